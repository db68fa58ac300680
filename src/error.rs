//! # Error Types Module
//!
//! Centralized error handling for the ingestion pipeline.
//! Provides custom error types for each stage with proper context and error chaining.
//!
//! ## Error Types
//! - `DecodeError`: Malformed heart rate notification frames
//! - `TransportError`: Bluetooth scan, connect and subscription failures
//! - `MonitorError`: Lifecycle failures surfaced by `start_monitoring()`
//! - `PersistenceError`: Batch writes that did not reach the database
//! - `ConfigError`: Configuration file I/O, parsing and validation errors
//! - `PipelineError`: Failures while building an ingestion pipeline
//!
//! ## Propagation
//! Decode errors only cost the offending frame. Persistence errors never tear
//! down the connection. Transport errors during discovery, connect or subscribe
//! move the supervisor to `Failed` and come back to the caller as `MonitorError`.

use std::fmt;

/// Errors produced while decoding a notification frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame ended before all fields announced by the flags byte
    TooShort { needed: usize, actual: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooShort { needed, actual } => {
                write!(f, "Frame too short: need {} bytes, got {}", needed, actual)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors reported by a `Transport` implementation
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Bluetooth adapter not found or not available
    NoAdapter,
    /// Scan operation failed
    Scan(String),
    /// Failed to connect to a specific device
    Connect { address: String, reason: String },
    /// Characteristic is not exposed by the peripheral
    CharacteristicNotFound(String),
    /// Enabling notifications failed
    Subscribe(String),
    /// Disabling notifications failed
    Unsubscribe(String),
    /// Link teardown failed
    Disconnect(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NoAdapter => {
                write!(f, "No Bluetooth adapter found. Please ensure Bluetooth is enabled.")
            }
            TransportError::Scan(msg) => write!(f, "Scan operation failed: {}", msg),
            TransportError::Connect { address, reason } => {
                write!(f, "Failed to connect to device {}: {}", address, reason)
            }
            TransportError::CharacteristicNotFound(id) => {
                write!(f, "Characteristic {} not found on device", id)
            }
            TransportError::Subscribe(msg) => write!(f, "Failed to subscribe: {}", msg),
            TransportError::Unsubscribe(msg) => write!(f, "Failed to unsubscribe: {}", msg),
            TransportError::Disconnect(msg) => write!(f, "Failed to disconnect: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors returned by the connection lifecycle
#[derive(Debug, Clone)]
pub enum MonitorError {
    /// No advertised name matched the target before the scan timed out
    DeviceNotFound { target: String },
    /// Discovery itself failed (adapter missing, scan error)
    Discovery(TransportError),
    /// Transport-level connect failed
    ConnectError { address: String, source: TransportError },
    /// Subscribing to the notification characteristic failed
    SubscribeError(TransportError),
    /// A stop request interrupted discovery
    Cancelled,
    /// The pipeline's writer thread is gone
    PipelineClosed,
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::DeviceNotFound { target } => {
                write!(f, "No device matching \"{}\" found", target)
            }
            MonitorError::Discovery(e) => write!(f, "Device discovery failed: {}", e),
            MonitorError::ConnectError { address, source } => {
                write!(f, "Connection to {} failed: {}", address, source)
            }
            MonitorError::SubscribeError(e) => {
                write!(f, "Heart rate subscription failed: {}", e)
            }
            MonitorError::Cancelled => write!(f, "Discovery cancelled by stop request"),
            MonitorError::PipelineClosed => write!(f, "Ingestion pipeline is shut down"),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Discovery(e) => Some(e),
            MonitorError::ConnectError { source, .. } => Some(source),
            MonitorError::SubscribeError(e) => Some(e),
            MonitorError::DeviceNotFound { .. }
            | MonitorError::Cancelled
            | MonitorError::PipelineClosed => None,
        }
    }
}

/// Cause of a failed batch write
#[derive(Debug)]
pub enum PersistenceErrorKind {
    /// Database rejected the statement or transaction
    Sqlite(rusqlite::Error),
    /// Sink refused the batch for another reason
    Rejected(String),
}

/// A batch write that did not fully reach storage.
///
/// `written` is the number of leading samples that were committed before the
/// failure; the pipeline re-queues the rest.
#[derive(Debug)]
pub struct PersistenceError {
    pub written: usize,
    pub kind: PersistenceErrorKind,
}

impl PersistenceError {
    pub fn sqlite(err: rusqlite::Error) -> Self {
        Self {
            written: 0,
            kind: PersistenceErrorKind::Sqlite(err),
        }
    }

    pub fn rejected(written: usize, reason: impl Into<String>) -> Self {
        Self {
            written,
            kind: PersistenceErrorKind::Rejected(reason.into()),
        }
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            PersistenceErrorKind::Sqlite(e) => {
                write!(f, "Database write failed after {} rows: {}", self.written, e)
            }
            PersistenceErrorKind::Rejected(msg) => {
                write!(f, "Batch rejected after {} rows: {}", self.written, msg)
            }
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PersistenceErrorKind::Sqlite(e) => Some(e),
            PersistenceErrorKind::Rejected(_) => None,
        }
    }
}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
    /// A value is out of range
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
            ConfigError::Invalid(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Errors that can occur while building an ingestion pipeline
#[derive(Debug)]
pub enum PipelineError {
    /// The configuration was rejected
    Config(ConfigError),
    /// The OS refused to start the writer thread
    WriterSpawn(std::io::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Config(e) => write!(f, "{}", e),
            PipelineError::WriterSpawn(e) => {
                write!(f, "Failed to spawn writer thread: {}", e)
            }
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Config(e) => Some(e),
            PipelineError::WriterSpawn(e) => Some(e),
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(e: ConfigError) -> Self {
        PipelineError::Config(e)
    }
}
