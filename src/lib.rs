//! # pulse-ingest
//!
//! Acquires heart rate notifications from a Bluetooth LE sensor and stores
//! them in SQLite.
//!
//! ```text
//! notification -> SampleDecoder -> Buffer --(full / stop)--> PersistenceSink
//! ```
//!
//! [`pipeline::IngestionPipeline`] is the entry point: `start()` connects and
//! subscribes, `stop()` tears the link down and flushes. Progress and errors
//! arrive on the event channel returned by `IngestionPipeline::new`.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod events;
pub mod persistence;
pub mod pipeline;
pub mod sample;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use connection::{ConnectionState, FailureReason};
pub use events::PipelineEvent;
pub use pipeline::{FlushReport, IngestionPipeline, PipelineStats};
pub use sample::{Sample, SessionId};
