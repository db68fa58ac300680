//! # Persistence Module
//!
//! Durable storage for decoded samples. The pipeline only depends on the
//! [`PersistenceSink`] trait; [`SqliteStore`] is the SQLite implementation
//! that also owns session bookkeeping.
//!
//! ## Schema
//! ```text
//! gaming_sessions(id, start_time, end_time, game_name, notes)
//! heart_rate_readings(id, timestamp, heart_rate, raw_flags, session_id -> gaming_sessions.id)
//!   idx_hr_timestamp on timestamp
//!   idx_hr_session   on session_id
//! ```
//! Timestamps are stored as RFC 3339 text in UTC so they sort lexically.

use crate::error::PersistenceError;
use crate::sample::{Sample, SessionId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Write side of the store, as seen by the pipeline
pub trait PersistenceSink: Send {
    /// Durably write `samples` in order and return how many were written.
    ///
    /// On failure, `PersistenceError::written` must name the committed prefix
    /// (0 for an atomic sink).
    fn write_batch(&mut self, samples: &[Sample]) -> Result<usize, PersistenceError>;
}

impl<S: PersistenceSink + ?Sized> PersistenceSink for Box<S> {
    fn write_batch(&mut self, samples: &[Sample]) -> Result<usize, PersistenceError> {
        (**self).write_batch(samples)
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS gaming_sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        start_time TEXT NOT NULL,
        end_time TEXT,
        game_name TEXT,
        notes TEXT
    );

    CREATE TABLE IF NOT EXISTS heart_rate_readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        heart_rate INTEGER NOT NULL,
        raw_flags INTEGER,
        session_id INTEGER,
        FOREIGN KEY (session_id) REFERENCES gaming_sessions(id)
    );

    CREATE INDEX IF NOT EXISTS idx_hr_timestamp ON heart_rate_readings(timestamp);
    CREATE INDEX IF NOT EXISTS idx_hr_session ON heart_rate_readings(session_id);
";

/// Row of `gaming_sessions`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub start_time: String,
    pub end_time: Option<String>,
    pub game_name: Option<String>,
    pub notes: Option<String>,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Row of `heart_rate_readings`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReading {
    pub id: i64,
    pub timestamp: String,
    pub heart_rate: u16,
    pub raw_flags: Option<u8>,
    pub session_id: Option<SessionId>,
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a database file and make sure the schema exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PersistenceError::rejected(
                        0,
                        format!("Failed to create database directory: {}", e),
                    )
                })?;
            }
        }

        log::info!("Opening reading store: {}", path.display());
        let conn = Connection::open(path).map_err(PersistenceError::sqlite)?;
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory().map_err(PersistenceError::sqlite)?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(PersistenceError::sqlite)?;
        conn.execute_batch(SCHEMA).map_err(PersistenceError::sqlite)?;
        Ok(Self { conn })
    }

    /// Start a new open session and return its id
    pub fn open_session(
        &self,
        start_time: DateTime<Utc>,
        game_name: Option<&str>,
        notes: Option<&str>,
    ) -> Result<SessionId, PersistenceError> {
        self.conn
            .execute(
                "INSERT INTO gaming_sessions (start_time, game_name, notes) VALUES (?1, ?2, ?3)",
                params![format_time(start_time), game_name, notes],
            )
            .map_err(PersistenceError::sqlite)?;

        let id = SessionId(self.conn.last_insert_rowid());
        log::info!("Opened session {}", id);
        Ok(id)
    }

    /// Set the end time of an open session. Closing twice is rejected.
    pub fn close_session(
        &self,
        id: SessionId,
        end_time: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let updated = self
            .conn
            .execute(
                "UPDATE gaming_sessions SET end_time = ?1 WHERE id = ?2 AND end_time IS NULL",
                params![format_time(end_time), id.0],
            )
            .map_err(PersistenceError::sqlite)?;

        if updated == 0 {
            return Err(PersistenceError::rejected(
                0,
                format!("Session {} is unknown or already closed", id),
            ));
        }

        log::info!("Closed session {}", id);
        Ok(())
    }

    pub fn session(&self, id: SessionId) -> Result<Option<Session>, PersistenceError> {
        self.conn
            .query_row(
                "SELECT id, start_time, end_time, game_name, notes FROM gaming_sessions WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok(Session {
                        id: SessionId(row.get(0)?),
                        start_time: row.get(1)?,
                        end_time: row.get(2)?,
                        game_name: row.get(3)?,
                        notes: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(PersistenceError::sqlite)
    }

    pub fn reading_count(&self) -> Result<usize, PersistenceError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM heart_rate_readings", [], |row| {
                row.get(0)
            })
            .map_err(PersistenceError::sqlite)?;

        usize::try_from(count).map_err(|_| {
            PersistenceError::rejected(0, format!("Reading count {} out of range", count))
        })
    }

    /// Readings of one session, oldest first
    pub fn readings_for_session(
        &self,
        id: SessionId,
    ) -> Result<Vec<StoredReading>, PersistenceError> {
        self.query_readings(
            "SELECT id, timestamp, heart_rate, raw_flags, session_id
             FROM heart_rate_readings WHERE session_id = ?1 ORDER BY id ASC",
            Some(id),
        )
    }

    /// Every reading in insertion order
    pub fn readings(&self) -> Result<Vec<StoredReading>, PersistenceError> {
        self.query_readings(
            "SELECT id, timestamp, heart_rate, raw_flags, session_id
             FROM heart_rate_readings ORDER BY id ASC",
            None,
        )
    }

    fn query_readings(
        &self,
        sql: &str,
        session: Option<SessionId>,
    ) -> Result<Vec<StoredReading>, PersistenceError> {
        let mut stmt = self.conn.prepare(sql).map_err(PersistenceError::sqlite)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<StoredReading> {
            Ok(StoredReading {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                heart_rate: row.get(2)?,
                raw_flags: row.get(3)?,
                session_id: row.get::<_, Option<i64>>(4)?.map(SessionId),
            })
        };

        let rows = match session {
            Some(id) => stmt.query_map(params![id.0], map_row),
            None => stmt.query_map([], map_row),
        }
        .map_err(PersistenceError::sqlite)?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(PersistenceError::sqlite)
    }
}

impl PersistenceSink for SqliteStore {
    fn write_batch(&mut self, samples: &[Sample]) -> Result<usize, PersistenceError> {
        if samples.is_empty() {
            return Ok(0);
        }

        // One transaction per batch: either every row lands or none does
        let tx = self.conn.transaction().map_err(PersistenceError::sqlite)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO heart_rate_readings (timestamp, heart_rate, raw_flags, session_id)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(PersistenceError::sqlite)?;

            for sample in samples {
                stmt.execute(params![
                    format_time(sample.timestamp()),
                    sample.heart_rate(),
                    sample.raw_flags(),
                    sample.session_id().map(|id| id.0),
                ])
                .map_err(PersistenceError::sqlite)?;
            }
        }
        tx.commit().map_err(PersistenceError::sqlite)?;

        log::debug!("Wrote {} readings", samples.len());
        Ok(samples.len())
    }
}
