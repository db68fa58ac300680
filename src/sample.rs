//! # Sample Types
//!
//! A `Sample` is one decoded heart rate measurement. It is only ever built by
//! the decoder and never mutated afterwards; the pipeline moves it from the
//! buffer into the persistence sink.

use chrono::{DateTime, Utc};
use std::fmt;

/// Row id of a session in the `gaming_sessions` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Skin contact status reported in flag bits 1-2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorContact {
    /// The sensor does not implement contact detection
    Unsupported,
    /// Supported, but no contact detected
    NotDetected,
    /// Supported and in contact
    Detected,
}

impl SensorContact {
    pub fn from_flags(flags: u8) -> Self {
        match (flags >> 1) & 0b11 {
            0b11 => SensorContact::Detected,
            0b10 => SensorContact::NotDetected,
            _ => SensorContact::Unsupported,
        }
    }
}

/// One heart rate measurement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    timestamp: DateTime<Utc>,
    heart_rate: u16,
    raw_flags: u8,
    sensor_contact: SensorContact,
    energy_expended: Option<u16>,
    rr_intervals: Vec<u16>,
    session_id: Option<SessionId>,
}

impl Sample {
    pub(crate) fn new(
        timestamp: DateTime<Utc>,
        heart_rate: u16,
        raw_flags: u8,
        energy_expended: Option<u16>,
        rr_intervals: Vec<u16>,
        session_id: Option<SessionId>,
    ) -> Self {
        Self {
            timestamp,
            heart_rate,
            raw_flags,
            sensor_contact: SensorContact::from_flags(raw_flags),
            energy_expended,
            rr_intervals,
            session_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Beats per minute
    pub fn heart_rate(&self) -> u16 {
        self.heart_rate
    }

    pub fn raw_flags(&self) -> u8 {
        self.raw_flags
    }

    pub fn sensor_contact(&self) -> SensorContact {
        self.sensor_contact
    }

    /// Cumulative energy expended in kilojoules, when the frame carried it
    pub fn energy_expended(&self) -> Option<u16> {
        self.energy_expended
    }

    /// RR intervals in units of 1/1024 second
    pub fn rr_intervals(&self) -> &[u16] {
        &self.rr_intervals
    }

    /// RR intervals converted to milliseconds
    pub fn rr_intervals_ms(&self) -> Vec<u32> {
        self.rr_intervals
            .iter()
            .map(|&rr| (u32::from(rr) * 1000 + 512) / 1024)
            .collect()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_contact_bits() {
        assert_eq!(SensorContact::from_flags(0x00), SensorContact::Unsupported);
        assert_eq!(SensorContact::from_flags(0x02), SensorContact::Unsupported);
        assert_eq!(SensorContact::from_flags(0x04), SensorContact::NotDetected);
        assert_eq!(SensorContact::from_flags(0x06), SensorContact::Detected);
        assert_eq!(SensorContact::from_flags(0x17), SensorContact::Detected);
    }

    #[test]
    fn test_rr_intervals_ms() {
        let sample = Sample::new(Utc::now(), 60, 0x10, None, vec![1024, 512], None);
        assert_eq!(sample.rr_intervals_ms(), vec![1000, 500]);
    }
}
