//! # Heart Rate Measurement Decoder
//!
//! Parses the payload of the standard Heart Rate Measurement characteristic
//! (0x2A37) into a typed [`Sample`].
//!
//! ## Frame Layout
//! ```text
//! byte 0      flags
//!             bit 0    heart rate is u16 (little endian) instead of u8
//!             bit 1-2  sensor contact status
//!             bit 3    energy expended field present (u16, kJ)
//!             bit 4    RR intervals present (u16 each, 1/1024 s)
//! byte 1..    heart rate, then optional energy expended, then RR intervals
//! ```
//!
//! Decoding is pure: the caller supplies the receive time, so the same frame
//! and timestamp always produce the same sample.

use crate::error::DecodeError;
use crate::sample::{Sample, SessionId};
use chrono::{DateTime, Utc};

pub const FLAG_HEART_RATE_U16: u8 = 0x01;
pub const FLAG_ENERGY_EXPENDED: u8 = 0x08;
pub const FLAG_RR_INTERVALS: u8 = 0x10;

/// Smallest frame we accept: flags plus an 8-bit heart rate
pub const MIN_FRAME_LEN: usize = 2;

/// Turns raw notification frames into samples tagged with the bound session
#[derive(Debug, Clone, Default)]
pub struct SampleDecoder {
    session_id: Option<SessionId>,
}

impl SampleDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
        }
    }

    /// Session attached to every sample decoded from now on
    pub fn bind_session(&mut self, session_id: Option<SessionId>) {
        self.session_id = session_id;
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn decode(&self, frame: &[u8], now: DateTime<Utc>) -> Result<Sample, DecodeError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(DecodeError::TooShort {
                needed: MIN_FRAME_LEN,
                actual: frame.len(),
            });
        }

        let flags = frame[0];
        let mut cursor = 1;

        let heart_rate = if flags & FLAG_HEART_RATE_U16 != 0 {
            read_u16(frame, &mut cursor)?
        } else {
            cursor += 1;
            u16::from(frame[1])
        };

        let energy_expended = if flags & FLAG_ENERGY_EXPENDED != 0 {
            Some(read_u16(frame, &mut cursor)?)
        } else {
            None
        };

        // An odd trailing byte cannot form an interval and is ignored
        let rr_intervals = if flags & FLAG_RR_INTERVALS != 0 {
            frame[cursor..]
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect()
        } else {
            Vec::new()
        };

        Ok(Sample::new(
            now,
            heart_rate,
            flags,
            energy_expended,
            rr_intervals,
            self.session_id,
        ))
    }
}

fn read_u16(frame: &[u8], cursor: &mut usize) -> Result<u16, DecodeError> {
    let end = *cursor + 2;
    match frame.get(*cursor..end) {
        Some(bytes) => {
            *cursor = end;
            Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
        }
        None => Err(DecodeError::TooShort {
            needed: end,
            actual: frame.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SensorContact;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_decode_minimal_frame() {
        let sample = SampleDecoder::new().decode(&[0x00, 72], at()).unwrap();

        assert_eq!(sample.heart_rate(), 72);
        assert_eq!(sample.raw_flags(), 0);
        assert_eq!(sample.timestamp(), at());
        assert_eq!(sample.session_id(), None);
        assert!(sample.rr_intervals().is_empty());
        assert_eq!(sample.energy_expended(), None);
    }

    #[test]
    fn test_decode_too_short() {
        let decoder = SampleDecoder::new();
        assert_eq!(
            decoder.decode(&[0x01], at()),
            Err(DecodeError::TooShort { needed: 2, actual: 1 })
        );
        assert_eq!(
            decoder.decode(&[], at()),
            Err(DecodeError::TooShort { needed: 2, actual: 0 })
        );
    }

    #[test]
    fn test_decode_is_deterministic() {
        let decoder = SampleDecoder::with_session(SessionId(4));
        let frame = [0x16, 80, 0x00, 0x04, 0x10, 0x04];
        assert_eq!(decoder.decode(&frame, at()), decoder.decode(&frame, at()));
    }

    #[test]
    fn test_decode_u16_heart_rate() {
        let sample = SampleDecoder::new()
            .decode(&[0x01, 0x2C, 0x01], at())
            .unwrap();
        assert_eq!(sample.heart_rate(), 300);

        // Flag announces two bytes but only one is present
        assert_eq!(
            SampleDecoder::new().decode(&[0x01, 0x2C], at()),
            Err(DecodeError::TooShort { needed: 3, actual: 2 })
        );
    }

    #[test]
    fn test_decode_energy_and_rr() {
        // u8 HR, contact detected, energy expended, two RR intervals
        let frame = [0x1E, 65, 0x10, 0x00, 0x00, 0x04, 0x00, 0x02];
        let sample = SampleDecoder::with_session(SessionId(9))
            .decode(&frame, at())
            .unwrap();

        assert_eq!(sample.heart_rate(), 65);
        assert_eq!(sample.sensor_contact(), SensorContact::Detected);
        assert_eq!(sample.energy_expended(), Some(16));
        assert_eq!(sample.rr_intervals(), &[1024, 512]);
        assert_eq!(sample.session_id(), Some(SessionId(9)));
    }

    #[test]
    fn test_decode_missing_energy_field() {
        assert_eq!(
            SampleDecoder::new().decode(&[0x08, 70, 0x01], at()),
            Err(DecodeError::TooShort { needed: 4, actual: 3 })
        );
    }

    #[test]
    fn test_decode_ignores_odd_rr_byte() {
        let sample = SampleDecoder::new()
            .decode(&[0x10, 70, 0x00, 0x04, 0xFF], at())
            .unwrap();
        assert_eq!(sample.rr_intervals(), &[1024]);
    }

    #[test]
    fn test_bind_session() {
        let mut decoder = SampleDecoder::new();
        decoder.bind_session(Some(SessionId(2)));
        assert_eq!(decoder.session(), Some(SessionId(2)));
        decoder.bind_session(None);
        let sample = decoder.decode(&[0x00, 60], at()).unwrap();
        assert_eq!(sample.session_id(), None);
    }
}
