//! Publish cursor and its persisted record.
//!
//! Record layout, little endian:
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 1    | magic `0xC5`                   |
//! | 1      | 1    | version                        |
//! | 2      | 4    | day                            |
//! | 6      | 1    | sensor index                   |
//! | 7      | 4    | record ordinal within sensor   |
//! | 11     | 1    | CRC-8 of bytes 0..11           |

use crate::clock::Day;
use crate::crc::crc8;

pub const CURSOR_RECORD_LEN: usize = 12;

const MAGIC: u8 = 0xC5;
const VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CursorError {
    BadMagic,
    UnsupportedVersion(u8),
    BadCrc,
}

/// Position of the next record not yet acknowledged by the broker.
///
/// Ordering is lexicographic on `(day, sensor, record)`, the order in which
/// the publisher walks the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cursor {
    pub day: Day,
    pub sensor: u8,
    /// Ordinal of the record among the sensor's lines in the day file.
    pub record: u32,
}

impl Cursor {
    pub const fn start_of(day: Day) -> Self {
        Self {
            day,
            sensor: 0,
            record: 0,
        }
    }

    /// Position just after the current record.
    pub const fn after_record(self) -> Self {
        Self {
            record: self.record + 1,
            ..self
        }
    }

    pub const fn at_sensor(self, sensor: u8) -> Self {
        Self {
            day: self.day,
            sensor,
            record: 0,
        }
    }

    pub fn encode(&self) -> [u8; CURSOR_RECORD_LEN] {
        let mut out = [0u8; CURSOR_RECORD_LEN];
        out[0] = MAGIC;
        out[1] = VERSION;
        out[2..6].copy_from_slice(&self.day.0.to_le_bytes());
        out[6] = self.sensor;
        out[7..11].copy_from_slice(&self.record.to_le_bytes());
        out[11] = crc8(&out[..11]);
        out
    }

    pub fn decode(raw: &[u8; CURSOR_RECORD_LEN]) -> Result<Self, CursorError> {
        if raw[0] != MAGIC {
            return Err(CursorError::BadMagic);
        }
        if raw[1] != VERSION {
            return Err(CursorError::UnsupportedVersion(raw[1]));
        }
        if crc8(&raw[..11]) != raw[11] {
            return Err(CursorError::BadCrc);
        }
        Ok(Self {
            day: Day(u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]])),
            sensor: raw[6],
            record: u32::from_le_bytes([raw[7], raw[8], raw[9], raw[10]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let cursor = Cursor {
            day: Day(20_742),
            sensor: 2,
            record: 5,
        };
        let raw = cursor.encode();
        assert_eq!(&raw[..11], &[0xC5, 1, 0x06, 0x51, 0, 0, 2, 5, 0, 0, 0]);
        assert_eq!(Cursor::decode(&raw), Ok(cursor));
    }

    #[test]
    fn corruption_is_detected() {
        let raw = Cursor::start_of(Day(10)).encode();

        let mut flipped = raw;
        flipped[7] ^= 0x01;
        assert_eq!(Cursor::decode(&flipped), Err(CursorError::BadCrc));

        let mut magic = raw;
        magic[0] = 0;
        assert_eq!(Cursor::decode(&magic), Err(CursorError::BadMagic));

        let mut version = raw;
        version[1] = 9;
        assert_eq!(
            Cursor::decode(&version),
            Err(CursorError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn ordering_follows_the_walk() {
        let a = Cursor::start_of(Day(3));
        let b = a.after_record();
        let c = a.at_sensor(1);
        let d = Cursor::start_of(Day(4));
        assert!(a < b && b < c && c < d);
    }
}
