//! Log record line codec.
//!
//! One reading per line, JSON encoded:
//! `{"s":0,"n":"B/254/co2","t":1792154096,"v":[612,null]}`.

use serde::{Deserialize, Serialize};

use crate::sensors::{SensorName, Values};

/// Longest encoded line, newline excluded.
pub const LINE_LEN: usize = 128;

pub type Line = heapless::Vec<u8, LINE_LEN>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Sensor index in the configuration that produced the reading.
    #[serde(rename = "s")]
    pub sensor: u8,
    /// Sensor topic suffix, so the publisher does not depend on the
    /// configuration still listing the sensor.
    #[serde(rename = "n")]
    pub name: SensorName,
    #[serde(rename = "t")]
    pub timestamp: u32,
    #[serde(rename = "v")]
    pub values: Values,
}

/// Body published for one record.
#[derive(Serialize)]
struct Payload<'a> {
    t: u32,
    v: &'a [Option<i32>],
}

impl LogRecord {
    pub fn encode(&self) -> Option<Line> {
        let mut buf = [0u8; LINE_LEN];
        let len = serde_json_core::to_slice(self, &mut buf).ok()?;
        Line::from_slice(&buf[..len]).ok()
    }

    pub fn decode(line: &[u8]) -> Option<Self> {
        serde_json_core::from_slice::<Self>(line)
            .ok()
            .map(|(record, _)| record)
    }

    /// Pub/sub payload: timestamp and values, the topic carries the rest.
    pub fn payload(&self) -> Option<Line> {
        let mut buf = [0u8; LINE_LEN];
        let len = serde_json_core::to_slice(
            &Payload {
                t: self.timestamp,
                v: &self.values,
            },
            &mut buf,
        )
        .ok()?;
        Line::from_slice(&buf[..len]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> LogRecord {
        let mut values = Values::new();
        values.push(Some(612)).unwrap();
        values.push(None).unwrap();
        LogRecord {
            sensor: 1,
            name: SensorName::try_from("B/254/co2").unwrap(),
            timestamp: 1_792_154_096,
            values,
        }
    }

    #[test]
    fn line_layout() {
        let line = record().encode().unwrap();
        assert_eq!(
            core::str::from_utf8(&line).unwrap(),
            r#"{"s":1,"n":"B/254/co2","t":1792154096,"v":[612,null]}"#
        );
        assert_eq!(LogRecord::decode(&line), Some(record()));
    }

    #[test]
    fn payload_drops_sensor_identity() {
        let payload = record().payload().unwrap();
        assert_eq!(
            core::str::from_utf8(&payload).unwrap(),
            r#"{"t":1792154096,"v":[612,null]}"#
        );
    }

    #[test]
    fn truncated_line_is_rejected() {
        let line = record().encode().unwrap();
        assert_eq!(LogRecord::decode(&line[..line.len() - 3]), None);
    }
}
