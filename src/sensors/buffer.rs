//! In-memory queue of readings waiting to be written to the log store.

use heapless::Deque;

use super::{MAX_SENSORS, SensorError, SensorName, Values};

/// Readings kept per sensor while the store is unavailable.
pub const PENDING_PER_SENSOR: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: u32,
    /// Topic name of the sensor when the sample was taken.
    pub name: SensorName,
    /// `Err` is the missing-value marker left by a failed sensor.
    pub values: Result<Values, SensorError>,
}

pub struct ReadingBuffer {
    queues: [Deque<Reading, PENDING_PER_SENSOR>; MAX_SENSORS],
    dropped: u32,
}

impl Default for ReadingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadingBuffer {
    pub const fn new() -> Self {
        Self {
            queues: [const { Deque::new() }; MAX_SENSORS],
            dropped: 0,
        }
    }

    /// Queues a reading. A full queue keeps what it holds and refuses the
    /// new reading, counted in [`ReadingBuffer::dropped`].
    pub fn push(&mut self, sensor: usize, reading: Reading) -> bool {
        let Some(queue) = self.queues.get_mut(sensor) else {
            return false;
        };
        if queue.push_back(reading).is_err() {
            self.dropped = self.dropped.saturating_add(1);
            log_warn!("buffer: sensor {} queue full, new reading dropped", sensor);
            return false;
        }
        true
    }

    pub fn front(&self, sensor: usize) -> Option<&Reading> {
        self.queues.get(sensor).and_then(|q| q.front())
    }

    pub fn pop(&mut self, sensor: usize) -> Option<Reading> {
        self.queues.get_mut(sensor).and_then(|q| q.pop_front())
    }

    /// Timestamp of the oldest queued reading across all sensors.
    pub fn oldest_timestamp(&self) -> Option<u32> {
        self.queues
            .iter()
            .filter_map(|q| q.front().map(|r| r.timestamp))
            .min()
    }

    pub fn pending(&self, sensor: usize) -> usize {
        self.queues.get(sensor).map_or(0, |q| q.len())
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}
