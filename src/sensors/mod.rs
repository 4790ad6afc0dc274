pub mod buffer;
pub mod s8;
pub mod sgp41;

use core::task::Poll;
use embassy_time::Instant;
use serde::{Deserialize, Serialize};

pub use buffer::{PENDING_PER_SENSOR, Reading, ReadingBuffer};

/// Sensors a station can carry.
pub const MAX_SENSORS: usize = 6;
/// Measured fields per sensor.
pub const MAX_VALUES: usize = 4;

/// Topic suffix identifying a sensor, e.g. `B/254/co2`.
pub const SENSOR_NAME_LEN: usize = 24;

pub type SensorName = heapless::String<SENSOR_NAME_LEN>;

/// One sample of a sensor; `None` marks a field the sensor could not provide.
pub type Values = heapless::Vec<Option<i32>, MAX_VALUES>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    Bus,
    Checksum,
    Protocol,
    NotInitialized,
    Timeout,
}

/// Driver kinds known to the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorKind {
    /// SenseAir S8 CO2 sensor, Modbus over UART.
    S8,
    /// Sensirion SGP41 VOC/NOx sensor, I2C.
    Sgp41,
}

/// Non-blocking, polled sensor driver.
///
/// The first call to `prepare` (or `read`) issues the command; later calls
/// poll it until it resolves. A resolved `read` leaves the driver idle so the
/// next sample starts over.
pub trait SensorDriver {
    fn prepare(&mut self, now: Instant) -> Poll<Result<(), SensorError>>;
    fn read(&mut self, now: Instant) -> Poll<Result<Values, SensorError>>;
    /// Drops any command in flight, e.g. after the caller timed it out.
    fn abort(&mut self) {}
}

/// The board's sensor drivers, looked up by the configured kind and address.
pub trait SensorBank {
    fn driver(&mut self, kind: SensorKind, address: u8) -> Option<&mut dyn SensorDriver>;
}
