use core::task::Poll;

use embassy_time::{Duration, Instant};
use embedded_hal::i2c::I2c;
use gas_index_algorithm::{AlgorithmType, GasIndexAlgorithm};

use super::{SensorDriver, SensorError, Values};
use crate::crc::crc8;

const SGP41_ADDRESS: u8 = 0x59;

// Commands
const CMD_MEASURE_RAW: [u8; 2] = [0x26, 0x19];
const CMD_SELF_TEST: [u8; 2] = [0x28, 0x0E];
const CMD_HEATER_OFF: [u8; 2] = [0x36, 0x15];

// Default compensation values
const DEFAULT_RH_TICKS: u16 = 0x8000; // 50% RH
const DEFAULT_TEMP_TICKS: u16 = 0x6666; // 25°C

// Measurement timing
const MEASURE_DELAY: Duration = Duration::from_millis(50);
const SELF_TEST_DELAY: Duration = Duration::from_millis(320);
const CONDITIONING_DELAY: Duration = Duration::from_secs(10);

// Buffer sizes
const RESPONSE_SIZE: usize = 6; // 2 bytes data + 1 CRC, twice
const SELF_TEST_RESPONSE_SIZE: usize = 3; // 2 bytes result + 1 CRC

// Self-test result codes
const SELF_TEST_OK: u16 = 0xD400;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Sgp41Error {
    I2cError,
    CrcError,
    SelfTestFailed(u16), // Contains the actual test result
    NotInitialized,
}

impl From<Sgp41Error> for SensorError {
    fn from(e: Sgp41Error) -> Self {
        match e {
            Sgp41Error::I2cError => SensorError::Bus,
            Sgp41Error::CrcError => SensorError::Checksum,
            Sgp41Error::SelfTestFailed(_) => SensorError::Protocol,
            Sgp41Error::NotInitialized => SensorError::NotInitialized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    SelfTest { ready_at: Instant },
    Conditioning { ready_at: Instant },
    ConditioningWait { until: Instant },
    Measuring { ready_at: Instant },
}

/// Sensirion SGP41, driven without blocking delays.
///
/// `prepare` runs the self-test and the 10 s conditioning once after
/// power-on; `read` yields the VOC and NOx indices.
pub struct Sgp41<I2C> {
    i2c: I2C,
    address: u8,
    initialized: bool,
    phase: Phase,
    humidity: Option<f32>,
    temp: Option<f32>,
    voc_algorithm: GasIndexAlgorithm,
    nox_algorithm: GasIndexAlgorithm,
}

impl<I2C: I2c> Sgp41<I2C> {
    pub fn new(i2c: I2C, sampling_interval_secs: f32) -> Self {
        Self {
            i2c,
            address: SGP41_ADDRESS,
            initialized: false,
            phase: Phase::Idle,
            humidity: None,
            temp: None,
            voc_algorithm: GasIndexAlgorithm::new(AlgorithmType::Voc, sampling_interval_secs),
            nox_algorithm: GasIndexAlgorithm::new(AlgorithmType::Nox, sampling_interval_secs),
        }
    }

    pub fn with_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Compensation used by subsequent measurements; `None` falls back to 50% RH / 25°C.
    pub fn set_compensation(&mut self, humidity: Option<f32>, temp: Option<f32>) {
        self.humidity = humidity;
        self.temp = temp;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Turn off the heater. The next `prepare` runs the self-test again.
    pub fn heater_off(&mut self) -> Result<(), Sgp41Error> {
        self.i2c
            .write(self.address, &CMD_HEATER_OFF)
            .map_err(|_| Sgp41Error::I2cError)?;
        self.initialized = false;
        self.phase = Phase::Idle;
        Ok(())
    }

    fn start_self_test(&mut self) -> Result<(), Sgp41Error> {
        self.i2c
            .write(self.address, &CMD_SELF_TEST)
            .map_err(|_| Sgp41Error::I2cError)
    }

    fn finish_self_test(&mut self) -> Result<(), Sgp41Error> {
        let mut read_buf = [0u8; SELF_TEST_RESPONSE_SIZE];
        self.i2c
            .read(self.address, &mut read_buf)
            .map_err(|_| Sgp41Error::I2cError)?;

        validate_crc(&read_buf[0..2], read_buf[2])?;

        let test_result = u16::from_be_bytes([read_buf[0], read_buf[1]]);
        if test_result == SELF_TEST_OK {
            Ok(())
        } else {
            Err(Sgp41Error::SelfTestFailed(test_result))
        }
    }

    fn start_measurement(&mut self) -> Result<(), Sgp41Error> {
        let rh_ticks = self
            .humidity
            .map(humidity_to_ticks)
            .unwrap_or(DEFAULT_RH_TICKS);
        let t_ticks = self
            .temp
            .map(temperature_to_ticks)
            .unwrap_or(DEFAULT_TEMP_TICKS);

        let rh_bytes = rh_ticks.to_be_bytes();
        let t_bytes = t_ticks.to_be_bytes();

        let buffer = [
            CMD_MEASURE_RAW[0],
            CMD_MEASURE_RAW[1],
            rh_bytes[0],
            rh_bytes[1],
            crc8(&rh_bytes),
            t_bytes[0],
            t_bytes[1],
            crc8(&t_bytes),
        ];

        self.i2c
            .write(self.address, &buffer)
            .map_err(|_| Sgp41Error::I2cError)
    }

    fn finish_measurement(&mut self) -> Result<(u16, u16), Sgp41Error> {
        let mut read_buf = [0u8; RESPONSE_SIZE];
        self.i2c
            .read(self.address, &mut read_buf)
            .map_err(|_| Sgp41Error::I2cError)?;

        validate_crc(&read_buf[0..2], read_buf[2])?;
        validate_crc(&read_buf[3..5], read_buf[5])?;

        let voc_raw = u16::from_be_bytes([read_buf[0], read_buf[1]]);
        let nox_raw = u16::from_be_bytes([read_buf[3], read_buf[4]]);
        Ok((voc_raw, nox_raw))
    }

    fn fail(&mut self, e: Sgp41Error) -> SensorError {
        self.phase = Phase::Idle;
        e.into()
    }
}

impl<I2C: I2c> SensorDriver for Sgp41<I2C> {
    fn prepare(&mut self, now: Instant) -> Poll<Result<(), SensorError>> {
        match self.phase {
            Phase::Idle if self.initialized => Poll::Ready(Ok(())),
            Phase::Idle => match self.start_self_test() {
                Ok(()) => {
                    self.phase = Phase::SelfTest {
                        ready_at: now + SELF_TEST_DELAY,
                    };
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(self.fail(e))),
            },
            Phase::SelfTest { ready_at } if now >= ready_at => {
                let started = self
                    .finish_self_test()
                    .and_then(|()| self.start_measurement());
                match started {
                    Ok(()) => {
                        self.phase = Phase::Conditioning {
                            ready_at: now + MEASURE_DELAY,
                        };
                        Poll::Pending
                    }
                    Err(e) => Poll::Ready(Err(self.fail(e))),
                }
            }
            Phase::Conditioning { ready_at } if now >= ready_at => {
                match self.finish_measurement() {
                    Ok(_) => {
                        self.phase = Phase::ConditioningWait {
                            until: ready_at + CONDITIONING_DELAY - MEASURE_DELAY,
                        };
                        Poll::Pending
                    }
                    Err(e) => Poll::Ready(Err(self.fail(e))),
                }
            }
            Phase::ConditioningWait { until } if now >= until => {
                self.initialized = true;
                self.phase = Phase::Idle;
                Poll::Ready(Ok(()))
            }
            Phase::Measuring { .. } => Poll::Ready(Ok(())),
            _ => Poll::Pending,
        }
    }

    fn read(&mut self, now: Instant) -> Poll<Result<Values, SensorError>> {
        if !self.initialized {
            return Poll::Ready(Err(Sgp41Error::NotInitialized.into()));
        }
        match self.phase {
            Phase::Measuring { ready_at } if now >= ready_at => {
                self.phase = Phase::Idle;
                match self.finish_measurement() {
                    Ok((voc_raw, nox_raw)) => {
                        let voc_index = self.voc_algorithm.process(i32::from(voc_raw));
                        let nox_index = self.nox_algorithm.process(i32::from(nox_raw));
                        let mut values = Values::new();
                        let _ = values.push(Some(voc_index));
                        let _ = values.push(Some(nox_index));
                        Poll::Ready(Ok(values))
                    }
                    Err(e) => Poll::Ready(Err(self.fail(e))),
                }
            }
            Phase::Measuring { .. } => Poll::Pending,
            _ => match self.start_measurement() {
                Ok(()) => {
                    self.phase = Phase::Measuring {
                        ready_at: now + MEASURE_DELAY,
                    };
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(self.fail(e))),
            },
        }
    }

    fn abort(&mut self) {
        if let Phase::Measuring { .. } = self.phase {
            self.phase = Phase::Idle;
        }
    }
}

/// Convert relative humidity percentage to SGP41 ticks
/// Formula: RH ticks = %RH * 65535 / 100
fn humidity_to_ticks(humidity: f32) -> u16 {
    let h = humidity.clamp(0.0, 100.0);
    (h * 65535.0 / 100.0) as u16
}

/// Convert temperature in Celsius to SGP41 ticks
/// Formula: T ticks = (°C + 45) * 65535 / 175
fn temperature_to_ticks(temp: f32) -> u16 {
    let t = temp.clamp(-45.0, 130.0);
    ((t + 45.0) * 65535.0 / 175.0) as u16
}

fn validate_crc(data: &[u8], expected_crc: u8) -> Result<(), Sgp41Error> {
    if crc8(data) == expected_crc {
        Ok(())
    } else {
        Err(Sgp41Error::CrcError)
    }
}
