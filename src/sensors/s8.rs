use core::task::Poll;

use embassy_time::Instant;
use embedded_io::{Read, ReadReady, Write};

use super::{SensorDriver, SensorError, Values};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum S8Error {
    ReadError,
    WriteError,
    ChecksumError,
    InvalidHeader,
}

impl From<S8Error> for SensorError {
    fn from(e: S8Error) -> Self {
        match e {
            S8Error::ReadError | S8Error::WriteError => SensorError::Bus,
            S8Error::ChecksumError => SensorError::Checksum,
            S8Error::InvalidHeader => SensorError::Protocol,
        }
    }
}

// Modbus protocol constants
const MODBUS_ADDR_ANY: u8 = 0xFE;
const MODBUS_FUNC_READ_INPUT: u8 = 0x04;
const MODBUS_IR4_CO2_HIGH: u8 = 0x00;
const MODBUS_IR4_CO2_LOW: u8 = 0x03;
const MODBUS_READ_LEN_HIGH: u8 = 0x00;
const MODBUS_READ_LEN_LOW: u8 = 0x01;
const RESPONSE_BYTE_COUNT: u8 = 0x02;
const RESPONSE_LEN: usize = 7;

enum Phase {
    Idle,
    Awaiting { buf: [u8; RESPONSE_LEN], received: usize },
}

/// SenseAir S8 CO2 sensor. The request goes out on the first `read` call,
/// the response is collected from the UART on the following polls.
pub struct S8<UART> {
    uart: UART,
    phase: Phase,
}

impl<UART: Read + ReadReady + Write> S8<UART> {
    pub fn new(uart: UART) -> Self {
        Self {
            uart,
            phase: Phase::Idle,
        }
    }

    fn send_request(&mut self) -> Result<(), S8Error> {
        // Modbus command: Addr(0xFE), Func(0x04), Reg(0x0003), Len(0x0001), CRC
        // S8 uses 0xFE as "Any Address". IR4 (Input Register 4) is CO2.
        let mut cmd = [
            MODBUS_ADDR_ANY,
            MODBUS_FUNC_READ_INPUT,
            MODBUS_IR4_CO2_HIGH,
            MODBUS_IR4_CO2_LOW,
            MODBUS_READ_LEN_HIGH,
            MODBUS_READ_LEN_LOW,
            0x00, // CRC low byte (calculated below)
            0x00, // CRC high byte (calculated below)
        ];

        let crc = crc16_modbus(&cmd[0..6]);
        cmd[6] = (crc & 0xFF) as u8;
        cmd[7] = ((crc >> 8) & 0xFF) as u8;

        self.uart
            .write_all(&cmd)
            .map_err(|_| S8Error::WriteError)?;
        self.uart.flush().map_err(|_| S8Error::WriteError)
    }

    /// Pulls whatever the UART has buffered; `Some` once the frame is complete.
    fn collect(
        &mut self,
        buf: &mut [u8; RESPONSE_LEN],
        received: &mut usize,
    ) -> Result<Option<u16>, S8Error> {
        while *received < RESPONSE_LEN {
            if !self.uart.read_ready().map_err(|_| S8Error::ReadError)? {
                return Ok(None);
            }
            let n = self
                .uart
                .read(&mut buf[*received..])
                .map_err(|_| S8Error::ReadError)?;
            if n == 0 {
                return Ok(None);
            }
            *received += n;
        }

        validate_response(buf)?;
        Ok(Some(((buf[3] as u16) << 8) | (buf[4] as u16)))
    }
}

impl<UART: Read + ReadReady + Write> SensorDriver for S8<UART> {
    fn prepare(&mut self, _now: Instant) -> Poll<Result<(), SensorError>> {
        // No warm-up: the S8 measures continuously.
        Poll::Ready(Ok(()))
    }

    fn read(&mut self, _now: Instant) -> Poll<Result<Values, SensorError>> {
        match core::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => match self.send_request() {
                Ok(()) => {
                    self.phase = Phase::Awaiting {
                        buf: [0; RESPONSE_LEN],
                        received: 0,
                    };
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(e.into())),
            },
            Phase::Awaiting {
                mut buf,
                mut received,
            } => match self.collect(&mut buf, &mut received) {
                Ok(Some(co2)) => {
                    let mut values = Values::new();
                    let _ = values.push(Some(i32::from(co2)));
                    Poll::Ready(Ok(values))
                }
                Ok(None) => {
                    self.phase = Phase::Awaiting { buf, received };
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(e.into())),
            },
        }
    }

    fn abort(&mut self) {
        self.phase = Phase::Idle;
    }
}

fn validate_response(buf: &[u8; RESPONSE_LEN]) -> Result<(), S8Error> {
    if buf[0] != MODBUS_ADDR_ANY
        || buf[1] != MODBUS_FUNC_READ_INPUT
        || buf[2] != RESPONSE_BYTE_COUNT
    {
        return Err(S8Error::InvalidHeader);
    }

    // Modbus CRC is transmitted as [CRC_LOW, CRC_HIGH]
    let received_crc = ((buf[6] as u16) << 8) | (buf[5] as u16);
    let calculated_crc = crc16_modbus(&buf[0..5]);

    if calculated_crc != received_crc {
        return Err(S8Error::ChecksumError);
    }

    Ok(())
}

fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if (crc & 0x0001) != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}
