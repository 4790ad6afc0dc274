//! The STIMA ESP32-C3 board: wifi link, SNTP, MQTT, RAM stores, RTC timer
//! and the two on-board sensors.

use esp_hal::Blocking;
use esp_hal::i2c::master::I2c;
use esp_hal::rtc_cntl::Rtc;
use esp_hal::uart::Uart;

use super::mqtt::MqttClient;
use super::sntp::SntpClient;
use super::wifi::WifiTransport;
use crate::clock;
use crate::sensors::s8::S8;
use crate::sensors::sgp41::Sgp41;
use crate::sensors::{SensorBank, SensorDriver, SensorKind};
use crate::settings::MemoryConfigStore;
use crate::station::Board;
use crate::store::{MemoryCursorStore, MemoryLogStore};

pub struct Stima;

impl Board for Stima {
    type Transport = WifiTransport;
    type TimeSource = SntpClient;
    type PubSub = MqttClient;
    type LogStore = MemoryLogStore<4, 8192>;
    type CursorStore = MemoryCursorStore;
    type ConfigStore = MemoryConfigStore;
    type Rtc = RtcClock;
    type Sensors = OnBoardSensors;
    type Console = Uart<'static, Blocking>;
}

/// The low-power RTC timer, which keeps counting across software resets.
pub struct RtcClock {
    rtc: Rtc<'static>,
}

impl RtcClock {
    pub fn new(rtc: Rtc<'static>) -> Self {
        Self { rtc }
    }
}

impl clock::Rtc for RtcClock {
    fn read(&mut self) -> Option<u32> {
        u32::try_from(self.rtc.current_time_us() / 1_000_000).ok()
    }

    fn write(&mut self, epoch: u32) -> bool {
        self.rtc.set_current_time_us(u64::from(epoch) * 1_000_000);
        true
    }
}

pub struct OnBoardSensors {
    pub s8: S8<Uart<'static, Blocking>>,
    pub sgp41: Sgp41<I2c<'static, Blocking>>,
}

impl SensorBank for OnBoardSensors {
    fn driver(&mut self, kind: SensorKind, address: u8) -> Option<&mut dyn SensorDriver> {
        match kind {
            SensorKind::S8 => Some(&mut self.s8),
            SensorKind::Sgp41 if address == self.sgp41.address() => Some(&mut self.sgp41),
            SensorKind::Sgp41 => None,
        }
    }
}
