//! Station configuration that can change at runtime.
//!
//! Tasks read [`ConfigPair::readable`]; RPC requests edit
//! [`ConfigPair::writable`]. The station copies writable into readable between
//! dispatcher steps once a commit was requested, so a task never sees the
//! configuration change in the middle of a transition.
//!
//! Persisted record layout: magic `b"STIM"`, version byte, `u16` body length
//! (little endian), postcard body, CRC-8 over everything before it.

use core::str::FromStr;

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::config::CONFIG;
use crate::crc::crc8;
use crate::network::{NetworkKind, Topic};
use crate::sensors::{MAX_SENSORS, SensorKind, SensorName};
use crate::store::StoreError;

const MAGIC: [u8; 4] = *b"STIM";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 7;
const BODY_LEN: usize = 512;

/// Largest persisted configuration record.
pub const CONFIG_RECORD_LEN: usize = HEADER_LEN + BODY_LEN + 1;

pub type Name = String<32>;
pub type Host = String<48>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SettingsError {
    UnknownField,
    InvalidValue,
    TooLong,
    Encode,
    BadRecord,
    Store(StoreError),
}

impl From<StoreError> for SettingsError {
    fn from(e: StoreError) -> Self {
        SettingsError::Store(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub kind: SensorKind,
    /// Bus address: I2C address, or Modbus address for UART sensors.
    pub address: u8,
    /// Topic suffix the readings are published under.
    pub name: SensorName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub module_name: Name,
    pub network: NetworkKind,
    pub mqtt_server: Host,
    pub mqtt_port: u16,
    pub mqtt_username: Name,
    pub mqtt_password: Name,
    pub mqtt_root_topic: Host,
    pub mqtt_subscribe_topic: Host,
    pub ntp_server: Host,
    /// Sample interval, aligned to wall-clock boundaries.
    pub report_seconds: u16,
    pub sensors: Vec<SensorConfig, MAX_SENSORS>,
}

/// Value of one scalar configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue<'a> {
    Str(&'a str),
    Num(u32),
}

/// Fields reachable through [`Configuration::field`] and [`Configuration::set_field`].
pub const FIELDS: [&str; 10] = [
    "module_name",
    "network",
    "mqtt_server",
    "mqtt_port",
    "mqtt_username",
    "mqtt_password",
    "mqtt_root_topic",
    "mqtt_subscribe_topic",
    "ntp_server",
    "report_seconds",
];

fn truncated<const N: usize>(value: &str) -> String<N> {
    let mut out = String::new();
    for c in value.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

fn sensor(kind: SensorKind, address: u8, name: &str) -> SensorConfig {
    SensorConfig {
        kind,
        address,
        name: truncated(name),
    }
}

impl Default for Configuration {
    fn default() -> Self {
        let defaults = &CONFIG.defaults;
        let mut sensors = Vec::new();
        let _ = sensors.push(sensor(SensorKind::S8, 0xFE, "co2"));
        let _ = sensors.push(sensor(SensorKind::Sgp41, 0x59, "voc_nox"));
        Self {
            module_name: truncated(defaults.module_name),
            network: NetworkKind::Wifi,
            mqtt_server: truncated(defaults.mqtt_server),
            mqtt_port: defaults.mqtt_port,
            mqtt_username: truncated(defaults.mqtt_username),
            mqtt_password: truncated(defaults.mqtt_password),
            mqtt_root_topic: truncated(defaults.mqtt_root_topic),
            mqtt_subscribe_topic: truncated(defaults.mqtt_subscribe_topic),
            ntp_server: truncated(defaults.ntp_server),
            report_seconds: defaults.report_seconds,
            sensors,
        }
    }
}

fn set_str<const N: usize>(slot: &mut String<N>, value: &str) -> Result<(), SettingsError> {
    *slot = String::from_str(value).map_err(|_| SettingsError::TooLong)?;
    Ok(())
}

impl Configuration {
    pub fn field(&self, name: &str) -> Result<FieldValue<'_>, SettingsError> {
        Ok(match name {
            "module_name" => FieldValue::Str(&self.module_name),
            "network" => FieldValue::Str(match self.network {
                NetworkKind::Ethernet => "ethernet",
                NetworkKind::Gsm => "gsm",
                NetworkKind::Wifi => "wifi",
            }),
            "mqtt_server" => FieldValue::Str(&self.mqtt_server),
            "mqtt_port" => FieldValue::Num(u32::from(self.mqtt_port)),
            "mqtt_username" => FieldValue::Str(&self.mqtt_username),
            "mqtt_password" => FieldValue::Str(if self.mqtt_password.is_empty() {
                ""
            } else {
                "***"
            }),
            "mqtt_root_topic" => FieldValue::Str(&self.mqtt_root_topic),
            "mqtt_subscribe_topic" => FieldValue::Str(&self.mqtt_subscribe_topic),
            "ntp_server" => FieldValue::Str(&self.ntp_server),
            "report_seconds" => FieldValue::Num(u32::from(self.report_seconds)),
            _ => return Err(SettingsError::UnknownField),
        })
    }

    pub fn set_field(&mut self, name: &str, value: &str) -> Result<(), SettingsError> {
        match name {
            "module_name" => set_str(&mut self.module_name, value),
            "network" => {
                self.network = match value {
                    "ethernet" => NetworkKind::Ethernet,
                    "gsm" => NetworkKind::Gsm,
                    "wifi" => NetworkKind::Wifi,
                    _ => return Err(SettingsError::InvalidValue),
                };
                Ok(())
            }
            "mqtt_server" => set_str(&mut self.mqtt_server, value),
            "mqtt_port" => {
                self.mqtt_port = match value.parse::<u16>() {
                    Ok(port) if port != 0 => port,
                    _ => return Err(SettingsError::InvalidValue),
                };
                Ok(())
            }
            "mqtt_username" => set_str(&mut self.mqtt_username, value),
            "mqtt_password" => set_str(&mut self.mqtt_password, value),
            "mqtt_root_topic" => set_str(&mut self.mqtt_root_topic, value),
            "mqtt_subscribe_topic" => set_str(&mut self.mqtt_subscribe_topic, value),
            "ntp_server" => set_str(&mut self.ntp_server, value),
            "report_seconds" => {
                self.report_seconds = match value.parse::<u16>() {
                    Ok(secs) if secs != 0 => secs,
                    _ => return Err(SettingsError::InvalidValue),
                };
                Ok(())
            }
            _ => Err(SettingsError::UnknownField),
        }
    }

    /// Topic the station listens on for remote requests: `<subscribe>/<module>`.
    pub fn rpc_topic(&self) -> Topic {
        let mut topic = Topic::new();
        let _ = topic.push_str(self.mqtt_subscribe_topic.trim_end_matches('/'));
        let _ = topic.push('/');
        let _ = topic.push_str(&self.module_name);
        topic
    }

    pub fn encode(&self, out: &mut [u8; CONFIG_RECORD_LEN]) -> Result<usize, SettingsError> {
        let body_len = postcard::to_slice(self, &mut out[HEADER_LEN..HEADER_LEN + BODY_LEN])
            .map_err(|_| SettingsError::Encode)?
            .len();
        out[..4].copy_from_slice(&MAGIC);
        out[4] = VERSION;
        out[5..7].copy_from_slice(&(body_len as u16).to_le_bytes());
        let end = HEADER_LEN + body_len;
        out[end] = crc8(&out[..end]);
        Ok(end + 1)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, SettingsError> {
        if raw.len() < HEADER_LEN + 1 || raw[..4] != MAGIC || raw[4] != VERSION {
            return Err(SettingsError::BadRecord);
        }
        let body_len = usize::from(u16::from_le_bytes([raw[5], raw[6]]));
        let end = HEADER_LEN + body_len;
        if raw.len() <= end || crc8(&raw[..end]) != raw[end] {
            return Err(SettingsError::BadRecord);
        }
        postcard::from_bytes(&raw[HEADER_LEN..end]).map_err(|_| SettingsError::BadRecord)
    }
}

/// Persistent configuration record (EEPROM or flash sector).
pub trait ConfigStore {
    /// Copies the stored record into `buf`, `None` if nothing was saved.
    fn load(&mut self, buf: &mut [u8]) -> Option<usize>;
    fn save(&mut self, record: &[u8]) -> Result<(), StoreError>;
}

/// Configuration record kept in RAM.
#[derive(Default)]
pub struct MemoryConfigStore {
    record: Option<Vec<u8, CONFIG_RECORD_LEN>>,
}

impl MemoryConfigStore {
    pub const fn new() -> Self {
        Self { record: None }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&mut self, buf: &mut [u8]) -> Option<usize> {
        let record = self.record.as_ref()?;
        let dst = buf.get_mut(..record.len())?;
        dst.copy_from_slice(record);
        Some(record.len())
    }

    fn save(&mut self, record: &[u8]) -> Result<(), StoreError> {
        self.record = Some(Vec::from_slice(record).map_err(|_| StoreError::Full)?);
        Ok(())
    }
}

/// Loads the saved configuration, falling back to the defaults.
pub fn load<S: ConfigStore + ?Sized>(store: &mut S) -> Configuration {
    let mut buf = [0u8; CONFIG_RECORD_LEN];
    let Some(len) = store.load(&mut buf) else {
        log_info!("settings: no saved configuration, using defaults");
        return Configuration::default();
    };
    match Configuration::decode(&buf[..len]) {
        Ok(configuration) => configuration,
        Err(e) => {
            log_warn!("settings: saved configuration rejected ({:?}), using defaults", e);
            Configuration::default()
        }
    }
}

pub fn save<S: ConfigStore + ?Sized>(
    store: &mut S,
    configuration: &Configuration,
) -> Result<(), SettingsError> {
    let mut buf = [0u8; CONFIG_RECORD_LEN];
    let len = configuration.encode(&mut buf)?;
    store.save(&buf[..len])?;
    log_info!("settings: configuration saved ({} bytes)", len);
    Ok(())
}

/// Dumps the configuration to the log.
pub fn print_configuration(configuration: &Configuration) {
    log_info!("--> module: {}", configuration.module_name.as_str());
    log_info!("--> network: {:?}", configuration.network);
    log_info!(
        "--> mqtt server: {}:{}",
        configuration.mqtt_server.as_str(),
        configuration.mqtt_port
    );
    log_info!("--> mqtt username: {}", configuration.mqtt_username.as_str());
    log_info!("--> mqtt root topic: {}", configuration.mqtt_root_topic.as_str());
    log_info!(
        "--> mqtt subscribe topic: {}",
        configuration.mqtt_subscribe_topic.as_str()
    );
    log_info!("--> ntp server: {}", configuration.ntp_server.as_str());
    log_info!("--> report seconds: {}", configuration.report_seconds);
    for (i, sensor) in configuration.sensors.iter().enumerate() {
        log_info!(
            "--> sensor {}: {:?} @ {} -> {}",
            i,
            sensor.kind,
            sensor.address,
            sensor.name.as_str()
        );
    }
}

/// Readable and writable copies of the configuration.
pub struct ConfigPair {
    readable: Configuration,
    writable: Configuration,
    commit_requested: bool,
}

impl ConfigPair {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            writable: configuration.clone(),
            readable: configuration,
            commit_requested: false,
        }
    }

    pub fn readable(&self) -> &Configuration {
        &self.readable
    }

    pub fn writable(&self) -> &Configuration {
        &self.writable
    }

    pub fn writable_mut(&mut self) -> &mut Configuration {
        &mut self.writable
    }

    /// Asks for the writable copy to become readable at the next commit point.
    pub fn request_commit(&mut self) {
        self.commit_requested = true;
    }

    /// Called by the station between dispatcher steps; `true` when the
    /// readable copy changed.
    pub fn commit(&mut self) -> bool {
        if !self.commit_requested {
            return false;
        }
        self.commit_requested = false;
        if self.readable == self.writable {
            return false;
        }
        self.readable.clone_from(&self.writable);
        true
    }
}
