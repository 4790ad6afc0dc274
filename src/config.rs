//! Compile-time configuration for the STIMA firmware.
//!
//! Timeouts, periods and retry budgets of the task state machines live here,
//! together with defaults taken from environment variables at build time.
//! The station configuration that can change at runtime is in
//! [`crate::settings`].

use embassy_time::Duration;

/// Supervisor task settings.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// How often (in wall-clock seconds) the tick interrupt wakes the supervisor.
    pub period_secs: u32,
    /// How long the supervisor waits for the connection task before moving on.
    pub connection_wait: Duration,
}

/// Network bring-up settings.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Maximum time spent polling `Transport::connect` per activation.
    pub connect_timeout: Duration,
    /// Attempts at opening the datagram socket.
    pub socket_attempts: u8,
}

/// Time synchronisation settings.
#[derive(Debug, Clone, Copy)]
pub struct TimeConfig {
    /// How long to wait for a time server response.
    pub response_timeout: Duration,
    /// Requests sent before falling back to the RTC.
    pub request_attempts: u8,
    /// Network sync is requested again once the last one is older than this (seconds).
    pub sync_period_secs: u32,
}

/// Sensor polling settings.
#[derive(Debug, Clone, Copy)]
pub struct SensorTimingConfig {
    /// Maximum time a sensor may take to become ready.
    pub prepare_timeout: Duration,
    /// Maximum time a sensor may take to deliver its values.
    pub read_timeout: Duration,
}

/// Telemetry publish settings.
#[derive(Debug, Clone, Copy)]
pub struct PublishConfig {
    /// Time handed to the pub/sub client on every yield.
    pub yield_timeout: Duration,
    /// Attempts at connecting the pub/sub session before the cycle is aborted.
    pub connect_attempts: u8,
}

/// Console stream settings.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Bytes consumed from the stream per dispatcher step.
    pub bytes_per_step: usize,
    /// The task deactivates after this long without input.
    pub end_task_timeout: Duration,
}

/// Maximum activation time before the supervisor cancels a task.
#[derive(Debug, Clone, Copy)]
pub struct BudgetConfig {
    pub connection: Duration,
    pub time_sync: Duration,
    pub sensors_reading: Duration,
    pub data_saving: Duration,
    pub publish: Duration,
}

/// Wifi transport settings (device only).
#[derive(Debug, Clone, Copy)]
pub struct WifiConfig {
    /// WiFi SSID to connect to.
    pub ssid: Option<&'static str>,
    /// WiFi password for authentication.
    pub password: Option<&'static str>,
}

/// Watchdog configuration settings.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// How often the watchdog task checks system health.
    pub tick_interval: Duration,
    /// Maximum time since the last dispatcher step before the system is considered unhealthy.
    pub dispatcher_timeout: Duration,
    /// Duration of the watchdog kick pulse (HIGH state) in milliseconds.
    pub kick_duration_ms: u32,
}

/// Defaults for the persisted station configuration.
#[derive(Debug, Clone, Copy)]
pub struct DefaultsConfig {
    pub module_name: &'static str,
    pub mqtt_server: &'static str,
    pub mqtt_port: u16,
    pub mqtt_username: &'static str,
    pub mqtt_password: &'static str,
    pub mqtt_root_topic: &'static str,
    pub mqtt_subscribe_topic: &'static str,
    pub ntp_server: &'static str,
    pub report_seconds: u16,
}

/// Global application configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub connection: ConnectionConfig,
    pub time: TimeConfig,
    pub sensor: SensorTimingConfig,
    pub publish: PublishConfig,
    pub stream: StreamConfig,
    pub budget: BudgetConfig,
    pub wifi: WifiConfig,
    pub watchdog: WatchdogConfig,
    pub defaults: DefaultsConfig,
    /// Upper bound on polls spent in any waiting state, whatever the clock does.
    pub max_polls: u32,
    /// Whether the firmware main loop prints a status line every second.
    pub print_status_loop: bool,
}

const fn env_or(value: Option<&'static str>, default: &'static str) -> &'static str {
    match value {
        Some(v) => v,
        None => default,
    }
}

impl Config {
    /// Creates a new configuration from compile-time environment variables.
    const fn new() -> Self {
        Self {
            supervisor: SupervisorConfig {
                period_secs: 60,
                connection_wait: Duration::from_secs(60),
            },
            connection: ConnectionConfig {
                connect_timeout: Duration::from_secs(30),
                socket_attempts: 3,
            },
            time: TimeConfig {
                response_timeout: Duration::from_secs(5),
                request_attempts: 3,
                sync_period_secs: 6 * 3600,
            },
            sensor: SensorTimingConfig {
                prepare_timeout: Duration::from_secs(15),
                read_timeout: Duration::from_secs(5),
            },
            publish: PublishConfig {
                yield_timeout: Duration::from_millis(100),
                connect_attempts: 3,
            },
            stream: StreamConfig {
                bytes_per_step: 64,
                end_task_timeout: Duration::from_secs(60),
            },
            budget: BudgetConfig {
                connection: Duration::from_secs(120),
                time_sync: Duration::from_secs(60),
                sensors_reading: Duration::from_secs(60),
                data_saving: Duration::from_secs(30),
                publish: Duration::from_secs(600),
            },
            wifi: WifiConfig {
                ssid: option_env!("STIMA_WIFI_SSID"),
                password: option_env!("STIMA_WIFI_PASSWORD"),
            },
            watchdog: WatchdogConfig {
                tick_interval: Duration::from_secs(30),
                dispatcher_timeout: Duration::from_secs(120),
                kick_duration_ms: 25,
            },
            defaults: DefaultsConfig {
                module_name: env_or(option_env!("STIMA_MODULE_NAME"), "stima"),
                mqtt_server: env_or(option_env!("STIMA_MQTT_SERVER"), "rmap.cc"),
                mqtt_port: 1883,
                mqtt_username: env_or(option_env!("STIMA_MQTT_USERNAME"), ""),
                mqtt_password: env_or(option_env!("STIMA_MQTT_PASSWORD"), ""),
                mqtt_root_topic: "sample",
                mqtt_subscribe_topic: "rpc",
                ntp_server: env_or(option_env!("STIMA_NTP_SERVER"), "pool.ntp.org"),
                report_seconds: 60,
            },
            max_polls: 10_000,
            print_status_loop: match option_env!("PRINT_STATUS_LOOP") {
                Some(s) => matches!(s.as_bytes(), b"true"),
                None => false,
            },
        }
    }
}

/// Global configuration instance.
pub static CONFIG: Config = Config::new();
