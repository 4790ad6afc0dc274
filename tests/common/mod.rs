//! Fake collaborators and a stepping harness for the station.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::convert::Infallible;
use std::task::Poll;

use embassy_time::{Duration, Instant};

use stima::clock::{Day, Rtc};
use stima::config::CONFIG;
use stima::interrupts::Interrupts;
use stima::network::{Credentials, NetworkKind, PubSub, TimeSource, Transport};
use stima::scheduler::TaskId;
use stima::sensors::{SensorBank, SensorDriver, SensorError, SensorKind, SensorName, Values};
use stima::settings::{self, Configuration, MemoryConfigStore, SensorConfig};
use stima::station::{Board, Devices, Fatal, Station};
use stima::store::{
    Cursor, FileMode, LogRecord, LogStore, MemoryCursorStore, MemoryLogStore,
};

/// A sealed day: 2026-10-14.
pub const DAY: Day = Day(20_740);
/// The day the station boots on.
pub const TODAY: Day = DAY.next();
/// Half a minute before a sample and supervisor boundary.
pub const BOOT_EPOCH: u32 = TODAY.start_epoch() + 12 * 3_600 + 30;

/// Monotonic time added per dispatcher step.
pub const STEP: Duration = Duration::from_millis(50);
/// No activation in these tests needs anywhere near this many steps.
pub const MAX_STEPS: usize = 20_000;

pub struct FakeTransport {
    pub link_up: bool,
    pub connected: bool,
    pub connects: u32,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self {
            link_up: true,
            connected: false,
            connects: 0,
        }
    }
}

impl Transport for FakeTransport {
    fn kind(&self) -> NetworkKind {
        NetworkKind::Ethernet
    }

    fn connect(&mut self) -> bool {
        self.connects += 1;
        self.connected = self.link_up;
        self.connected
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn open_socket(&mut self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// Answers every request with `response`, or never when it is `None`.
#[derive(Default)]
pub struct FakeTimeSource {
    pub response: Option<u32>,
    pub requests: u32,
    pending: bool,
}

impl TimeSource for FakeTimeSource {
    fn send_request(&mut self, _server: &str) -> bool {
        self.requests += 1;
        self.pending = true;
        true
    }

    fn poll_response(&mut self) -> Option<u32> {
        if !self.pending {
            return None;
        }
        let response = self.response?;
        self.pending = false;
        Some(response)
    }
}

#[derive(Default)]
pub struct FakePubSub {
    pub connected: bool,
    pub refuse_connect: bool,
    pub connects: u32,
    /// Acknowledge this many more publishes, then refuse.
    pub ack_budget: Option<usize>,
    /// The broker drops the session after this many more publishes.
    pub drop_after: Option<usize>,
    /// The broker drops the session after every publish.
    pub flaky: bool,
    pub published: Vec<(String, Vec<u8>)>,
    pub subscriptions: Vec<String>,
    pub inbox: VecDeque<Vec<u8>>,
}

impl FakePubSub {
    pub fn payloads(&self) -> Vec<String> {
        self.published
            .iter()
            .map(|(_, payload)| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<String> {
        self.published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }
}

impl PubSub for FakePubSub {
    fn connect(&mut self, _credentials: &Credentials<'_>) -> bool {
        self.connects += 1;
        self.connected = !self.refuse_connect;
        self.connected
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        self.subscriptions.push(topic.to_owned());
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        if !self.connected {
            return false;
        }
        if let Some(budget) = &mut self.ack_budget {
            if *budget == 0 {
                return false;
            }
            *budget -= 1;
        }
        self.published.push((topic.to_owned(), payload.to_vec()));
        if let Some(left) = &mut self.drop_after {
            *left = left.saturating_sub(1);
            if *left == 0 {
                self.connected = false;
                self.drop_after = None;
            }
        }
        if self.flaky {
            self.connected = false;
        }
        true
    }

    fn yield_now(&mut self, _timeout: Duration, on_message: &mut dyn FnMut(&[u8])) {
        if !self.connected {
            return;
        }
        while let Some(message) = self.inbox.pop_front() {
            on_message(&message);
        }
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[derive(Default)]
pub struct FakeRtc {
    pub epoch: Option<u32>,
    pub writes: u32,
}

impl Rtc for FakeRtc {
    fn read(&mut self) -> Option<u32> {
        self.epoch
    }

    fn write(&mut self, epoch: u32) -> bool {
        self.epoch = Some(epoch);
        self.writes += 1;
        true
    }
}

#[derive(Default, Clone)]
pub struct FakeSensor {
    pub values: Vec<Option<i32>>,
    /// Never becomes ready.
    pub stuck: bool,
    pub fail: Option<SensorError>,
    pub reads: u32,
    pub aborts: u32,
}

impl SensorDriver for FakeSensor {
    fn prepare(&mut self, _now: Instant) -> Poll<Result<(), SensorError>> {
        if self.stuck {
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn read(&mut self, _now: Instant) -> Poll<Result<Values, SensorError>> {
        if let Some(e) = self.fail {
            return Poll::Ready(Err(e));
        }
        self.reads += 1;
        let mut values = Values::new();
        for value in &self.values {
            let _ = values.push(*value);
        }
        Poll::Ready(Ok(values))
    }

    fn abort(&mut self) {
        self.aborts += 1;
    }
}

pub struct FakeSensors {
    pub slots: Vec<(SensorKind, u8, FakeSensor)>,
}

impl FakeSensors {
    /// One healthy sensor per configured entry, sensor `i` reporting `[100 * i + 1]`.
    pub fn for_configuration(configuration: &Configuration) -> Self {
        let slots = configuration
            .sensors
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let sensor = FakeSensor {
                    values: vec![Some(100 * i as i32 + 1)],
                    ..FakeSensor::default()
                };
                (s.kind, s.address, sensor)
            })
            .collect();
        Self { slots }
    }

    pub fn get_mut(&mut self, index: usize) -> &mut FakeSensor {
        &mut self.slots[index].2
    }
}

impl SensorBank for FakeSensors {
    fn driver(&mut self, kind: SensorKind, address: u8) -> Option<&mut dyn SensorDriver> {
        self.slots
            .iter_mut()
            .find(|(k, a, _)| *k == kind && *a == address)
            .map(|(_, _, sensor)| sensor as &mut dyn SensorDriver)
    }
}

#[derive(Default)]
pub struct FakeConsole {
    pub input: VecDeque<u8>,
    pub output: Vec<u8>,
}

impl FakeConsole {
    pub fn send(&mut self, line: &str) {
        self.input.extend(line.bytes());
        self.input.push_back(b'\n');
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.output)
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl embedded_io::ErrorType for FakeConsole {
    type Error = Infallible;
}

impl embedded_io::Read for FakeConsole {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut n = 0;
        while n < buf.len() {
            match self.input.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl embedded_io::ReadReady for FakeConsole {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.input.is_empty())
    }
}

impl embedded_io::Write for FakeConsole {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub struct TestBoard;

impl Board for TestBoard {
    type Transport = FakeTransport;
    type TimeSource = FakeTimeSource;
    type PubSub = FakePubSub;
    type LogStore = MemoryLogStore<8, 8192>;
    type CursorStore = MemoryCursorStore;
    type ConfigStore = MemoryConfigStore;
    type Rtc = FakeRtc;
    type Sensors = FakeSensors;
    type Console = FakeConsole;
}

/// A healthy board with the default configuration, booting at [`BOOT_EPOCH`].
pub fn devices() -> Devices<TestBoard> {
    devices_with(None)
}

/// Like [`devices`], with `configuration` saved in the configuration store.
pub fn devices_with(configuration: Option<Configuration>) -> Devices<TestBoard> {
    let mut config_store = MemoryConfigStore::new();
    let sensors = match &configuration {
        Some(configuration) => {
            settings::save(&mut config_store, configuration).expect("configuration fits");
            FakeSensors::for_configuration(configuration)
        }
        None => FakeSensors::for_configuration(&Configuration::default()),
    };
    Devices {
        transport: FakeTransport::default(),
        time_source: FakeTimeSource {
            response: Some(BOOT_EPOCH),
            ..FakeTimeSource::default()
        },
        pubsub: FakePubSub::default(),
        log_store: MemoryLogStore::new(),
        cursor_store: MemoryCursorStore::new(),
        config_store,
        rtc: FakeRtc {
            epoch: Some(BOOT_EPOCH),
            writes: 0,
        },
        sensors,
        console: FakeConsole::default(),
    }
}

pub fn sensor_config(kind: SensorKind, address: u8, name: &str) -> SensorConfig {
    SensorConfig {
        kind,
        address,
        name: SensorName::try_from(name).expect("short name"),
    }
}

/// Record `index` of `sensor` on `day`, one a minute, value `100 * sensor + index`.
pub fn record(day: Day, sensor: u8, index: u32) -> LogRecord {
    let mut values = Values::new();
    values
        .push(Some(100 * i32::from(sensor) + index as i32))
        .expect("one value");
    LogRecord {
        sensor,
        name: SensorName::try_from(if sensor == 0 { "co2" } else { "voc_nox" })
            .expect("short name"),
        timestamp: day.start_epoch() + index * 60,
        values,
    }
}

/// Published payload of [`record`].
pub fn payload(day: Day, sensor: u8, index: u32) -> String {
    let payload = record(day, sensor, index).payload().expect("payload fits");
    String::from_utf8(payload.to_vec()).expect("utf-8 payload")
}

/// Appends `counts[s]` records for each sensor `s` to the day file,
/// interleaved by sample time as the data-saving task writes them.
pub fn seed_day<S: LogStore>(store: &mut S, day: Day, counts: &[u32]) {
    store.open_store().expect("store available");
    let file = store
        .open(&day.file_name(), FileMode::Append)
        .expect("day file");
    let samples = counts.iter().copied().max().unwrap_or(0);
    for index in 0..samples {
        for (sensor, count) in counts.iter().enumerate() {
            if index < *count {
                let line = record(day, sensor as u8, index).encode().expect("line fits");
                store.append(file, &line).expect("room for line");
            }
        }
    }
    store.close(file);
    store.close_store();
}

/// Appends one more line to a day file.
pub fn append_record<S: LogStore>(store: &mut S, day: Day, record: &LogRecord) {
    store.open_store().expect("store available");
    let file = store
        .open(&day.file_name(), FileMode::Append)
        .expect("day file");
    let line = record.encode().expect("line fits");
    store.append(file, &line).expect("room for line");
    store.close(file);
    store.close_store();
}

/// Decoded lines of a day file.
pub fn day_records<const F: usize, const B: usize>(
    store: &MemoryLogStore<F, B>,
    day: Day,
) -> Vec<LogRecord> {
    store
        .file(&day.file_name())
        .unwrap_or_default()
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| LogRecord::decode(line).expect("well-formed line"))
        .collect()
}

pub fn stored_cursor(store: &MemoryCursorStore) -> Option<Cursor> {
    store
        .raw()
        .map(|raw| Cursor::decode(&raw).expect("valid cursor record"))
}

pub struct Harness {
    pub station: Station<'static, TestBoard>,
    pub interrupts: &'static Interrupts,
    pub now: Instant,
}

impl Harness {
    /// Powers the board up without stepping it.
    pub fn new(dev: Devices<TestBoard>) -> Self {
        let interrupts: &'static Interrupts =
            Box::leak(Box::new(Interrupts::new(CONFIG.supervisor.period_secs)));
        Self {
            station: Station::new(dev, interrupts),
            interrupts,
            now: Instant::from_secs(1),
        }
    }

    /// Powers the board up and runs the boot activations to completion.
    pub fn boot(dev: Devices<TestBoard>) -> Self {
        let mut harness = Self::new(dev);
        harness.run_until_idle().expect("boot without fatal error");
        harness
    }

    pub fn step(&mut self) -> Result<(), Fatal> {
        let result = self.station.step(self.now);
        self.now += STEP;
        result
    }

    /// Steps until every task is parked; the number of steps taken.
    pub fn run_until_idle(&mut self) -> Result<usize, Fatal> {
        for steps in 1..=MAX_STEPS {
            self.step()?;
            if self.station.is_idle() {
                return Ok(steps);
            }
        }
        panic!("station still busy after {} steps", MAX_STEPS);
    }

    /// One second passes.
    pub fn tick(&mut self) -> Result<(), Fatal> {
        self.interrupts.on_tick();
        self.now += Duration::from_secs(1);
        self.run_until_idle().map(|_| ())
    }

    /// Ticks up to the next whole minute, where both the supervisor and the
    /// sample schedule fire.
    pub fn tick_to_minute(&mut self) -> Result<(), Fatal> {
        loop {
            self.tick()?;
            if self.epoch() % 60 == 0 {
                return Ok(());
            }
        }
    }

    pub fn trigger(&mut self, task: TaskId) -> Result<usize, Fatal> {
        self.station.signal(task);
        self.run_until_idle()
    }

    pub fn epoch(&self) -> u32 {
        self.interrupts.epoch().expect("clock set")
    }

    pub fn dev(&mut self) -> &mut Devices<TestBoard> {
        &mut self.station.context_mut().dev
    }

    /// Cuts the power: RAM state is lost, the stores and the RTC survive,
    /// the link and the broker session do not.
    pub fn crash(self) -> Devices<TestBoard> {
        let epoch = self.interrupts.epoch();
        let mut dev = self.station.into_devices();
        dev.log_store.power_cycle();
        dev.cursor_store.power_cycle();
        dev.transport.connected = false;
        dev.pubsub.connected = false;
        if epoch.is_some() {
            dev.rtc.epoch = epoch;
            if dev.time_source.response.is_some() {
                dev.time_source.response = epoch;
            }
        }
        dev
    }
}
