//! Telemetry-Publish: uploads the day files from the persisted cursor on.
//!
//! The walk goes day by day, within a day sensor by sensor, within a sensor
//! record by record in file order. Each record is published and, only once the
//! broker acknowledged it, the cursor moves past it and is written back before
//! the next record is read. A restart anywhere in between therefore replays at
//! most the one record whose acknowledgement was not yet persisted.
//!
//! The cursor names a single `(day, sensor, record)` position, so it can only
//! leave a sensor once no more lines can be appended for it: a day is sealed
//! when it is before today and no reading still on its way to the store
//! belongs to it, buffered or part of a sensors cycle in progress. On the
//! open day only the cursor's own sensor is drained.
//!
//! While the session is up the task also yields to the pub/sub client, which
//! hands over RPC requests received on the subscribe topic.

use embassy_time::Instant;

use super::Task;
use crate::clock::Day;
use crate::config::CONFIG;
use crate::network::{Credentials, PubSub, Transport, publish_topic, response_topic};
use crate::rpc::{self, Request, Response, RpcContext};
use crate::scheduler::{Dispatcher, TaskId};
use crate::station::{Board, Context, Fatal};
use crate::store::{
    CURSOR_RECORD_LEN, Cursor, CursorStore, FileHandle, FileMode, LINE_LEN, LogRecord, LogStore,
    StoreError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PublishState {
    Init,
    OpenStore,
    OpenCursorRecord,
    ReadCursor,
    FindStartPosition,
    Found,
    CursorEnd,
    OpenConnection,
    Check,
    Connect,
    Subscribe,
    OpenDataFile,
    SensorsLoop,
    DataLoop,
    RecordLoop,
    Publish,
    CloseDataFile,
    Disconnect,
    UpdateCursor,
    CloseCursorRecord,
    CloseStore,
    End,
    Wait,
}

pub struct Publish {
    state: PublishState,
    store_open: bool,
    cursor_open: bool,
    session: bool,
    file: Option<FileHandle>,
    /// Position of the walk; only ever moves forward.
    cursor: Option<Cursor>,
    /// Last value written to the cursor store.
    persisted: Option<Cursor>,
    today: Day,
    /// Lines of `cursor.sensor` met so far in the current pass over the file.
    seen: u32,
    /// Smallest sensor index above the cursor's met in the current pass.
    next_sensor: Option<u8>,
    record: Option<LogRecord>,
    advance_day: bool,
    /// Nothing to walk; connect only to serve RPC requests.
    walk_done: bool,
    finishing: bool,
    attempts: u8,
    published: u32,
    /// The session dropped mid-walk; try again right away.
    retry: bool,
    retrying: bool,
}

impl Default for Publish {
    fn default() -> Self {
        Self::new()
    }
}

/// A day can no longer grow.
pub fn is_sealed(day: Day, today: Day, oldest_unsaved: Option<u32>) -> bool {
    day < today && oldest_unsaved.is_none_or(|t| Day::from_epoch(t) > day)
}

/// First day file after `after` (or the first one at all), skipping files
/// whose name is not a day.
fn next_day<S: LogStore>(store: &mut S, after: Option<Day>) -> Option<Day> {
    let mut name = after.map(Day::file_name);
    loop {
        let next = store.next_file(name.as_deref())?;
        if let Some(day) = Day::from_file_name(&next) {
            return Some(day);
        }
        name = Some(next);
    }
}

/// Requests answered per yield; any beyond are dropped.
const RPC_PER_YIELD: usize = 2;

/// Lets the pub/sub client run and answers the RPC requests that arrived.
fn serve_rpc<B: Board>(ctx: &mut Context<'_, B>) {
    let mut requests: heapless::Vec<Request, RPC_PER_YIELD> = heapless::Vec::new();
    let mut dropped = 0u32;
    ctx.dev
        .pubsub
        .yield_now(CONFIG.publish.yield_timeout, &mut |message: &[u8]| {
            let queued = Request::from_slice(message)
                .ok()
                .is_some_and(|r| requests.push(r).is_ok());
            if !queued {
                dropped += 1;
            }
        });
    if dropped > 0 {
        log_warn!("publish: {} RPC requests dropped", dropped);
    }

    let topic = response_topic(&ctx.settings.readable().rpc_topic());
    for request in &requests {
        let mut response = Response::new();
        let epoch = ctx.epoch();
        let mut rpc_ctx = RpcContext {
            settings: &mut ctx.settings,
            config_store: &mut ctx.dev.config_store,
            status: &mut ctx.status,
            epoch,
        };
        rpc::process(request, &mut rpc_ctx, &mut response);

        if !ctx.dev.pubsub.publish(&topic, response.as_bytes()) {
            log_warn!("publish: RPC response not delivered");
        }
    }
}

impl Publish {
    pub const fn new() -> Self {
        Self {
            state: PublishState::Init,
            store_open: false,
            cursor_open: false,
            session: false,
            file: None,
            cursor: None,
            persisted: None,
            today: Day(0),
            seen: 0,
            next_sensor: None,
            record: None,
            advance_day: false,
            walk_done: false,
            finishing: false,
            attempts: 0,
            published: 0,
            retry: false,
            retrying: false,
        }
    }

    pub fn state(&self) -> PublishState {
        self.state
    }

    /// Position of the walk in the current activation.
    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    fn release<B: Board>(&mut self, ctx: &mut Context<'_, B>) {
        if let Some(file) = self.file.take() {
            ctx.dev.log_store.close(file);
        }
        if core::mem::take(&mut self.session) && ctx.dev.pubsub.is_connected() {
            ctx.dev.pubsub.disconnect();
        }
        if core::mem::take(&mut self.cursor_open) {
            ctx.dev.cursor_store.close();
        }
        if core::mem::take(&mut self.store_open) {
            ctx.dev.log_store.close_store();
        }
    }

    /// Ends the cycle; the persisted cursor stays where it was.
    fn abort<B: Board>(&mut self, ctx: &mut Context<'_, B>) {
        self.release(ctx);
        self.state = PublishState::End;
    }

    fn storage_failure<B: Board>(&mut self, ctx: &mut Context<'_, B>, e: StoreError) {
        log_error!("publish: storage error {:?}", e);
        ctx.status.storage_error = true;
        self.abort(ctx);
    }

    fn sealed<B: Board>(&self, ctx: &Context<'_, B>, day: Day) -> bool {
        is_sealed(day, self.today, ctx.oldest_unsaved())
    }

    fn open_day_file<B: Board>(&mut self, ctx: &mut Context<'_, B>, day: Day) -> Result<(), StoreError> {
        if let Some(file) = self.file.take() {
            ctx.dev.log_store.close(file);
        }
        let file = ctx.dev.log_store.open(&day.file_name(), FileMode::Read)?;
        self.file = Some(file);
        self.seen = 0;
        self.next_sensor = None;
        Ok(())
    }
}

impl<B: Board> Task<B> for Publish {
    const ID: TaskId = TaskId::Publish;

    fn step(
        &mut self,
        ctx: &mut Context<'_, B>,
        dispatcher: &mut Dispatcher,
        _now: Instant,
    ) -> Result<(), Fatal> {
        match self.state {
            PublishState::Init => {
                let retrying = self.retrying;
                *self = Self::new();
                self.retrying = retrying;
                if ctx.status.storage_error {
                    log_debug!("publish: storage error set, not publishing");
                    self.state = PublishState::End;
                    return Ok(());
                }
                let Some(today) = ctx.today() else {
                    log_warn!("publish: clock not set, not publishing");
                    self.state = PublishState::End;
                    return Ok(());
                };
                self.today = today;
                self.state = PublishState::OpenStore;
            }
            PublishState::OpenStore => match ctx.dev.log_store.open_store() {
                Ok(()) => {
                    self.store_open = true;
                    self.state = PublishState::OpenCursorRecord;
                }
                Err(e) => self.storage_failure(ctx, e),
            },
            PublishState::OpenCursorRecord => match ctx.dev.cursor_store.open() {
                Ok(()) => {
                    self.cursor_open = true;
                    self.state = PublishState::ReadCursor;
                }
                Err(e) => {
                    log_error!("publish: cannot open cursor record: {:?}", e);
                    self.abort(ctx);
                }
            },
            PublishState::ReadCursor => {
                let mut raw = [0u8; CURSOR_RECORD_LEN];
                match ctx.dev.cursor_store.read(&mut raw) {
                    Ok(true) => match Cursor::decode(&raw) {
                        Ok(cursor) => {
                            self.cursor = Some(cursor);
                            self.persisted = Some(cursor);
                        }
                        Err(e) => {
                            log_error!("publish: cursor record corrupt: {:?}", e);
                            self.release(ctx);
                            *self = Self::new();
                            return Err(Fatal::CorruptCursor(e));
                        }
                    },
                    Ok(false) => self.cursor = None,
                    Err(e) => {
                        log_error!("publish: cannot read cursor record: {:?}", e);
                        self.abort(ctx);
                        return Ok(());
                    }
                }
                self.state = PublishState::FindStartPosition;
            }
            PublishState::FindStartPosition => {
                if self.cursor.is_some() {
                    self.state = PublishState::Found;
                    return Ok(());
                }
                self.state = match next_day(&mut ctx.dev.log_store, None) {
                    Some(day) => {
                        log_info!("publish: no cursor yet, starting at day {}", day.0);
                        self.cursor = Some(Cursor::start_of(day));
                        PublishState::Found
                    }
                    None => PublishState::CursorEnd,
                };
            }
            PublishState::Found => {
                log_info!("publish: resuming from {:?}", self.cursor);
                self.state = PublishState::OpenConnection;
            }
            PublishState::CursorEnd => {
                log_debug!("publish: nothing stored yet");
                self.walk_done = true;
                self.state = PublishState::OpenConnection;
            }
            PublishState::OpenConnection => {
                if !ctx.dev.transport.is_connected() {
                    log_warn!("publish: no link");
                    self.abort(ctx);
                    return Ok(());
                }
                self.attempts = 0;
                self.state = PublishState::Check;
            }
            PublishState::Check => {
                self.state = if ctx.dev.pubsub.is_connected() {
                    self.session = true;
                    PublishState::Subscribe
                } else {
                    PublishState::Connect
                };
            }
            PublishState::Connect => {
                let config = ctx.settings.readable();
                let credentials = Credentials {
                    server: &config.mqtt_server,
                    port: config.mqtt_port,
                    client_id: &config.module_name,
                    username: &config.mqtt_username,
                    password: &config.mqtt_password,
                };
                if ctx.dev.pubsub.connect(&credentials) {
                    log_info!("publish: session open with {}", config.mqtt_server.as_str());
                    self.session = true;
                    self.state = PublishState::Subscribe;
                } else {
                    self.attempts += 1;
                    if self.attempts >= CONFIG.publish.connect_attempts {
                        log_error!("publish: broker unreachable after {} attempts", self.attempts);
                        ctx.status.publish_failures = ctx.status.publish_failures.saturating_add(1);
                        self.abort(ctx);
                    }
                }
            }
            PublishState::Subscribe => {
                let topic = ctx.settings.readable().rpc_topic();
                if !ctx.dev.pubsub.subscribe(&topic) {
                    log_warn!("publish: could not subscribe to {}", topic.as_str());
                }
                self.state = if self.walk_done {
                    PublishState::Disconnect
                } else {
                    PublishState::OpenDataFile
                };
            }
            PublishState::OpenDataFile => {
                let Some(cursor) = self.cursor else {
                    self.state = PublishState::Disconnect;
                    return Ok(());
                };
                match self.open_day_file(ctx, cursor.day) {
                    Ok(()) => self.state = PublishState::DataLoop,
                    Err(StoreError::NotFound) => {
                        self.advance_day = self.sealed(ctx, cursor.day);
                        self.state = PublishState::CloseDataFile;
                    }
                    Err(e) => self.storage_failure(ctx, e),
                }
            }
            PublishState::SensorsLoop => {
                let (Some(cursor), Some(sensor)) = (self.cursor, self.next_sensor) else {
                    self.state = PublishState::CloseDataFile;
                    return Ok(());
                };
                self.cursor = Some(cursor.at_sensor(sensor));
                // Rewind: the new sensor's lines may precede the end of the last pass.
                match self.open_day_file(ctx, cursor.day) {
                    Ok(()) => self.state = PublishState::DataLoop,
                    Err(e) => self.storage_failure(ctx, e),
                }
            }
            PublishState::DataLoop => {
                let (Some(file), Some(cursor)) = (self.file, self.cursor) else {
                    self.state = PublishState::CloseDataFile;
                    return Ok(());
                };
                let mut line = [0u8; LINE_LEN];
                match ctx.dev.log_store.read_line(file, &mut line) {
                    Ok(Some(len)) => match LogRecord::decode(&line[..len]) {
                        Some(record) if record.sensor == cursor.sensor => {
                            self.record = Some(record);
                            self.state = PublishState::RecordLoop;
                        }
                        Some(record) => {
                            if record.sensor > cursor.sensor
                                && self.next_sensor.is_none_or(|s| record.sensor < s)
                            {
                                self.next_sensor = Some(record.sensor);
                            }
                        }
                        None => log_warn!("publish: skipping malformed line in day {}", cursor.day.0),
                    },
                    Ok(None) => {
                        if !self.sealed(ctx, cursor.day) {
                            self.state = PublishState::CloseDataFile;
                        } else if self.next_sensor.is_some() {
                            self.state = PublishState::SensorsLoop;
                        } else {
                            self.advance_day = true;
                            self.state = PublishState::CloseDataFile;
                        }
                    }
                    Err(StoreError::LineTooLong) => {
                        log_warn!("publish: skipping overlong line in day {}", cursor.day.0);
                    }
                    Err(e) => self.storage_failure(ctx, e),
                }
            }
            PublishState::RecordLoop => {
                let Some(cursor) = self.cursor else {
                    self.state = PublishState::CloseDataFile;
                    return Ok(());
                };
                if self.seen < cursor.record {
                    // Already acknowledged in an earlier cycle.
                    self.seen += 1;
                    self.record = None;
                    self.state = PublishState::DataLoop;
                } else {
                    self.state = PublishState::Publish;
                }
            }
            PublishState::Publish => {
                let (Some(cursor), Some(record)) = (self.cursor, self.record.take()) else {
                    self.state = PublishState::DataLoop;
                    return Ok(());
                };
                if !ctx.dev.transport.is_connected() || !ctx.dev.pubsub.is_connected() {
                    log_warn!("publish: connection lost at {:?}", cursor);
                    ctx.status.publish_failures = ctx.status.publish_failures.saturating_add(1);
                    self.retry = true;
                    self.abort(ctx);
                    return Ok(());
                }
                let config = ctx.settings.readable();
                let topic = publish_topic(&config.mqtt_root_topic, &config.module_name, &record.name);
                let Some(payload) = record.payload() else {
                    log_error!("publish: record {:?} has no payload, skipped", cursor);
                    self.cursor = Some(cursor.after_record());
                    self.seen += 1;
                    self.state = PublishState::UpdateCursor;
                    return Ok(());
                };
                if ctx.dev.pubsub.publish(&topic, &payload) {
                    self.cursor = Some(cursor.after_record());
                    self.seen += 1;
                    self.published += 1;
                    ctx.status.records_published = ctx.status.records_published.saturating_add(1);
                    self.state = PublishState::UpdateCursor;
                } else {
                    log_warn!("publish: {} not acknowledged", topic.as_str());
                    ctx.status.publish_failures = ctx.status.publish_failures.saturating_add(1);
                    self.abort(ctx);
                }
            }
            PublishState::UpdateCursor => {
                if let Some(cursor) = self.cursor.filter(|c| Some(*c) != self.persisted) {
                    if let Err(e) = ctx.dev.cursor_store.write(&cursor.encode()) {
                        log_error!("publish: cursor write failed: {:?}", e);
                        self.abort(ctx);
                        return Ok(());
                    }
                    self.persisted = Some(cursor);
                }
                if self.finishing {
                    self.state = PublishState::CloseCursorRecord;
                } else {
                    serve_rpc(ctx);
                    self.state = PublishState::DataLoop;
                }
            }
            PublishState::CloseDataFile => {
                if let Some(file) = self.file.take() {
                    ctx.dev.log_store.close(file);
                }
                let next = match (core::mem::take(&mut self.advance_day), self.cursor) {
                    (true, Some(cursor)) => next_day(&mut ctx.dev.log_store, Some(cursor.day)),
                    _ => None,
                };
                self.state = match next {
                    Some(day) => {
                        self.cursor = Some(Cursor::start_of(day));
                        PublishState::OpenDataFile
                    }
                    None => PublishState::Disconnect,
                };
            }
            PublishState::Disconnect => {
                if core::mem::take(&mut self.session) && ctx.dev.pubsub.is_connected() {
                    serve_rpc(ctx);
                    ctx.dev.pubsub.disconnect();
                }
                self.finishing = true;
                self.state = PublishState::UpdateCursor;
            }
            PublishState::CloseCursorRecord => {
                if core::mem::take(&mut self.cursor_open) {
                    ctx.dev.cursor_store.close();
                }
                self.state = PublishState::CloseStore;
            }
            PublishState::CloseStore => {
                if core::mem::take(&mut self.store_open) {
                    ctx.dev.log_store.close_store();
                }
                log_info!(
                    "publish: {} records sent, cursor at {:?}",
                    self.published,
                    self.persisted
                );
                self.state = PublishState::End;
            }
            PublishState::End => {
                dispatcher.complete(TaskId::Publish);
                let again = core::mem::take(&mut self.retry) && !self.retrying;
                self.retrying = again;
                if again {
                    log_info!("publish: retrying once");
                    dispatcher.signal(TaskId::Publish);
                }
                self.state = PublishState::Wait;
            }
            PublishState::Wait => self.state = PublishState::Init,
        }
        Ok(())
    }

    fn cancel(&mut self, ctx: &mut Context<'_, B>) {
        self.release(ctx);
        *self = Self::new();
    }

    fn is_idle(&self) -> bool {
        matches!(self.state, PublishState::Init | PublishState::Wait)
    }
}
