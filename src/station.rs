//! The application context and the dispatcher loop body.
//!
//! [`Station`] owns everything the firmware keeps in RAM: the dispatcher, the
//! task state machines and the [`Context`] they share. The device (or a test)
//! calls [`Station::step`] repeatedly and parks in a low-power wait whenever
//! [`Station::may_sleep`] says so.

use embassy_time::Instant;
use embedded_io::{Read, ReadReady, Write};

use crate::clock::{Day, Rtc};
use crate::interrupts::Interrupts;
use crate::network::{PubSub, TimeSource, Transport};
use crate::scheduler::{Dispatcher, PRIORITY_ORDER, TASK_COUNT, TaskId};
use crate::sensors::{ReadingBuffer, SensorBank};
use crate::settings::{self, ConfigPair, ConfigStore, Configuration};
use crate::status::Status;
use crate::store::{CursorError, CursorStore, LogStore};
use crate::tasks::{
    Connection, DataSaving, Publish, SensorsReading, Stream, Supervisor, Task, TimeSync,
};

/// Concrete collaborator types of a board.
pub trait Board {
    type Transport: Transport;
    type TimeSource: TimeSource;
    type PubSub: PubSub;
    type LogStore: LogStore;
    type CursorStore: CursorStore;
    type ConfigStore: ConfigStore;
    type Rtc: Rtc;
    type Sensors: SensorBank;
    type Console: Read + ReadReady + Write;
}

/// The board's collaborators. Everything here outlives a reset of the
/// station, which is how the tests simulate power loss.
pub struct Devices<B: Board> {
    pub transport: B::Transport,
    pub time_source: B::TimeSource,
    pub pubsub: B::PubSub,
    pub log_store: B::LogStore,
    pub cursor_store: B::CursorStore,
    pub config_store: B::ConfigStore,
    pub rtc: B::Rtc,
    pub sensors: B::Sensors,
    pub console: B::Console,
}

/// Invariant violations that require a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fatal {
    CorruptCursor(CursorError),
    /// Ready count and raised flags disagree.
    Dispatcher,
}

/// State shared by the tasks, handed to each step by reference.
pub struct Context<'a, B: Board> {
    pub dev: Devices<B>,
    pub settings: ConfigPair,
    pub status: Status,
    pub readings: ReadingBuffer,
    /// Timestamp of the sensors cycle still in progress, if any.
    pub sampling: Option<u32>,
    pub interrupts: &'a Interrupts,
    /// When each task's current activation started.
    pub active_since: [Option<Instant>; TASK_COUNT],
    /// Cancellations requested by the supervisor, applied between steps.
    pub cancel: [bool; TASK_COUNT],
}

impl<'a, B: Board> Context<'a, B> {
    pub fn new(dev: Devices<B>, configuration: Configuration, interrupts: &'a Interrupts) -> Self {
        Self {
            dev,
            settings: ConfigPair::new(configuration),
            status: Status::new(),
            readings: ReadingBuffer::new(),
            sampling: None,
            interrupts,
            active_since: [None; TASK_COUNT],
            cancel: [false; TASK_COUNT],
        }
    }

    /// Wall-clock seconds, `None` until the time has been set.
    pub fn epoch(&self) -> Option<u32> {
        self.interrupts.epoch()
    }

    pub fn today(&self) -> Option<Day> {
        self.epoch().map(Day::from_epoch)
    }

    /// Oldest sample not yet in the log store: buffered, or part of the
    /// cycle being taken.
    pub fn oldest_unsaved(&self) -> Option<u32> {
        [self.readings.oldest_timestamp(), self.sampling]
            .into_iter()
            .flatten()
            .min()
    }
}

pub struct Station<'a, B: Board> {
    ctx: Context<'a, B>,
    dispatcher: Dispatcher,
    supervisor: Supervisor,
    connection: Connection,
    time_sync: TimeSync,
    sensors_reading: SensorsReading,
    data_saving: DataSaving,
    publish: Publish,
    stream: Stream,
}

fn run<B: Board, T: Task<B>>(
    task: &mut T,
    ctx: &mut Context<'_, B>,
    dispatcher: &mut Dispatcher,
    now: Instant,
) -> Result<(), Fatal> {
    task.step(ctx, dispatcher, now)
}

impl<'a, B: Board> Station<'a, B> {
    /// Boots the station: loads the saved configuration and raises the
    /// supervisor and console tasks.
    pub fn new(mut dev: Devices<B>, interrupts: &'a Interrupts) -> Self {
        let configuration = settings::load(&mut dev.config_store);
        settings::print_configuration(&configuration);

        let mut dispatcher = Dispatcher::new();
        dispatcher.signal(TaskId::Supervisor);
        dispatcher.signal(TaskId::Stream);

        Self {
            ctx: Context::new(dev, configuration, interrupts),
            dispatcher,
            supervisor: Supervisor::new(),
            connection: Connection::new(),
            time_sync: TimeSync::new(),
            sensors_reading: SensorsReading::new(),
            data_saving: DataSaving::new(),
            publish: Publish::new(),
            stream: Stream::new(),
        }
    }

    /// One dispatcher iteration: drain interrupt requests, step every raised
    /// task once in priority order, then apply cancellations and the
    /// configuration commit.
    pub fn step(&mut self, now: Instant) -> Result<(), Fatal> {
        let pending = self.ctx.interrupts.take();
        if pending.supervisor {
            self.dispatcher.signal(TaskId::Supervisor);
        }
        if pending.sensors {
            self.dispatcher.signal(TaskId::SensorsReading);
        }
        if pending.console {
            self.dispatcher.signal(TaskId::Stream);
        }

        for id in PRIORITY_ORDER {
            if !self.dispatcher.is_signaled(id) {
                continue;
            }
            self.ctx.active_since[id.index()].get_or_insert(now);

            let ctx = &mut self.ctx;
            let dispatcher = &mut self.dispatcher;
            match id {
                TaskId::Supervisor => run(&mut self.supervisor, ctx, dispatcher, now)?,
                TaskId::Connection => run(&mut self.connection, ctx, dispatcher, now)?,
                TaskId::TimeSync => run(&mut self.time_sync, ctx, dispatcher, now)?,
                TaskId::SensorsReading => run(&mut self.sensors_reading, ctx, dispatcher, now)?,
                TaskId::DataSaving => run(&mut self.data_saving, ctx, dispatcher, now)?,
                TaskId::Publish => run(&mut self.publish, ctx, dispatcher, now)?,
                TaskId::Stream => run(&mut self.stream, ctx, dispatcher, now)?,
            }

            if self.dispatcher.take_completed(id) {
                self.ctx.active_since[id.index()] = None;
            }
        }

        self.apply_cancellations();

        if self.ctx.settings.commit() {
            log_info!("station: configuration committed");
            settings::print_configuration(self.ctx.settings.readable());
            // Sample alignment depends on the report interval.
            self.ctx.status.is_time_for_sensors_reading_updated = false;
        }

        if !self.dispatcher.is_consistent() {
            log_error!("station: dispatcher flags and ready count disagree");
            return Err(Fatal::Dispatcher);
        }
        Ok(())
    }

    fn apply_cancellations(&mut self) {
        for id in PRIORITY_ORDER {
            if !core::mem::take(&mut self.ctx.cancel[id.index()]) {
                continue;
            }
            log_warn!("station: cancelling {}", id.name());
            let ctx = &mut self.ctx;
            match id {
                TaskId::Supervisor => Task::<B>::cancel(&mut self.supervisor, ctx),
                TaskId::Connection => Task::<B>::cancel(&mut self.connection, ctx),
                TaskId::TimeSync => Task::<B>::cancel(&mut self.time_sync, ctx),
                TaskId::SensorsReading => Task::<B>::cancel(&mut self.sensors_reading, ctx),
                TaskId::DataSaving => Task::<B>::cancel(&mut self.data_saving, ctx),
                TaskId::Publish => Task::<B>::cancel(&mut self.publish, ctx),
                TaskId::Stream => Task::<B>::cancel(&mut self.stream, ctx),
            }
            self.dispatcher.complete(id);
            self.dispatcher.take_completed(id);
            self.ctx.active_since[id.index()] = None;
        }
    }

    /// Nothing is ready; the caller may wait for the next interrupt.
    pub fn may_sleep(&self) -> bool {
        self.dispatcher.may_sleep()
    }

    /// No task raised and every task parked in its wait state.
    pub fn is_idle(&self) -> bool {
        self.dispatcher.ready_count() == 0
            && Task::<B>::is_idle(&self.supervisor)
            && Task::<B>::is_idle(&self.connection)
            && Task::<B>::is_idle(&self.time_sync)
            && Task::<B>::is_idle(&self.sensors_reading)
            && Task::<B>::is_idle(&self.data_saving)
            && Task::<B>::is_idle(&self.publish)
            && Task::<B>::is_idle(&self.stream)
    }

    pub fn set_low_power(&mut self, enabled: bool) {
        self.dispatcher.set_low_power(enabled);
    }

    pub fn signal(&mut self, task: TaskId) {
        self.dispatcher.signal(task);
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn context(&self) -> &Context<'a, B> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context<'a, B> {
        &mut self.ctx
    }

    /// Tears the station down, keeping only what survives a reset.
    pub fn into_devices(self) -> Devices<B> {
        self.ctx.dev
    }
}
