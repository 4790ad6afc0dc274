//! Supervisor: the periodic orchestrator.
//!
//! Each activation walks the levels in a fixed order: load the clock from the
//! RTC if it is unset, bring the link up, request a time sync when one is
//! due, then decide which tasks run next and cancel the ones that overran
//! their activation budget.

use embassy_time::{Duration, Instant};

use super::{Deadline, Task};
use crate::clock::{Rtc, TimeProvider, next_aligned};
use crate::config::CONFIG;
use crate::network::Transport;
use crate::scheduler::{Dispatcher, PRIORITY_ORDER, TaskId};
use crate::station::{Board, Context, Fatal};
use crate::store::LogStore;

/// 2020-01-01T00:00:00Z; anything older read from the RTC means it lost power.
pub const MIN_VALID_EPOCH: u32 = 1_577_836_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SupervisorState {
    Init,
    RtcLevel,
    ConnectionLevel,
    NtpLevel,
    ManageLevel,
    End,
    Wait,
}

pub struct Supervisor {
    state: SupervisorState,
    connection_wait: Option<Deadline>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Longest activation tolerated per task.
fn budget(id: TaskId) -> Option<Duration> {
    let budget = &CONFIG.budget;
    match id {
        TaskId::Connection => Some(budget.connection),
        TaskId::TimeSync => Some(budget.time_sync),
        TaskId::SensorsReading => Some(budget.sensors_reading),
        TaskId::DataSaving => Some(budget.data_saving),
        TaskId::Publish => Some(budget.publish),
        TaskId::Supervisor | TaskId::Stream => None,
    }
}

impl Supervisor {
    pub const fn new() -> Self {
        Self {
            state: SupervisorState::Init,
            connection_wait: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn rtc_level<B: Board>(&mut self, ctx: &mut Context<'_, B>) {
        if ctx.epoch().is_none() {
            match ctx.dev.rtc.read() {
                Some(epoch) if epoch >= MIN_VALID_EPOCH => {
                    ctx.interrupts.set_epoch(epoch);
                    ctx.status.time_provider = TimeProvider::Rtc;
                    log_info!("supervisor: clock loaded from RTC ({})", epoch);
                }
                _ => log_warn!("supervisor: RTC not set, waiting for network time"),
            }
        }
        self.state = SupervisorState::ConnectionLevel;
    }

    fn connection_level<B: Board>(
        &mut self,
        ctx: &mut Context<'_, B>,
        dispatcher: &mut Dispatcher,
        now: Instant,
    ) {
        if ctx.status.is_client_connected && ctx.dev.transport.is_connected() {
            self.connection_wait = None;
            self.state = SupervisorState::NtpLevel;
            return;
        }
        if ctx.status.is_client_connected {
            log_warn!("supervisor: link lost");
            ctx.status.is_client_connected = false;
            ctx.status.is_client_udp_socket_open = false;
        }

        match &mut self.connection_wait {
            None => {
                dispatcher.signal(TaskId::Connection);
                self.connection_wait = Some(Deadline::after(now, CONFIG.supervisor.connection_wait));
            }
            Some(deadline) => {
                if !dispatcher.is_signaled(TaskId::Connection) || deadline.expired(now) {
                    if !ctx.status.is_client_connected {
                        log_warn!("supervisor: continuing without link");
                    }
                    self.connection_wait = None;
                    self.state = SupervisorState::NtpLevel;
                }
            }
        }
    }

    fn ntp_level<B: Board>(&mut self, ctx: &mut Context<'_, B>, dispatcher: &mut Dispatcher) {
        if let (Some(epoch), Some(last)) = (ctx.epoch(), ctx.status.last_sync) {
            if epoch.saturating_sub(last) >= CONFIG.time.sync_period_secs {
                ctx.status.do_ntp_sync = true;
            }
        }
        if ctx.status.do_ntp_sync && !dispatcher.is_signaled(TaskId::TimeSync) {
            dispatcher.signal(TaskId::TimeSync);
        }
        self.state = SupervisorState::ManageLevel;
    }

    fn manage_level<B: Board>(
        &mut self,
        ctx: &mut Context<'_, B>,
        dispatcher: &mut Dispatcher,
        now: Instant,
    ) {
        if ctx.status.storage_error && ctx.dev.log_store.is_ready() {
            log_info!("supervisor: storage ready again, clearing storage error");
            ctx.status.storage_error = false;
        }

        if let Some(epoch) = ctx.epoch() {
            if !ctx.status.is_time_for_sensors_reading_updated {
                let next = next_aligned(epoch, ctx.settings.readable().report_seconds);
                ctx.interrupts.schedule_sample(next);
                ctx.status.is_time_for_sensors_reading_updated = true;
                log_info!("supervisor: next sample at {}", next);
            }
        }

        if !ctx.status.storage_error {
            if !ctx.readings.is_empty() {
                dispatcher.signal(TaskId::DataSaving);
            }
            if ctx.status.is_client_connected {
                dispatcher.signal(TaskId::Publish);
            }
        }

        for id in PRIORITY_ORDER {
            let (Some(limit), Some(since)) = (budget(id), ctx.active_since[id.index()]) else {
                continue;
            };
            let overran = now
                .checked_duration_since(since)
                .is_some_and(|active| active > limit);
            if overran {
                log_warn!("supervisor: {} overran its budget", id.name());
                ctx.cancel[id.index()] = true;
                if id == TaskId::Publish {
                    ctx.status.publish_failures = ctx.status.publish_failures.saturating_add(1);
                }
            }
        }

        self.state = SupervisorState::End;
    }
}

impl<B: Board> Task<B> for Supervisor {
    const ID: TaskId = TaskId::Supervisor;

    fn step(
        &mut self,
        ctx: &mut Context<'_, B>,
        dispatcher: &mut Dispatcher,
        now: Instant,
    ) -> Result<(), Fatal> {
        match self.state {
            SupervisorState::Init => {
                log_debug!("supervisor: start");
                self.state = SupervisorState::RtcLevel;
            }
            SupervisorState::RtcLevel => self.rtc_level(ctx),
            SupervisorState::ConnectionLevel => self.connection_level(ctx, dispatcher, now),
            SupervisorState::NtpLevel => self.ntp_level(ctx, dispatcher),
            SupervisorState::ManageLevel => self.manage_level(ctx, dispatcher, now),
            SupervisorState::End => {
                dispatcher.complete(TaskId::Supervisor);
                self.state = SupervisorState::Wait;
            }
            SupervisorState::Wait => self.state = SupervisorState::Init,
        }
        Ok(())
    }

    fn cancel(&mut self, _ctx: &mut Context<'_, B>) {
        *self = Self::new();
    }

    fn is_idle(&self) -> bool {
        matches!(self.state, SupervisorState::Init | SupervisorState::Wait)
    }
}
