//! Network time sync with RTC fallback.
//!
//! A request goes out over the datagram socket; the response is awaited for a
//! bounded time and retried a few times. Without a response (or without a
//! link) the clock keeps running on the RTC-derived time and the supervisor
//! asks again on its next period.

use embassy_time::Instant;

use super::{Deadline, Task};
use crate::clock::{Rtc, TimeProvider};
use crate::config::CONFIG;
use crate::network::TimeSource;
use crate::scheduler::{Dispatcher, TaskId};
use crate::station::{Board, Context, Fatal};
use crate::tasks::supervisor::MIN_VALID_EPOCH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimeSyncState {
    Init,
    SendOnlineRequest,
    WaitOnlineResponse,
    SetSyncNtpProvider,
    SetSyncRtcProvider,
    End,
    Wait,
}

pub struct TimeSync {
    state: TimeSyncState,
    attempts: u8,
    deadline: Option<Deadline>,
    received: u32,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSync {
    pub const fn new() -> Self {
        Self {
            state: TimeSyncState::Init,
            attempts: 0,
            deadline: None,
            received: 0,
        }
    }

    pub fn state(&self) -> TimeSyncState {
        self.state
    }

    fn retry_or_fallback(&mut self) {
        self.attempts += 1;
        self.state = if self.attempts < CONFIG.time.request_attempts {
            TimeSyncState::SendOnlineRequest
        } else {
            log_warn!("time: no response after {} requests", self.attempts);
            TimeSyncState::SetSyncRtcProvider
        };
    }
}

impl<B: Board> Task<B> for TimeSync {
    const ID: TaskId = TaskId::TimeSync;

    fn step(
        &mut self,
        ctx: &mut Context<'_, B>,
        dispatcher: &mut Dispatcher,
        now: Instant,
    ) -> Result<(), Fatal> {
        match self.state {
            TimeSyncState::Init => {
                self.attempts = 0;
                self.deadline = None;
                self.state = if ctx.status.is_client_connected && ctx.status.is_client_udp_socket_open
                {
                    TimeSyncState::SendOnlineRequest
                } else {
                    log_warn!("time: no network, keeping RTC time");
                    TimeSyncState::SetSyncRtcProvider
                };
            }
            TimeSyncState::SendOnlineRequest => {
                let server = &ctx.settings.readable().ntp_server;
                if ctx.dev.time_source.send_request(server) {
                    log_debug!("time: request sent to {}", server.as_str());
                    self.deadline = Some(Deadline::after(now, CONFIG.time.response_timeout));
                    self.state = TimeSyncState::WaitOnlineResponse;
                } else {
                    self.retry_or_fallback();
                }
            }
            TimeSyncState::WaitOnlineResponse => match ctx.dev.time_source.poll_response() {
                Some(epoch) if epoch >= MIN_VALID_EPOCH => {
                    self.received = epoch;
                    self.state = TimeSyncState::SetSyncNtpProvider;
                }
                Some(epoch) => {
                    log_warn!("time: implausible server time {}", epoch);
                    self.retry_or_fallback();
                }
                None => {
                    if self.deadline.as_mut().is_none_or(|d| d.expired(now)) {
                        self.retry_or_fallback();
                    }
                }
            },
            TimeSyncState::SetSyncNtpProvider => {
                let epoch = self.received;
                let previous = ctx.epoch();
                ctx.interrupts.set_epoch(epoch);
                if !ctx.dev.rtc.write(epoch) {
                    log_warn!("time: RTC write failed");
                }
                ctx.status.time_provider = TimeProvider::Ntp;
                ctx.status.last_sync = Some(epoch);
                ctx.status.do_ntp_sync = false;
                if previous != Some(epoch) {
                    // The sample schedule was computed on the old clock.
                    ctx.status.is_time_for_sensors_reading_updated = false;
                }
                log_info!("time: synchronised to {}", epoch);
                self.state = TimeSyncState::End;
            }
            TimeSyncState::SetSyncRtcProvider => {
                if ctx.epoch().is_none() {
                    match ctx.dev.rtc.read() {
                        Some(epoch) if epoch >= MIN_VALID_EPOCH => {
                            ctx.interrupts.set_epoch(epoch);
                            ctx.status.time_provider = TimeProvider::Rtc;
                            log_info!("time: clock loaded from RTC ({})", epoch);
                        }
                        _ => log_error!("time: no valid time source"),
                    }
                }
                self.state = TimeSyncState::End;
            }
            TimeSyncState::End => {
                self.deadline = None;
                dispatcher.complete(TaskId::TimeSync);
                self.state = TimeSyncState::Wait;
            }
            TimeSyncState::Wait => self.state = TimeSyncState::Init,
        }
        Ok(())
    }

    fn cancel(&mut self, _ctx: &mut Context<'_, B>) {
        *self = Self::new();
    }

    fn is_idle(&self) -> bool {
        matches!(self.state, TimeSyncState::Init | TimeSyncState::Wait)
    }
}
