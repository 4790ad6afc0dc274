//! Sensors-Reading: samples every configured sensor once per scheduled
//! instant.
//!
//! Each sensor is prepared, then read, each phase polled under its own
//! deadline. A sensor that fails or times out leaves a missing-value marker in
//! the reading buffer and the cycle moves on to the next one.

use core::task::Poll;

use embassy_time::Instant;

use super::{Deadline, Task};
use crate::clock::next_aligned;
use crate::config::CONFIG;
use crate::scheduler::{Dispatcher, TaskId};
use crate::sensors::{Reading, SensorBank, SensorDriver, SensorError, SensorName, Values};
use crate::station::{Board, Context, Fatal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorsReadingState {
    Init,
    Prepare,
    IsPrepared,
    Get,
    IsGetted,
    Next,
    End,
    Wait,
}

pub struct SensorsReading {
    state: SensorsReadingState,
    index: usize,
    timestamp: u32,
    deadline: Option<Deadline>,
    /// Timestamp of the last completed cycle; samples never go backwards.
    last_sample: Option<u32>,
}

impl Default for SensorsReading {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorsReading {
    pub const fn new() -> Self {
        Self {
            state: SensorsReadingState::Init,
            index: 0,
            timestamp: 0,
            deadline: None,
            last_sample: None,
        }
    }

    pub fn state(&self) -> SensorsReadingState {
        self.state
    }

    fn driver<'c, B: Board>(
        &self,
        ctx: &'c mut Context<'_, B>,
    ) -> Option<&'c mut dyn SensorDriver> {
        let sensor = ctx.settings.readable().sensors.get(self.index)?;
        let (kind, address) = (sensor.kind, sensor.address);
        ctx.dev.sensors.driver(kind, address)
    }

    fn store<B: Board>(&mut self, ctx: &mut Context<'_, B>, values: Result<Values, SensorError>) {
        if let Err(e) = values {
            log_warn!("sensors: sensor {} failed: {:?}", self.index, e);
            ctx.status.readings_missing = ctx.status.readings_missing.saturating_add(1);
        }
        let name = ctx
            .settings
            .readable()
            .sensors
            .get(self.index)
            .map(|s| s.name.clone())
            .unwrap_or_else(SensorName::new);
        let reading = Reading {
            timestamp: self.timestamp,
            name,
            values,
        };
        let failed = reading.values.is_err();
        if !ctx.readings.push(self.index, reading) && !failed {
            ctx.status.readings_missing = ctx.status.readings_missing.saturating_add(1);
        }
        self.deadline = None;
        self.state = SensorsReadingState::Next;
    }
}

impl<B: Board> Task<B> for SensorsReading {
    const ID: TaskId = TaskId::SensorsReading;

    fn step(
        &mut self,
        ctx: &mut Context<'_, B>,
        dispatcher: &mut Dispatcher,
        now: Instant,
    ) -> Result<(), Fatal> {
        match self.state {
            SensorsReadingState::Init => {
                self.index = 0;
                self.deadline = None;
                let Some(epoch) = ctx.epoch() else {
                    log_warn!("sensors: clock not set, skipping sample");
                    self.state = SensorsReadingState::End;
                    return Ok(());
                };
                // Stamp with the scheduled instant the cycle belongs to.
                let timestamp = match ctx.interrupts.next_sample() {
                    Some(scheduled) if scheduled <= epoch => scheduled,
                    _ => epoch,
                };
                if self.last_sample.is_some_and(|last| timestamp <= last) {
                    log_debug!("sensors: sample {} already taken", timestamp);
                    self.state = SensorsReadingState::End;
                    return Ok(());
                }
                self.timestamp = timestamp;
                ctx.sampling = Some(timestamp);
                log_info!(
                    "sensors: sampling {} sensors at {}",
                    ctx.settings.readable().sensors.len(),
                    timestamp
                );
                self.state = if ctx.settings.readable().sensors.is_empty() {
                    SensorsReadingState::Next
                } else {
                    SensorsReadingState::Prepare
                };
            }
            SensorsReadingState::Prepare => {
                let Some(driver) = self.driver(ctx) else {
                    self.store(ctx, Err(SensorError::NotInitialized));
                    return Ok(());
                };
                match driver.prepare(now) {
                    Poll::Ready(Ok(())) => self.state = SensorsReadingState::Get,
                    Poll::Ready(Err(e)) => self.store(ctx, Err(e)),
                    Poll::Pending => {
                        self.deadline = Some(Deadline::after(now, CONFIG.sensor.prepare_timeout));
                        self.state = SensorsReadingState::IsPrepared;
                    }
                }
            }
            SensorsReadingState::IsPrepared => {
                let Some(driver) = self.driver(ctx) else {
                    self.store(ctx, Err(SensorError::NotInitialized));
                    return Ok(());
                };
                match driver.prepare(now) {
                    Poll::Ready(Ok(())) => {
                        self.deadline = None;
                        self.state = SensorsReadingState::Get;
                    }
                    Poll::Ready(Err(e)) => self.store(ctx, Err(e)),
                    Poll::Pending => {
                        if self.deadline.as_mut().is_none_or(|d| d.expired(now)) {
                            driver.abort();
                            self.store(ctx, Err(SensorError::Timeout));
                        }
                    }
                }
            }
            SensorsReadingState::Get => {
                let Some(driver) = self.driver(ctx) else {
                    self.store(ctx, Err(SensorError::NotInitialized));
                    return Ok(());
                };
                match driver.read(now) {
                    Poll::Ready(values) => self.store(ctx, values),
                    Poll::Pending => {
                        self.deadline = Some(Deadline::after(now, CONFIG.sensor.read_timeout));
                        self.state = SensorsReadingState::IsGetted;
                    }
                }
            }
            SensorsReadingState::IsGetted => {
                let Some(driver) = self.driver(ctx) else {
                    self.store(ctx, Err(SensorError::NotInitialized));
                    return Ok(());
                };
                match driver.read(now) {
                    Poll::Ready(values) => self.store(ctx, values),
                    Poll::Pending => {
                        if self.deadline.as_mut().is_none_or(|d| d.expired(now)) {
                            driver.abort();
                            self.store(ctx, Err(SensorError::Timeout));
                        }
                    }
                }
            }
            SensorsReadingState::Next => {
                self.index += 1;
                if self.index < ctx.settings.readable().sensors.len() {
                    self.state = SensorsReadingState::Prepare;
                    return Ok(());
                }
                self.last_sample = Some(self.timestamp);
                ctx.sampling = None;
                let epoch = ctx.epoch().unwrap_or(self.timestamp);
                let interval = ctx.settings.readable().report_seconds;
                let next = next_aligned(epoch.max(self.timestamp), interval);
                ctx.interrupts.schedule_sample(next);
                ctx.status.is_time_for_sensors_reading_updated = true;
                dispatcher.signal(TaskId::DataSaving);
                log_info!("sensors: cycle done, next sample at {}", next);
                self.state = SensorsReadingState::End;
            }
            SensorsReadingState::End => {
                dispatcher.complete(TaskId::SensorsReading);
                self.state = SensorsReadingState::Wait;
            }
            SensorsReadingState::Wait => self.state = SensorsReadingState::Init,
        }
        Ok(())
    }

    fn cancel(&mut self, ctx: &mut Context<'_, B>) {
        if matches!(
            self.state,
            SensorsReadingState::IsPrepared | SensorsReadingState::IsGetted
        ) {
            if let Some(driver) = self.driver(ctx) {
                driver.abort();
            }
        }
        ctx.sampling = None;
        let last_sample = self.last_sample;
        *self = Self::new();
        self.last_sample = last_sample;
    }

    fn is_idle(&self) -> bool {
        matches!(
            self.state,
            SensorsReadingState::Init | SensorsReadingState::Wait
        )
    }
}
