//! Data-Saving: appends buffered readings to the day files.
//!
//! Readings are written in time order: each batch holds the oldest pending
//! timestamp, walked sensor by sensor. A reading leaves the buffer only once
//! its line is appended, so a store failure loses nothing; the sticky storage
//! error then suppresses further attempts until the store recovers.

use embassy_time::Instant;

use super::Task;
use crate::clock::Day;
use crate::scheduler::{Dispatcher, TaskId};
use crate::sensors::MAX_SENSORS;
use crate::station::{Board, Context, Fatal};
use crate::store::{FileHandle, FileMode, LogRecord, LogStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataSavingState {
    Init,
    OpenStore,
    OpenFile,
    SensorsLoop,
    DataLoop,
    Write,
    CloseFile,
    End,
    Wait,
}

pub struct DataSaving {
    state: DataSavingState,
    store_open: bool,
    file: Option<FileHandle>,
    day: Day,
    batch: u32,
    sensor: usize,
    written: u32,
}

impl Default for DataSaving {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSaving {
    pub const fn new() -> Self {
        Self {
            state: DataSavingState::Init,
            store_open: false,
            file: None,
            day: Day(0),
            batch: 0,
            sensor: 0,
            written: 0,
        }
    }

    pub fn state(&self) -> DataSavingState {
        self.state
    }

    fn release<S: LogStore>(&mut self, store: &mut S) {
        if let Some(file) = self.file.take() {
            store.close(file);
        }
        if core::mem::take(&mut self.store_open) {
            store.close_store();
        }
    }

    fn fail<B: Board>(&mut self, ctx: &mut Context<'_, B>, e: StoreError) {
        log_error!(
            "data: storage error {:?}, {} readings kept for retry",
            e,
            ctx.readings.len()
        );
        ctx.status.storage_error = true;
        self.release(&mut ctx.dev.log_store);
        self.state = DataSavingState::End;
    }
}

impl<B: Board> Task<B> for DataSaving {
    const ID: TaskId = TaskId::DataSaving;

    fn step(
        &mut self,
        ctx: &mut Context<'_, B>,
        dispatcher: &mut Dispatcher,
        _now: Instant,
    ) -> Result<(), Fatal> {
        match self.state {
            DataSavingState::Init => {
                self.written = 0;
                self.state = if ctx.status.storage_error {
                    log_debug!("data: storage error set, not saving");
                    DataSavingState::End
                } else if ctx.readings.is_empty() {
                    DataSavingState::End
                } else {
                    DataSavingState::OpenStore
                };
            }
            DataSavingState::OpenStore => match ctx.dev.log_store.open_store() {
                Ok(()) => {
                    self.store_open = true;
                    self.state = DataSavingState::OpenFile;
                }
                Err(e) => self.fail(ctx, e),
            },
            DataSavingState::OpenFile => {
                let Some(batch) = ctx.readings.oldest_timestamp() else {
                    self.state = DataSavingState::CloseFile;
                    return Ok(());
                };
                self.batch = batch;
                self.day = Day::from_epoch(batch);
                self.sensor = 0;
                let name = self.day.file_name();
                match ctx.dev.log_store.open(&name, FileMode::Append) {
                    Ok(file) => {
                        log_debug!("data: appending to {}", name.as_str());
                        self.file = Some(file);
                        self.state = DataSavingState::SensorsLoop;
                    }
                    Err(e) => self.fail(ctx, e),
                }
            }
            DataSavingState::SensorsLoop => {
                if self.sensor < MAX_SENSORS {
                    self.state = DataSavingState::DataLoop;
                    return Ok(());
                }
                // Batch done. Keep the file open while the next batch is on the same day.
                match ctx.readings.oldest_timestamp() {
                    Some(next) if Day::from_epoch(next) == self.day => {
                        self.batch = next;
                        self.sensor = 0;
                    }
                    _ => self.state = DataSavingState::CloseFile,
                }
            }
            DataSavingState::DataLoop => {
                let front = ctx
                    .readings
                    .front(self.sensor)
                    .map(|r| (r.timestamp, r.values.is_ok()));
                match front {
                    Some((timestamp, true)) if timestamp == self.batch => {
                        self.state = DataSavingState::Write;
                    }
                    Some((timestamp, false)) if timestamp == self.batch => {
                        // Missing-value marker: nothing to write for this sensor.
                        ctx.readings.pop(self.sensor);
                    }
                    _ => {
                        self.sensor += 1;
                        self.state = DataSavingState::SensorsLoop;
                    }
                }
            }
            DataSavingState::Write => {
                let Some(file) = self.file else {
                    self.state = DataSavingState::CloseFile;
                    return Ok(());
                };
                let pending = ctx
                    .readings
                    .front(self.sensor)
                    .map(|r| (r.name.clone(), r.values.clone()));
                let Some((name, Ok(values))) = pending else {
                    self.state = DataSavingState::DataLoop;
                    return Ok(());
                };
                let record = LogRecord {
                    sensor: self.sensor as u8,
                    name,
                    timestamp: self.batch,
                    values,
                };
                let Some(line) = record.encode() else {
                    log_error!(
                        "data: record for sensor {} does not fit a line, dropped",
                        self.sensor
                    );
                    ctx.readings.pop(self.sensor);
                    self.state = DataSavingState::DataLoop;
                    return Ok(());
                };
                match ctx.dev.log_store.append(file, &line) {
                    Ok(()) => {
                        ctx.readings.pop(self.sensor);
                        ctx.status.readings_saved = ctx.status.readings_saved.saturating_add(1);
                        self.written += 1;
                        self.state = DataSavingState::DataLoop;
                    }
                    Err(e) => self.fail(ctx, e),
                }
            }
            DataSavingState::CloseFile => {
                if let Some(file) = self.file.take() {
                    ctx.dev.log_store.close(file);
                }
                if ctx.readings.is_empty() {
                    self.release(&mut ctx.dev.log_store);
                    log_info!("data: {} records saved", self.written);
                    self.state = DataSavingState::End;
                } else {
                    self.state = DataSavingState::OpenFile;
                }
            }
            DataSavingState::End => {
                dispatcher.complete(TaskId::DataSaving);
                self.state = DataSavingState::Wait;
            }
            DataSavingState::Wait => self.state = DataSavingState::Init,
        }
        Ok(())
    }

    fn cancel(&mut self, ctx: &mut Context<'_, B>) {
        self.release(&mut ctx.dev.log_store);
        *self = Self::new();
    }

    fn is_idle(&self) -> bool {
        matches!(self.state, DataSavingState::Init | DataSavingState::Wait)
    }
}
