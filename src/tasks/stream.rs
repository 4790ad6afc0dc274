//! Stream/RPC: JSON-RPC requests over the serial console.
//!
//! Bytes are consumed a few at a time so a chatty console cannot starve the
//! other tasks. A request is one line; a line longer than the request buffer
//! is discarded up to its terminator. The task stays raised while input keeps
//! arriving and ends after a quiet period; the console interrupt raises it
//! again.

use embassy_time::Instant;
use embedded_io::{Read, ReadReady, Write};

use super::{Deadline, Task};
use crate::config::CONFIG;
use crate::rpc::{self, Request, Response, RpcContext};
use crate::scheduler::{Dispatcher, TaskId};
use crate::station::{Board, Context, Fatal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamState {
    Init,
    Available,
    Process,
    End,
    Wait,
}

pub struct Stream {
    state: StreamState,
    request: Request,
    /// The current line outgrew the buffer; drop it at its terminator.
    overflow: bool,
    idle: Option<Deadline>,
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream {
    pub const fn new() -> Self {
        Self {
            state: StreamState::Init,
            request: Request::new(),
            overflow: false,
            idle: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Feeds one received byte; `true` once a complete request is buffered.
    fn accept(&mut self, byte: u8) -> bool {
        match byte {
            b'\n' | b'\r' => {
                if core::mem::take(&mut self.overflow) {
                    log_warn!("stream: request longer than {} bytes dropped", self.request.capacity());
                    self.request.clear();
                    false
                } else {
                    !self.request.is_empty()
                }
            }
            _ if self.overflow => false,
            _ => {
                if self.request.push(byte).is_err() {
                    self.overflow = true;
                    self.request.clear();
                }
                false
            }
        }
    }
}

impl<B: Board> Task<B> for Stream {
    const ID: TaskId = TaskId::Stream;

    fn step(
        &mut self,
        ctx: &mut Context<'_, B>,
        dispatcher: &mut Dispatcher,
        now: Instant,
    ) -> Result<(), Fatal> {
        match self.state {
            StreamState::Init => {
                self.request.clear();
                self.overflow = false;
                self.idle = Some(Deadline::after(now, CONFIG.stream.end_task_timeout));
                self.state = StreamState::Available;
            }
            StreamState::Available => {
                let console = &mut ctx.dev.console;
                let mut received = false;
                for _ in 0..CONFIG.stream.bytes_per_step {
                    match console.read_ready() {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(_) => {
                            log_warn!("stream: console not readable");
                            break;
                        }
                    }
                    let mut byte = [0u8; 1];
                    match console.read(&mut byte) {
                        Ok(1) => {
                            received = true;
                            if self.accept(byte[0]) {
                                self.state = StreamState::Process;
                                break;
                            }
                        }
                        Ok(_) => break,
                        Err(_) => {
                            log_warn!("stream: console read failed");
                            break;
                        }
                    }
                }
                if received {
                    self.idle = Some(Deadline::after(now, CONFIG.stream.end_task_timeout));
                } else if self.idle.as_mut().is_none_or(|d| d.expired(now)) {
                    self.state = StreamState::End;
                }
            }
            StreamState::Process => {
                let mut response = Response::new();
                let epoch = ctx.epoch();
                let mut rpc_ctx = RpcContext {
                    settings: &mut ctx.settings,
                    config_store: &mut ctx.dev.config_store,
                    status: &mut ctx.status,
                    epoch,
                };
                rpc::process(&self.request, &mut rpc_ctx, &mut response);
                self.request.clear();

                let console = &mut ctx.dev.console;
                let written = console
                    .write_all(response.as_bytes())
                    .and_then(|()| console.write_all(b"\n"))
                    .and_then(|()| console.flush());
                if written.is_err() {
                    log_warn!("stream: console write failed");
                }
                self.idle = Some(Deadline::after(now, CONFIG.stream.end_task_timeout));
                self.state = StreamState::Available;
            }
            StreamState::End => {
                self.idle = None;
                dispatcher.complete(TaskId::Stream);
                self.state = StreamState::Wait;
            }
            StreamState::Wait => self.state = StreamState::Init,
        }
        Ok(())
    }

    fn cancel(&mut self, _ctx: &mut Context<'_, B>) {
        *self = Self::new();
    }

    fn is_idle(&self) -> bool {
        matches!(self.state, StreamState::Init | StreamState::Wait)
    }
}
