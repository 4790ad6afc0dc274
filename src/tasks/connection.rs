//! Link bring-up through the [`Transport`] capability: connect, then open the
//! datagram socket used for time sync.

use embassy_time::Instant;

use super::{Deadline, Task};
use crate::config::CONFIG;
use crate::network::Transport;
use crate::scheduler::{Dispatcher, TaskId};
use crate::station::{Board, Context, Fatal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    Init,
    Connect,
    OpenSocket,
    End,
    Wait,
}

pub struct Connection {
    state: ConnectionState,
    deadline: Option<Deadline>,
    socket_attempts: u8,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub const fn new() -> Self {
        Self {
            state: ConnectionState::Init,
            deadline: None,
            socket_attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

impl<B: Board> Task<B> for Connection {
    const ID: TaskId = TaskId::Connection;

    fn step(
        &mut self,
        ctx: &mut Context<'_, B>,
        dispatcher: &mut Dispatcher,
        now: Instant,
    ) -> Result<(), Fatal> {
        let transport = &mut ctx.dev.transport;
        match self.state {
            ConnectionState::Init => {
                self.socket_attempts = 0;
                self.deadline = Some(Deadline::after(now, CONFIG.connection.connect_timeout));
                log_info!("connection: bringing up {:?} link", transport.kind());
                self.state = ConnectionState::Connect;
            }
            ConnectionState::Connect => {
                if transport.connect() {
                    log_info!("connection: link up");
                    ctx.status.is_client_connected = true;
                    self.state = ConnectionState::OpenSocket;
                } else if self.deadline.as_mut().is_none_or(|d| d.expired(now)) {
                    log_error!("connection: link did not come up");
                    transport.disconnect();
                    ctx.status.is_client_connected = false;
                    ctx.status.is_client_udp_socket_open = false;
                    self.state = ConnectionState::End;
                }
            }
            ConnectionState::OpenSocket => {
                if transport.open_socket() {
                    ctx.status.is_client_udp_socket_open = true;
                    self.state = ConnectionState::End;
                } else {
                    self.socket_attempts += 1;
                    if self.socket_attempts >= CONFIG.connection.socket_attempts {
                        log_warn!("connection: could not open datagram socket");
                        ctx.status.is_client_udp_socket_open = false;
                        self.state = ConnectionState::End;
                    }
                }
            }
            ConnectionState::End => {
                self.deadline = None;
                dispatcher.complete(TaskId::Connection);
                self.state = ConnectionState::Wait;
            }
            ConnectionState::Wait => self.state = ConnectionState::Init,
        }
        Ok(())
    }

    fn cancel(&mut self, ctx: &mut Context<'_, B>) {
        if self.state == ConnectionState::Connect {
            ctx.dev.transport.disconnect();
        }
        *self = Self::new();
    }

    fn is_idle(&self) -> bool {
        matches!(self.state, ConnectionState::Init | ConnectionState::Wait)
    }
}
