//! Cooperative task state machines.
//!
//! Every task is a struct holding its current state plus the scratch it needs
//! across steps. [`Task::step`] performs exactly one transition and never
//! blocks: waiting means staying in the same state until a [`Deadline`]
//! expires. A task clears its own dispatcher flag when it reaches its terminal
//! state.

pub mod connection;
pub mod data_saving;
pub mod publish;
pub mod sensors_reading;
pub mod stream;
pub mod supervisor;
pub mod time_sync;

use embassy_time::{Duration, Instant};

use crate::config::CONFIG;
use crate::scheduler::{Dispatcher, TaskId};
use crate::station::{Board, Context, Fatal};

pub use connection::Connection;
pub use data_saving::DataSaving;
pub use publish::Publish;
pub use sensors_reading::SensorsReading;
pub use stream::Stream;
pub use supervisor::Supervisor;
pub use time_sync::TimeSync;

pub trait Task<B: Board> {
    const ID: TaskId;

    /// One state transition.
    fn step(
        &mut self,
        ctx: &mut Context<'_, B>,
        dispatcher: &mut Dispatcher,
        now: Instant,
    ) -> Result<(), Fatal>;

    /// Forces the task back to its initial state, releasing any handle it holds.
    fn cancel(&mut self, ctx: &mut Context<'_, B>);

    /// Parked in its wait state, holding nothing.
    fn is_idle(&self) -> bool;
}

/// Time limit of a waiting state, also bounded in number of polls so that a
/// stalled clock cannot keep a task waiting forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    polls: u32,
}

impl Deadline {
    pub fn after(now: Instant, timeout: Duration) -> Self {
        Self {
            at: now + timeout,
            polls: 0,
        }
    }

    /// Counts one poll; `true` once the time or the poll budget ran out.
    pub fn expired(&mut self, now: Instant) -> bool {
        self.polls = self.polls.saturating_add(1);
        now >= self.at || self.polls >= CONFIG.max_polls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_expires_on_time() {
        let start = Instant::from_millis(1_000);
        let mut deadline = Deadline::after(start, Duration::from_millis(500));
        assert!(!deadline.expired(start));
        assert!(!deadline.expired(Instant::from_millis(1_499)));
        assert!(deadline.expired(Instant::from_millis(1_500)));
    }

    #[test]
    fn deadline_expires_on_poll_budget_with_frozen_clock() {
        let start = Instant::from_millis(0);
        let mut deadline = Deadline::after(start, Duration::from_secs(3_600));
        let mut polls = 0;
        while !deadline.expired(start) {
            polls += 1;
        }
        assert_eq!(polls + 1, CONFIG.max_polls);
    }
}
