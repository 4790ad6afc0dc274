//! Cooperative dispatcher state: one event flag per task and the ready count.
//!
//! The dispatcher itself does not call tasks; [`crate::station::Station`]
//! walks [`PRIORITY_ORDER`] and steps every task whose flag is set. A task
//! calls [`Dispatcher::complete`] when it reaches its terminal state.

/// Task identifiers, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TaskId {
    Supervisor = 0,
    Connection = 1,
    TimeSync = 2,
    SensorsReading = 3,
    DataSaving = 4,
    Publish = 5,
    Stream = 6,
}

pub const TASK_COUNT: usize = 7;

/// Step order; higher priority tasks observe the freshest flags first.
pub const PRIORITY_ORDER: [TaskId; TASK_COUNT] = [
    TaskId::Supervisor,
    TaskId::Connection,
    TaskId::TimeSync,
    TaskId::SensorsReading,
    TaskId::DataSaving,
    TaskId::Publish,
    TaskId::Stream,
];

impl TaskId {
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            TaskId::Supervisor => "supervisor",
            TaskId::Connection => "connection",
            TaskId::TimeSync => "time",
            TaskId::SensorsReading => "sensors",
            TaskId::DataSaving => "data",
            TaskId::Publish => "publish",
            TaskId::Stream => "stream",
        }
    }
}

#[derive(Debug)]
pub struct Dispatcher {
    flags: [bool; TASK_COUNT],
    /// Terminal states reached since the station last looked.
    completed: [bool; TASK_COUNT],
    ready: u8,
    low_power: bool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub const fn new() -> Self {
        Self {
            flags: [false; TASK_COUNT],
            completed: [false; TASK_COUNT],
            ready: 0,
            low_power: true,
        }
    }

    /// Sets the task's flag; the ready count only grows on a false -> true edge.
    pub fn signal(&mut self, task: TaskId) {
        let flag = &mut self.flags[task.index()];
        if !*flag {
            *flag = true;
            self.ready += 1;
        }
    }

    /// Clears the task's flag on reaching its terminal state.
    pub fn complete(&mut self, task: TaskId) {
        self.completed[task.index()] = true;
        let flag = &mut self.flags[task.index()];
        if *flag {
            *flag = false;
            self.ready = self.ready.saturating_sub(1);
        }
    }

    /// Whether the task reached its terminal state since the last call, even
    /// if it has been signaled again since.
    pub fn take_completed(&mut self, task: TaskId) -> bool {
        core::mem::take(&mut self.completed[task.index()])
    }

    pub fn is_signaled(&self, task: TaskId) -> bool {
        self.flags[task.index()]
    }

    pub fn ready_count(&self) -> u8 {
        self.ready
    }

    /// Disabled in tests so the host loop never parks.
    pub fn set_low_power(&mut self, enabled: bool) {
        self.low_power = enabled;
    }

    /// The caller may enter the low-power wait until the next interrupt.
    pub fn may_sleep(&self) -> bool {
        self.low_power && self.ready == 0
    }

    /// The ready count must always equal the number of raised flags.
    pub fn is_consistent(&self) -> bool {
        let raised = self.flags.iter().filter(|f| **f).count();
        raised == usize::from(self.ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_is_idempotent() {
        let mut d = Dispatcher::new();
        d.signal(TaskId::Publish);
        d.signal(TaskId::Publish);
        assert_eq!(d.ready_count(), 1);
        assert!(d.is_signaled(TaskId::Publish));
    }

    #[test]
    fn complete_only_decrements_raised_flags() {
        let mut d = Dispatcher::new();
        d.signal(TaskId::Supervisor);
        d.complete(TaskId::Stream);
        assert_eq!(d.ready_count(), 1);
        d.complete(TaskId::Supervisor);
        d.complete(TaskId::Supervisor);
        assert_eq!(d.ready_count(), 0);
        assert!(d.is_consistent());
    }

    #[test]
    fn completion_is_seen_through_a_new_signal() {
        let mut d = Dispatcher::new();
        d.signal(TaskId::Publish);
        d.complete(TaskId::Publish);
        d.signal(TaskId::Publish);
        assert!(d.is_signaled(TaskId::Publish));
        assert!(d.take_completed(TaskId::Publish));
        assert!(!d.take_completed(TaskId::Publish));
    }

    #[test]
    fn sleep_requires_no_ready_task_and_low_power_enabled() {
        let mut d = Dispatcher::new();
        assert!(d.may_sleep());
        d.signal(TaskId::SensorsReading);
        assert!(!d.may_sleep());
        d.complete(TaskId::SensorsReading);
        d.set_low_power(false);
        assert!(!d.may_sleep());
    }

    #[test]
    fn priority_order_covers_every_task_once() {
        for (i, task) in PRIORITY_ORDER.iter().enumerate() {
            assert_eq!(task.index(), i);
        }
    }
}
