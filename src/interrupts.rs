//! Interrupt-side signal block.
//!
//! The periodic tick interrupt only touches the atomics in [`Interrupts`]:
//! it advances the wall-clock seconds counter and raises the supervisor and
//! sensors-reading requests. The dispatcher drains the requests with
//! [`Interrupts::take`] at the start of every step; nothing else crosses the
//! interrupt boundary.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

/// Requests raised by interrupts since the last [`Interrupts::take`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pending {
    pub supervisor: bool,
    pub sensors: bool,
    pub console: bool,
}

impl Pending {
    pub fn any(&self) -> bool {
        self.supervisor || self.sensors || self.console
    }
}

pub struct Interrupts {
    /// Wall-clock Unix seconds, 0 while unset.
    epoch: AtomicU32,
    /// Monotonic tick count, runs even while the wall clock is unset.
    ticks: AtomicU32,
    /// Next scheduled sample instant, 0 while unscheduled.
    next_sample: AtomicU32,
    supervisor_period: AtomicU32,
    supervisor: AtomicBool,
    sensors: AtomicBool,
    console: AtomicBool,
    wake: Signal<CriticalSectionRawMutex, ()>,
}

impl Interrupts {
    pub const fn new(supervisor_period_secs: u32) -> Self {
        Self {
            epoch: AtomicU32::new(0),
            ticks: AtomicU32::new(0),
            next_sample: AtomicU32::new(0),
            supervisor_period: AtomicU32::new(supervisor_period_secs),
            supervisor: AtomicBool::new(false),
            sensors: AtomicBool::new(false),
            console: AtomicBool::new(false),
            wake: Signal::new(),
        }
    }

    /// Once-per-second tick handler. Single writer of `epoch` and `ticks`
    /// apart from [`Interrupts::set_epoch`], which runs with interrupts masked.
    pub fn on_tick(&self) {
        let ticks = self.ticks.load(Ordering::Relaxed).wrapping_add(1);
        self.ticks.store(ticks, Ordering::Relaxed);

        let period = self.supervisor_period.load(Ordering::Relaxed).max(1);
        let epoch = self.epoch.load(Ordering::Acquire);
        let mut raised = false;

        if epoch == 0 {
            if ticks % period == 0 {
                self.supervisor.store(true, Ordering::Release);
                raised = true;
            }
        } else {
            let epoch = epoch.wrapping_add(1);
            self.epoch.store(epoch, Ordering::Release);

            if epoch % period == 0 {
                self.supervisor.store(true, Ordering::Release);
                raised = true;
            }

            let next = self.next_sample.load(Ordering::Acquire);
            if next != 0 && epoch >= next {
                self.sensors.store(true, Ordering::Release);
                raised = true;
            }
        }

        if raised {
            self.wake.signal(());
        }
    }

    /// Console receive interrupt.
    pub fn on_console_rx(&self) {
        self.console.store(true, Ordering::Release);
        self.wake.signal(());
    }

    /// Drains the pending requests.
    pub fn take(&self) -> Pending {
        critical_section::with(|_| {
            let pending = Pending {
                supervisor: self.supervisor.load(Ordering::Acquire),
                sensors: self.sensors.load(Ordering::Acquire),
                console: self.console.load(Ordering::Acquire),
            };
            self.supervisor.store(false, Ordering::Release);
            self.sensors.store(false, Ordering::Release);
            self.console.store(false, Ordering::Release);
            pending
        })
    }

    /// Wall-clock seconds, `None` until the time has been set once.
    pub fn epoch(&self) -> Option<u32> {
        match self.epoch.load(Ordering::Acquire) {
            0 => None,
            epoch => Some(epoch),
        }
    }

    pub fn set_epoch(&self, epoch: u32) {
        critical_section::with(|_| self.epoch.store(epoch, Ordering::Release));
    }

    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn next_sample(&self) -> Option<u32> {
        match self.next_sample.load(Ordering::Acquire) {
            0 => None,
            next => Some(next),
        }
    }

    pub fn schedule_sample(&self, epoch: u32) {
        self.next_sample.store(epoch, Ordering::Release);
    }

    pub fn set_supervisor_period(&self, secs: u32) {
        self.supervisor_period.store(secs, Ordering::Relaxed);
    }

    /// Low-power wait: resolves on the next interrupt that raised a request.
    pub async fn wait(&self) {
        self.wake.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_raises_supervisor_on_period_boundary() {
        let irq = Interrupts::new(60);
        irq.set_epoch(119);
        irq.on_tick();
        assert_eq!(irq.epoch(), Some(120));
        let pending = irq.take();
        assert!(pending.supervisor);
        assert!(!pending.sensors);
        assert_eq!(irq.take(), Pending::default());
    }

    #[test]
    fn tick_raises_sensors_once_sample_time_is_reached() {
        let irq = Interrupts::new(60);
        irq.set_epoch(1_000);
        irq.schedule_sample(1_002);
        irq.on_tick();
        assert!(!irq.take().sensors);
        irq.on_tick();
        assert!(irq.take().sensors);
    }

    #[test]
    fn unset_clock_still_wakes_supervisor_from_ticks() {
        let irq = Interrupts::new(3);
        irq.schedule_sample(1);
        for _ in 0..3 {
            irq.on_tick();
        }
        assert_eq!(irq.epoch(), None);
        let pending = irq.take();
        assert!(pending.supervisor);
        assert!(!pending.sensors);
    }

    #[test]
    fn console_rx_is_latched_until_taken() {
        let irq = Interrupts::new(60);
        irq.on_console_rx();
        assert!(irq.take().console);
        assert!(!irq.take().console);
    }
}
