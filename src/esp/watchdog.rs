use core::sync::atomic::{AtomicU64, Ordering};

use embassy_time::{Duration, Instant, Ticker};
use esp_hal::delay::Delay;

use crate::config::CONFIG;

/// Uptime (ms) of the last completed dispatcher step, written by the main loop.
pub struct Heartbeat(AtomicU64);

impl Heartbeat {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn beat(&self) {
        self.0.store(Instant::now().as_millis(), Ordering::Relaxed);
    }

    fn age(&self, now: Instant) -> Duration {
        let last = Instant::from_millis(self.0.load(Ordering::Relaxed));
        now.checked_duration_since(last).unwrap_or_default()
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Kicks the external TPL5010 as long as the dispatcher keeps stepping. A
/// stuck station stops the kicks and the TPL5010 resets the board.
#[embassy_executor::task]
pub async fn watchdog_task(
    mut watchdog_pin: esp_hal::gpio::Output<'static>,
    delay: Delay,
    heartbeat: &'static Heartbeat,
) {
    // TPL5010 expects a HIGH pulse on DONE; start LOW.
    watchdog_pin.set_low();
    let mut ticker = Ticker::every(CONFIG.watchdog.tick_interval);

    loop {
        ticker.next().await;
        let age = heartbeat.age(Instant::now());

        if age <= CONFIG.watchdog.dispatcher_timeout {
            watchdog_pin.set_high();
            delay.delay_millis(CONFIG.watchdog.kick_duration_ms);
            watchdog_pin.set_low();
            defmt::debug!("watchdog: fed");
        } else {
            defmt::error!(
                "watchdog: dispatcher stalled for {} ms, not feeding",
                age.as_millis()
            );
        }
    }
}
