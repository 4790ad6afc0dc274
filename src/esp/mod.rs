//! ESP32-C3 bindings of the station collaborators.

pub mod board;
pub mod device;
pub mod mqtt;
pub mod sntp;
pub mod watchdog;
pub mod wifi;

use embassy_time::{Duration, Ticker};

use crate::interrupts::Interrupts;

/// The once-per-second tick interrupt of the station.
#[embassy_executor::task]
pub async fn tick_task(interrupts: &'static Interrupts) {
    let mut ticker = Ticker::every(Duration::from_secs(1));
    loop {
        ticker.next().await;
        interrupts.on_tick();
    }
}
