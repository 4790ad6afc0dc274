//! Wall-clock helpers: calendar days, day file names and sample alignment.
//!
//! The running wall clock itself is the seconds counter advanced by the tick
//! interrupt (see [`crate::interrupts`]); this module provides the calendar
//! arithmetic on top of it plus the RTC collaborator.

use chrono::{DateTime, Datelike, NaiveDate, Timelike};
use core::fmt::Write;
use serde::Serialize;

pub const SECONDS_PER_DAY: u32 = 86_400;

/// Length of a day file name, `YYYY_MM_DD.txt`.
pub const FILE_NAME_LEN: usize = 14;

pub type FileName = heapless::String<16>;

/// Battery-backed real-time clock (e.g. PCF8563).
pub trait Rtc {
    /// Current time as Unix seconds, `None` if the chip is unreadable or not set.
    fn read(&mut self) -> Option<u32>;
    /// Sets the chip time.
    fn write(&mut self, epoch: u32) -> bool;
}

/// Where the current wall-clock time came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimeProvider {
    Unset,
    Rtc,
    Ntp,
}

/// Calendar day, counted in days since 1970-01-01 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Day(pub u32);

impl Day {
    pub const fn from_epoch(epoch: u32) -> Self {
        Self(epoch / SECONDS_PER_DAY)
    }

    pub const fn start_epoch(self) -> u32 {
        self.0 * SECONDS_PER_DAY
    }

    pub fn date(self) -> Option<NaiveDate> {
        DateTime::from_timestamp(i64::from(self.start_epoch()), 0).map(|dt| dt.date_naive())
    }

    /// Name of the log file holding this day's records.
    pub fn file_name(self) -> FileName {
        let mut name = FileName::new();
        if let Some(date) = self.date() {
            let _ = write!(
                name,
                "{:04}_{:02}_{:02}.txt",
                date.year(),
                date.month(),
                date.day()
            );
        }
        name
    }

    /// Parses a name produced by [`Day::file_name`].
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".txt")?;
        let mut parts = stem.split('_');
        let year = parts.next()?.parse::<i32>().ok()?;
        let month = parts.next()?.parse::<u32>().ok()?;
        let day = parts.next()?.parse::<u32>().ok()?;
        if parts.next().is_some() {
            return None;
        }
        let midnight = NaiveDate::from_ymd_opt(year, month, day)?
            .and_hms_opt(0, 0, 0)?
            .and_utc()
            .timestamp();
        let epoch = u32::try_from(midnight).ok()?;
        Some(Self::from_epoch(epoch))
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Next sample instant strictly after `now`, aligned to multiples of
/// `interval_secs` since midnight UTC (and therefore to the minute whenever
/// the interval divides or is a multiple of 60).
pub fn next_aligned(now: u32, interval_secs: u16) -> u32 {
    let interval = u32::from(interval_secs.max(1));
    let midnight = Day::from_epoch(now).start_epoch();
    let since_midnight = now - midnight;
    let slot = since_midnight / interval + 1;
    midnight + slot * interval
}

/// `YYYY-MM-DDTHH:MM:SS`, used in RPC status replies.
pub fn format_iso(epoch: u32) -> heapless::String<20> {
    let mut out = heapless::String::new();
    if let Some(dt) = DateTime::from_timestamp(i64::from(epoch), 0) {
        let _ = write!(
            out,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second()
        );
    }
    out
}
