//! Real-time clock abstraction and date/time file name substitution

use alloc::string::String;
use core::fmt::Write;

use embassy_time::Instant;
use embedded_sdmmc::{TimeSource, Timestamp};

/// Calendar date and time as delivered by the RTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    pub const fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
        }
    }

    /// ISO 8601 representation, e.g. `2025-01-04T13:05:09`.
    pub fn iso(&self) -> String {
        let mut s = String::with_capacity(19);
        let _ = write!(
            s,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        );
        s
    }
}

/// Source of monotonic time and calendar time.
pub trait Clock {
    /// Monotonic time since boot.
    fn now(&self) -> Instant;

    /// Current calendar date and time.
    fn date_time(&self) -> DateTime;

    /// Replace date and time tokens in `template` by the current time.
    fn make_str(&self, template: &str) -> String {
        make_str(template, &self.date_time())
    }
}

/// Replace date and time tokens in `template`.
///
/// | token       | example           |
/// |-------------|-------------------|
/// | `SDATETIME` | `20250104T130509` |
/// | `DATETIME`  | `20250104T1305`   |
/// | `SDATE`     | `20250104`        |
/// | `DATE`      | `2025-01-04`      |
/// | `STIME`     | `13-05-09`        |
/// | `TIME`      | `13-05`           |
///
/// Longer tokens are substituted first, so `SDATETIME` never matches as
/// `DATE` plus leftovers.
pub fn make_str(template: &str, dt: &DateTime) -> String {
    let mut buf = String::new();
    let mut out = String::from(template);

    if out.contains("SDATETIME") {
        let _ = write!(
            buf,
            "{:04}{:02}{:02}T{:02}{:02}{:02}",
            dt.year, dt.month, dt.day, dt.hour, dt.minute, dt.second
        );
        out = out.replace("SDATETIME", &buf);
        buf.clear();
    }
    if out.contains("DATETIME") {
        let _ = write!(
            buf,
            "{:04}{:02}{:02}T{:02}{:02}",
            dt.year, dt.month, dt.day, dt.hour, dt.minute
        );
        out = out.replace("DATETIME", &buf);
        buf.clear();
    }
    if out.contains("SDATE") {
        let _ = write!(buf, "{:04}{:02}{:02}", dt.year, dt.month, dt.day);
        out = out.replace("SDATE", &buf);
        buf.clear();
    }
    if out.contains("DATE") {
        let _ = write!(buf, "{:04}-{:02}-{:02}", dt.year, dt.month, dt.day);
        out = out.replace("DATE", &buf);
        buf.clear();
    }
    if out.contains("STIME") {
        let _ = write!(buf, "{:02}-{:02}-{:02}", dt.hour, dt.minute, dt.second);
        out = out.replace("STIME", &buf);
        buf.clear();
    }
    if out.contains("TIME") {
        let _ = write!(buf, "{:02}-{:02}", dt.hour, dt.minute);
        out = out.replace("TIME", &buf);
    }
    out
}

/// Adapts a [`Clock`] to the FAT time source of `embedded-sdmmc`, so that
/// directory entries carry the RTC time.
pub struct ClockTimeSource<C: Clock> {
    clock: C,
}

impl<C: Clock> ClockTimeSource<C> {
    pub const fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> TimeSource for ClockTimeSource<C> {
    fn get_timestamp(&self) -> Timestamp {
        let dt = self.clock.date_time();
        Timestamp::from_calendar(dt.year, dt.month, dt.day, dt.hour, dt.minute, dt.second)
            // FAT cannot represent dates before 1980
            .unwrap_or(Timestamp {
                year_since_1970: 10,
                zero_indexed_month: 0,
                zero_indexed_day: 0,
                hours: 0,
                minutes: 0,
                seconds: 0,
            })
    }
}
