//! Environmental sensors polled next to the recording
//!
//! A [`SensorBank`] groups the temperature, humidity and light sensors of a
//! logger. [`SensorLogger`] polls it on a [`SensorSession`] timer and writes
//! one CSV row per poll next to the current WAV file.

mod logger;

pub use logger::SensorLogger;

use embassy_time::{Duration, Instant};

use crate::error::SensorError;

/// Unit of illumination readings. Sensors reporting in this unit gate the
/// indicator LEDs.
pub const LUX: &str = "lx";

/// Latest value of one sensor channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub name: &'static str,
    pub unit: &'static str,
    pub value: f32,
}

/// A set of environmental sensors read together.
pub trait SensorBank {
    /// Start a conversion on all sensors.
    fn request(&mut self) -> Result<(), SensorError>;

    /// Fetch the results of the last request into [`readings`](Self::readings).
    fn read(&mut self) -> Result<(), SensorError>;

    /// One entry per available sensor channel, always in the same order.
    fn readings(&self) -> &[SensorReading];

    /// Time a conversion needs between [`request`](Self::request) and
    /// [`read`](Self::read).
    fn conversion_time(&self) -> Duration {
        Duration::from_millis(0)
    }

    fn report(&self) {}
}

/// What the session timer asks for at a given moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorStep {
    Wait,
    Request,
    Read,
}

/// Interval timer driving request and read of a [`SensorBank`].
#[derive(Debug, Clone)]
pub struct SensorSession {
    interval: Duration,
    conversion: Duration,
    requested: Option<Instant>,
    last_read: Option<Instant>,
}

impl SensorSession {
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            conversion: Duration::from_millis(0),
            requested: None,
            last_read: None,
        }
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn set_conversion_time(&mut self, conversion: Duration) {
        self.conversion = conversion;
    }

    /// Next step at `now`. Reads are held back while `defer` is set.
    pub fn step(&self, now: Instant, defer: bool) -> SensorStep {
        match self.requested {
            Some(at) if now.saturating_duration_since(at) >= self.conversion && !defer => {
                SensorStep::Read
            }
            Some(_) => SensorStep::Wait,
            None => {
                let due = self
                    .last_read
                    .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
                if due {
                    SensorStep::Request
                } else {
                    SensorStep::Wait
                }
            }
        }
    }

    pub fn requested(&mut self, now: Instant) {
        self.requested = Some(now);
    }

    pub fn read(&mut self, now: Instant) {
        self.requested = None;
        self.last_read = Some(now);
    }
}
