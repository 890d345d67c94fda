//! Status, error and sync LEDs
//!
//! The logger talks to its LEDs through the [`Indicator`] trait. [`Blink`]
//! drives real pins through `embedded-hal`; [`NoIndicator`] stands in for an
//! LED that is not fitted.

mod blink;

pub use blink::Blink;

use alloc::vec::Vec;

use embassy_time::{Duration, Instant};

/// Capacity of the switch time history an indicator keeps.
pub const MAX_SWITCH_TIMES: usize = 128;

/// One recorded on/off transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchTime {
    pub at: Instant,
    pub on: bool,
}

/// Timing of a repeating blink pattern.
///
/// For regular patterns `on` and `off` are the pulse and gap lengths. For
/// the random pattern they bound the randomly drawn pulse and gap lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkTiming {
    pub interval: Duration,
    pub on: Duration,
    pub off: Duration,
}

impl BlinkTiming {
    /// Heartbeat for rotations longer than 30 s.
    pub const SLOW_HEARTBEAT: Self = Self::heartbeat(Duration::from_millis(5000));
    /// Heartbeat for rotations of 30 s and less.
    pub const FAST_HEARTBEAT: Self = Self::heartbeat(Duration::from_millis(2000));
    /// Randomized multi-pulse timing used to mark recordings.
    pub const RANDOM: Self = Self {
        interval: Duration::from_millis(5000),
        on: Duration::from_millis(100),
        off: Duration::from_millis(1200),
    };

    pub const fn heartbeat(interval: Duration) -> Self {
        Self {
            interval,
            on: Duration::from_millis(50),
            off: Duration::from_millis(150),
        }
    }

    /// Heartbeat matching the duration of a file rotation.
    pub fn for_file_time(file_time: Duration) -> Self {
        if file_time > Duration::from_secs(30) {
            Self::SLOW_HEARTBEAT
        } else {
            Self::FAST_HEARTBEAT
        }
    }
}

impl Default for BlinkTiming {
    fn default() -> Self {
        Self::FAST_HEARTBEAT
    }
}

/// A visual indicator with a repeating pattern, one-shot blinks, pins that
/// can be disabled to save power and a history of switch times.
pub trait Indicator {
    /// False for indicators that are not fitted.
    fn available(&self) -> bool {
        true
    }

    fn set_timing(&mut self, timing: BlinkTiming);

    fn timing(&self) -> BlinkTiming;

    fn set_single(&mut self) {
        self.set_multiple(1);
    }

    fn set_double(&mut self) {
        self.set_multiple(2);
    }

    fn set_triple(&mut self) {
        self.set_multiple(3);
    }

    /// Blink `count` pulses every interval.
    fn set_multiple(&mut self, count: u8);

    /// Blink a random number of pulses with random lengths every interval.
    fn set_random(&mut self);

    /// One extra pulse of `duration` after `delay`.
    fn blink_single(&mut self, delay: Duration, duration: Duration) {
        self.blink_multiple(1, delay, duration, Duration::from_millis(0));
    }

    /// `count` extra pulses after `delay`.
    fn blink_multiple(&mut self, count: u8, delay: Duration, on: Duration, off: Duration);

    /// Stop any pattern and switch off.
    fn clear(&mut self);

    fn switch_on(&mut self);

    fn switch_off(&mut self);

    fn is_on(&self) -> bool;

    fn enable_pins(&mut self);

    fn disable_pins(&mut self);

    fn disable_pin(&mut self, index: usize);

    /// Remove all pins for good.
    fn clear_pins(&mut self);

    /// Number of transitions recorded since the history was last drained.
    fn switch_times_len(&self) -> usize;

    /// Move the recorded transitions into `out`.
    fn drain_switch_times(&mut self, out: &mut Vec<SwitchTime>);

    fn clear_switch_times(&mut self);

    /// Advance the pattern to `now` and drive the pins.
    fn update(&mut self, now: Instant);

    fn report(&self) {}
}

/// Indicator for an LED that is not fitted. All operations are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndicator;

impl Indicator for NoIndicator {
    fn available(&self) -> bool {
        false
    }

    fn set_timing(&mut self, _timing: BlinkTiming) {}

    fn timing(&self) -> BlinkTiming {
        BlinkTiming::default()
    }

    fn set_multiple(&mut self, _count: u8) {}

    fn set_random(&mut self) {}

    fn blink_multiple(&mut self, _count: u8, _delay: Duration, _on: Duration, _off: Duration) {}

    fn clear(&mut self) {}

    fn switch_on(&mut self) {}

    fn switch_off(&mut self) {}

    fn is_on(&self) -> bool {
        false
    }

    fn enable_pins(&mut self) {}

    fn disable_pins(&mut self) {}

    fn disable_pin(&mut self, _index: usize) {}

    fn clear_pins(&mut self) {}

    fn switch_times_len(&self) -> usize {
        0
    }

    fn drain_switch_times(&mut self, _out: &mut Vec<SwitchTime>) {}

    fn clear_switch_times(&mut self) {}

    fn update(&mut self, _now: Instant) {}
}
