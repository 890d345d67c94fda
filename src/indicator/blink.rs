use alloc::vec::Vec;

use embassy_time::{Duration, Instant};
use embedded_hal::digital::OutputPin;
use heapless::Deque;
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{BlinkTiming, Indicator, MAX_SWITCH_TIMES, SwitchTime};

/// Maximum number of pins driven in parallel by one indicator.
pub const MAX_PINS: usize = 4;

const MAX_RANDOM_PULSES: usize = 5;

struct LedPin<P> {
    pin: P,
    enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    Off,
    Pulses(u8),
    Random,
}

#[derive(Debug, Clone, Copy)]
struct OneShot {
    start: Instant,
    count: u8,
    on: Duration,
    off: Duration,
}

/// LED indicator on one or more `embedded-hal` output pins.
///
/// All pins show the same state. Call [`Indicator::update`] from the main
/// loop; the pins only change there.
pub struct Blink<P: OutputPin> {
    name: &'static str,
    pins: heapless::Vec<LedPin<P>, MAX_PINS>,
    timing: BlinkTiming,
    pattern: Pattern,
    forced: bool,
    cycle_start: Instant,
    cycle: u64,
    random_plan: heapless::Vec<(u64, u64), MAX_RANDOM_PULSES>,
    oneshot: Option<OneShot>,
    on: bool,
    now: Instant,
    history: Deque<SwitchTime, MAX_SWITCH_TIMES>,
    rng: SmallRng,
}

impl<P: OutputPin> Blink<P> {
    pub fn new(name: &'static str, seed: u64) -> Self {
        Self {
            name,
            pins: heapless::Vec::new(),
            timing: BlinkTiming::default(),
            pattern: Pattern::Off,
            forced: false,
            cycle_start: Instant::from_millis(0),
            cycle: 0,
            random_plan: heapless::Vec::new(),
            oneshot: None,
            on: false,
            now: Instant::from_millis(0),
            history: Deque::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Add a pin. Returns the pin back if all slots are taken.
    pub fn add_pin(&mut self, mut pin: P) -> Result<(), P> {
        let _ = pin.set_low();
        self.pins.push(LedPin { pin, enabled: true }).map_err(|led| led.pin)
    }

    pub fn with_pin(mut self, pin: P) -> Self {
        let _ = self.add_pin(pin);
        self
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }

    fn restart_cycle(&mut self) {
        self.cycle_start = self.now;
        self.cycle = u64::MAX;
    }

    fn plan_random_cycle(&mut self) {
        self.random_plan.clear();
        let lo = self.timing.on.as_millis();
        let hi = self.timing.off.as_millis().max(lo);
        let pulses = self.rng.gen_range(1..=MAX_RANDOM_PULSES);
        for _ in 0..pulses {
            let on = self.rng.gen_range(lo..=hi);
            let off = self.rng.gen_range(lo..=hi);
            let _ = self.random_plan.push((on, off));
        }
    }

    fn pattern_level(&mut self, now: Instant) -> bool {
        let interval = self.timing.interval.as_millis().max(1);
        let elapsed = now.saturating_duration_since(self.cycle_start).as_millis();
        let cycle = elapsed / interval;
        let t = elapsed % interval;
        match self.pattern {
            Pattern::Off => false,
            Pattern::Pulses(count) => {
                let period = (self.timing.on + self.timing.off).as_millis().max(1);
                t / period < count as u64 && t % period < self.timing.on.as_millis()
            }
            Pattern::Random => {
                if cycle != self.cycle {
                    self.cycle = cycle;
                    self.plan_random_cycle();
                }
                let mut start = 0;
                for &(on, off) in self.random_plan.iter() {
                    if t < start + on {
                        return t >= start;
                    }
                    start += on + off;
                }
                false
            }
        }
    }

    fn oneshot_level(&mut self, now: Instant) -> Option<bool> {
        let shot = self.oneshot?;
        if now < shot.start {
            return None;
        }
        let elapsed = now.duration_since(shot.start).as_millis();
        let period = (shot.on + shot.off).as_millis().max(1);
        if elapsed / period >= shot.count as u64 {
            self.oneshot = None;
            return None;
        }
        Some(elapsed % period < shot.on.as_millis())
    }

    fn drive(&mut self, on: bool) {
        for led in self.pins.iter_mut() {
            let _ = if on && led.enabled {
                led.pin.set_high()
            } else {
                led.pin.set_low()
            };
        }
    }

    fn set_level(&mut self, on: bool) {
        if on == self.on {
            return;
        }
        self.on = on;
        self.drive(on);
        if self.history.is_full() {
            self.history.pop_front();
        }
        let _ = self.history.push_back(SwitchTime { at: self.now, on });
    }
}

impl<P: OutputPin> Indicator for Blink<P> {
    fn available(&self) -> bool {
        !self.pins.is_empty()
    }

    fn set_timing(&mut self, timing: BlinkTiming) {
        self.timing = timing;
        self.restart_cycle();
    }

    fn timing(&self) -> BlinkTiming {
        self.timing
    }

    fn set_multiple(&mut self, count: u8) {
        self.forced = false;
        self.pattern = if count == 0 {
            Pattern::Off
        } else {
            Pattern::Pulses(count)
        };
        self.restart_cycle();
    }

    fn set_random(&mut self) {
        self.forced = false;
        self.pattern = Pattern::Random;
        self.restart_cycle();
    }

    fn blink_multiple(&mut self, count: u8, delay: Duration, on: Duration, off: Duration) {
        self.oneshot = Some(OneShot {
            start: self.now + delay,
            count,
            on,
            off,
        });
    }

    fn clear(&mut self) {
        self.pattern = Pattern::Off;
        self.forced = false;
        self.oneshot = None;
        self.set_level(false);
    }

    fn switch_on(&mut self) {
        self.pattern = Pattern::Off;
        self.oneshot = None;
        self.forced = true;
        self.set_level(true);
    }

    fn switch_off(&mut self) {
        self.pattern = Pattern::Off;
        self.oneshot = None;
        self.forced = false;
        self.set_level(false);
    }

    fn is_on(&self) -> bool {
        self.on && self.pins.iter().any(|led| led.enabled)
    }

    fn enable_pins(&mut self) {
        for led in self.pins.iter_mut() {
            led.enabled = true;
        }
        self.drive(self.on);
    }

    fn disable_pins(&mut self) {
        for led in self.pins.iter_mut() {
            led.enabled = false;
        }
        self.drive(false);
    }

    fn disable_pin(&mut self, index: usize) {
        if let Some(led) = self.pins.get_mut(index) {
            led.enabled = false;
            let _ = led.pin.set_low();
        }
    }

    fn clear_pins(&mut self) {
        self.drive(false);
        self.pins.clear();
    }

    fn switch_times_len(&self) -> usize {
        self.history.len()
    }

    fn drain_switch_times(&mut self, out: &mut Vec<SwitchTime>) {
        while let Some(switch) = self.history.pop_front() {
            out.push(switch);
        }
    }

    fn clear_switch_times(&mut self) {
        self.history.clear();
    }

    fn update(&mut self, now: Instant) {
        self.now = now;
        if self.forced {
            return;
        }
        let level = match self.oneshot_level(now) {
            Some(level) => level,
            None => self.pattern_level(now),
        };
        self.set_level(level);
    }

    fn report(&self) {
        info!(
            "{} LED on {} pin(s), interval {}ms",
            self.name,
            self.pins.len(),
            self.timing.interval.as_millis()
        );
    }
}
