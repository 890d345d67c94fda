//! The dual volume streaming file logger
//!
//! [`Logger`] drains the acquisition ring buffer into rotating WAV files on
//! a primary and an optional backup volume. [`Logger::update`] is called
//! from the main loop; each call performs at most one write and at most
//! one file rotation so that a call never blocks for long on SD card I/O.
//!
//! Write failures are recovered locally. What could not be recovered puts
//! the logger into [`LoggerState::Halted`], which the firmware polls.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use embassy_time::{Duration, Instant};
use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};

use crate::channel::{FileChannel, Role};
use crate::clock::Clock;
use crate::device_id::DeviceId;
use crate::error::{HaltReason, WriteError};
use crate::indicator::{BlinkTiming, Indicator, MAX_SWITCH_TIMES, NoIndicator, SwitchTime};
use crate::input::AcquisitionStream;
use crate::naming;
use crate::settings::LoggerSettings;
use crate::storage::{self, FileHandle, MIN_FREE_BYTES, StorageVolume};
use crate::sync::{NoSync, RotationSync};
use crate::wave::WaveHeader;

/// Consecutive write failures after which a channel is given up.
pub const MAX_RESTARTS: u32 = 5;

/// CPU clock used when the backup volume is not in use.
pub const BACKUP_OFF_CPU_MHZ: u32 = 150;

const REBOOT: &[u8] = b"reboot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerState {
    /// Not recording, either before `start()` or after `close()`
    Idle,
    Saving,
    /// Terminal state. Only a reset leaves it.
    Halted(HaltReason),
}

/// What one call of [`Logger::update`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Channel that was written to
    pub stored: Option<Role>,
    /// Channel whose file was rotated
    pub rotated: Option<Role>,
    /// A new primary file was opened, by a rotation or by a restart after
    /// a write error
    pub primary_opened: bool,
}

impl UpdateOutcome {
    pub fn primary_rotated(&self) -> bool {
        self.rotated == Some(Role::Primary)
    }
}

pub struct Logger<A, V, C>
where
    A: AcquisitionStream,
    V: StorageVolume,
    C: Clock,
{
    input: A,
    clock: C,
    primary: FileChannel<V>,
    backup: FileChannel<V>,
    status: Box<dyn Indicator>,
    error_led: Box<dyn Indicator>,
    sync_led: Box<dyn Indicator>,
    sync: Box<dyn RotationSync>,
    device: DeviceId,
    settings: Option<LoggerSettings>,
    file_template: String,
    prev_name: String,
    random_blinks: bool,
    blink_timeout: Duration,
    state: LoggerState,
    file_counter: u32,
    restarts: u32,
    next_store: Role,
    next_open: Role,
    started: Instant,
    primary_blinks: Option<V::File>,
    backup_blinks: Option<V::File>,
    switch_times: Vec<SwitchTime>,
    reboot_matched: usize,
    reboot_requested: bool,
}

impl<A, V, C> Logger<A, V, C>
where
    A: AcquisitionStream,
    V: StorageVolume,
    C: Clock,
{
    /// A logger writing to `primary` and, if given, mirroring every file
    /// to `backup`.
    pub fn new(
        input: A,
        primary: V,
        backup: Option<V>,
        clock: C,
        status: impl Indicator + 'static,
    ) -> Self {
        Self {
            input,
            clock,
            primary: FileChannel::new(Role::Primary, Some(primary)),
            backup: FileChannel::new(Role::Backup, backup),
            status: Box::new(status),
            error_led: Box::new(NoIndicator),
            sync_led: Box::new(NoIndicator),
            sync: Box::new(NoSync),
            device: DeviceId::default(),
            settings: None,
            file_template: String::new(),
            prev_name: String::new(),
            random_blinks: false,
            blink_timeout: Duration::from_millis(0),
            state: LoggerState::Idle,
            file_counter: 0,
            restarts: 0,
            next_store: Role::Primary,
            next_open: Role::Primary,
            started: Instant::from_millis(0),
            primary_blinks: None,
            backup_blinks: None,
            switch_times: Vec::with_capacity(MAX_SWITCH_TIMES),
            reboot_matched: 0,
            reboot_requested: false,
        }
    }

    pub fn with_error_led(mut self, led: impl Indicator + 'static) -> Self {
        self.error_led = Box::new(led);
        self
    }

    pub fn with_sync_led(mut self, led: impl Indicator + 'static) -> Self {
        self.sync_led = Box::new(led);
        self
    }

    /// Hook called at every primary rotation boundary.
    pub fn with_sync(mut self, sync: impl RotationSync + 'static) -> Self {
        self.sync = Box::new(sync);
        self
    }

    pub fn with_device_id(mut self, device: DeviceId) -> Self {
        self.device = device;
        self
    }

    pub fn state(&self) -> LoggerState {
        self.state
    }

    /// True while files are being written.
    pub fn saving(&self) -> bool {
        self.state == LoggerState::Saving
    }

    pub fn halted(&self) -> bool {
        matches!(self.state, LoggerState::Halted(_))
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Number of primary files opened so far.
    pub fn file_counter(&self) -> u32 {
        self.file_counter
    }

    /// Name of the current primary file without extension.
    pub fn base_name(&self) -> &str {
        self.primary.base_name()
    }

    pub fn primary(&self) -> &FileChannel<V> {
        &self.primary
    }

    pub fn backup(&self) -> &FileChannel<V> {
        &self.backup
    }

    pub fn input(&self) -> &A {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut A {
        &mut self.input
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device
    }

    /// True once `reboot` was typed on the console while halted.
    pub fn reboot_requested(&self) -> bool {
        self.reboot_requested
    }

    pub(crate) fn primary_volume_mut(&mut self) -> Option<&mut V> {
        self.primary.volume_mut()
    }

    pub(crate) fn status_led_mut(&mut self) -> &mut dyn Indicator {
        self.status.as_mut()
    }

    pub(crate) fn sync_led_mut(&mut self) -> &mut dyn Indicator {
        self.sync_led.as_mut()
    }

    /// True while the status or the sync LED is lit.
    pub fn leds_on(&self) -> bool {
        self.status.is_on() || self.sync_led.is_on()
    }

    /// Check the volumes before a session.
    ///
    /// The primary volume needs [`MIN_FREE_BYTES`] free, otherwise the
    /// logger halts and `false` is returned. The backup volume, if in use or
    /// if `force_backup` is set, needs at least as much free space as the
    /// primary one or it is dropped for the session.
    pub fn check(&mut self, force_backup: bool) -> bool {
        let primary_ok = self
            .primary
            .volume_mut()
            .is_some_and(|v| v.check(MIN_FREE_BYTES));
        if !primary_ok {
            if let Some(volume) = self.primary.volume_mut() {
                volume.end();
            }
            self.status.switch_off();
            error!("SD card not properly inserted or without enough free space, need to reboot");
            self.halt(HaltReason::CardCheck);
            return false;
        }
        let free = self.primary.volume().map_or(0, |v| v.free_bytes());
        if self.backup.bound() && (self.backup.active() || force_backup) {
            let backup_ok = self.backup.volume_mut().is_some_and(|v| v.check(free));
            if !backup_ok {
                warn!(
                    "{} SD card not available or smaller than primary, no backups",
                    self.backup.volume_name()
                );
                self.backup.end();
            }
        }
        true
    }

    /// Drop a backup volume that turned out to be unavailable.
    pub fn end_backup(&mut self) {
        if self.backup.bound() && !self.backup.active() {
            self.backup.end();
            info!("backup volume ended");
        }
    }

    /// Recommended CPU clock in MHz for sampling at `rate` Hz: steps of
    /// 24 MHz, at least 24 MHz, or a fixed 150 MHz when the backup volume
    /// is not in use. The value is recorded in the WAV headers.
    pub fn set_cpu_speed(&mut self, rate: u32) -> u32 {
        let speed = if self.backup.bound() && !self.backup.active() {
            BACKUP_OFF_CPU_MHZ
        } else {
            let khz = rate / 1000;
            (((12 + khz / 2) / 24) * 24).max(24)
        };
        self.primary.header_mut().cpu_speed_mhz = speed;
        self.backup.header_mut().cpu_speed_mhz = speed;
        info!("Set CPU speed to {}MHz", speed);
        speed
    }

    pub fn report(&self) {
        self.status.report();
        if self.error_led.available() {
            self.error_led.report();
        }
        if self.sync_led.available() {
            self.sync_led.report();
        }
        self.device.report();
        info!("Current time: {}", self.clock.date_time().iso());
    }

    /// Flash all fitted LEDs once so an operator can see they work.
    pub fn flash_leds<D: DelayNs>(&mut self, delay: &mut D) {
        if !self.error_led.available() && !self.sync_led.available() {
            return;
        }
        self.status.switch_off();
        delay.delay_ms(100);
        self.status.switch_on();
        delay.delay_ms(100);
        self.status.switch_off();
        delay.delay_ms(100);
        for led in [&mut self.error_led, &mut self.sync_led] {
            if led.available() {
                led.switch_on();
                delay.delay_ms(100);
                led.switch_off();
                delay.delay_ms(100);
            }
        }
        self.status.switch_on();
    }

    /// Wait `initial_delay` before recording, double blinking the status LED.
    pub fn initial_delay<D: DelayNs>(&mut self, initial_delay: Duration, delay: &mut D) {
        let total = initial_delay.as_millis();
        if total == 0 {
            self.status.set_double();
            return;
        }
        info!("Delay for {}s ...", initial_delay.as_secs());
        if total < 2000 {
            delay.delay_ms(total as u32);
            return;
        }
        delay.delay_ms(1000);
        self.status.set_double();
        let mut remaining = total - 1000;
        while remaining > 0 {
            let step = remaining.min(10);
            delay.delay_ms(step as u32);
            remaining -= step;
            self.status.update(self.clock.now());
        }
    }

    /// Select the data directory and file name template of a session.
    ///
    /// `path` and `file_name` may contain the date and time tokens of
    /// [`Clock::make_str`]; `file_name` may also contain `NUM` and `COUNT`.
    /// Its extension is replaced by `.wav`.
    pub fn setup(
        &mut self,
        path: &str,
        file_name: &str,
        software: &str,
        random_blinks: bool,
        blink_timeout: Duration,
    ) {
        self.random_blinks = random_blinks;
        self.blink_timeout = blink_timeout;
        self.file_template = naming::wave_template(file_name);
        self.prev_name.clear();
        self.restarts = 0;
        let path = self.clock.make_str(path);
        if let Some(volume) = self.primary.volume_mut() {
            match volume.prepare_dir(&path) {
                Ok(()) => info!(
                    "Save recorded data in folder \"{}\" on {} SD card",
                    volume.working_dir(),
                    volume.name()
                ),
                Err(err) => warn!("failed to prepare folder \"{}\": {}", path, err),
            }
        }
        let dir = String::from(self.primary.volume().map_or("", |v| v.working_dir()));
        if self.backup.active()
            && let Some(volume) = self.backup.volume_mut()
            && let Err(err) = volume.prepare_dir(&dir)
        {
            warn!("failed to prepare folder \"{}\" on backup: {}", dir, err);
        }
        let meta = self.input.metadata();
        for channel in [&mut self.primary, &mut self.backup] {
            let header = channel.header_mut();
            let cpu = header.cpu_speed_mhz;
            *header = WaveHeader::from_metadata(meta);
            header.software = String::from(software);
            header.cpu_speed_mhz = cpu;
        }
    }

    /// Start recording files of `file_time` each.
    pub fn start(&mut self, file_time: Duration) {
        if self.halted() {
            return;
        }
        if self.saving() {
            self.close();
        }
        self.restarts = 0;
        let write_interval = self.input.dma_buffer_time() * 2;
        self.primary.configure(write_interval, file_time);
        self.backup.configure(write_interval, file_time);
        let meta = self.input.metadata();
        for channel in [&mut self.primary, &mut self.backup] {
            let header = channel.header_mut();
            header.channels = meta.channels;
            header.rate = meta.rate;
        }

        if self.random_blinks && self.sync_led.available() {
            self.sync_led.set_timing(BlinkTiming::RANDOM);
            self.status.set_timing(BlinkTiming::for_file_time(file_time));
            self.sync_led.clear_switch_times();
        } else {
            if self.random_blinks {
                self.status.set_timing(BlinkTiming::RANDOM);
            } else {
                self.status.set_timing(BlinkTiming::for_file_time(file_time));
            }
            self.status.clear_switch_times();
        }

        self.primary.start(&self.input);
        self.backup.start_from(&self.primary);
        self.started = self.clock.now();
        self.open(Role::Primary);
        self.open(Role::Backup);
        self.next_store = Role::Primary;
        self.next_open = Role::Primary;
    }

    /// Like [`start`](Self::start), and write the settings together with
    /// the amplifier metadata next to every file.
    pub fn start_with_metadata(&mut self, file_time: Duration, settings: LoggerSettings) {
        self.settings = Some(settings);
        self.start(file_time);
        let header = self.primary.header();
        for (key, value) in [
            ("Channels", &header.channel_pins),
            ("Averaging", &header.averaging),
            ("Conversion speed", &header.conversion_speed),
            ("Sampling speed", &header.sampling_speed),
            ("Reference", &header.reference),
            ("Gain", &header.gain),
            ("Software", &header.software),
        ] {
            if !value.is_empty() {
                info!("{}: {}", key, value);
            }
        }
    }

    /// Close the current files. Does nothing unless saving.
    pub fn close(&mut self) {
        if !self.saving() {
            return;
        }
        if let Err(err) = self.primary.close() {
            warn!("closing {}: {}", self.primary.name(), err);
        }
        if self.backup.active()
            && let Err(err) = self.backup.close()
        {
            warn!("closing {} on backup: {}", self.backup.name(), err);
        }
        self.close_blink_files();
        self.state = LoggerState::Idle;
        self.sync_led.clear();
        self.status.set_double();
    }

    /// Enter the terminal state. The error LED blinks `reason.code()` times.
    pub fn halt(&mut self, reason: HaltReason) {
        error!("HALT ({}): {}", reason.code(), reason);
        self.state = LoggerState::Halted(reason);
        self.error_led.set_multiple(reason.code());
        self.reboot_matched = 0;
    }

    /// Feed one byte from the operator console. While halted, typing
    /// `reboot` requests a reset and returns true.
    pub fn console_input(&mut self, byte: u8) -> bool {
        if !self.halted() {
            return false;
        }
        if byte == REBOOT[self.reboot_matched] {
            self.reboot_matched += 1;
        } else {
            self.reboot_matched = usize::from(byte == REBOOT[0]);
        }
        if self.reboot_matched == REBOOT.len() {
            error!("REBOOT NOW");
            self.reboot_matched = 0;
            self.reboot_requested = true;
            return true;
        }
        false
    }

    /// Service the logger once. Call this from the main loop.
    pub fn update(&mut self) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();
        let now = self.clock.now();
        match self.state {
            LoggerState::Halted(_) => {
                self.error_led.update(now);
                return outcome;
            }
            LoggerState::Idle => {
                self.update_leds(now);
                return outcome;
            }
            LoggerState::Saving => {}
        }

        let files = self.file_counter;
        self.service(now, &mut outcome);
        outcome.primary_opened = self.file_counter != files;
        outcome
    }

    fn service(&mut self, now: Instant, outcome: &mut UpdateOutcome) {
        if !self.backup.active() {
            self.next_store = Role::Primary;
            self.next_open = Role::Primary;
        }

        let first = self.next_store;
        for role in [first, first.other()] {
            if role.is_backup() && !self.backup.active() {
                continue;
            }
            if self.store(role) {
                outcome.stored = Some(role);
                if self.backup.active() {
                    self.next_store = role.other();
                }
                break;
            }
        }
        if self.halted() {
            return;
        }

        // the backup mirrors the primary's file names, so it only rotates
        // once the primary moved on to its next file
        let primary_due = self.primary.end_of_rotation();
        let backup_due = self.backup.active()
            && self.backup.end_of_rotation()
            && self.backup.name() != self.primary.name();
        let rotate = match (primary_due, backup_due) {
            (true, true) => Some(self.next_open),
            (true, false) => Some(Role::Primary),
            (false, true) => Some(Role::Backup),
            (false, false) => None,
        };
        if let Some(role) = rotate {
            self.rotate(role);
            outcome.rotated = Some(role);
            if self.backup.active() {
                self.next_open = role.other();
            }
        }
        if self.halted() {
            return;
        }

        if self.random_blinks {
            self.store_blinks();
        }
        if self.blink_timeout.as_ticks() > 0 {
            let elapsed = now.saturating_duration_since(self.started);
            if elapsed > self.blink_timeout {
                self.status.disable_pin(0);
                self.sync_led.clear_pins();
            }
            if elapsed > self.blink_timeout * 2 {
                self.status.disable_pin(1);
            }
        }
        self.update_leds(now);
    }

    fn update_leds(&mut self, now: Instant) {
        self.status.update(now);
        self.sync_led.update(now);
        self.error_led.update(now);
    }

    fn rotate(&mut self, role: Role) {
        match role {
            Role::Primary => {
                if let Err(err) = self.primary.close() {
                    warn!("closing {}: {}", self.primary.name(), err);
                }
                if self.sync.on_rotation_boundary() {
                    debug!("rotation sync asked to defer, rotating anyway");
                }
                self.open(Role::Primary);
            }
            Role::Backup => {
                if let Err(err) = self.backup.close() {
                    warn!("closing {} on backup: {}", self.backup.name(), err);
                }
                self.open(Role::Backup);
            }
        }
    }

    /// Write once to the channel if it is pending. Returns whether a write
    /// was attempted.
    fn store(&mut self, role: Role) -> bool {
        let now = self.clock.now();
        let channel = match role {
            Role::Primary => &mut self.primary,
            Role::Backup => &mut self.backup,
        };
        match channel.store(&self.input, now) {
            None => false,
            Some(Ok(_)) => true,
            Some(Err(err)) => {
                self.recover(role, err);
                true
            }
        }
    }

    fn recover(&mut self, role: Role, err: WriteError) {
        let backup = role.is_backup();
        let channel = match role {
            Role::Primary => &mut self.primary,
            Role::Backup => &mut self.backup,
        };
        let volume = String::from(channel.volume_name());
        error!("ERROR in writing data to file on {} SD card: {}", volume, err);
        match err {
            WriteError::NoData => {
                self.input.stop();
                warn!(
                    "dma buffer time = {}ms",
                    self.input.dma_buffer_time().as_millis()
                );
            }
            WriteError::WroteNothing if backup => {
                warn!("{} SD card probably full", volume);
            }
            WriteError::WroteNothing => {
                error!("{} SD card probably full", volume);
                self.stop_on_fatal();
                self.halt(HaltReason::VolumeFull);
            }
            _ => {}
        }

        let channel = match role {
            Role::Primary => &mut self.primary,
            Role::Backup => &mut self.backup,
        };
        let base = String::from(channel.base_name());
        if let Err(close_err) = channel.close() {
            debug!("closing after write error: {}", close_err);
        }
        let marker = naming::error_marker(&base, backup, self.restarts + 1, err.tag());
        warn!("{}", marker);
        if let Some(volume) = self.primary.volume_mut().filter(|v| v.available())
            && let Err(touch_err) = storage::touch(volume, &marker)
        {
            warn!("failed to write {}: {}", marker, touch_err);
        }
        self.restarts += 1;
        info!("Incremented restarts to {} on {} SD card", self.restarts, volume);

        if backup && err == WriteError::WroteNothing {
            self.backup.end();
        }
        if self.restarts >= MAX_RESTARTS {
            error!("too many file errors on {} SD card", volume);
            if backup {
                warn!("end backups");
                self.backup.end();
            } else if !self.halted() {
                self.stop_on_fatal();
                self.halt(HaltReason::TooManyRestarts);
            }
        }
        if self.halted() {
            return;
        }

        if !self.input.running() {
            self.input.start();
        }
        match role {
            Role::Primary => self.primary.start(&self.input),
            Role::Backup => self.backup.start(&self.input),
        }
        self.open(role);
    }

    fn stop_on_fatal(&mut self) {
        self.input.stop();
        self.status.clear();
        self.sync_led.clear();
    }

    fn open(&mut self, role: Role) {
        match role {
            Role::Primary => self.open_primary(),
            Role::Backup => self.open_backup(),
        }
    }

    fn open_primary(&mut self) {
        let now = self.clock.now();
        self.status.set_single();
        self.status.blink_single(Duration::from_millis(0), Duration::from_millis(2000));
        if self.random_blinks {
            let led = if self.sync_led.available() {
                self.sync_led.as_mut()
            } else {
                self.status.as_mut()
            };
            led.set_random();
            led.blink_multiple(
                5,
                Duration::from_millis(0),
                Duration::from_millis(200),
                Duration::from_millis(200),
            );
        }

        let name = self
            .file_template
            .replace("COUNT", &format!("{:04}", self.file_counter + 1));
        let name = self.clock.make_str(&name);
        if name != self.prev_name {
            if let Some(volume) = self.primary.volume_mut() {
                volume.reset_file_counter();
            }
            self.prev_name = name.clone();
        }
        let Some(name) = self
            .primary
            .volume_mut()
            .and_then(|v| v.increment_file_name(&name))
        else {
            self.stop_on_fatal();
            self.halt(HaltReason::FileName);
            return;
        };

        self.primary.header_mut().date_time = self.clock.date_time().iso();
        if let Err(err) = self.primary.open(&name, &self.input, now) {
            error!(
                "failed to open file on {} SD card: {}",
                self.primary.volume_name(),
                err
            );
            self.stop_on_fatal();
            self.halt(HaltReason::OpenFailed);
            return;
        }
        self.state = LoggerState::Saving;
        self.file_counter += 1;
        self.initial_write(Role::Primary, now);
        if self.backup.active() {
            info!(
                "{} (on {} and {} SD card)",
                name,
                self.primary.volume_name(),
                self.backup.volume_name()
            );
        } else {
            info!("{}", name);
        }
        if self.random_blinks {
            self.open_blink_files();
        }
        self.write_metadata();
    }

    fn open_backup(&mut self) {
        if !self.backup.active() {
            return;
        }
        let now = self.clock.now();
        *self.backup.header_mut() = self.primary.header().clone();
        let name = String::from(self.primary.name());
        if let Err(err) = self.backup.open(&name, &self.input, now) {
            warn!(
                "failed to open {} on {} SD card: {}, no backups",
                name,
                self.backup.volume_name(),
                err
            );
            self.backup.end();
            return;
        }
        self.initial_write(Role::Backup, now);
    }

    fn initial_write(&mut self, role: Role, now: Instant) {
        let channel = match role {
            Role::Primary => &mut self.primary,
            Role::Backup => &mut self.backup,
        };
        match channel.write(&self.input, now) {
            Ok(_) => {}
            Err(WriteError::Overrun) => channel.recover_overrun(&self.input, now),
            Err(err) => debug!("initial write of {}: {}", channel.name(), err),
        }
    }

    fn close_blink_files(&mut self) {
        for file in [self.primary_blinks.take(), self.backup_blinks.take()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = file.close() {
                debug!("closing blink file: {}", err);
            }
        }
    }

    fn open_blink_files(&mut self) {
        self.close_blink_files();
        let name = naming::sidecar_name(self.primary.base_name(), "-blinks.csv");
        let header = b"time/ms,on\n";
        self.primary_blinks = self
            .primary
            .volume_mut()
            .and_then(|v| open_with(v, &name, header));
        if self.backup.active() {
            self.backup_blinks = self
                .backup
                .volume_mut()
                .and_then(|v| open_with(v, &name, header));
        }
        info!("Store blink times in {}", name);
    }

    /// Append the recorded LED switch times to the blink files once half
    /// of the indicator's history is used.
    fn store_blinks(&mut self) {
        let led = if self.sync_led.available() {
            self.sync_led.as_mut()
        } else {
            self.status.as_mut()
        };
        if led.switch_times_len() < MAX_SWITCH_TIMES / 2 {
            return;
        }
        self.switch_times.clear();
        led.drain_switch_times(&mut self.switch_times);
        let start = self.primary.start_write_time().as_millis() as i64;
        let mut rows = String::with_capacity(self.switch_times.len() * 14);
        for switch in &self.switch_times {
            let _ = writeln!(
                rows,
                "{},{}",
                switch.at.as_millis() as i64 - start,
                u8::from(switch.on)
            );
        }
        let backup_active = self.backup.active();
        for (file, active) in [
            (&mut self.primary_blinks, true),
            (&mut self.backup_blinks, backup_active),
        ] {
            let Some(file) = file.as_mut().filter(|_| active) else {
                continue;
            };
            if let Err(err) = storage::write_all(&mut *file, rows.as_bytes()) {
                warn!("failed to store blink times: {}", err);
            } else if let Err(err) = file.flush() {
                warn!("failed to flush blink times: {}", err);
            }
        }
    }

    fn write_metadata(&mut self) {
        let Some(settings) = self.settings.as_ref() else {
            return;
        };
        let mut yaml = String::new();
        let _ = settings.write_yaml(&mut yaml);
        let header = self.primary.header();
        let _ = writeln!(yaml, "Amplifier:");
        for (key, value) in [
            ("Channels", &header.channel_pins),
            ("Gain", &header.gain),
            ("Averaging", &header.averaging),
            ("ConversionSpeed", &header.conversion_speed),
            ("SamplingSpeed", &header.sampling_speed),
            ("Reference", &header.reference),
            ("Software", &header.software),
        ] {
            if !value.is_empty() {
                let _ = writeln!(yaml, "  {}: {}", key, value);
            }
        }
        let _ = writeln!(yaml, "  Rate: {}Hz", header.rate);
        let name = naming::sidecar_name(self.primary.base_name(), "-metadata.yml");
        let backup_active = self.backup.active();
        for (channel, active) in [(&mut self.primary, true), (&mut self.backup, backup_active)] {
            if let Some(volume) = channel.volume_mut().filter(|_| active)
                && let Err(err) = storage::write_file(volume, &name, yaml.as_bytes())
            {
                warn!("failed to write {}: {}", name, err);
            }
        }
        info!("Wrote metadata to {}", name);
    }
}

/// Create `name` and write `header` into it, keeping the file open.
fn open_with<V: StorageVolume>(volume: &mut V, name: &str, header: &[u8]) -> Option<V::File> {
    let opened = volume.open_write(name).and_then(|mut file| {
        storage::write_all(&mut file, header)?;
        Ok(file)
    });
    match opened {
        Ok(file) => Some(file),
        Err(err) => {
            warn!("failed to open {} on {} SD card: {}", name, volume.name(), err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::testing::{
        IndicatorLog, InputState, MemoryVolume, MockClock, MockInput, RecordingIndicator,
        VolumeState,
    };
    use crate::clock::DateTime;
    use alloc::rc::Rc;
    use core::cell::RefCell;

    type TestLogger = Logger<MockInput, MemoryVolume, MockClock>;

    struct Rig {
        clock: MockClock,
        input: Rc<RefCell<InputState>>,
        primary: Rc<RefCell<VolumeState>>,
        backup: Rc<RefCell<VolumeState>>,
        status: Rc<RefCell<IndicatorLog>>,
        sync: Rc<RefCell<IndicatorLog>>,
    }

    impl Rig {
        /// Advance time by one write interval and produce matching frames.
        fn tick(&self, logger: &mut TestLogger) -> UpdateOutcome {
            self.clock.advance(100);
            self.input.borrow_mut().head += 100;
            logger.update()
        }
    }

    fn rig(with_backup: bool, with_sync_led: bool) -> (TestLogger, Rig) {
        let input = MockInput::new();
        let primary = MemoryVolume::new("primary");
        let backup = MemoryVolume::new("backup");
        let clock = MockClock::new();
        let status = RecordingIndicator::new();
        let sync = RecordingIndicator::new();
        let rig = Rig {
            clock: clock.clone(),
            input: input.handle(),
            primary: primary.handle(),
            backup: backup.handle(),
            status: status.handle(),
            sync: sync.handle(),
        };
        let mut logger = Logger::new(input, primary, with_backup.then_some(backup), clock, status);
        if with_sync_led {
            logger = logger.with_sync_led(sync);
        }
        (logger, rig)
    }

    fn started(with_backup: bool, file_time: Duration) -> (TestLogger, Rig) {
        let (mut logger, rig) = rig(with_backup, false);
        logger.setup("recordings", "rec-NUM", "TeeGrid 1.0", false, Duration::from_millis(0));
        logger.start(file_time);
        (logger, rig)
    }

    #[test]
    fn test_start_opens_first_file() {
        let (logger, rig) = started(true, Duration::from_secs(10));
        assert!(logger.saving());
        assert_eq!(logger.file_counter(), 1);
        assert_eq!(logger.base_name(), "rec-01");
        assert_eq!(rig.primary.borrow().opened, ["rec-01.wav"]);
        assert_eq!(rig.backup.borrow().opened, ["rec-01.wav"]);
        assert_eq!(rig.status.borrow().pattern, "single");
    }

    #[test]
    fn test_round_robin_fairness() {
        let (mut logger, rig) = started(true, Duration::from_secs(10));
        let (mut primary, mut backup) = (0i32, 0i32);
        for _ in 0..41 {
            match rig.tick(&mut logger).stored {
                Some(Role::Primary) => primary += 1,
                Some(Role::Backup) => backup += 1,
                None => {}
            }
            assert!((primary - backup).abs() <= 1);
        }
        assert!(primary >= 20);
        assert!(backup >= 20);
        assert_eq!(logger.primary().cursor(), logger.backup().cursor() + 100);
    }

    #[test]
    fn test_rotation_closes_before_open() {
        let (mut logger, rig) = started(false, Duration::from_secs(1));
        let mut rotations = 0;
        for _ in 0..100 {
            if rig.tick(&mut logger).primary_rotated() {
                rotations += 1;
            }
        }
        let header_len = logger.primary().header().to_bytes(0).len();
        let state = rig.primary.borrow();
        assert_eq!(rotations, 10);
        assert_eq!(state.max_open_handles, 1);
        assert_eq!(state.opened.len(), rotations + 1);
        assert_eq!(state.files["rec-01.wav"].len(), header_len + 1000 * 4);
        assert_eq!(state.files["rec-05.wav"].len(), header_len + 1000 * 4);
        assert_eq!(logger.file_counter(), 11);
    }

    #[test]
    fn test_backup_follows_primary_rotation() {
        let (mut logger, rig) = started(true, Duration::from_secs(1));
        let mut rotated = Vec::new();
        for _ in 0..55 {
            if let Some(role) = rig.tick(&mut logger).rotated {
                rotated.push(role);
            }
        }
        assert_eq!(rotated.len(), 10);
        assert!(rotated.windows(2).all(|w| w[0] != w[1]));
        let primary = rig.primary.borrow();
        let backup = rig.backup.borrow();
        assert_eq!(backup.opened, primary.opened);
        assert_eq!(backup.files["rec-01.wav"], primary.files["rec-01.wav"]);
    }

    #[test]
    fn test_overrun_recovery_without_restart() {
        let (mut logger, rig) = started(false, Duration::from_secs(10));
        rig.tick(&mut logger);
        rig.input.borrow_mut().head += 2000;
        rig.tick(&mut logger);
        assert!(logger.saving());
        assert!(logger.primary().is_open());
        assert_eq!(logger.restarts(), 0);
        assert_eq!(rig.primary.borrow().names_with("-overrun"), ["rec-01-overrun1-overrun.msg"]);

        rig.tick(&mut logger);
        rig.input.borrow_mut().head += 2000;
        rig.tick(&mut logger);
        assert_eq!(rig.primary.borrow().count_files(".msg"), 2);
        assert!(rig.primary.borrow().files.contains_key("rec-01-overrun2-overrun.msg"));
        assert_eq!(logger.restarts(), 0);
    }

    #[test]
    fn test_primary_restarts_escalate_to_halt() {
        let (mut logger, rig) = started(false, Duration::from_secs(10));
        for restart in 1..=5 {
            assert!(logger.saving());
            rig.clock.advance(100);
            rig.input.borrow_mut().running = false;
            logger.update();
            assert_eq!(logger.restarts(), restart);
        }
        assert_eq!(logger.state(), LoggerState::Halted(HaltReason::TooManyRestarts));
        let state = rig.primary.borrow();
        assert_eq!(state.count_files(".msg"), 5);
        assert!(state.files.contains_key("rec-01-error1-nodata.msg"));
        assert!(state.files.contains_key("rec-05-error5-nodata.msg"));
        assert!(!rig.input.borrow().running);
    }

    #[test]
    fn test_restarts_reset_on_start() {
        let (mut logger, rig) = started(false, Duration::from_secs(10));
        rig.clock.advance(100);
        rig.input.borrow_mut().running = false;
        logger.update();
        assert_eq!(logger.restarts(), 1);
        logger.close();
        logger.start(Duration::from_secs(10));
        assert_eq!(logger.restarts(), 0);
    }

    #[test]
    fn test_restart_opens_new_primary() {
        let (mut logger, rig) = started(false, Duration::from_secs(10));
        assert!(!rig.tick(&mut logger).primary_opened);
        rig.clock.advance(100);
        rig.input.borrow_mut().running = false;
        let outcome = logger.update();
        assert!(outcome.primary_opened);
        assert!(!outcome.primary_rotated());
        assert_eq!(logger.base_name(), "rec-02");
        assert_eq!(logger.file_counter(), 2);
        assert!(!rig.tick(&mut logger).primary_opened);
    }

    #[test]
    fn test_sidecars_follow_restart() {
        let (mut logger, rig) = rig(false, true);
        logger.setup("data", "rec-NUM", "TeeGrid", true, Duration::from_millis(0));
        logger.start_with_metadata(Duration::from_secs(10), LoggerSettings::default());
        rig.tick(&mut logger);
        rig.clock.advance(100);
        rig.input.borrow_mut().running = false;
        logger.update();
        assert_eq!(logger.restarts(), 1);
        assert_eq!(logger.base_name(), "rec-02");
        let state = rig.primary.borrow();
        assert_eq!(state.text("rec-02-blinks.csv"), "time/ms,on\n");
        assert!(state.files.contains_key("rec-02-metadata.yml"));
        assert_eq!(state.count_files("-blinks.csv"), 2);
        assert_eq!(state.count_files("-metadata.yml"), 2);
        assert_eq!(state.open_handles, 2);
    }

    #[test]
    fn test_start_while_saving_closes_file() {
        let (mut logger, rig) = started(false, Duration::from_secs(10));
        rig.tick(&mut logger);
        logger.start(Duration::from_secs(10));
        assert!(logger.saving());
        let header_len = logger.primary().header().to_bytes(0).len();
        let state = rig.primary.borrow();
        assert_eq!(state.open_handles, 1);
        assert_eq!(state.max_open_handles, 1);
        assert_eq!(state.opened, ["rec-01.wav", "rec-02.wav"]);
        let file = &state.files["rec-01.wav"];
        let size = &file[header_len - 4..header_len];
        let size = u32::from_le_bytes([size[0], size[1], size[2], size[3]]) as usize;
        assert_eq!(size, file.len() - header_len);
        assert!(size > 0);
    }

    #[test]
    fn test_backup_restarts_disable_backup() {
        let (mut logger, rig) = started(true, Duration::from_secs(10));
        rig.backup.borrow_mut().fail_appends = Some(StorageError::Closed);
        for _ in 0..12 {
            rig.tick(&mut logger);
        }
        assert_eq!(logger.restarts(), 5);
        assert!(!logger.backup().active());
        assert!(rig.backup.borrow().ended);
        assert!(logger.saving());
        let markers = rig.primary.borrow().names_with("-backup-error");
        assert_eq!(markers.len(), 5);
        assert!(markers.iter().all(|m| m.ends_with("-notopen.msg")));

        let cursor = logger.primary().cursor();
        for _ in 0..3 {
            assert_eq!(rig.tick(&mut logger).stored, Some(Role::Primary));
        }
        assert_eq!(logger.primary().cursor(), cursor + 300);
    }

    #[test]
    fn test_primary_volume_full_halts() {
        let (mut logger, rig) = started(true, Duration::from_secs(10));
        rig.primary.borrow_mut().fail_appends = Some(StorageError::Full);
        rig.tick(&mut logger);
        assert_eq!(logger.state(), LoggerState::Halted(HaltReason::VolumeFull));
        assert!(rig.primary.borrow().files.contains_key("rec-01-error1-nowrite.msg"));
        assert!(!rig.input.borrow().running);
    }

    #[test]
    fn test_backup_volume_full_disables_backup() {
        let (mut logger, rig) = started(true, Duration::from_secs(10));
        rig.backup.borrow_mut().fail_appends = Some(StorageError::Full);
        rig.tick(&mut logger);
        rig.tick(&mut logger);
        assert!(logger.saving());
        assert!(!logger.backup().active());
        assert_eq!(logger.restarts(), 1);
        assert!(
            rig.primary
                .borrow()
                .files
                .contains_key("rec-01-backup-error1-nowrite.msg")
        );
        assert_eq!(rig.tick(&mut logger).stored, Some(Role::Primary));
    }

    #[test]
    fn test_file_counter_resets_on_new_name() {
        let (mut logger, rig) = rig(false, false);
        logger.setup("data", "LOG_SDATE_NUM", "TeeGrid", false, Duration::from_millis(0));
        logger.start(Duration::from_secs(1));
        for _ in 0..20 {
            rig.tick(&mut logger);
        }
        rig.clock.date.set(DateTime::new(2025, 1, 5, 0, 0, 0));
        for _ in 0..20 {
            rig.tick(&mut logger);
        }
        let opened = rig.primary.borrow().opened.clone();
        assert_eq!(
            opened,
            [
                "LOG_20250104_01.wav",
                "LOG_20250104_02.wav",
                "LOG_20250104_03.wav",
                "LOG_20250105_01.wav",
                "LOG_20250105_02.wav",
            ]
        );
        assert_eq!(rig.primary.borrow().counter_resets, 2);
    }

    #[test]
    fn test_count_token() {
        let (mut logger, rig) = rig(false, false);
        logger.setup("data", "rec-COUNT.raw", "TeeGrid", false, Duration::from_millis(0));
        logger.start(Duration::from_secs(1));
        for _ in 0..10 {
            rig.tick(&mut logger);
        }
        assert_eq!(rig.primary.borrow().opened, ["rec-0001.wav", "rec-0002.wav"]);
    }

    #[test]
    fn test_file_name_failure_halts() {
        let (mut logger, rig) = rig(false, false);
        logger.setup("data", "rec-NUM", "TeeGrid", false, Duration::from_millis(0));
        for n in 1..=99 {
            let name = alloc::format!("rec-{:02}.wav", n);
            rig.primary.borrow_mut().files.insert(name, Vec::new());
        }
        logger.start(Duration::from_secs(10));
        assert_eq!(logger.state(), LoggerState::Halted(HaltReason::FileName));
    }

    #[test]
    fn test_check_primary_free_space() {
        let (mut logger, rig) = rig(true, false);
        rig.primary.borrow_mut().free = 1_500_000_000;
        rig.backup.borrow_mut().available = false;
        assert!(logger.check(false));
        assert!(!logger.halted());
        assert!(!rig.backup.borrow().ended);

        let (mut logger, rig) = self::rig(false, false);
        rig.primary.borrow_mut().free = 500_000_000;
        assert!(!logger.check(false));
        assert_eq!(logger.state(), LoggerState::Halted(HaltReason::CardCheck));
        assert!(rig.primary.borrow().ended);
        assert!(!rig.status.borrow().on);
    }

    #[test]
    fn test_check_backup_needs_primary_free_space() {
        let (mut logger, rig) = rig(true, false);
        rig.primary.borrow_mut().free = 8_000_000_000;
        rig.backup.borrow_mut().free = 4_000_000_000;
        assert!(logger.check(false));
        assert!(!logger.backup().active());
        assert!(rig.backup.borrow().ended);
    }

    #[test]
    fn test_heartbeat_follows_file_time() {
        let (mut logger, rig) = rig(false, false);
        logger.setup("data", "rec-NUM", "TeeGrid", false, Duration::from_millis(0));
        logger.start(Duration::from_secs(10));
        assert_eq!(rig.status.borrow().timing, Some(BlinkTiming::FAST_HEARTBEAT));
        logger.close();
        logger.start(Duration::from_secs(300));
        assert_eq!(rig.status.borrow().timing, Some(BlinkTiming::SLOW_HEARTBEAT));
    }

    #[test]
    fn test_random_blinks_on_sync_led() {
        let (mut logger, rig) = rig(false, true);
        logger.setup("data", "rec-NUM", "TeeGrid", true, Duration::from_millis(0));
        logger.start(Duration::from_secs(60));
        assert_eq!(rig.sync.borrow().timing, Some(BlinkTiming::RANDOM));
        assert_eq!(rig.sync.borrow().pattern, "random");
        assert_eq!(rig.sync.borrow().oneshots, 1);
        assert_eq!(rig.status.borrow().timing, Some(BlinkTiming::SLOW_HEARTBEAT));
        assert_eq!(rig.status.borrow().pattern, "single");

        let (mut logger, rig) = self::rig(false, false);
        logger.setup("data", "rec-NUM", "TeeGrid", true, Duration::from_millis(0));
        logger.start(Duration::from_secs(60));
        assert_eq!(rig.status.borrow().timing, Some(BlinkTiming::RANDOM));
        assert_eq!(rig.status.borrow().pattern, "random");
    }

    #[test]
    fn test_blink_times_are_stored() {
        let (mut logger, rig) = rig(true, true);
        logger.setup("data", "rec-NUM", "TeeGrid", true, Duration::from_millis(0));
        rig.clock.advance(1000);
        logger.start(Duration::from_secs(60));
        let header = "time/ms,on\n";
        assert_eq!(rig.primary.borrow().text("rec-01-blinks.csv"), header);

        for k in 0..(MAX_SWITCH_TIMES / 2) as u64 - 1 {
            rig.sync.borrow_mut().switch_times.push(SwitchTime {
                at: Instant::from_millis(1000 + 10 * k),
                on: k % 2 == 0,
            });
        }
        rig.tick(&mut logger);
        assert_eq!(rig.primary.borrow().text("rec-01-blinks.csv"), header);

        rig.sync.borrow_mut().switch_times.push(SwitchTime {
            at: Instant::from_millis(2000),
            on: true,
        });
        rig.tick(&mut logger);
        let text = rig.primary.borrow().text("rec-01-blinks.csv");
        assert!(text.starts_with("time/ms,on\n0,1\n10,0\n20,1\n"));
        assert!(text.ends_with("1000,1\n"));
        assert_eq!(text.lines().count(), 1 + MAX_SWITCH_TIMES / 2);
        assert_eq!(rig.backup.borrow().text("rec-01-blinks.csv"), text);
    }

    #[test]
    fn test_blink_timeout_disables_pins() {
        let (mut logger, rig) = rig(false, true);
        logger.setup("data", "rec-NUM", "TeeGrid", false, Duration::from_secs(10));
        logger.start(Duration::from_secs(60));
        for _ in 0..100 {
            rig.tick(&mut logger);
        }
        assert!(rig.status.borrow().disabled_pins.is_empty());
        rig.tick(&mut logger);
        assert_eq!(rig.status.borrow().disabled_pins[0], 0);
        assert!(rig.sync.borrow().pins_cleared);
        assert!(!rig.status.borrow().disabled_pins.contains(&1));
        for _ in 0..100 {
            rig.tick(&mut logger);
        }
        assert!(rig.status.borrow().disabled_pins.contains(&1));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut logger, rig) = started(true, Duration::from_secs(10));
        rig.tick(&mut logger);
        logger.close();
        assert_eq!(logger.state(), LoggerState::Idle);
        assert_eq!(rig.status.borrow().pattern, "double");
        assert_eq!(rig.primary.borrow().open_handles, 0);
        assert_eq!(rig.backup.borrow().open_handles, 0);
        let len = rig.primary.borrow().files["rec-01.wav"].len();
        logger.close();
        rig.tick(&mut logger);
        assert_eq!(rig.primary.borrow().files["rec-01.wav"].len(), len);
        assert_eq!(rig.primary.borrow().opened.len(), 1);
    }

    #[test]
    fn test_metadata_written_per_rotation() {
        let (mut logger, rig) = rig(true, false);
        logger.setup("data", "rec-NUM", "TeeGrid 1.0", false, Duration::from_millis(0));
        logger.start_with_metadata(Duration::from_secs(1), LoggerSettings::default());
        let yaml = rig.primary.borrow().text("rec-01-metadata.yml");
        assert!(yaml.starts_with("Settings:\n"));
        assert!(yaml.contains("Amplifier:\n"));
        assert!(yaml.contains("  Gain: 20dB\n"));
        assert!(yaml.contains("  Software: TeeGrid 1.0\n"));
        assert_eq!(rig.backup.borrow().text("rec-01-metadata.yml"), yaml);
        for _ in 0..25 {
            rig.tick(&mut logger);
        }
        assert!(rig.primary.borrow().files.contains_key("rec-02-metadata.yml"));
    }

    #[test]
    fn test_rotation_calls_sync_hook() {
        let calls = Rc::new(RefCell::new(0));
        let counter = calls.clone();
        let (logger, rig) = rig(false, false);
        let mut logger = logger.with_sync(move || {
            *counter.borrow_mut() += 1;
            false
        });
        logger.setup("data", "rec-NUM", "TeeGrid", false, Duration::from_millis(0));
        logger.start(Duration::from_secs(1));
        for _ in 0..30 {
            rig.tick(&mut logger);
        }
        assert_eq!(*calls.borrow(), 3);
    }

    #[test]
    fn test_console_reboot_while_halted() {
        let (mut logger, _rig) = rig(false, false);
        assert!(!logger.console_input(b'r'));
        logger.halt(HaltReason::OpenFailed);
        let mut rebooted = false;
        for &byte in b"xrerreboot" {
            rebooted = logger.console_input(byte);
        }
        assert!(rebooted);
        assert!(logger.reboot_requested());
    }

    #[test]
    fn test_cpu_speed() {
        let (mut logger, rig) = rig(true, false);
        assert_eq!(logger.set_cpu_speed(48_000), 24);
        assert_eq!(logger.set_cpu_speed(96_000), 48);
        assert_eq!(logger.set_cpu_speed(1_000), 24);
        assert_eq!(logger.primary().header().cpu_speed_mhz, 24);
        rig.backup.borrow_mut().available = false;
        assert_eq!(logger.set_cpu_speed(96_000), BACKUP_OFF_CPU_MHZ);
    }
}
