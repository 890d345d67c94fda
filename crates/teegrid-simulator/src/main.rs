//! Desktop simulator for the TeeGrid dual-SD streaming logger.
//!
//! Runs the logger core against directories on the host file system
//! instead of SD cards, a synthetic sine wave acquisition instead of the
//! ADCs and console output instead of LEDs. Useful for checking file
//! rotation, backup mirroring and the sidecar files without a Teensy.
//!
//! # Usage
//!
//! ```bash
//! teegrid-simulator --output rec --backup rec-backup --file-time 5 --run-time 60
//! RUST_LOG=debug teegrid-simulator --random-blinks --sensors
//! ```
//!
//! Pass `--stall` to block the main loop once for longer than the ring
//! buffer holds and watch the overrun recovery.

use std::convert::Infallible;
use std::f32::consts::TAU;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use chrono::{Datelike, Local, Timelike};
use clap::Parser;
use embassy_time::{Duration, Instant};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, OutputPin};
use log::{debug, error, info, warn};

use teegrid_logger::error::SettingsError;
use teegrid_logger::naming::FileNameCounter;
use teegrid_logger::sensors::LUX;
use teegrid_logger::{
    AcquisitionStream, Blink, Clock, DateTime, DeviceId, FileHandle, InputMetadata, Logger,
    LoggerSettings, LoggerState, SensorBank, SensorError, SensorLogger, SensorReading,
    StorageError, StorageVolume,
};

const SOFTWARE: &str = concat!("teegrid-simulator ", env!("CARGO_PKG_VERSION"));

/// Pause between two iterations of the main loop.
const LOOP_INTERVAL: std::time::Duration = std::time::Duration::from_millis(5);

/// Time span the synthetic ring buffer holds.
const BUFFER_TIME_MS: u64 = 500;

/// Time span of one synthetic DMA buffer.
const DMA_BUFFER_TIME_MS: u64 = 25;

#[derive(Parser)]
#[command(name = "teegrid-simulator")]
#[command(about = "Run the TeeGrid logger core against host directories", long_about = None)]
struct Cli {
    /// Directory standing in for the primary SD card
    #[arg(short, long, default_value = "recordings")]
    output: PathBuf,

    /// Directory standing in for the backup SD card
    #[arg(short, long)]
    backup: Option<PathBuf>,

    /// Label substituted for LABEL in path and file name
    #[arg(long, default_value = "logger")]
    label: String,

    /// Device identifier, -1 for none
    #[arg(long, default_value_t = -1)]
    device_id: i16,

    /// Folder template
    #[arg(long, default_value = "LABELID2-SDATETIMEM")]
    path: String,

    /// File name template
    #[arg(long, default_value = "LABELID2-SDATETIME")]
    file_name: String,

    /// Seconds per file
    #[arg(short, long, default_value_t = 10.0)]
    file_time: f32,

    /// Seconds to record before closing the last file
    #[arg(short, long, default_value_t = 60.0)]
    run_time: f32,

    /// Seconds to wait before recording
    #[arg(long, default_value_t = 0.0)]
    initial_delay: f32,

    /// Number of channels
    #[arg(short, long, default_value_t = 4)]
    channels: u16,

    /// Sampling rate in Hz
    #[arg(long, default_value_t = 48_000)]
    rate: u32,

    /// Free space reported by both volumes in GB
    #[arg(long, default_value_t = 32.0)]
    free_gb: f64,

    /// Random blink patterns on the sync LED, logged to blink files
    #[arg(long)]
    random_blinks: bool,

    /// Seconds after which the LEDs are switched off, 0 keeps them on
    #[arg(long, default_value_t = 0.0)]
    blink_timeout: f32,

    /// Log synthetic temperature and illumination readings
    #[arg(long)]
    sensors: bool,

    /// Seconds between sensor readings
    #[arg(long, default_value_t = 30.0)]
    sensors_interval: f32,

    /// Illumination in lux below which the LEDs are switched off
    #[arg(long, default_value_t = 0.0)]
    light_threshold: f32,

    /// Block the main loop once for this many milliseconds half way through
    #[arg(long)]
    stall: Option<u64>,
}

// ---------------------------------------------------------------------------
// Host collaborators
// ---------------------------------------------------------------------------

/// Monotonic time since start plus the local wall clock.
#[derive(Clone)]
struct SystemClock {
    boot: std::time::Instant,
}

impl SystemClock {
    fn new() -> Self {
        Self {
            boot: std::time::Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::from_micros(self.boot.elapsed().as_micros() as u64)
    }

    fn date_time(&self) -> DateTime {
        let now = Local::now();
        DateTime::new(
            now.year() as u16,
            now.month() as u8,
            now.day() as u8,
            now.hour() as u8,
            now.minute() as u8,
            now.second() as u8,
        )
    }
}

/// A directory on the host playing the role of an SD card.
struct HostVolume {
    name: &'static str,
    root: PathBuf,
    dir: PathBuf,
    dir_name: String,
    free: u64,
    available: bool,
    counter: FileNameCounter,
}

impl HostVolume {
    fn new(name: &'static str, root: PathBuf, free: u64) -> Self {
        let available = fs::create_dir_all(&root).is_ok();
        Self {
            name,
            dir: root.clone(),
            root,
            dir_name: String::new(),
            free,
            available,
            counter: FileNameCounter::new(),
        }
    }
}

fn io_error(err: std::io::Error) -> StorageError {
    match err.kind() {
        std::io::ErrorKind::NotFound => StorageError::NotFound,
        std::io::ErrorKind::StorageFull => StorageError::Full,
        _ => StorageError::Io,
    }
}

struct HostFile {
    file: File,
}

impl FileHandle for HostFile {
    fn write(&mut self, data: &[u8]) -> Result<usize, StorageError> {
        self.file.write(data).map_err(io_error)
    }

    fn seek(&mut self, pos: u64) -> Result<(), StorageError> {
        self.file.seek(SeekFrom::Start(pos)).map(|_| ()).map_err(io_error)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.file.flush().map_err(io_error)
    }

    fn close(mut self) -> Result<(), StorageError> {
        self.file.flush().map_err(io_error)?;
        self.file.sync_all().map_err(io_error)
    }
}

impl StorageVolume for HostVolume {
    type File = HostFile;

    fn name(&self) -> &str {
        self.name
    }

    fn available(&self) -> bool {
        self.available
    }

    fn free_bytes(&self) -> u64 {
        self.free
    }

    fn end(&mut self) {
        info!("Stop using {} volume at {}", self.name, self.root.display());
        self.available = false;
    }

    fn prepare_dir(&mut self, path: &str) -> Result<(), StorageError> {
        if !self.available {
            return Err(StorageError::Unavailable);
        }
        let dir = self.root.join(path);
        fs::create_dir_all(&dir).map_err(io_error)?;
        self.dir = dir;
        self.dir_name = path.to_owned();
        Ok(())
    }

    fn working_dir(&self) -> &str {
        &self.dir_name
    }

    fn exists(&self, name: &str) -> bool {
        self.dir.join(name).exists()
    }

    fn open_write(&mut self, name: &str) -> Result<HostFile, StorageError> {
        if !self.available {
            return Err(StorageError::Unavailable);
        }
        let file = File::create(self.dir.join(name)).map_err(io_error)?;
        Ok(HostFile { file })
    }

    fn reset_file_counter(&mut self) {
        self.counter.reset();
    }

    fn increment_file_name(&mut self, name: &str) -> Option<String> {
        if !self.available {
            return None;
        }
        let dir = &self.dir;
        self.counter.next(name, |candidate| dir.join(candidate).exists())
    }
}

/// Acquisition producing one sine wave per channel in real time.
struct SineInput {
    meta: InputMetadata,
    boot: std::time::Instant,
    running_since: Option<std::time::Instant>,
    produced: u64,
}

impl SineInput {
    fn new(channels: u16, rate: u32) -> Self {
        let pins = (0..channels)
            .map(|c| format!("A{c}"))
            .collect::<Vec<_>>()
            .join(",");
        Self {
            meta: InputMetadata {
                channels,
                rate,
                channel_pins: pins,
                gain: String::from("1.00"),
                averaging: String::from("4"),
                conversion_speed: String::from("high"),
                sampling_speed: String::from("high"),
                reference: String::from("3.3V"),
            },
            boot: std::time::Instant::now(),
            running_since: None,
            produced: 0,
        }
    }

    fn sample(&self, frame: u64, channel: usize) -> i16 {
        let t = frame as f32 / self.meta.rate as f32;
        let freq = 110.0 * (channel + 1) as f32;
        (8000.0 * (TAU * freq * t).sin()) as i16
    }
}

impl AcquisitionStream for SineInput {
    fn dma_buffer_time(&self) -> Duration {
        Duration::from_millis(DMA_BUFFER_TIME_MS)
    }

    fn buffer_frames(&self) -> usize {
        (self.meta.rate as u64 * BUFFER_TIME_MS / 1000) as usize
    }

    fn metadata(&self) -> &InputMetadata {
        &self.meta
    }

    fn running(&self) -> bool {
        self.running_since.is_some()
    }

    fn start(&mut self) {
        if self.running_since.is_none() {
            debug!("start acquisition at {:?}", self.boot.elapsed());
            self.running_since = Some(std::time::Instant::now());
        }
    }

    fn stop(&mut self) {
        self.produced = self.head();
        self.running_since = None;
    }

    fn head(&self) -> u64 {
        let running = self.running_since.map_or(0, |since| {
            since.elapsed().as_micros() as u64 * self.meta.rate as u64 / 1_000_000
        });
        self.produced + running
    }

    fn copy_frames(&self, from: u64, out: &mut [i16]) -> usize {
        let channels = self.meta.channels.max(1) as usize;
        let head = self.head();
        let oldest = head.saturating_sub(self.buffer_frames() as u64);
        if from < oldest {
            return 0;
        }
        let frames = (head.saturating_sub(from) as usize).min(out.len() / channels);
        for (k, frame) in out.chunks_mut(channels).take(frames).enumerate() {
            for (c, sample) in frame.iter_mut().enumerate() {
                *sample = self.sample(from + k as u64, c);
            }
        }
        frames
    }
}

/// Output pin printing its transitions.
struct ConsolePin {
    name: &'static str,
    high: bool,
}

impl ConsolePin {
    fn new(name: &'static str) -> Self {
        Self { name, high: false }
    }
}

impl ErrorType for ConsolePin {
    type Error = Infallible;
}

impl OutputPin for ConsolePin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        if self.high {
            debug!("{} LED off", self.name);
        }
        self.high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        if !self.high {
            debug!("{} LED on", self.name);
        }
        self.high = true;
        Ok(())
    }
}

struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        thread::sleep(std::time::Duration::from_nanos(ns as u64));
    }
}

/// Temperature and illumination following a slow synthetic day cycle.
struct SyntheticSensors {
    clock: SystemClock,
    readings: [SensorReading; 2],
}

impl SyntheticSensors {
    fn new(clock: SystemClock) -> Self {
        Self {
            clock,
            readings: [
                SensorReading {
                    name: "temperature",
                    unit: "°C",
                    value: f32::NAN,
                },
                SensorReading {
                    name: "illumination",
                    unit: LUX,
                    value: f32::NAN,
                },
            ],
        }
    }
}

impl SensorBank for SyntheticSensors {
    fn request(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn read(&mut self) -> Result<(), SensorError> {
        let t = self.clock.now().as_millis() as f32 / 1000.0;
        let day = (TAU * t / 120.0).sin();
        self.readings[0].value = 18.0 + 4.0 * day;
        self.readings[1].value = (400.0 * day).max(0.0);
        Ok(())
    }

    fn readings(&self) -> &[SensorReading] {
        &self.readings
    }

    fn conversion_time(&self) -> Duration {
        Duration::from_millis(10)
    }

    fn report(&self) {
        info!("Synthetic sensors: temperature, illumination");
    }
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

type HostLogger = Logger<SineInput, HostVolume, SystemClock>;

enum Runner {
    Plain(HostLogger),
    Sensors(SensorLogger<SineInput, HostVolume, SystemClock, SyntheticSensors>),
}

impl Runner {
    fn logger(&self) -> &HostLogger {
        match self {
            Self::Plain(logger) => logger,
            Self::Sensors(logger) => logger.logger(),
        }
    }

    fn update(&mut self) {
        match self {
            Self::Plain(logger) => {
                logger.update();
            }
            Self::Sensors(logger) => {
                logger.update();
            }
        }
    }

    fn close(&mut self) {
        match self {
            Self::Plain(logger) => logger.close(),
            Self::Sensors(logger) => logger.close(),
        }
    }
}

fn settings(cli: &Cli) -> Result<LoggerSettings, SettingsError> {
    let mut settings = LoggerSettings::default();
    settings.set_label(&cli.label)?;
    settings.set_device_id(cli.device_id)?;
    settings.set_path(&cli.path)?;
    settings.set_file_name(&cli.file_name)?;
    settings.set_file_time(cli.file_time)?;
    settings.set_initial_delay(cli.initial_delay)?;
    settings.set_random_blinks(cli.random_blinks);
    settings.set_blink_timeout(cli.blink_timeout)?;
    settings.set_sensors_interval(cli.sensors_interval)?;
    settings.set_light_threshold(cli.light_threshold)?;
    Ok(settings)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let device = DeviceId::new(cli.device_id);
    let mut settings = match settings(&cli) {
        Ok(settings) => settings,
        Err(err) => {
            error!("Invalid configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = settings.prepare_paths(&device) {
        error!("Invalid configuration: {}", err);
        return ExitCode::FAILURE;
    }
    settings.report();

    let free = (cli.free_gb * 1e9) as u64;
    let clock = SystemClock::new();
    let seed = Local::now().timestamp_millis() as u64;
    let primary = HostVolume::new("primary", cli.output.clone(), free);
    let backup = cli
        .backup
        .clone()
        .map(|dir| HostVolume::new("backup", dir, free));
    let input = SineInput::new(cli.channels, cli.rate);
    let status = Blink::new("status", seed).with_pin(ConsolePin::new("status"));
    let mut logger = Logger::new(input, primary, backup, clock.clone(), status)
        .with_error_led(Blink::new("error", seed ^ 1).with_pin(ConsolePin::new("error")))
        .with_sync_led(Blink::new("sync", seed ^ 2).with_pin(ConsolePin::new("sync")))
        .with_device_id(device);

    let mut delay = StdDelay;
    logger.report();
    logger.flash_leds(&mut delay);
    if !logger.check(false) {
        error!("Primary volume at {} not usable", cli.output.display());
        return ExitCode::FAILURE;
    }
    logger.set_cpu_speed(cli.rate);
    logger.initial_delay(settings.initial_delay(), &mut delay);
    logger.setup(
        settings.path(),
        settings.file_name(),
        SOFTWARE,
        settings.random_blinks(),
        settings.blink_timeout(),
    );

    let file_time = settings.file_time();
    let mut runner = if cli.sensors {
        let mut logger = SensorLogger::new(logger, SyntheticSensors::new(clock.clone()));
        logger.setup_sensors();
        logger.start_sensors(settings.sensors_interval(), settings.light_threshold());
        logger.start_with_metadata(file_time, settings);
        Runner::Sensors(logger)
    } else {
        logger.start_with_metadata(file_time, settings);
        Runner::Plain(logger)
    };

    let run_time = Duration::from_millis((cli.run_time.max(0.0) * 1000.0) as u64);
    let stall_after = run_time / 2;
    let mut stall = cli.stall;
    let started = clock.now();
    while clock.now().saturating_duration_since(started) < run_time {
        runner.update();
        if let LoggerState::Halted(reason) = runner.logger().state() {
            error!("Logger halted with code {}: {}", reason.code(), reason);
            return ExitCode::FAILURE;
        }
        if clock.now().saturating_duration_since(started) >= stall_after
            && let Some(ms) = stall.take()
        {
            warn!("Stall main loop for {}ms", ms);
            thread::sleep(std::time::Duration::from_millis(ms));
        }
        thread::sleep(LOOP_INTERVAL);
    }
    runner.close();
    info!(
        "Recorded {} files with {} restarts",
        runner.logger().file_counter(),
        runner.logger().restarts()
    );
    ExitCode::SUCCESS
}
