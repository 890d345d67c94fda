use alloc::string::String;
use core::fmt::Write;

use embassy_time::Duration;
use log::{info, warn};

use super::{LUX, SensorBank, SensorSession, SensorStep};
use crate::clock::Clock;
use crate::input::AcquisitionStream;
use crate::logger::Logger;
use crate::naming;
use crate::settings::LoggerSettings;
use crate::storage::{self, FileHandle, StorageVolume};

/// Light sensors taken into account for gating the LEDs.
pub const MAX_LIGHT_SENSORS: usize = 4;

/// A [`Logger`] that also polls a [`SensorBank`] and writes the readings
/// into a CSV file next to every primary WAV file.
///
/// If the bank has light sensors, the status and sync LEDs are switched
/// off while the strongest illumination is below a threshold.
pub struct SensorLogger<A, V, C, S>
where
    A: AcquisitionStream,
    V: StorageVolume,
    C: Clock,
    S: SensorBank,
{
    logger: Logger<A, V, C>,
    sensors: S,
    session: SensorSession,
    csv: Option<V::File>,
    light: heapless::Vec<usize, MAX_LIGHT_SENSORS>,
    light_threshold: f32,
    row: String,
}

impl<A, V, C, S> SensorLogger<A, V, C, S>
where
    A: AcquisitionStream,
    V: StorageVolume,
    C: Clock,
    S: SensorBank,
{
    pub fn new(logger: Logger<A, V, C>, sensors: S) -> Self {
        Self {
            logger,
            sensors,
            session: SensorSession::new(Duration::from_secs(30)),
            csv: None,
            light: heapless::Vec::new(),
            light_threshold: 0.0,
            row: String::new(),
        }
    }

    pub fn logger(&self) -> &Logger<A, V, C> {
        &self.logger
    }

    pub fn logger_mut(&mut self) -> &mut Logger<A, V, C> {
        &mut self.logger
    }

    pub fn sensors(&self) -> &S {
        &self.sensors
    }

    pub fn session(&self) -> &SensorSession {
        &self.session
    }

    /// Number of sensors reporting illumination.
    pub fn light_sensors(&self) -> usize {
        self.light.len()
    }

    /// Start the sensors and find the ones measuring illumination.
    pub fn setup_sensors(&mut self) {
        if let Err(err) = self.sensors.request() {
            warn!("{}", err);
        }
        self.session
            .set_conversion_time(self.sensors.conversion_time());
        self.light.clear();
        for (index, reading) in self.sensors.readings().iter().enumerate() {
            if reading.unit == LUX && self.light.push(index).is_err() {
                break;
            }
        }
    }

    /// Poll every `interval` and switch the LEDs off below `light_threshold` lux.
    /// Takes two readings right away so the first CSV row holds valid data.
    pub fn start_sensors(&mut self, interval: Duration, light_threshold: f32) {
        self.light_threshold = light_threshold;
        self.session.set_interval(interval);
        self.sensors.report();
        for _ in 0..2 {
            let primed = self.sensors.request().and_then(|()| self.sensors.read());
            if let Err(err) = primed {
                warn!("{}", err);
            }
        }
        self.session.read(self.logger.clock().now());
    }

    pub fn start(&mut self, file_time: Duration) {
        self.logger.start(file_time);
        self.open_csv();
    }

    pub fn start_with_metadata(&mut self, file_time: Duration, mut settings: LoggerSettings) {
        settings.enable_sensors();
        self.logger.start_with_metadata(file_time, settings);
        self.open_csv();
    }

    pub fn close(&mut self) {
        self.logger.close();
        self.close_csv();
    }

    /// Service the logger and the sensors. Returns true if the sensors were
    /// read during this call.
    pub fn update(&mut self) -> bool {
        if self.logger.update().primary_opened {
            self.open_csv();
        }
        if !self.logger.saving() {
            return false;
        }
        self.store_sensors()
    }

    fn store_sensors(&mut self) -> bool {
        let now = self.logger.clock().now();
        match self.session.step(now, self.logger.leds_on()) {
            SensorStep::Wait => false,
            SensorStep::Request => {
                if let Err(err) = self.sensors.request() {
                    warn!("{}", err);
                }
                self.session.requested(now);
                false
            }
            SensorStep::Read => {
                self.session.read(now);
                if let Err(err) = self.sensors.read() {
                    warn!("{}", err);
                    return false;
                }
                self.write_row();
                self.gate_leds();
                true
            }
        }
    }

    fn close_csv(&mut self) {
        if let Some(file) = self.csv.take()
            && let Err(err) = file.close()
        {
            warn!("closing sensor file: {}", err);
        }
    }

    fn open_csv(&mut self) {
        self.close_csv();
        if !self.logger.saving() {
            return;
        }
        let name = naming::sidecar_name(self.logger.base_name(), "-sensors.csv");
        self.row.clear();
        self.row.push_str("time");
        for reading in self.sensors.readings() {
            let _ = write!(self.row, ",{}/{}", reading.name, reading.unit);
        }
        self.row.push('\n');
        let Some(volume) = self.logger.primary_volume_mut() else {
            return;
        };
        let opened = volume.open_write(&name).and_then(|mut file| {
            storage::write_all(&mut file, self.row.as_bytes())?;
            Ok(file)
        });
        match opened {
            Ok(file) => {
                info!("Store sensor readings in {}", name);
                self.csv = Some(file);
            }
            Err(err) => warn!("failed to open {}: {}", name, err),
        }
    }

    fn write_row(&mut self) {
        self.row.clear();
        self.row.push_str(&self.logger.clock().date_time().iso());
        for reading in self.sensors.readings() {
            let _ = write!(self.row, ",{:.2}", reading.value);
        }
        self.row.push('\n');
        let Some(file) = self.csv.as_mut() else {
            return;
        };
        let written = storage::write_all(file, self.row.as_bytes());
        if let Err(err) = written.and_then(|()| file.flush()) {
            warn!("failed to write sensor readings: {}", err);
        }
    }

    fn gate_leds(&mut self) {
        if self.light.is_empty() {
            return;
        }
        let readings = self.sensors.readings();
        let illumination = self
            .light
            .iter()
            .filter_map(|&index| readings.get(index))
            .fold(0.0f32, |max, reading| max.max(reading.value));
        if illumination < self.light_threshold {
            self.logger.status_led_mut().disable_pins();
            self.logger.sync_led_mut().disable_pins();
        } else {
            self.logger.status_led_mut().enable_pins();
            self.logger.sync_led_mut().enable_pins();
        }
    }
}
