//! Common configurable settings of a logger
//!
//! Settings are kept in fixed capacity strings so they can be persisted
//! to flash with `postcard` and restored without a heap allocation per
//! field. [`LoggerSettings::write_yaml`] renders them for the metadata file
//! written next to each recording.

use alloc::vec::Vec;
use core::fmt::{self, Write};

use embassy_time::Duration;
use heapless::String;
use log::info;
use serde::{Deserialize, Serialize};

use crate::device_id::DeviceId;
use crate::error::SettingsError;

/// Capacity of the string settings.
pub const MAX_STR: usize = 64;

/// Label, names and timing of a recording session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerSettings {
    label: String<MAX_STR>,
    device_id: i16,
    path: String<MAX_STR>,
    file_name: String<MAX_STR>,
    /// Seconds per file
    file_time: f32,
    /// Seconds to wait before recording starts
    initial_delay: f32,
    random_blinks: bool,
    /// Seconds after which the indicator pins are switched off, 0 for never
    blink_timeout: f32,
    sensors_interval: f32,
    /// Lux
    light_threshold: f32,
    sensors_enabled: bool,
}

fn bounded(field: &'static str, value: &str) -> Result<String<MAX_STR>, SettingsError> {
    let mut s = String::new();
    s.push_str(value)
        .map_err(|_| SettingsError::TooLong { field })?;
    Ok(s)
}

fn in_range(field: &'static str, value: f32, min: f32, max: f32) -> Result<f32, SettingsError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(SettingsError::OutOfRange { field })
    }
}

fn seconds(value: f32) -> Duration {
    Duration::from_millis((value.max(0.0) * 1000.0) as u64)
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            label: bounded("Label", "logger").unwrap_or_default(),
            device_id: -1,
            path: bounded("Path", "LABELID2-SDATETIMEM").unwrap_or_default(),
            file_name: bounded("FileName", "LABELID2-SDATETIME").unwrap_or_default(),
            file_time: 10.0,
            initial_delay: 0.0,
            random_blinks: false,
            blink_timeout: 0.0,
            sensors_interval: 30.0,
            light_threshold: 0.0,
            sensors_enabled: false,
        }
    }
}

impl LoggerSettings {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: &str) -> Result<(), SettingsError> {
        self.label = bounded("Label", label)?;
        Ok(())
    }

    /// Configured device identifier, -1 to take it from the device.
    pub const fn device_id(&self) -> i16 {
        self.device_id
    }

    pub fn set_device_id(&mut self, id: i16) -> Result<(), SettingsError> {
        if !(-1..=127).contains(&id) {
            return Err(SettingsError::OutOfRange { field: "DeviceID" });
        }
        self.device_id = id;
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: &str) -> Result<(), SettingsError> {
        self.path = bounded("Path", path)?;
        Ok(())
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn set_file_name(&mut self, name: &str) -> Result<(), SettingsError> {
        self.file_name = bounded("FileName", name)?;
        Ok(())
    }

    pub fn file_time(&self) -> Duration {
        seconds(self.file_time)
    }

    pub fn set_file_time(&mut self, secs: f32) -> Result<(), SettingsError> {
        self.file_time = in_range("FileTime", secs, 1.0, 8640.0)?;
        Ok(())
    }

    pub fn initial_delay(&self) -> Duration {
        seconds(self.initial_delay)
    }

    pub fn set_initial_delay(&mut self, secs: f32) -> Result<(), SettingsError> {
        self.initial_delay = in_range("InitialDelay", secs, 0.0, 1e8)?;
        Ok(())
    }

    pub const fn random_blinks(&self) -> bool {
        self.random_blinks
    }

    pub fn set_random_blinks(&mut self, random: bool) {
        self.random_blinks = random;
    }

    pub fn blink_timeout(&self) -> Duration {
        seconds(self.blink_timeout)
    }

    pub fn set_blink_timeout(&mut self, secs: f32) -> Result<(), SettingsError> {
        self.blink_timeout = in_range("BlinkTimeout", secs, 0.0, 1e8)?;
        Ok(())
    }

    pub fn sensors_interval(&self) -> Duration {
        seconds(self.sensors_interval)
    }

    pub fn set_sensors_interval(&mut self, secs: f32) -> Result<(), SettingsError> {
        self.sensors_interval = in_range("SensorsInterval", secs, 1.0, 1e8)?;
        Ok(())
    }

    pub const fn light_threshold(&self) -> f32 {
        self.light_threshold
    }

    pub fn set_light_threshold(&mut self, lux: f32) -> Result<(), SettingsError> {
        self.light_threshold = in_range("LightThreshold", lux, 0.0, 1e8)?;
        Ok(())
    }

    /// Sensor settings are only reported by loggers with a sensor bank.
    pub fn enable_sensors(&mut self) {
        self.sensors_enabled = true;
    }

    /// Replace `LABEL` and the device identifier tokens in path and file name.
    pub fn prepare_paths(&mut self, device: &DeviceId) -> Result<(), SettingsError> {
        let path = device.make_str(&self.path.replace("LABEL", &self.label));
        let file_name = device.make_str(&self.file_name.replace("LABEL", &self.label));
        self.path = bounded("Path", &path)?;
        self.file_name = bounded("FileName", &file_name)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SettingsError> {
        postcard::to_allocvec(self).map_err(|_| SettingsError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SettingsError> {
        postcard::from_bytes(bytes).map_err(|_| SettingsError::Decode)
    }

    /// Render the settings as the `Settings:` section of a YAML document.
    pub fn write_yaml<W: Write>(&self, out: &mut W) -> fmt::Result {
        writeln!(out, "Settings:")?;
        writeln!(out, "  Label: {}", self.label)?;
        if self.device_id < 0 {
            writeln!(out, "  DeviceID: device")?;
        } else {
            writeln!(out, "  DeviceID: {}", self.device_id)?;
        }
        writeln!(out, "  Path: {}", self.path)?;
        writeln!(out, "  FileName: {}", self.file_name)?;
        writeln!(out, "  FileTime: {:.0}s", self.file_time)?;
        writeln!(out, "  InitialDelay: {:.0}s", self.initial_delay)?;
        writeln!(out, "  RandomBlinks: {}", self.random_blinks)?;
        writeln!(out, "  BlinkTimeout: {:.0}s", self.blink_timeout)?;
        if self.sensors_enabled {
            writeln!(out, "  SensorsInterval: {:.0}s", self.sensors_interval)?;
            writeln!(out, "  LightThreshold: {:.0}lx", self.light_threshold)?;
        }
        Ok(())
    }

    pub fn report(&self) {
        info!(
            "Settings: label {}, path {}, file name {}, file time {:.0}s",
            self.label, self.path, self.file_name, self.file_time
        );
    }
}
