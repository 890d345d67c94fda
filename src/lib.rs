//! Hardware-independent core of the TeeGrid field recorders
//!
//! This crate contains the dual-SD streaming file logger: it drains the
//! acquisition ring buffer into rotating WAV files on a primary and an
//! optional backup volume, recovers from write failures, paces rotation
//! against real time and drives the indicator LEDs.
//!
//! Hardware enters through the collaborator traits ([`AcquisitionStream`],
//! [`StorageVolume`], [`Indicator`], [`Clock`], [`SensorBank`]). The crate is
//! `#![no_std]` with `extern crate alloc` so it builds for the Teensy and for
//! desktop hosts (the simulator and the tests).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod channel;
pub mod clock;
pub mod device_id;
pub mod error;
pub mod indicator;
pub mod input;
pub mod logger;
pub mod naming;
pub mod sensors;
pub mod settings;
pub mod storage;
pub mod sync;
pub mod wave;

#[cfg(test)]
mod testing;

pub use channel::{FileChannel, Role};
pub use clock::{Clock, ClockTimeSource, DateTime};
pub use device_id::{DeviceId, IdSource};
pub use error::{HaltReason, SensorError, SettingsError, StorageError, WriteError};
pub use indicator::{Blink, BlinkTiming, Indicator, NoIndicator, SwitchTime};
pub use input::{AcquisitionStream, InputMetadata};
pub use logger::{Logger, LoggerState, UpdateOutcome};
pub use sensors::{SensorBank, SensorLogger, SensorReading, SensorSession};
pub use settings::LoggerSettings;
pub use storage::{FileHandle, SdVolume, StorageVolume};
pub use sync::{CanBus, CanSync, NoSync, RotationSync};
