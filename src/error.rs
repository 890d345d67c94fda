//! Error types shared by the logger core

use thiserror_no_std::Error;

/// Outcome of a failed write of acquired frames into a WAV file.
///
/// Every variant maps onto one row of the recovery policy in
/// [`Logger`](crate::Logger): all of them except [`WriteError::Overrun`]
/// close the rotation, leave a marker file and count a restart.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The file handle is not (or no longer) valid
    #[error("file not open")]
    NotOpen,
    /// The rotation already holds its maximum number of frames
    #[error("file already full")]
    FileFull,
    /// Nothing to write and the acquisition is not running
    #[error("no data available, data acquisition probably not running")]
    NoData,
    /// The acquisition ring buffer lapped the writer
    #[error("buffer overrun")]
    Overrun,
    /// The volume accepted no bytes, it is most likely full
    #[error("failed to write anything")]
    WroteNothing,
}

impl WriteError {
    /// Short tag used in marker file names.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::NotOpen => "notopen",
            Self::FileFull => "full",
            Self::NoData => "nodata",
            Self::Overrun => "overrun",
            Self::WroteNothing => "nowrite",
        }
    }
}

/// Errors reported by a [`StorageVolume`](crate::StorageVolume) or its files.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// The card is not inserted or was ended
    #[error("storage volume not available")]
    Unavailable,
    /// No such file or directory
    #[error("file or directory not found")]
    NotFound,
    /// No space left on the volume
    #[error("storage volume full")]
    Full,
    /// Operation on a file that was already closed
    #[error("file closed")]
    Closed,
    /// The name does not fit the file system limits
    #[error("file name too long")]
    NameTooLong,
    /// Any other low level failure
    #[error("I/O error")]
    Io,
}

impl From<StorageError> for WriteError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Closed | StorageError::NotFound => Self::NotOpen,
            _ => Self::WroteNothing,
        }
    }
}

/// Errors reported by environmental sensors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("Sensor {sensor} failed during {operation}")]
    ReadFailed {
        sensor: &'static str,
        operation: &'static str,
    },
    #[error("Sensor {sensor} not available")]
    NotAvailable { sensor: &'static str },
}

/// Errors validating, encoding or decoding [`LoggerSettings`](crate::LoggerSettings).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{field} out of range")]
    OutOfRange { field: &'static str },
    #[error("{field} too long")]
    TooLong { field: &'static str },
    #[error("failed to encode settings")]
    Encode,
    #[error("failed to decode settings")]
    Decode,
}

/// Unrecoverable conditions that put the logger into its halted state.
///
/// The numeric code is what the error LED blinks while halted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    #[error("primary SD card missing or without enough free space")]
    CardCheck,
    #[error("failed to increment file name, SD card probably not inserted")]
    FileName,
    #[error("failed to open file, SD card probably not inserted or full")]
    OpenFailed,
    #[error("primary SD card full")]
    VolumeFull,
    #[error("too many file errors")]
    TooManyRestarts,
}

impl HaltReason {
    /// Number of error LED blinks.
    pub const fn code(self) -> u8 {
        match self {
            Self::CardCheck => 1,
            Self::FileName => 3,
            Self::OpenFailed => 4,
            Self::VolumeFull => 5,
            Self::TooManyRestarts => 6,
        }
    }
}
