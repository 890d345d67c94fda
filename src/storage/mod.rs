//! Storage volumes (SD cards) and their files

use alloc::string::String;

use crate::error::StorageError;

pub mod sd_card;

pub use sd_card::{SdFile, SdVolume};

/// Minimum free space the primary volume needs before a session starts.
pub const MIN_FREE_BYTES: u64 = 1_000_000_000;

/// An open file on a [`StorageVolume`].
///
/// SD card writes are blocking; each call may take several milliseconds.
pub trait FileHandle {
    /// Write `data` at the current position and return the number of
    /// bytes accepted. `Ok(0)` means the volume took nothing.
    fn write(&mut self, data: &[u8]) -> Result<usize, StorageError>;

    /// Move the write position to `pos` bytes from the start.
    fn seek(&mut self, pos: u64) -> Result<(), StorageError>;

    fn flush(&mut self) -> Result<(), StorageError>;

    fn close(self) -> Result<(), StorageError>;
}

/// One physical storage device, e.g. an SD card on its own SPI or SDIO bus.
pub trait StorageVolume {
    type File: FileHandle;

    /// Human readable name used in diagnostics, e.g. `"primary"`.
    fn name(&self) -> &str;

    /// True while the card is usable. Once [`end`](Self::end) was called
    /// this stays false.
    fn available(&self) -> bool;

    fn free_bytes(&self) -> u64;

    /// Stop using the volume for the rest of the session.
    fn end(&mut self);

    /// True if the volume is available and has at least `min_free` bytes left.
    fn check(&mut self, min_free: u64) -> bool {
        self.available() && self.free_bytes() >= min_free
    }

    /// Create the directory `path` if needed and make it the working directory.
    fn prepare_dir(&mut self, path: &str) -> Result<(), StorageError>;

    fn working_dir(&self) -> &str;

    /// True if a file `name` exists in the working directory.
    fn exists(&self, name: &str) -> bool;

    /// Create or truncate `name` in the working directory.
    fn open_write(&mut self, name: &str) -> Result<Self::File, StorageError>;

    /// Restart the counter behind the `NUM` file name token.
    fn reset_file_counter(&mut self);

    /// Substitute `NUM` in `name` by the next number not yet taken in the
    /// working directory. `None` if no valid name can be produced.
    fn increment_file_name(&mut self, name: &str) -> Option<String>;
}

/// Create an empty file, used for marker files whose existence is the signal.
pub fn touch<V: StorageVolume>(volume: &mut V, name: &str) -> Result<(), StorageError> {
    volume.open_write(name)?.close()
}

/// Write all of `data`. A write that accepts nothing is reported as
/// [`StorageError::Full`].
pub fn write_all<F: FileHandle>(file: &mut F, data: &[u8]) -> Result<(), StorageError> {
    let mut offset = 0;
    while offset < data.len() {
        match file.write(&data[offset..])? {
            0 => return Err(StorageError::Full),
            n => offset += n,
        }
    }
    Ok(())
}

/// Create `name` and write `contents` into it.
pub fn write_file<V: StorageVolume>(
    volume: &mut V,
    name: &str,
    contents: &[u8],
) -> Result<(), StorageError> {
    let mut file = volume.open_write(name)?;
    write_all(&mut file, contents)?;
    file.close()
}
