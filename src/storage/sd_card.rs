//! FAT formatted SD cards through `embedded-sdmmc`

use alloc::rc::Rc;
use alloc::string::String;
use core::cell::Cell;

use embedded_sdmmc::{
    BlockDevice, Error, Mode, RawDirectory, RawFile, RawVolume, TimeSource, VolumeIdx,
    VolumeManager,
};
use log::{info, warn};

use super::{FileHandle, StorageVolume};
use crate::clock::{Clock, ClockTimeSource};
use crate::error::StorageError;
use crate::naming::FileNameCounter;

const BLOCK_SIZE: u64 = 512;

/// A [`StorageVolume`] on the first FAT partition of a block device.
///
/// These SD card operations are blocking, like every other transfer on the
/// card's SPI bus. `embedded-sdmmc` only handles 8.3 short names, so
/// templates and directories have to fit into 8 characters plus extension.
///
/// The FAT is not scanned for free clusters. [`free_bytes`](Self::free_bytes)
/// reports the card capacity minus what was written through this volume.
pub struct SdVolume<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    name: &'static str,
    manager: Rc<VolumeManager<D, T>>,
    volume: Option<RawVolume>,
    root: Option<RawDirectory>,
    dir: Option<RawDirectory>,
    dir_name: String,
    capacity: u64,
    written: Rc<Cell<u64>>,
    counter: FileNameCounter,
}

impl<D, T> SdVolume<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    /// Mount the first partition of `device`. A card that cannot be
    /// mounted stays unavailable.
    pub fn new(name: &'static str, device: D, time_source: T) -> Self {
        let capacity = match device.num_blocks() {
            Ok(blocks) => u64::from(blocks.0) * BLOCK_SIZE,
            Err(err) => {
                warn!("{} SD card: unknown size: {:?}", name, err);
                0
            }
        };
        let mut volume = Self {
            name,
            manager: Rc::new(VolumeManager::new(device, time_source)),
            volume: None,
            root: None,
            dir: None,
            dir_name: String::new(),
            capacity,
            written: Rc::new(Cell::new(0)),
            counter: FileNameCounter::new(),
        };
        volume.mount();
        volume
    }

    fn mount(&mut self) {
        let manager = &self.manager;
        let opened = manager.open_raw_volume(VolumeIdx(0)).and_then(|volume| {
            match manager.open_root_dir(volume) {
                Ok(root) => Ok((volume, root)),
                Err(err) => {
                    let _ = manager.close_volume(volume);
                    Err(err)
                }
            }
        });
        match opened {
            Ok((volume, root)) => {
                self.volume = Some(volume);
                self.root = Some(root);
                info!("{} SD card: {}MB", self.name, self.capacity / 1_000_000);
            }
            Err(err) => warn!("{} SD card not available: {:?}", self.name, err),
        }
    }

    fn cwd(&self) -> Option<RawDirectory> {
        self.dir.or(self.root)
    }

    fn close_working_dir(&mut self) {
        if let Some(dir) = self.dir.take()
            && let Err(err) = self.manager.close_dir(dir)
        {
            warn!("{} SD card: closing {}: {:?}", self.name, self.dir_name, err);
        }
    }
}

impl<D, C> SdVolume<D, ClockTimeSource<C>>
where
    D: BlockDevice,
    C: Clock,
{
    /// Stamp directory entries with the time of `clock`.
    pub fn with_clock(name: &'static str, device: D, clock: C) -> Self {
        Self::new(name, device, ClockTimeSource::new(clock))
    }
}

impl<D, T> StorageVolume for SdVolume<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    type File = SdFile<D, T>;

    fn name(&self) -> &str {
        self.name
    }

    fn available(&self) -> bool {
        self.root.is_some()
    }

    fn free_bytes(&self) -> u64 {
        self.capacity.saturating_sub(self.written.get())
    }

    fn end(&mut self) {
        self.close_working_dir();
        if let Some(root) = self.root.take()
            && let Err(err) = self.manager.close_dir(root)
        {
            warn!("{} SD card: closing root: {:?}", self.name, err);
        }
        if let Some(volume) = self.volume.take()
            && let Err(err) = self.manager.close_volume(volume)
        {
            warn!("{} SD card: {:?}", self.name, err);
        }
    }

    fn prepare_dir(&mut self, path: &str) -> Result<(), StorageError> {
        let root = self.root.ok_or(StorageError::Unavailable)?;
        self.close_working_dir();
        let mut dir = root;
        for part in path.split('/').filter(|part| !part.is_empty()) {
            let made = match self.manager.make_dir_in_dir(dir, part) {
                Ok(()) | Err(Error::DirAlreadyExists) => Ok(()),
                Err(err) => Err(err),
            };
            let opened = made.and_then(|()| self.manager.open_dir(dir, part));
            if dir != root {
                let _ = self.manager.close_dir(dir);
            }
            dir = opened.map_err(storage_error)?;
        }
        if dir != root {
            self.dir = Some(dir);
        }
        self.dir_name = String::from(path);
        self.counter.reset();
        Ok(())
    }

    fn working_dir(&self) -> &str {
        &self.dir_name
    }

    fn exists(&self, name: &str) -> bool {
        self.cwd()
            .is_some_and(|dir| self.manager.find_directory_entry(dir, name).is_ok())
    }

    fn open_write(&mut self, name: &str) -> Result<SdFile<D, T>, StorageError> {
        let dir = self.cwd().ok_or(StorageError::Unavailable)?;
        let file = self
            .manager
            .open_file_in_dir(dir, name, Mode::ReadWriteCreateOrTruncate)
            .map_err(storage_error)?;
        Ok(SdFile {
            manager: self.manager.clone(),
            file,
            open: true,
            written: self.written.clone(),
        })
    }

    fn reset_file_counter(&mut self) {
        self.counter.reset();
    }

    fn increment_file_name(&mut self, name: &str) -> Option<String> {
        let dir = self.cwd()?;
        let manager = &self.manager;
        self.counter
            .next(name, |candidate| manager.find_directory_entry(dir, candidate).is_ok())
    }
}

/// A file opened by [`SdVolume::open_write`]. Dropping it closes the file.
pub struct SdFile<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    manager: Rc<VolumeManager<D, T>>,
    file: RawFile,
    open: bool,
    written: Rc<Cell<u64>>,
}

impl<D, T> FileHandle for SdFile<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    fn write(&mut self, data: &[u8]) -> Result<usize, StorageError> {
        if !self.open {
            return Err(StorageError::Closed);
        }
        self.manager.write(self.file, data).map_err(storage_error)?;
        self.written.set(self.written.get() + data.len() as u64);
        Ok(data.len())
    }

    fn seek(&mut self, pos: u64) -> Result<(), StorageError> {
        let pos = u32::try_from(pos).map_err(|_| StorageError::Io)?;
        self.manager
            .file_seek_from_start(self.file, pos)
            .map_err(storage_error)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.manager.flush_file(self.file).map_err(storage_error)
    }

    fn close(mut self) -> Result<(), StorageError> {
        self.open = false;
        self.manager.close_file(self.file).map_err(storage_error)
    }
}

impl<D, T> Drop for SdFile<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    fn drop(&mut self) {
        if self.open {
            let _ = self.manager.close_file(self.file);
        }
    }
}

fn storage_error<E: core::fmt::Debug>(err: Error<E>) -> StorageError {
    match err {
        Error::DiskFull | Error::NotEnoughSpace => StorageError::Full,
        Error::BadHandle => StorageError::Closed,
        Error::NotFound => StorageError::NotFound,
        Error::FilenameError(_) => StorageError::NameTooLong,
        _ => StorageError::Io,
    }
}
