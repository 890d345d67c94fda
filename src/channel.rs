//! One storage destination: a volume plus the WAV file currently written to it

use alloc::string::String;
use alloc::vec::Vec;

use embassy_time::{Duration, Instant};
use log::{debug, info, warn};

use crate::error::{StorageError, WriteError};
use crate::input::AcquisitionStream;
use crate::naming;
use crate::storage::{self, FileHandle, StorageVolume};
use crate::wave::WaveHeader;

/// Frames converted and written per storage call.
const WRITE_CHUNK_FRAMES: usize = 256;

/// Which of the two channels of a [`Logger`](crate::Logger).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Backup,
}

impl Role {
    pub const fn is_backup(self) -> bool {
        matches!(self, Self::Backup)
    }

    pub const fn other(self) -> Self {
        match self {
            Self::Primary => Self::Backup,
            Self::Backup => Self::Primary,
        }
    }
}

/// Drains the acquisition ring buffer into rotating WAV files on one volume.
///
/// A channel without a volume is permanently inactive and every operation
/// on it is a no-op. The write cursor is an absolute frame index into the
/// acquisition stream.
pub struct FileChannel<V: StorageVolume> {
    role: Role,
    volume: Option<V>,
    file: Option<V::File>,
    header: WaveHeader,
    name: String,
    write_interval: Duration,
    max_file_time: Duration,
    max_frames: u64,
    cursor: u64,
    frames_written: u64,
    in_rotation: bool,
    last_write: Option<Instant>,
    start_write_time: Instant,
    overruns: u32,
    samples: Vec<i16>,
    bytes: Vec<u8>,
}

impl<V: StorageVolume> FileChannel<V> {
    pub fn new(role: Role, volume: Option<V>) -> Self {
        Self {
            role,
            volume,
            file: None,
            header: WaveHeader::default(),
            name: String::new(),
            write_interval: Duration::from_millis(0),
            max_file_time: Duration::from_secs(10),
            max_frames: 0,
            cursor: 0,
            frames_written: 0,
            in_rotation: false,
            last_write: None,
            start_write_time: Instant::from_millis(0),
            overruns: 0,
            samples: Vec::new(),
            bytes: Vec::new(),
        }
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    /// True if a volume is bound, even if it is no longer available.
    pub const fn bound(&self) -> bool {
        self.volume.is_some()
    }

    /// True if a volume is bound and still usable.
    pub fn active(&self) -> bool {
        self.volume.as_ref().is_some_and(|v| v.available())
    }

    pub fn volume(&self) -> Option<&V> {
        self.volume.as_ref()
    }

    pub fn volume_mut(&mut self) -> Option<&mut V> {
        self.volume.as_mut()
    }

    pub fn volume_name(&self) -> &str {
        self.volume.as_ref().map_or("", |v| v.name())
    }

    pub fn header(&self) -> &WaveHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut WaveHeader {
        &mut self.header
    }

    /// Name of the current (or last) rotation's file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File name of the current rotation without extension.
    pub fn base_name(&self) -> &str {
        naming::base_name(&self.name)
    }

    pub const fn cursor(&self) -> u64 {
        self.cursor
    }

    pub const fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub const fn start_write_time(&self) -> Instant {
        self.start_write_time
    }

    pub const fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub const fn overruns(&self) -> u32 {
        self.overruns
    }

    /// Set the minimum time between writes and the duration of a rotation.
    pub fn configure(&mut self, write_interval: Duration, max_file_time: Duration) {
        self.write_interval = write_interval;
        self.max_file_time = max_file_time;
    }

    /// Start writing at the current head of the acquisition stream.
    pub fn start<A: AcquisitionStream>(&mut self, input: &A) {
        self.cursor = input.head();
    }

    /// Start writing at the same frame as `other`.
    pub fn start_from(&mut self, other: &Self) {
        self.cursor = other.cursor;
    }

    /// Move the cursor to `behind` frames before the head.
    pub fn skip_to<A: AcquisitionStream>(&mut self, input: &A, behind: u64) {
        self.cursor = input.head().saturating_sub(behind);
    }

    /// Create `name` and write the header with zero sizes. A file still open
    /// from the previous rotation is closed first.
    pub fn open<A: AcquisitionStream>(
        &mut self,
        name: &str,
        input: &A,
        now: Instant,
    ) -> Result<(), StorageError> {
        if self.is_open() {
            warn!("{} still open on {} volume", self.name, self.volume_name());
            if let Err(err) = self.close() {
                warn!("closing {}: {}", self.name, err);
            }
        }
        let volume = self
            .volume
            .as_mut()
            .filter(|v| v.available())
            .ok_or(StorageError::Unavailable)?;
        let mut file = volume.open_write(name)?;
        storage::write_all(&mut file, &self.header.to_bytes(0))?;
        self.file = Some(file);
        self.name = String::from(name);
        let rate = u64::from(input.metadata().rate.max(1));
        self.max_frames = self.max_file_time.as_millis() * rate / 1000;
        self.frames_written = 0;
        self.in_rotation = true;
        self.last_write = None;
        self.start_write_time = now;
        debug!("opened {} on {} volume", name, self.volume_name());
        Ok(())
    }

    /// True if the rotation is open, not yet complete and the write
    /// interval has passed since the last write.
    pub fn pending(&self, now: Instant) -> bool {
        self.in_rotation
            && self.frames_written < self.max_frames
            && self.active()
            && self
                .last_write
                .is_none_or(|last| now.saturating_duration_since(last) >= self.write_interval)
    }

    /// True once the rotation holds its configured duration of frames.
    pub fn end_of_rotation(&self) -> bool {
        self.in_rotation && self.frames_written >= self.max_frames
    }

    /// Write all frames between the cursor and the head of `input`.
    ///
    /// `Ok(0)` means there was nothing to write while the acquisition is
    /// running.
    pub fn write<A: AcquisitionStream>(
        &mut self,
        input: &A,
        now: Instant,
    ) -> Result<usize, WriteError> {
        let Some(file) = self.file.as_mut() else {
            return Err(WriteError::NotOpen);
        };
        if self.frames_written >= self.max_frames {
            return Err(WriteError::FileFull);
        }
        let head = input.head();
        let available = head.saturating_sub(self.cursor);
        if available > input.buffer_frames() as u64 {
            return Err(WriteError::Overrun);
        }
        self.last_write = Some(now);
        if available == 0 {
            return if input.running() {
                Ok(0)
            } else {
                Err(WriteError::NoData)
            };
        }

        let channels = usize::from(self.header.channels.max(1));
        let frame_bytes = channels * 2;
        let mut remaining = available.min(self.max_frames - self.frames_written);
        let mut written: u64 = 0;
        'chunks: while remaining > 0 {
            let frames = remaining.min(WRITE_CHUNK_FRAMES as u64) as usize;
            self.samples.resize(frames * channels, 0);
            let copied = input.copy_frames(self.cursor, &mut self.samples);
            if copied == 0 {
                break;
            }
            self.bytes.clear();
            for sample in &self.samples[..copied * channels] {
                self.bytes.extend_from_slice(&sample.to_le_bytes());
            }
            let mut offset = 0;
            while offset < self.bytes.len() {
                match file.write(&self.bytes[offset..]) {
                    Ok(0) => break,
                    Ok(n) => offset += n,
                    Err(err) if written == 0 && offset == 0 => {
                        if err == StorageError::Closed {
                            self.file = None;
                        }
                        return Err(err.into());
                    }
                    Err(_) => break,
                }
            }
            let frames_done = (offset / frame_bytes) as u64;
            self.cursor += frames_done;
            self.frames_written += frames_done;
            written += frames_done;
            remaining -= frames_done.min(remaining);
            if offset < self.bytes.len() || copied < frames {
                break 'chunks;
            }
        }
        if written == 0 {
            return Err(WriteError::WroteNothing);
        }
        Ok(written as usize)
    }

    /// Recover from a ring buffer overrun: skip to half a ring buffer behind
    /// the head, write what is left and leave a marker file.
    pub fn recover_overrun<A: AcquisitionStream>(&mut self, input: &A, now: Instant) {
        self.skip_to(input, (input.buffer_frames() / 2) as u64);
        if let Err(err) = self.write(input, now) {
            warn!("writing after overrun on {} volume: {}", self.volume_name(), err);
        }
        self.overruns += 1;
        let marker = naming::overrun_marker(self.base_name(), self.role.is_backup(), self.overruns);
        warn!("{}", marker);
        if let Some(volume) = self.volume.as_mut()
            && let Err(err) = storage::touch(volume, &marker)
        {
            warn!("failed to write {}: {}", marker, err);
        }
    }

    /// Write once if [`pending`](Self::pending). Overruns are recovered here,
    /// every other failure is returned.
    pub fn store<A: AcquisitionStream>(
        &mut self,
        input: &A,
        now: Instant,
    ) -> Option<Result<usize, WriteError>> {
        if !self.pending(now) {
            return None;
        }
        match self.write(input, now) {
            Err(WriteError::Overrun) => {
                warn!("buffer overrun on {} volume", self.volume_name());
                self.recover_overrun(input, now);
                Some(Ok(0))
            }
            result => Some(result),
        }
    }

    /// Finish the rotation: rewrite the header with the final sizes and
    /// close the file. Does nothing if no file is open.
    pub fn close(&mut self) -> Result<(), StorageError> {
        self.in_rotation = false;
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        let data_bytes = self.frames_written * self.header.frame_bytes() as u64;
        let header = self.header.to_bytes(u32::try_from(data_bytes).unwrap_or(u32::MAX));
        let rewrite = file
            .seek(0)
            .and_then(|()| storage::write_all(&mut file, &header))
            .and_then(|()| file.flush());
        let closed = file.close();
        info!(
            "closed {} on {} volume ({} frames)",
            self.name,
            self.volume_name(),
            self.frames_written
        );
        rewrite.and(closed)
    }

    /// Stop using the volume for the rest of the session.
    pub fn end(&mut self) {
        if let Err(err) = self.close() {
            debug!("closing {} while ending volume: {}", self.name, err);
        }
        if let Some(volume) = self.volume.as_mut() {
            volume.end();
        }
    }
}
