//! In-memory collaborators shared by the unit tests

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use embassy_time::{Duration, Instant};

use crate::clock::{Clock, DateTime};
use crate::error::StorageError;
use crate::indicator::{BlinkTiming, Indicator, SwitchTime};
use crate::input::{AcquisitionStream, InputMetadata};
use crate::naming::FileNameCounter;
use crate::storage::{FileHandle, StorageVolume};

#[derive(Debug)]
pub struct VolumeState {
    pub available: bool,
    pub free: u64,
    pub files: BTreeMap<String, Vec<u8>>,
    /// Every name passed to `open_write`, in order
    pub opened: Vec<String>,
    pub open_handles: usize,
    pub max_open_handles: usize,
    /// Error returned by every following write
    pub fail_writes: Option<StorageError>,
    /// Error returned by following writes that do not start at the
    /// beginning of a file, i.e. sample data but not WAV headers
    pub fail_appends: Option<StorageError>,
    /// Accept zero bytes on every following write
    pub write_nothing: bool,
    pub counter: FileNameCounter,
    pub counter_resets: usize,
    pub ended: bool,
}

impl Default for VolumeState {
    fn default() -> Self {
        Self {
            available: true,
            free: 32_000_000_000,
            files: BTreeMap::new(),
            opened: Vec::new(),
            open_handles: 0,
            max_open_handles: 0,
            fail_writes: None,
            fail_appends: None,
            write_nothing: false,
            counter: FileNameCounter::new(),
            counter_resets: 0,
            ended: false,
        }
    }
}

impl VolumeState {
    pub fn count_files(&self, suffix: &str) -> usize {
        self.files.keys().filter(|name| name.ends_with(suffix)).count()
    }

    pub fn names_with(&self, pattern: &str) -> Vec<String> {
        self.files
            .keys()
            .filter(|name| name.contains(pattern))
            .cloned()
            .collect()
    }

    pub fn text(&self, name: &str) -> String {
        self.files
            .get(name)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default()
    }
}

pub struct MemoryVolume {
    name: &'static str,
    dir: String,
    pub state: Rc<RefCell<VolumeState>>,
}

impl MemoryVolume {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            dir: String::new(),
            state: Rc::new(RefCell::new(VolumeState::default())),
        }
    }

    pub fn handle(&self) -> Rc<RefCell<VolumeState>> {
        self.state.clone()
    }
}

pub struct MemoryFile {
    name: String,
    pos: usize,
    closed: bool,
    state: Rc<RefCell<VolumeState>>,
}

impl FileHandle for MemoryFile {
    fn write(&mut self, data: &[u8]) -> Result<usize, StorageError> {
        let mut state = self.state.borrow_mut();
        if let Some(err) = state.fail_writes {
            return Err(err);
        }
        if let Some(err) = state.fail_appends.filter(|_| self.pos > 0) {
            return Err(err);
        }
        if state.write_nothing || data.is_empty() {
            return Ok(0);
        }
        let file = state.files.entry(self.name.clone()).or_default();
        let end = self.pos + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[self.pos..end].copy_from_slice(data);
        self.pos = end;
        state.free = state.free.saturating_sub(data.len() as u64);
        Ok(data.len())
    }

    fn seek(&mut self, pos: u64) -> Result<(), StorageError> {
        self.pos = pos as usize;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn close(mut self) -> Result<(), StorageError> {
        self.closed = true;
        self.state.borrow_mut().open_handles -= 1;
        Ok(())
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        if !self.closed {
            self.state.borrow_mut().open_handles -= 1;
        }
    }
}

impl StorageVolume for MemoryVolume {
    type File = MemoryFile;

    fn name(&self) -> &str {
        self.name
    }

    fn available(&self) -> bool {
        self.state.borrow().available
    }

    fn free_bytes(&self) -> u64 {
        self.state.borrow().free
    }

    fn end(&mut self) {
        let mut state = self.state.borrow_mut();
        state.available = false;
        state.ended = true;
    }

    fn prepare_dir(&mut self, path: &str) -> Result<(), StorageError> {
        if !self.available() {
            return Err(StorageError::Unavailable);
        }
        self.dir = String::from(path);
        Ok(())
    }

    fn working_dir(&self) -> &str {
        &self.dir
    }

    fn exists(&self, name: &str) -> bool {
        self.state.borrow().files.contains_key(name)
    }

    fn open_write(&mut self, name: &str) -> Result<MemoryFile, StorageError> {
        let mut state = self.state.borrow_mut();
        if !state.available {
            return Err(StorageError::Unavailable);
        }
        state.files.insert(String::from(name), Vec::new());
        state.opened.push(String::from(name));
        state.open_handles += 1;
        state.max_open_handles = state.max_open_handles.max(state.open_handles);
        Ok(MemoryFile {
            name: String::from(name),
            pos: 0,
            closed: false,
            state: self.state.clone(),
        })
    }

    fn reset_file_counter(&mut self) {
        let mut state = self.state.borrow_mut();
        state.counter.reset();
        state.counter_resets += 1;
    }

    fn increment_file_name(&mut self, name: &str) -> Option<String> {
        let mut state = self.state.borrow_mut();
        if !state.available {
            return None;
        }
        let VolumeState { counter, files, .. } = &mut *state;
        counter.next(name, |candidate| files.contains_key(candidate))
    }
}

#[derive(Debug)]
pub struct InputState {
    pub head: u64,
    pub running: bool,
    pub starts: usize,
    pub stops: usize,
}

pub struct MockInput {
    meta: InputMetadata,
    buffer_frames: usize,
    dma_buffer_time: Duration,
    pub state: Rc<RefCell<InputState>>,
}

impl MockInput {
    /// Two channels at 1 kHz with a 1000 frame ring buffer.
    pub fn new() -> Self {
        Self {
            meta: InputMetadata {
                channels: 2,
                rate: 1000,
                gain: String::from("20dB"),
                ..InputMetadata::default()
            },
            buffer_frames: 1000,
            dma_buffer_time: Duration::from_millis(50),
            state: Rc::new(RefCell::new(InputState {
                head: 0,
                running: true,
                starts: 0,
                stops: 0,
            })),
        }
    }

    pub fn handle(&self) -> Rc<RefCell<InputState>> {
        self.state.clone()
    }
}

impl AcquisitionStream for MockInput {
    fn dma_buffer_time(&self) -> Duration {
        self.dma_buffer_time
    }

    fn buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    fn metadata(&self) -> &InputMetadata {
        &self.meta
    }

    fn running(&self) -> bool {
        self.state.borrow().running
    }

    fn start(&mut self) {
        let mut state = self.state.borrow_mut();
        state.running = true;
        state.starts += 1;
    }

    fn stop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.running = false;
        state.stops += 1;
    }

    fn head(&self) -> u64 {
        self.state.borrow().head
    }

    fn copy_frames(&self, from: u64, out: &mut [i16]) -> usize {
        let channels = self.meta.channels as usize;
        let head = self.head();
        let frames = ((head.saturating_sub(from)) as usize).min(out.len() / channels);
        for (k, frame) in out.chunks_mut(channels).take(frames).enumerate() {
            frame.fill((from + k as u64) as i16);
        }
        frames
    }
}

#[derive(Clone)]
pub struct MockClock {
    pub millis: Rc<Cell<u64>>,
    pub date: Rc<Cell<DateTime>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            millis: Rc::new(Cell::new(0)),
            date: Rc::new(Cell::new(DateTime::new(2025, 1, 4, 12, 0, 0))),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.millis.set(self.millis.get() + ms);
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        Instant::from_millis(self.millis.get())
    }

    fn date_time(&self) -> DateTime {
        self.date.get()
    }
}

#[derive(Debug, Default)]
pub struct IndicatorLog {
    pub timing: Option<BlinkTiming>,
    pub pattern: &'static str,
    pub oneshots: usize,
    pub on: bool,
    pub pins_enabled: bool,
    pub disabled_pins: Vec<usize>,
    pub pins_cleared: bool,
    pub switch_times: Vec<SwitchTime>,
    pub updates: usize,
}

/// Indicator that only records what the logger asked it to do.
pub struct RecordingIndicator {
    pub log: Rc<RefCell<IndicatorLog>>,
}

impl RecordingIndicator {
    pub fn new() -> Self {
        Self {
            log: Rc::new(RefCell::new(IndicatorLog {
                pins_enabled: true,
                ..IndicatorLog::default()
            })),
        }
    }

    pub fn handle(&self) -> Rc<RefCell<IndicatorLog>> {
        self.log.clone()
    }
}

impl Indicator for RecordingIndicator {
    fn set_timing(&mut self, timing: BlinkTiming) {
        self.log.borrow_mut().timing = Some(timing);
    }

    fn timing(&self) -> BlinkTiming {
        self.log.borrow().timing.unwrap_or_default()
    }

    fn set_multiple(&mut self, count: u8) {
        self.log.borrow_mut().pattern = match count {
            1 => "single",
            2 => "double",
            3 => "triple",
            _ => "multiple",
        };
    }

    fn set_random(&mut self) {
        self.log.borrow_mut().pattern = "random";
    }

    fn blink_multiple(&mut self, _count: u8, _delay: Duration, _on: Duration, _off: Duration) {
        self.log.borrow_mut().oneshots += 1;
    }

    fn clear(&mut self) {
        let mut log = self.log.borrow_mut();
        log.pattern = "clear";
        log.on = false;
    }

    fn switch_on(&mut self) {
        self.log.borrow_mut().on = true;
    }

    fn switch_off(&mut self) {
        self.log.borrow_mut().on = false;
    }

    fn is_on(&self) -> bool {
        let log = self.log.borrow();
        log.on && log.pins_enabled
    }

    fn enable_pins(&mut self) {
        self.log.borrow_mut().pins_enabled = true;
    }

    fn disable_pins(&mut self) {
        self.log.borrow_mut().pins_enabled = false;
    }

    fn disable_pin(&mut self, index: usize) {
        self.log.borrow_mut().disabled_pins.push(index);
    }

    fn clear_pins(&mut self) {
        self.log.borrow_mut().pins_cleared = true;
    }

    fn switch_times_len(&self) -> usize {
        self.log.borrow().switch_times.len()
    }

    fn drain_switch_times(&mut self, out: &mut Vec<SwitchTime>) {
        out.append(&mut self.log.borrow_mut().switch_times);
    }

    fn clear_switch_times(&mut self) {
        self.log.borrow_mut().switch_times.clear();
    }

    fn update(&mut self, _now: Instant) {
        self.log.borrow_mut().updates += 1;
    }
}
