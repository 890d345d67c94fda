//! File name helpers: sidecar names and incrementing file names

use alloc::format;
use alloc::string::String;

/// Largest value the `NUM` token can take.
pub const MAX_FILE_NUMBER: u16 = 99;

/// Strip the extension from a file name, if it has one.
pub fn base_name(name: &str) -> &str {
    match name.rfind('.') {
        Some(dot) if !name[dot..].contains('/') => &name[..dot],
        _ => name,
    }
}

/// Name of a file that belongs to the recording `base`, e.g.
/// `sidecar_name("rec-0001", "-blinks.csv") == "rec-0001-blinks.csv"`.
pub fn sidecar_name(base: &str, suffix: &str) -> String {
    let mut name = String::with_capacity(base.len() + suffix.len());
    name.push_str(base);
    name.push_str(suffix);
    name
}

/// Marker left when a write failed and the rotation was restarted.
pub fn error_marker(base: &str, backup: bool, restart: u32, tag: &str) -> String {
    if backup {
        format!("{base}-backup-error{restart}-{tag}.msg")
    } else {
        format!("{base}-error{restart}-{tag}.msg")
    }
}

/// Marker left after recovering from a ring buffer overrun.
pub fn overrun_marker(base: &str, backup: bool, count: u32) -> String {
    if backup {
        format!("{base}-backup-overrun{count}-overrun.msg")
    } else {
        format!("{base}-overrun{count}-overrun.msg")
    }
}

/// Replace the extension of `template` by `.wav`.
pub fn wave_template(template: &str) -> String {
    sidecar_name(base_name(template), ".wav")
}

/// Per-directory counter behind the `NUM` token of file name templates.
///
/// Storage volume implementations embed one of these to provide
/// [`StorageVolume::increment_file_name`](crate::StorageVolume::increment_file_name).
#[derive(Debug, Default, Clone)]
pub struct FileNameCounter {
    counter: u16,
}

impl FileNameCounter {
    pub const fn new() -> Self {
        Self { counter: 0 }
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }

    /// Last number handed out, 0 after a reset.
    pub const fn current(&self) -> u16 {
        self.counter
    }

    /// Substitute `NUM` by the next two-digit number for which `exists`
    /// returns false. Names without `NUM` are returned unchanged.
    /// Returns `None` once the numbers are exhausted.
    pub fn next(&mut self, name: &str, exists: impl Fn(&str) -> bool) -> Option<String> {
        if !name.contains("NUM") {
            return Some(String::from(name));
        }
        while self.counter < MAX_FILE_NUMBER {
            self.counter += 1;
            let candidate = name.replace("NUM", &format!("{:02}", self.counter));
            if !exists(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}
