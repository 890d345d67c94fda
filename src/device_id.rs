//! Device identifier used to tag recordings of a logger array

use alloc::string::String;
use core::fmt::Write;

use embedded_hal::digital::InputPin;
use log::{info, warn};

/// Where the current identifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    NotSet,
    Default,
    Configured,
    Pins,
}

impl IdSource {
    pub const fn label(self) -> &'static str {
        match self {
            Self::NotSet => "not set",
            Self::Default => "default",
            Self::Configured => "configured",
            Self::Pins => "read from device",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    id: i16,
    source: IdSource,
}

impl DeviceId {
    /// Identifier from firmware defaults. Non-positive values mean "not set".
    pub const fn new(id: i16) -> Self {
        Self {
            id,
            source: if id > 0 {
                IdSource::Default
            } else {
                IdSource::NotSet
            },
        }
    }

    pub const fn id(&self) -> i16 {
        self.id
    }

    pub const fn source(&self) -> IdSource {
        self.source
    }

    pub fn set_id(&mut self, id: i16) {
        self.id = id;
        self.source = IdSource::Configured;
    }

    /// Read the identifier from jumper pins, least significant bit first.
    ///
    /// With `pullup` a pin pulled low (jumper set) counts as one.
    /// Pins that fail to read count as zero.
    pub fn read_pins<P: InputPin>(&mut self, pins: &mut [P], pullup: bool) -> Option<i16> {
        if pins.is_empty() {
            return None;
        }
        let mut id = 0i16;
        for (bit, pin) in pins.iter_mut().enumerate() {
            let set = match pin.is_high() {
                Ok(high) => high != pullup,
                Err(_) => {
                    warn!("Failed to read device identifier pin {}", bit);
                    false
                }
            };
            if set {
                id |= 1 << bit;
            }
        }
        info!("Read DeviceID: #{:02X} = {:02}", id, id);
        self.id = id;
        self.source = IdSource::Pins;
        Some(id)
    }

    /// Replace `ID3`, `ID2` and `ID` in `template` by the zero padded identifier.
    pub fn make_str(&self, template: &str) -> String {
        let id = self.id.max(0);
        let mut buf = String::new();
        let mut out = String::from(template);
        if out.contains("ID3") {
            let _ = write!(buf, "{:03}", id);
            out = out.replace("ID3", &buf);
            buf.clear();
        }
        if out.contains("ID2") {
            let _ = write!(buf, "{:02}", id);
            out = out.replace("ID2", &buf);
            buf.clear();
        }
        if out.contains("ID") {
            let _ = write!(buf, "{}", id);
            out = out.replace("ID", &buf);
        }
        out
    }

    pub fn report(&self) {
        info!("Device identifier: {} ({})", self.id, self.source.label());
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new(0)
    }
}
