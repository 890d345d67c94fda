//! WAV header with the logger's LIST/INFO metadata.
//!
//! The header is written with zero sizes when a rotation opens and is
//! rewritten with the final sizes when it closes.
//!
//! Layout (little-endian):
//! - `RIFF` chunk descriptor: 12 bytes
//! - `fmt ` chunk, 16-bit PCM: 24 bytes
//! - `LIST`/`INFO` chunk with one sub-chunk per non-empty text field
//! - `data` chunk header: 8 bytes, followed by the samples

use alloc::string::String;
use alloc::vec::Vec;

use crate::input::InputMetadata;

const BITS_PER_SAMPLE: u16 = 16;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaveHeader {
    pub channels: u16,
    pub rate: u32,
    pub software: String,
    pub cpu_speed_mhz: u32,
    pub date_time: String,
    pub channel_pins: String,
    pub gain: String,
    pub averaging: String,
    pub conversion_speed: String,
    pub sampling_speed: String,
    pub reference: String,
}

impl WaveHeader {
    pub fn from_metadata(meta: &InputMetadata) -> Self {
        Self {
            channels: meta.channels,
            rate: meta.rate,
            channel_pins: meta.channel_pins.clone(),
            gain: meta.gain.clone(),
            averaging: meta.averaging.clone(),
            conversion_speed: meta.conversion_speed.clone(),
            sampling_speed: meta.sampling_speed.clone(),
            reference: meta.reference.clone(),
            ..Self::default()
        }
    }

    /// Bytes per interleaved frame.
    pub const fn frame_bytes(&self) -> usize {
        self.channels as usize * (BITS_PER_SAMPLE as usize / 8)
    }

    fn info_entries(&self) -> Vec<([u8; 4], String)> {
        let mut entries = Vec::new();
        let mut push = |id: &[u8; 4], text: &str| {
            if !text.is_empty() {
                entries.push((*id, String::from(text)));
            }
        };
        push(b"ISFT", &self.software);
        push(b"ICRD", &self.date_time);
        push(b"PINS", &self.channel_pins);
        push(b"GAIN", &self.gain);
        push(b"AVRG", &self.averaging);
        push(b"CNVS", &self.conversion_speed);
        push(b"SMPS", &self.sampling_speed);
        push(b"VREF", &self.reference);
        if self.cpu_speed_mhz > 0 {
            entries.push((*b"CPUF", alloc::format!("{}MHz", self.cpu_speed_mhz)));
        }
        entries
    }

    /// Serialize the header for a data chunk of `data_bytes` bytes.
    /// The samples start right after the returned bytes.
    pub fn to_bytes(&self, data_bytes: u32) -> Vec<u8> {
        let mut info = Vec::new();
        for (id, text) in self.info_entries() {
            // text is NUL terminated and padded to an even size
            let size = text.len() + 1;
            info.extend_from_slice(&id);
            info.extend_from_slice(&(size as u32).to_le_bytes());
            info.extend_from_slice(text.as_bytes());
            info.push(0);
            if size % 2 == 1 {
                info.push(0);
            }
        }

        let mut bytes = Vec::with_capacity(56 + info.len());
        let list_size = if info.is_empty() { 0 } else { 4 + info.len() };
        let header_len = 12 + 24 + if list_size > 0 { 8 + list_size } else { 0 } + 8;
        let riff_size = (header_len - 8) as u32 + data_bytes;

        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&riff_size.to_le_bytes());
        bytes.extend_from_slice(b"WAVE");

        let block_align = self.frame_bytes() as u16;
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
        bytes.extend_from_slice(&self.channels.to_le_bytes());
        bytes.extend_from_slice(&self.rate.to_le_bytes());
        bytes.extend_from_slice(&(self.rate * block_align as u32).to_le_bytes());
        bytes.extend_from_slice(&block_align.to_le_bytes());
        bytes.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

        if list_size > 0 {
            bytes.extend_from_slice(b"LIST");
            bytes.extend_from_slice(&(list_size as u32).to_le_bytes());
            bytes.extend_from_slice(b"INFO");
            bytes.extend_from_slice(&info);
        }

        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_bytes.to_le_bytes());
        bytes
    }
}
