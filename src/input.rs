//! Acquisition front-end as seen by the logger

use alloc::string::String;

use embassy_time::Duration;

/// Description of the acquired channels, copied into the WAV header and
/// the metadata file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputMetadata {
    /// Number of interleaved channels per frame
    pub channels: u16,
    /// Frames per second
    pub rate: u32,
    /// Pins or TDM slots that were sampled
    pub channel_pins: String,
    pub gain: String,
    pub averaging: String,
    pub conversion_speed: String,
    pub sampling_speed: String,
    pub reference: String,
}

/// Interrupt driven acquisition feeding a ring buffer of interleaved
/// 16-bit frames.
///
/// Frames are addressed by an absolute index that counts every frame
/// produced since the acquisition was first started. Only the last
/// [`buffer_frames`](Self::buffer_frames) frames are still held in the
/// ring buffer.
pub trait AcquisitionStream {
    /// Duration covered by one DMA buffer.
    fn dma_buffer_time(&self) -> Duration;

    /// Capacity of the ring buffer in frames.
    fn buffer_frames(&self) -> usize;

    fn metadata(&self) -> &InputMetadata;

    fn running(&self) -> bool;

    fn start(&mut self);

    fn stop(&mut self);

    /// Absolute index of the next frame that will be produced.
    fn head(&self) -> u64;

    /// Copy frames starting at absolute index `from` into `out`
    /// (`out.len()` a multiple of the channel count) and return the
    /// number of frames copied.
    fn copy_frames(&self, from: u64, out: &mut [i16]) -> usize;
}
