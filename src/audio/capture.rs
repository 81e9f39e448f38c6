//! Microphone block encoding
//!
//! Turns raw device blocks into transport frames:
//! - RMS volume for the UI meter
//! - nearest-neighbour decimation to the transport rate
//! - float to 16-bit PCM with clamping

use tracing::debug;

use super::backend::{AudioFrame, CaptureBlock};

/// Full-scale constant shared by the encoder and the playback decoder
pub const PCM16_FULL_SCALE: f32 = 32767.0;

/// Result of encoding one capture block
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    /// RMS of the raw block, in [0, 1]
    pub volume: f32,
    /// Frame ready for the transport
    pub frame: AudioFrame,
}

/// Encodes microphone blocks into transport frames
///
/// Holds no device state; the sequence counter is the only thing that
/// survives between blocks.
pub struct CaptureEncoder {
    target_rate: u32,
    next_sequence: u64,
}

impl CaptureEncoder {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            next_sequence: 0,
        }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Encode one block. Never fails: an empty block yields an empty frame.
    pub fn encode_block(&mut self, block: &CaptureBlock) -> EncodedBlock {
        let volume = rms(&block.samples).min(1.0);

        let resampled = resample_nearest(&block.samples, block.sample_rate, self.target_rate);
        let pcm = float_to_pcm16(&resampled);

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        if sequence == 0 {
            debug!(
                "First capture block: {} samples at {}Hz -> {} samples at {}Hz",
                block.samples.len(),
                block.sample_rate,
                pcm.len(),
                self.target_rate
            );
        }

        EncodedBlock {
            volume,
            frame: AudioFrame::from_pcm16(&pcm, self.target_rate, sequence),
        }
    }
}

/// Root-mean-square amplitude of a block
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum: f32 = samples.iter().map(|&s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Resample by picking the nearest preceding source sample for each output slot
/// (ratio `native/target`, no anti-aliasing filter)
pub fn resample_nearest(samples: &[f32], native_rate: u32, target_rate: u32) -> Vec<f32> {
    if native_rate == target_rate || native_rate == 0 || target_rate == 0 {
        return samples.to_vec();
    }

    let ratio = native_rate as f64 / target_rate as f64;
    let output_len = (samples.len() as f64 / ratio) as usize;

    (0..output_len)
        .filter_map(|i| samples.get((i as f64 * ratio) as usize).copied())
        .collect()
}

/// Convert float samples to 16-bit PCM, clamping to [-1, 1] first
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * PCM16_FULL_SCALE).round() as i16)
        .collect()
}

/// Convert 16-bit PCM back to floats in [-1, 1]
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| (s as f32 / PCM16_FULL_SCALE).max(-1.0))
        .collect()
}
