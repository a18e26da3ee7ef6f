//! Typed audio block passed between capture, gate, VAD and playback.

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

/// Sample rate and block length every component of one pipeline agrees on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockFormat {
    /// Sample rate in Hz (e.g. 16000).
    pub sample_rate: u32,
    /// Samples per block (e.g. 320 = 20 ms at 16 kHz).
    pub block_len: usize,
}

impl BlockFormat {
    pub const fn new(sample_rate: u32, block_len: usize) -> Self {
        Self {
            sample_rate,
            block_len,
        }
    }

    /// Duration of one block in seconds.
    pub fn block_secs(&self) -> f64 {
        self.block_len as f64 / self.sample_rate as f64
    }

    /// Number of samples covering `ms` milliseconds at this rate.
    pub fn samples_for_ms(&self, ms: u64) -> usize {
        (self.sample_rate as u64 * ms / 1000) as usize
    }

    /// Reject blocks that do not match this format.
    pub fn check(&self, block: &AudioBlock) -> Result<()> {
        if block.sample_rate != self.sample_rate || block.samples.len() != self.block_len {
            return Err(ParleyError::FormatMismatch {
                expected_len: self.block_len,
                expected_rate: self.sample_rate,
                len: block.samples.len(),
                rate: block.sample_rate,
            });
        }
        Ok(())
    }
}

impl Default for BlockFormat {
    fn default() -> Self {
        Self::new(16_000, 320)
    }
}

/// A contiguous block of mono PCM samples at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioBlock {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// An all-zero block of `len` samples.
    pub fn silent(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; len], sample_rate)
    }

    /// Returns the duration of this block in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Returns true if the block contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Root-mean-square loudness of the block.
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    /// Overwrite every sample with silence, keeping the length.
    pub fn zero(&mut self) {
        self.samples.iter_mut().for_each(|s| *s = 0.0);
    }
}

/// Compute the root-mean-square of a sample slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Decode little-endian signed 16-bit PCM into f32 samples.
///
/// A trailing odd byte is ignored.
pub fn pcm16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Encode f32 samples as little-endian signed 16-bit PCM (clamped).
pub fn f32_to_pcm16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Average interleaved multi-channel frames down to mono.
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if ch == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}
