//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Blocks inside one pipeline never change rate. Conversion happens only at
//! the documented boundaries: a capture device that cannot open at the
//! pipeline rate, the neural VAD (which wants 16 kHz), and sound-effect files
//! recorded at another rate.
//!
//! When source rate == target rate, `RateConverter` is a passthrough and no
//! rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{ParleyError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input chunks between calls.
    input_buf: Vec<f32>,
    /// Input frames rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    ratio: f64,
}

impl RateConverter {
    /// Create a converter from `source_rate` to `target_rate`, feeding rubato
    /// `chunk_size` input frames at a time.
    ///
    /// # Errors
    /// Returns `ParleyError::Resample` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        let ratio = target_rate as f64 / source_rate.max(1) as f64;
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                ratio,
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| ParleyError::Resample(format!("init {source_rate}->{target_rate}: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        debug!(source_rate, target_rate, chunk_size, max_out, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf,
            ratio,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples accumulate until a full `chunk_size` block is available; the
    /// remainder is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Push out whatever is still buffered, padding the final chunk with
    /// silence and trimming the output to the expected length.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.input_buf.is_empty() {
            self.input_buf.clear();
            return Vec::new();
        }
        let pending = self.input_buf.len();
        let expected = (pending as f64 * self.ratio).round() as usize;
        let pad = self.chunk_size - pending;
        let mut out = self.process(&vec![0.0; pad]);
        out.truncate(expected);
        out
    }

    /// `true` when no resampling occurs.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Drop buffered input, e.g. after a stream restart.
    pub fn reset(&mut self) {
        self.input_buf.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

/// Convert a whole buffer in one go (sound-effect decoding).
pub fn resample_all(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    if source_rate == target_rate {
        return Ok(samples.to_vec());
    }
    let mut rc = RateConverter::new(source_rate, target_rate, 1024)?;
    let mut out = rc.process(samples);
    out.extend(rc.flush());
    Ok(out)
}
