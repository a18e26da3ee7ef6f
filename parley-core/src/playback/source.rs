//! Sound sources: WAV sound effects and in-memory synthesized speech.
//!
//! Everything is decoded to mono f32 at the pipeline rate before the playback
//! loop sees it. File rate conversion is one of the two places a pipeline
//! resamples.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hound::{SampleFormat, WavReader};
use tracing::debug;

use crate::{
    audio::resample::resample_all,
    buffering::block::{downmix_to_mono, rms},
    error::{ParleyError, Result},
};

/// Peak ceiling applied after loudness normalization.
const PEAK_LIMIT: f32 = 0.98;

#[derive(Debug, Clone)]
pub enum SoundSource {
    /// A WAV file, decoded when the entry executes.
    File(PathBuf),
    /// Mono samples already in memory (e.g. TTS output).
    Samples {
        samples: Arc<[f32]>,
        sample_rate: u32,
    },
}

impl SoundSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn samples(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self::Samples {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Short label for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Samples {
                samples,
                sample_rate,
            } => format!("{} samples @ {sample_rate} Hz", samples.len()),
        }
    }

    /// Decode to mono f32 at `target_rate`.
    pub fn load(&self, target_rate: u32) -> Result<Vec<f32>> {
        match self {
            Self::File(path) => {
                let (samples, rate) = decode_wav(path)?;
                resample_all(&samples, rate, target_rate)
            }
            Self::Samples {
                samples,
                sample_rate,
            } => resample_all(samples, *sample_rate, target_rate),
        }
    }
}

/// Read a WAV file as mono f32 and its sample rate.
pub fn decode_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = WavReader::open(path)
        .map_err(|e| ParleyError::Decode(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();
    let decode_err = |e: hound::Error| ParleyError::Decode(format!("{}: {e}", path.display()));

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(decode_err)?,
        SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(decode_err)?
        }
    };

    debug!(
        path = %path.display(),
        sample_rate = spec.sample_rate,
        channels = spec.channels,
        bits = spec.bits_per_sample,
        "decoded wav"
    );
    Ok((downmix_to_mono(&interleaved, spec.channels), spec.sample_rate))
}

/// Scale `samples` so their RMS equals `target`, limited so no peak exceeds
/// the ceiling. A non-positive target or a silent source leaves samples as-is.
pub fn normalize_loudness(samples: &mut [f32], target: f32) {
    if target.is_nan() || target <= 0.0 {
        return;
    }
    let current = rms(samples);
    if current <= f32::EPSILON {
        return;
    }
    let peak = samples.iter().fold(0f32, |m, s| m.max(s.abs()));
    let gain = (target / current).min(PEAK_LIMIT / peak);
    samples.iter_mut().for_each(|s| *s *= gain);
}
