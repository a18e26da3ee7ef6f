//! Loudness-based VAD fallback.
//!
//! `probability = clamp(rms / reference_rms, 0, 1)`. Always available; used
//! when the neural model cannot be loaded. Flaps on every loud/quiet block
//! pair without the hysteresis stage, so never use it on its own.

use super::SpeechProbability;
use crate::buffering::block::AudioBlock;

#[derive(Debug, Clone)]
pub struct LoudnessVad {
    /// RMS that maps to probability 1.0. Typical range: 0.02–0.1.
    reference_rms: f32,
}

impl LoudnessVad {
    pub fn new(reference_rms: f32) -> Self {
        Self {
            reference_rms: reference_rms.max(f32::EPSILON),
        }
    }

    pub fn reference_rms(&self) -> f32 {
        self.reference_rms
    }
}

impl Default for LoudnessVad {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl SpeechProbability for LoudnessVad {
    fn probability(&mut self, block: &AudioBlock) -> f32 {
        (block.rms() / self.reference_rms).clamp(0.0, 1.0)
    }

    fn reset(&mut self) {}
}
