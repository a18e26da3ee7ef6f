//! Voice Activity Detection.
//!
//! A backend turns a block into a speech probability; [`hysteresis`] turns the
//! probability stream into debounced speech-start/speech-end edges.
//!
//! Backend selection is a one-time negotiation: [`VadBackend::negotiate`]
//! tries the neural model and falls back to the loudness backend if it cannot
//! be loaded. The choice is never re-checked per block.

pub mod energy;
pub mod hysteresis;

#[cfg(feature = "onnx")]
pub mod silero;

#[cfg(feature = "onnx")]
pub use silero::SileroVad;

use tracing::{info, warn};

use crate::{
    buffering::block::AudioBlock,
    config::VadConfig,
    error::{ParleyError, Result},
};

pub use energy::LoudnessVad;
pub use hysteresis::{SpeechDetector, SpeechEvent, SpeechState};

/// Capability every VAD backend provides.
///
/// Implementors may be stateful (RNN hidden states, resampler tails, etc.).
pub trait SpeechProbability: Send + 'static {
    /// Speech probability for `block`, in [0, 1].
    fn probability(&mut self, block: &AudioBlock) -> f32;

    /// Reset any internal state.
    fn reset(&mut self);
}

/// The negotiated backend.
pub enum VadBackend {
    /// Neural model loaded successfully.
    Neural(Box<dyn SpeechProbability>),
    /// Loudness-threshold fallback.
    Fallback(LoudnessVad),
}

impl VadBackend {
    /// Try the neural backend, degrade to loudness on any failure.
    pub fn negotiate(config: &VadConfig, sample_rate: u32) -> Self {
        Self::from_load_result(load_neural(config, sample_rate), config)
    }

    /// Resolve a neural load attempt into a backend.
    pub fn from_load_result(
        loaded: Result<Box<dyn SpeechProbability>>,
        config: &VadConfig,
    ) -> Self {
        match loaded {
            Ok(model) => {
                info!("VAD backend: neural");
                Self::Neural(model)
            }
            Err(e) => {
                warn!("neural VAD unavailable ({e}), falling back to loudness VAD");
                Self::Fallback(LoudnessVad::new(config.reference_rms))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Neural(_) => "neural",
            Self::Fallback(_) => "loudness",
        }
    }

    pub fn probability(&mut self, block: &AudioBlock) -> f32 {
        let p = match self {
            Self::Neural(model) => model.probability(block),
            Self::Fallback(vad) => vad.probability(block),
        };
        if p.is_nan() {
            0.0
        } else {
            p.clamp(0.0, 1.0)
        }
    }

    pub fn reset(&mut self) {
        match self {
            Self::Neural(model) => model.reset(),
            Self::Fallback(vad) => vad.reset(),
        }
    }
}

#[cfg(feature = "onnx")]
fn load_neural(config: &VadConfig, sample_rate: u32) -> Result<Box<dyn SpeechProbability>> {
    let path = config
        .model_path
        .clone()
        .ok_or_else(|| ParleyError::Other(anyhow::anyhow!("no VAD model path configured")))?;
    let vad = SileroVad::new(&path, sample_rate)?;
    Ok(Box::new(vad))
}

#[cfg(not(feature = "onnx"))]
fn load_neural(config: &VadConfig, _sample_rate: u32) -> Result<Box<dyn SpeechProbability>> {
    match &config.model_path {
        Some(path) => Err(ParleyError::ModelNotFound { path: path.clone() }),
        None => Err(ParleyError::Other(anyhow::anyhow!(
            "compiled without the onnx feature"
        ))),
    }
}
