//! Silero VAD neural backend.
//!
//! Wraps the Silero VAD ONNX model (<https://github.com/snakers4/silero-vad>).
//! Both the v3/v4 LSTM interface (`h`/`c` tensors) and the v5 GRU interface
//! (single `state` tensor) are detected from the model's declared I/O names.
//!
//! The model wants 512-sample windows at 16 kHz. Blocks arrive at the
//! pipeline rate, so this backend owns a resampling boundary: it converts
//! incoming blocks to 16 kHz and buffers until a full window is available.

use std::path::Path;

use ndarray::{Array1, Array2, Array3};
use ort::session::builder::SessionBuilder;
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use tracing::{error, info, warn};

use super::SpeechProbability;
use crate::{
    audio::resample::RateConverter,
    buffering::block::AudioBlock,
    error::{ParleyError, Result},
};

/// Model sample rate.
const MODEL_RATE: u32 = 16_000;
/// Window length the model expects (32 ms at 16 kHz).
const WINDOW: usize = 512;
/// LSTM state: 2 layers × 1 batch × 64 units.
const LSTM_SIZE: usize = 128;
/// GRU state: 2 layers × 1 batch × 128 units.
const GRU_STATE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateLayout {
    Lstm,
    Gru,
    Stateless,
}

#[derive(Debug, Default)]
struct IoNames {
    input: String,
    sr: Option<String>,
    output: String,
    h: Option<String>,
    c: Option<String>,
    hn: Option<String>,
    cn: Option<String>,
    state: Option<String>,
    state_out: Option<String>,
}

pub struct SileroVad {
    session: Session,
    layout: StateLayout,
    names: IoNames,
    h: Vec<f32>,
    c: Vec<f32>,
    state: Vec<f32>,
    converter: RateConverter,
    window_buf: Vec<f32>,
    last_probability: f32,
}

impl SileroVad {
    /// Load the model at `path` for blocks arriving at `input_rate`.
    pub fn new(path: impl AsRef<Path>, input_rate: u32) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ParleyError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }

        let session = SessionBuilder::new()
            .map_err(|e| ParleyError::OnnxSession(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e| ParleyError::OnnxSession(e.to_string()))?;

        let inputs: Vec<String> = session
            .inputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        let outputs: Vec<String> = session
            .outputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();

        let names = IoNames {
            input: resolve_name(&inputs, &["input", "audio", "x"])
                .or_else(|| inputs.first().cloned())
                .ok_or_else(|| ParleyError::OnnxSession("Silero model has no inputs".into()))?,
            sr: resolve_name(&inputs, &["sr", "sample_rate"]),
            output: resolve_name(&outputs, &["output", "speech_prob", "prob"])
                .or_else(|| outputs.first().cloned())
                .ok_or_else(|| ParleyError::OnnxSession("Silero model has no outputs".into()))?,
            h: resolve_name(&inputs, &["h", "state_h"]),
            c: resolve_name(&inputs, &["c", "state_c"]),
            hn: resolve_name(&outputs, &["hn", "state_hn", "h_out"]),
            cn: resolve_name(&outputs, &["cn", "state_cn", "c_out"]),
            state: resolve_name(&inputs, &["state", "h_0", "hidden"]),
            state_out: resolve_name(&outputs, &["stateN", "state_out", "hn_out"]),
        };

        let layout = if names.h.is_some()
            && names.c.is_some()
            && names.hn.is_some()
            && names.cn.is_some()
        {
            StateLayout::Lstm
        } else if names.state.is_some() {
            StateLayout::Gru
        } else {
            StateLayout::Stateless
        };

        let converter = RateConverter::new(input_rate, MODEL_RATE, WINDOW)?;

        info!(
            path = %path.display(),
            ?layout,
            input_rate,
            inputs = ?inputs,
            outputs = ?outputs,
            "Silero VAD loaded"
        );

        Ok(Self {
            session,
            layout,
            names,
            h: vec![0.0; LSTM_SIZE],
            c: vec![0.0; LSTM_SIZE],
            state: vec![0.0; GRU_STATE_SIZE],
            converter,
            window_buf: Vec::with_capacity(WINDOW * 2),
            last_probability: 0.0,
        })
    }

    /// Run one 512-sample window; updates recurrent state and returns the probability.
    fn run_window(&mut self, window: &[f32]) -> Result<f32> {
        let onnx = |e: ort::Error| ParleyError::OnnxSession(e.to_string());
        let shape = |e: ndarray::ShapeError| ParleyError::OnnxSession(e.to_string());

        let input = Value::from_array(
            Array2::<f32>::from_shape_vec((1, WINDOW), window.to_vec()).map_err(shape)?,
        )
        .map_err(onnx)?;
        let mut feeds: Vec<(String, SessionInputValue<'_>)> =
            vec![(self.names.input.clone(), input.into())];

        if let Some(sr) = &self.names.sr {
            let sr_val =
                Value::from_array(Array1::<i64>::from_elem(1, MODEL_RATE as i64)).map_err(onnx)?;
            feeds.push((sr.clone(), sr_val.into()));
        }

        match self.layout {
            StateLayout::Lstm => {
                for (name, buf) in [(&self.names.h, &self.h), (&self.names.c, &self.c)] {
                    if let Some(name) = name {
                        let arr = Array3::<f32>::from_shape_vec((2, 1, 64), buf.clone())
                            .map_err(shape)?;
                        feeds.push((name.clone(), Value::from_array(arr).map_err(onnx)?.into()));
                    }
                }
            }
            StateLayout::Gru => {
                if let Some(name) = &self.names.state {
                    let arr = Array3::<f32>::from_shape_vec((2, 1, 128), self.state.clone())
                        .map_err(shape)?;
                    feeds.push((name.clone(), Value::from_array(arr).map_err(onnx)?.into()));
                }
            }
            StateLayout::Stateless => {}
        }

        let outputs = self
            .session
            .run(feeds)
            .map_err(|e| ParleyError::OnnxSession(e.to_string()))?;

        let prob_value = outputs
            .get(self.names.output.as_str())
            .unwrap_or(&outputs[0]);
        let (_, prob_data) = prob_value.try_extract_tensor::<f32>().map_err(onnx)?;
        let prob = prob_data.first().copied().unwrap_or(0.0);

        match self.layout {
            StateLayout::Lstm => {
                let hn = self.names.hn.as_deref().and_then(|n| outputs.get(n));
                let cn = self.names.cn.as_deref().and_then(|n| outputs.get(n));
                if let (Some(hn), Some(cn)) = (hn, cn) {
                    self.h = hn.try_extract_tensor::<f32>().map_err(onnx)?.1.to_vec();
                    self.c = cn.try_extract_tensor::<f32>().map_err(onnx)?.1.to_vec();
                } else {
                    warn!("Silero LSTM state outputs missing; switching to stateless");
                    self.layout = StateLayout::Stateless;
                }
            }
            StateLayout::Gru => {
                match self.names.state_out.as_deref().and_then(|n| outputs.get(n)) {
                    Some(out) => {
                        self.state = out.try_extract_tensor::<f32>().map_err(onnx)?.1.to_vec();
                    }
                    None => {
                        warn!("Silero GRU state output missing; switching to stateless");
                        self.layout = StateLayout::Stateless;
                    }
                }
            }
            StateLayout::Stateless => {}
        }

        Ok(prob)
    }
}

fn resolve_name(candidates: &[String], preferred: &[&str]) -> Option<String> {
    preferred.iter().find_map(|needle| {
        candidates
            .iter()
            .find(|name| name.eq_ignore_ascii_case(needle))
            .cloned()
    })
}

impl SpeechProbability for SileroVad {
    /// Highest probability over the windows completed by this block, or the
    /// previous value when the block did not complete a window.
    fn probability(&mut self, block: &AudioBlock) -> f32 {
        let converted = self.converter.process(&block.samples);
        self.window_buf.extend_from_slice(&converted);

        let mut best: Option<f32> = None;
        while self.window_buf.len() >= WINDOW {
            let window: Vec<f32> = self.window_buf.drain(..WINDOW).collect();
            match self.run_window(&window) {
                Ok(p) => best = Some(best.map_or(p, |b: f32| b.max(p))),
                Err(e) => error!("Silero VAD inference error: {e}"),
            }
        }

        if let Some(p) = best {
            self.last_probability = p;
        }
        self.last_probability
    }

    fn reset(&mut self) {
        self.h.iter_mut().for_each(|v| *v = 0.0);
        self.c.iter_mut().for_each(|v| *v = 0.0);
        self.state.iter_mut().for_each(|v| *v = 0.0);
        self.window_buf.clear();
        self.converter.reset();
        self.last_probability = 0.0;
    }
}
