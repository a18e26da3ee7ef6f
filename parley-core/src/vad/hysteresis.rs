//! Debounced speech/silence state on top of a VAD backend.
//!
//! ## Algorithm
//!
//! 1. `is_speech = probability > activation_threshold` for each block.
//! 2. While `Inactive`, accumulate the duration of consecutive speech blocks;
//!    flip to `Active` (emit `Start`) once it reaches `min_speech`.
//! 3. While `Active`, accumulate consecutive non-speech duration; flip to
//!    `Inactive` (emit `End`) once it reaches `min_silence`.
//! 4. Any block agreeing with the current state resets the accumulator.
//!
//! Durations are counted from block lengths, not wall time, so the result is
//! independent of scheduling jitter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::VadBackend;
use crate::{buffering::block::AudioBlock, engine::tuning::LiveTuning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechState {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEvent {
    Start,
    End,
}

pub struct SpeechDetector {
    backend: VadBackend,
    tuning: Arc<LiveTuning>,
    min_speech: Duration,
    min_silence: Duration,
    state: SpeechState,
    /// How long the raw decision has disagreed with `state`.
    pending: Duration,
    speech_start_time: Option<Instant>,
    last_probability: f32,
}

impl SpeechDetector {
    pub fn new(
        backend: VadBackend,
        tuning: Arc<LiveTuning>,
        min_speech: Duration,
        min_silence: Duration,
    ) -> Self {
        Self {
            backend,
            tuning,
            min_speech,
            min_silence,
            state: SpeechState::Inactive,
            pending: Duration::ZERO,
            speech_start_time: None,
            last_probability: 0.0,
        }
    }

    /// Feed one forwarded block; returns an event only on a debounced edge.
    pub fn process(&mut self, block: &AudioBlock) -> Option<SpeechEvent> {
        let probability = self.backend.probability(block);
        self.last_probability = probability;
        let is_speech = probability > self.tuning.vad_activation_threshold();

        match (self.state, is_speech) {
            (SpeechState::Inactive, false) | (SpeechState::Active, true) => {
                self.pending = Duration::ZERO;
                None
            }
            (SpeechState::Inactive, true) => {
                self.pending += block_duration(block);
                if self.pending >= self.min_speech {
                    self.state = SpeechState::Active;
                    self.pending = Duration::ZERO;
                    self.speech_start_time = Some(Instant::now());
                    debug!(probability, "VAD: speech started");
                    Some(SpeechEvent::Start)
                } else {
                    None
                }
            }
            (SpeechState::Active, false) => {
                self.pending += block_duration(block);
                if self.pending >= self.min_silence {
                    self.finish();
                    Some(SpeechEvent::End)
                } else {
                    None
                }
            }
        }
    }

    /// End an active utterance immediately (e.g. the gate closed mid-speech).
    ///
    /// Returns `End` only if speech was active.
    pub fn interrupt(&mut self) -> Option<SpeechEvent> {
        self.pending = Duration::ZERO;
        self.backend.reset();
        if self.state == SpeechState::Active {
            self.finish();
            Some(SpeechEvent::End)
        } else {
            None
        }
    }

    fn finish(&mut self) {
        let spoke_for = self.speech_start_time.take().map(|t| t.elapsed());
        self.state = SpeechState::Inactive;
        self.pending = Duration::ZERO;
        debug!(?spoke_for, "VAD: speech ended");
    }

    pub fn state(&self) -> SpeechState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SpeechState::Active
    }

    pub fn speech_start_time(&self) -> Option<Instant> {
        self.speech_start_time
    }

    pub fn last_probability(&self) -> f32 {
        self.last_probability
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

fn block_duration(block: &AudioBlock) -> Duration {
    if block.sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(block.len() as u64 * 1_000_000_000 / block.sample_rate as u64)
}
