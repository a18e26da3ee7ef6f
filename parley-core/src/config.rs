//! Core configuration.
//!
//! Every field has a default and `normalize()` clamps values into their valid
//! range instead of rejecting them, so a bad settings file never leaves the
//! device without audio.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffering::block::BlockFormat;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CoreConfig {
    /// Sample rate and block length shared by every component.
    pub format: BlockFormat,
    /// How much playback history the reference ring keeps.
    pub reference_window_ms: u64,
    pub gate: GateConfig,
    pub barge_in: BargeInConfig,
    pub vad: VadConfig,
    pub playback: PlaybackConfig,
    pub retry: RetryConfig,
    pub devices: DeviceConfig,
    /// Capture reads give up after this long so a stop request is observed.
    pub read_timeout_ms: u64,
    /// How long `stop()` waits for each worker before forcing handles closed.
    pub shutdown_timeout_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            format: BlockFormat::default(),
            reference_window_ms: 2_000,
            gate: GateConfig::default(),
            barge_in: BargeInConfig::default(),
            vad: VadConfig::default(),
            playback: PlaybackConfig::default(),
            retry: RetryConfig::default(),
            devices: DeviceConfig::default(),
            read_timeout_ms: 100,
            shutdown_timeout_ms: 2_000,
        }
    }
}

impl CoreConfig {
    pub fn normalize(&mut self) {
        self.format.sample_rate = self.format.sample_rate.clamp(8_000, 96_000);
        self.format.block_len = self.format.block_len.clamp(32, 8_192);
        self.reference_window_ms = self.reference_window_ms.clamp(50, 30_000);
        self.read_timeout_ms = self.read_timeout_ms.clamp(5, 2_000);
        self.shutdown_timeout_ms = self.shutdown_timeout_ms.clamp(50, 30_000);
        self.gate.normalize();
        self.barge_in.normalize();
        self.vad.normalize();
        self.playback.normalize();
        self.retry.normalize();
        self.devices.normalize();
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct GateConfig {
    /// Time the gate stays closed after playback stops (device latency + echo tail).
    pub release_delay_ms: u64,
    /// Blocks quieter than this RMS are zeroed even when the gate is open.
    pub silence_threshold: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            release_delay_ms: 400,
            silence_threshold: 0.004,
        }
    }
}

impl GateConfig {
    pub fn normalize(&mut self) {
        self.release_delay_ms = self.release_delay_ms.min(MAX_RELEASE_DELAY_MS);
        self.silence_threshold = clamp_threshold(self.silence_threshold, 0.0, 0.5);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct BargeInConfig {
    /// Must sit above expected echo loudness and below close/shouted speech.
    pub threshold: f32,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self { threshold: 0.12 }
    }
}

impl BargeInConfig {
    pub fn normalize(&mut self) {
        self.threshold = clamp_threshold(self.threshold, 0.001, 1.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct VadConfig {
    /// Speech probability above which a block counts as speech.
    pub activation_threshold: f32,
    /// Continuous speech required before speech-start fires.
    pub min_speech_ms: u64,
    /// Continuous silence required before speech-end fires.
    pub min_silence_ms: u64,
    /// RMS that maps to probability 1.0 in the loudness fallback.
    pub reference_rms: f32,
    /// Silero VAD model. `None` disables the neural backend.
    pub model_path: Option<PathBuf>,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 0.5,
            min_speech_ms: 250,
            min_silence_ms: 700,
            reference_rms: 0.05,
            model_path: None,
        }
    }
}

impl VadConfig {
    pub fn normalize(&mut self) {
        self.activation_threshold = clamp_threshold(self.activation_threshold, 0.01, 0.99);
        self.min_speech_ms = self.min_speech_ms.min(5_000);
        self.min_silence_ms = self.min_silence_ms.min(10_000);
        self.reference_rms = clamp_threshold(self.reference_rms, 0.001, 1.0);
        self.model_path = self
            .model_path
            .take()
            .filter(|p| !p.as_os_str().is_empty());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct PlaybackConfig {
    /// Loudness at or below this counts as "not playing".
    pub playing_epsilon: f32,
    /// Pending request limit; `enqueue` refuses beyond it.
    pub queue_capacity: usize,
    /// Extra time allowed past a source's nominal duration before it is abandoned.
    pub entry_timeout_margin_ms: u64,
    /// Hard ceiling on one entry's execution time.
    pub max_entry_ms: u64,
    /// Output volume restored once the first sound begins.
    pub restore_volume_percent: u8,
    pub volume_ramp_steps: u32,
    pub volume_ramp_ms: u64,
    /// Mixer control driven by `amixer`; `None` leaves system volume alone.
    pub mixer_control: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            playing_epsilon: 1e-4,
            queue_capacity: 64,
            entry_timeout_margin_ms: 2_000,
            max_entry_ms: 60_000,
            restore_volume_percent: 80,
            volume_ramp_steps: 10,
            volume_ramp_ms: 150,
            mixer_control: None,
        }
    }
}

impl PlaybackConfig {
    pub fn normalize(&mut self) {
        self.playing_epsilon = clamp_threshold(self.playing_epsilon, 0.0, 0.1);
        self.queue_capacity = self.queue_capacity.clamp(1, 4_096);
        self.entry_timeout_margin_ms = self.entry_timeout_margin_ms.clamp(100, 60_000);
        self.max_entry_ms = self.max_entry_ms.clamp(1_000, 600_000);
        self.restore_volume_percent = self.restore_volume_percent.min(100);
        self.volume_ramp_steps = self.volume_ramp_steps.clamp(1, 100);
        self.volume_ramp_ms = self.volume_ramp_ms.min(5_000);
        self.mixer_control = self
            .mixer_control
            .as_ref()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive failures tolerated before the loop gives up.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn normalize(&mut self) {
        self.max_retries = self.max_retries.min(1_000);
        self.initial_backoff_ms = self.initial_backoff_ms.clamp(1, 60_000);
        self.max_backoff_ms = self.max_backoff_ms.clamp(self.initial_backoff_ms, 300_000);
    }

    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Which I/O family drives the capture and playback paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackend {
    /// In-process cpal streams.
    #[default]
    Cpal,
    /// `arecord` / `aplay` subprocesses with raw PCM16 pipes.
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: DeviceBackend,
    /// Named input device; `None` uses the host default.
    pub input_device: Option<String>,
    /// Named output device; `None` uses the host default.
    pub output_device: Option<String>,
}

impl DeviceConfig {
    pub fn normalize(&mut self) {
        for name in [&mut self.input_device, &mut self.output_device] {
            *name = name
                .as_ref()
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty());
        }
    }
}

/// Upper bound on the gate release delay.
pub const MAX_RELEASE_DELAY_MS: u64 = 5_000;

/// Clamp a float threshold, mapping NaN to the lower bound.
pub fn clamp_threshold(value: f32, min: f32, max: f32) -> f32 {
    if value.is_nan() {
        min
    } else {
        value.clamp(min, max)
    }
}
