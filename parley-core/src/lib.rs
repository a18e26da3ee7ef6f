//! # parley-core
//!
//! Real-time audio core for a voice-interactive device: plays queued sounds,
//! captures the microphone, keeps device speech out of speech recognition and
//! detects when the user talks over the device.
//!
//! ## Architecture
//!
//! ```text
//! PlaybackEngine ──► reference ring + is_playing / playback_loudness
//!                                │
//! Capture device ──► capture loop ──► Gate ──open──► VAD ──► on_speech_start / on_speech_end
//!                                      │
//!                                    closed
//!                                      ▼
//!                               BargeInDetector ──► on_barge_in
//! ```
//!
//! Capture and playback each run on one dedicated thread. The only state they
//! share is the [`playback::PlaybackMonitor`], taken under one mutex per access.
//! The [`duplex`] module offers the same gating through a single device callback.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod config;
pub mod duplex;
pub mod engine;
pub mod error;
pub mod gate;
pub mod ipc;
pub mod playback;
pub mod vad;

// Convenience re-exports for downstream crates
pub use buffering::block::{AudioBlock, BlockFormat};
pub use config::CoreConfig;
pub use engine::{diagnostics::DiagnosticsSnapshot, AudioCore};
pub use error::{ParleyError, Result};
pub use gate::GateState;
pub use ipc::events::{AudioActivityEvent, Component, CoreStatusEvent, LoopStatus};
pub use ipc::listener::{NoopListener, SpeechListener};
pub use playback::SoundSource;
pub use vad::VadBackend;

#[cfg(feature = "onnx")]
pub use vad::SileroVad;
