//! Downstream callbacks, registered once when the core is built.
//!
//! Callbacks run on the capture thread between blocks. Keep them short:
//! hand the work to a channel if it may block.

pub trait SpeechListener: Send + Sync {
    /// Debounced start of user speech.
    fn on_speech_start(&self) {}

    /// Debounced end of user speech.
    fn on_speech_end(&self) {}

    /// The user talked over playback.
    fn on_barge_in(&self) {}
}

/// Listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl SpeechListener for NoopListener {}
