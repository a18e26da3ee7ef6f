//! Capture gate: decides per block whether microphone audio reaches the VAD.
//!
//! ```text
//!            is_playing()                    !is_playing() for > release_delay
//!   Open ─────────────────────► Closed ──────────────────────────────────► Open
//! ```
//!
//! The gate closes on the playback engine's own "emitting audio" signal, not
//! on detected echo, so it is already closed when sound leaves the speaker.
//! While open, blocks quieter than the silence threshold are zeroed before
//! forwarding; that is noise suppression, not a state change.

pub mod barge_in;

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    buffering::block::{AudioBlock, BlockFormat},
    engine::tuning::LiveTuning,
    error::Result,
    playback::monitor::PlaybackStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    Open,
    Closed,
}

/// What the gate did with a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Passed through untouched.
    Forwarded,
    /// Gate open but the block was below the silence threshold; zeroed.
    Silenced,
    /// Gate closed; zeroed and withheld from the VAD.
    Gated,
}

/// Operator override applied between blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateCommand {
    ForceOpen,
    ForceClose,
    /// Drop any override and follow playback state again.
    Automatic,
}

#[derive(Debug, Clone)]
pub struct ProcessedBlock {
    /// Original samples, or zeros when suppressed.
    pub block: AudioBlock,
    pub disposition: Disposition,
    /// Loudness of the block as captured, before any zeroing.
    pub rms: f32,
}

impl ProcessedBlock {
    /// True when the block continues to the VAD (possibly as silence).
    pub fn reaches_vad(&self) -> bool {
        self.disposition != Disposition::Gated
    }
}

pub struct Gate {
    format: BlockFormat,
    playback: Arc<dyn PlaybackStatus>,
    tuning: Arc<LiveTuning>,
    /// State computed from playback alone.
    auto_state: GateState,
    last_playback_time: Option<Instant>,
    /// Operator override, held until the automatic state next changes.
    forced: Option<GateState>,
    gated_samples: u64,
    ungated_samples: u64,
}

impl Gate {
    pub fn new(
        format: BlockFormat,
        playback: Arc<dyn PlaybackStatus>,
        tuning: Arc<LiveTuning>,
    ) -> Self {
        Self {
            format,
            playback,
            tuning,
            auto_state: GateState::Open,
            last_playback_time: None,
            forced: None,
            gated_samples: 0,
            ungated_samples: 0,
        }
    }

    /// Gate one block using the current wall clock.
    pub fn process(&mut self, block: AudioBlock) -> Result<ProcessedBlock> {
        self.process_at(block, Instant::now())
    }

    /// Gate one block as if it arrived at `now`.
    ///
    /// Mismatched blocks are rejected without touching gate state.
    pub fn process_at(&mut self, mut block: AudioBlock, now: Instant) -> Result<ProcessedBlock> {
        self.format.check(&block)?;
        self.update(now);

        let rms = block.rms();
        let disposition = if self.is_closed() {
            block.zero();
            self.gated_samples += block.len() as u64;
            Disposition::Gated
        } else if rms < self.tuning.silence_threshold() {
            block.zero();
            self.ungated_samples += block.len() as u64;
            Disposition::Silenced
        } else {
            self.ungated_samples += block.len() as u64;
            Disposition::Forwarded
        };

        Ok(ProcessedBlock {
            block,
            disposition,
            rms,
        })
    }

    fn update(&mut self, now: Instant) {
        let previous = self.auto_state;

        if self.playback.is_playing_at(now) {
            self.auto_state = GateState::Closed;
            self.last_playback_time = Some(now);
        } else if self.auto_state == GateState::Closed {
            let released = match self.last_playback_time {
                Some(t) => now.saturating_duration_since(t) > self.tuning.release_delay(),
                None => true,
            };
            if released {
                self.auto_state = GateState::Open;
            }
        }

        if self.auto_state != previous {
            if let Some(forced) = self.forced.take() {
                debug!(?forced, "gate override released by natural transition");
            }
            debug!(state = ?self.auto_state, "gate transition");
        }
    }

    pub fn apply(&mut self, command: GateCommand) {
        match command {
            GateCommand::ForceOpen => self.force_open(),
            GateCommand::ForceClose => self.force_close(),
            GateCommand::Automatic => self.forced = None,
        }
    }

    pub fn force_open(&mut self) {
        self.forced = Some(GateState::Open);
    }

    pub fn force_close(&mut self) {
        self.forced = Some(GateState::Closed);
    }

    pub fn state(&self) -> GateState {
        self.forced.unwrap_or(self.auto_state)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == GateState::Closed
    }

    pub fn is_overridden(&self) -> bool {
        self.forced.is_some()
    }

    pub fn last_playback_time(&self) -> Option<Instant> {
        self.last_playback_time
    }

    pub fn gated_samples(&self) -> u64 {
        self.gated_samples
    }

    pub fn ungated_samples(&self) -> u64 {
        self.ungated_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use crate::error::ParleyError;

    #[derive(Default)]
    struct FakePlayback(AtomicBool);

    impl FakePlayback {
        fn set(&self, playing: bool) {
            self.0.store(playing, Ordering::SeqCst);
        }
    }

    impl PlaybackStatus for FakePlayback {
        fn is_playing_at(&self, _now: Instant) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn playback_loudness(&self) -> f32 {
            if self.is_playing() {
                0.3
            } else {
                0.0
            }
        }
    }

    const FMT: BlockFormat = BlockFormat::new(16_000, 320);

    fn gate_with(release_ms: u64) -> (Gate, Arc<FakePlayback>) {
        let playback = Arc::new(FakePlayback::default());
        let tuning = Arc::new(LiveTuning::default());
        tuning.set_release_delay(Duration::from_millis(release_ms));
        tuning.set_silence_threshold(0.01);
        (Gate::new(FMT, playback.clone(), tuning), playback)
    }

    fn loud() -> AudioBlock {
        AudioBlock::new(vec![0.2; 320], 16_000)
    }

    #[test]
    fn closes_on_first_block_while_playing() {
        let (mut gate, playback) = gate_with(300);
        let t0 = Instant::now();
        assert!(!gate.is_closed());

        playback.set(true);
        let out = gate.process_at(loud(), t0).unwrap();
        assert!(gate.is_closed());
        assert_eq!(out.disposition, Disposition::Gated);
        assert!(out.block.samples.iter().all(|&s| s == 0.0));
        assert!((out.rms - 0.2).abs() < 1e-5, "rms measured before zeroing");
    }

    #[test]
    fn reopens_only_after_release_delay() {
        let (mut gate, playback) = gate_with(300);
        let t0 = Instant::now();

        playback.set(true);
        gate.process_at(loud(), t0).unwrap();
        playback.set(false);

        gate.process_at(loud(), t0 + Duration::from_millis(250)).unwrap();
        assert!(gate.is_closed(), "still inside release delay");

        gate.process_at(loud(), t0 + Duration::from_millis(300)).unwrap();
        assert!(gate.is_closed(), "exactly at release delay is not past it");

        let out = gate.process_at(loud(), t0 + Duration::from_millis(350)).unwrap();
        assert!(!gate.is_closed());
        assert_eq!(out.disposition, Disposition::Forwarded);
    }

    #[test]
    fn quiet_blocks_are_zeroed_while_open() {
        let (mut gate, _) = gate_with(300);
        let quiet = AudioBlock::new(vec![0.001; 320], 16_000);
        let out = gate.process(quiet).unwrap();
        assert_eq!(out.disposition, Disposition::Silenced);
        assert!(out.reaches_vad());
        assert!(!gate.is_closed());
        assert!(out.block.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn mismatched_block_is_rejected() {
        let (mut gate, _) = gate_with(300);
        let err = gate
            .process(AudioBlock::new(vec![0.2; 100], 16_000))
            .unwrap_err();
        assert!(matches!(err, ParleyError::FormatMismatch { .. }));
        assert_eq!(gate.ungated_samples(), 0);
    }

    #[test]
    fn force_open_holds_until_natural_transition() {
        let (mut gate, playback) = gate_with(100);
        let t0 = Instant::now();

        playback.set(true);
        gate.process_at(loud(), t0).unwrap();
        gate.force_open();
        gate.process_at(loud(), t0 + Duration::from_millis(20)).unwrap();
        assert!(!gate.is_closed(), "override beats playback");

        playback.set(false);
        gate.process_at(loud(), t0 + Duration::from_millis(200)).unwrap();
        assert!(!gate.is_overridden(), "released at the natural open edge");

        playback.set(true);
        gate.process_at(loud(), t0 + Duration::from_millis(220)).unwrap();
        assert!(gate.is_closed(), "automatic control resumed");
    }

    #[test]
    fn force_close_holds_while_idle() {
        let (mut gate, _) = gate_with(100);
        gate.force_close();
        let out = gate.process(loud()).unwrap();
        assert_eq!(out.disposition, Disposition::Gated);
        gate.apply(GateCommand::Automatic);
        assert!(!gate.is_closed());
    }

    #[test]
    fn counts_gated_and_ungated_samples() {
        let (mut gate, playback) = gate_with(0);
        let t0 = Instant::now();
        gate.process_at(loud(), t0).unwrap();
        playback.set(true);
        gate.process_at(loud(), t0).unwrap();
        gate.process_at(loud(), t0).unwrap();
        assert_eq!(gate.ungated_samples(), 320);
        assert_eq!(gate.gated_samples(), 640);
    }
}
