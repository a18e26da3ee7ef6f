//! Shared playback state: reference ring, measured loudness, manual override.
//!
//! This is the only cross-thread mutable state between the playback and
//! capture paths. Every access takes the single `parking_lot::Mutex` for one
//! read or one write and never across blocking I/O. The manual override is
//! mirrored into an atomic so real-time callbacks can read it without locking.
//!
//! Measured loudness expires: once the last reference write is older than the
//! reference window, playback counts as silent even if nobody calls
//! [`PlaybackMonitor::mark_idle`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffering::{block::rms, reference::ReferenceRing};

/// Read-only view of playback state consumed by the gate.
pub trait PlaybackStatus: Send + Sync {
    /// Playing as of `now`.
    fn is_playing_at(&self, now: Instant) -> bool;

    fn is_playing(&self) -> bool {
        self.is_playing_at(Instant::now())
    }

    /// Loudness of recent playback; 0 when not playing.
    fn playback_loudness(&self) -> f32;
}

#[derive(Debug)]
struct PlaybackState {
    reference: ReferenceRing,
    /// RMS of the most recently written reference block.
    loudness: f32,
    last_write: Option<Instant>,
    /// Loudness older than this is treated as silence.
    stale_after: Duration,
    /// Explicit playing flag set by producers that cannot be measured cheaply.
    manual_override: Option<bool>,
    epsilon: f32,
}

impl PlaybackState {
    fn loudness_at(&self, now: Instant) -> f32 {
        match self.last_write {
            Some(t) if now.saturating_duration_since(t) <= self.stale_after => self.loudness,
            _ => 0.0,
        }
    }

    fn is_playing_at(&self, now: Instant) -> bool {
        // Manual override wins while set.
        self.manual_override
            .unwrap_or_else(|| self.loudness_at(now) > self.epsilon)
    }

    fn record(&mut self, samples: &[f32], loudness: f32, now: Instant) {
        self.reference.write(samples);
        self.loudness = loudness;
        self.last_write = Some(now);
    }
}

const OVERRIDE_NONE: u8 = 0;
const OVERRIDE_PLAYING: u8 = 1;
const OVERRIDE_SILENT: u8 = 2;

/// Cloneable handle to the shared playback state.
#[derive(Debug, Clone)]
pub struct PlaybackMonitor {
    inner: Arc<Mutex<PlaybackState>>,
    forced: Arc<AtomicU8>,
}

impl PlaybackMonitor {
    pub fn new(sample_rate: u32, window_ms: u64, epsilon: f32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PlaybackState {
                reference: ReferenceRing::with_window(sample_rate, window_ms),
                loudness: 0.0,
                last_write: None,
                stale_after: Duration::from_millis(window_ms),
                manual_override: None,
                epsilon,
            })),
            forced: Arc::new(AtomicU8::new(OVERRIDE_NONE)),
        }
    }

    /// Record samples that are about to leave the speaker.
    pub fn write_reference(&self, samples: &[f32]) {
        self.write_reference_at(samples, Instant::now());
    }

    /// [`write_reference`](Self::write_reference) with an explicit timestamp.
    pub fn write_reference_at(&self, samples: &[f32], now: Instant) {
        let loudness = rms(samples);
        self.inner.lock().record(samples, loudness, now);
    }

    /// Like [`write_reference`](Self::write_reference) but gives up instead of
    /// waiting when the lock is contended. Safe for real-time callbacks.
    ///
    /// Returns `false` when the write was skipped.
    pub fn try_write_reference(&self, samples: &[f32]) -> bool {
        let loudness = rms(samples);
        let now = Instant::now();
        match self.inner.try_lock() {
            Some(mut state) => {
                state.record(samples, loudness, now);
                true
            }
            None => false,
        }
    }

    /// Playback finished: measured loudness drops to zero.
    pub fn mark_idle(&self) {
        self.inner.lock().loudness = 0.0;
    }

    /// Force the playing flag regardless of measured loudness.
    pub fn set_playing_state(&self, playing: bool) {
        let mut state = self.inner.lock();
        state.manual_override = Some(playing);
        let flag = if playing {
            OVERRIDE_PLAYING
        } else {
            OVERRIDE_SILENT
        };
        self.forced.store(flag, Ordering::Release);
    }

    /// Return to loudness-based inference.
    pub fn clear_playing_override(&self) {
        let mut state = self.inner.lock();
        state.manual_override = None;
        self.forced.store(OVERRIDE_NONE, Ordering::Release);
    }

    pub fn playing_override(&self) -> Option<bool> {
        self.inner.lock().manual_override
    }

    /// The manual override without taking the lock. Safe for real-time callbacks.
    pub fn override_hint(&self) -> Option<bool> {
        match self.forced.load(Ordering::Acquire) {
            OVERRIDE_PLAYING => Some(true),
            OVERRIDE_SILENT => Some(false),
            _ => None,
        }
    }

    /// The most recent `n` reference samples, zero-padded on the left.
    pub fn lookback(&self, n: usize) -> Vec<f32> {
        self.inner.lock().reference.lookback(n)
    }

    pub fn reference_capacity(&self) -> usize {
        self.inner.lock().reference.capacity()
    }

    /// Consistent `(is_playing, loudness)` pair taken under one lock.
    pub fn snapshot(&self) -> (bool, f32) {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> (bool, f32) {
        let state = self.inner.lock();
        let playing = state.is_playing_at(now);
        (playing, if playing { state.loudness_at(now) } else { 0.0 })
    }
}

impl PlaybackStatus for PlaybackMonitor {
    fn is_playing_at(&self, now: Instant) -> bool {
        self.inner.lock().is_playing_at(now)
    }

    fn playback_loudness(&self) -> f32 {
        self.snapshot().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> PlaybackMonitor {
        PlaybackMonitor::new(16_000, 100, 1e-3)
    }

    #[test]
    fn loud_reference_means_playing() {
        let m = monitor();
        assert!(!m.is_playing());
        m.write_reference(&[0.5; 160]);
        assert!(m.is_playing());
        assert!((m.playback_loudness() - 0.5).abs() < 1e-5);

        m.mark_idle();
        assert!(!m.is_playing());
        assert_eq!(m.playback_loudness(), 0.0);
    }

    #[test]
    fn quiet_reference_is_not_playing() {
        let m = monitor();
        m.write_reference(&[0.0001; 160]);
        assert!(!m.is_playing());
        assert_eq!(m.playback_loudness(), 0.0);
    }

    #[test]
    fn manual_override_wins_while_set() {
        let m = monitor();
        m.set_playing_state(true);
        assert!(m.is_playing(), "override on with silent reference");

        m.write_reference(&[0.5; 160]);
        m.set_playing_state(false);
        assert!(!m.is_playing(), "override off beats loud reference");

        m.clear_playing_override();
        assert!(m.is_playing(), "back to loudness inference");
    }

    #[test]
    fn loudness_expires_one_window_after_the_last_write() {
        let m = monitor();
        let t0 = Instant::now();
        m.write_reference_at(&[0.3; 160], t0);
        assert!(m.is_playing_at(t0 + Duration::from_millis(100)));
        assert!(!m.is_playing_at(t0 + Duration::from_millis(101)));
        assert_eq!(m.snapshot_at(t0 + Duration::from_secs(60)), (false, 0.0));

        m.set_playing_state(true);
        assert!(m.is_playing_at(t0 + Duration::from_secs(60)), "override ignores expiry");
    }

    #[test]
    fn override_hint_mirrors_the_locked_flag() {
        let m = monitor();
        assert_eq!(m.override_hint(), None);
        m.set_playing_state(true);
        assert_eq!(m.override_hint(), Some(true));
        m.set_playing_state(false);
        assert_eq!(m.override_hint(), Some(false));
        m.clear_playing_override();
        assert_eq!(m.override_hint(), None);
        assert_eq!(m.playing_override(), None);
    }

    #[test]
    fn reference_samples_reach_lookback() {
        let m = monitor();
        m.write_reference(&[0.25, 0.5]);
        assert_eq!(m.lookback(3), vec![0.0, 0.25, 0.5]);
        assert_eq!(m.reference_capacity(), 1_600);
    }
}
