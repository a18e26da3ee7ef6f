//! Live-tunable thresholds shared by the running loops.
//!
//! Operators may change these while capture is running; loops re-read them on
//! every block. Values are clamped on write, same as `CoreConfig::normalize`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::config::{clamp_threshold, CoreConfig, MAX_RELEASE_DELAY_MS};

/// f32 stored as raw bits in an `AtomicU32`.
#[derive(Debug)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct LiveTuning {
    vad_activation_threshold: AtomicF32,
    barge_in_threshold: AtomicF32,
    silence_threshold: AtomicF32,
    release_delay_ms: AtomicU64,
}

impl LiveTuning {
    pub fn from_config(config: &CoreConfig) -> Self {
        let tuning = Self {
            vad_activation_threshold: AtomicF32::new(0.0),
            barge_in_threshold: AtomicF32::new(0.0),
            silence_threshold: AtomicF32::new(0.0),
            release_delay_ms: AtomicU64::new(0),
        };
        tuning.set_vad_activation_threshold(config.vad.activation_threshold);
        tuning.set_barge_in_threshold(config.barge_in.threshold);
        tuning.set_silence_threshold(config.gate.silence_threshold);
        tuning.set_release_delay(Duration::from_millis(config.gate.release_delay_ms));
        tuning
    }

    pub fn vad_activation_threshold(&self) -> f32 {
        self.vad_activation_threshold.load()
    }

    pub fn set_vad_activation_threshold(&self, value: f32) {
        self.vad_activation_threshold
            .store(clamp_threshold(value, 0.01, 0.99));
    }

    pub fn barge_in_threshold(&self) -> f32 {
        self.barge_in_threshold.load()
    }

    pub fn set_barge_in_threshold(&self, value: f32) {
        self.barge_in_threshold
            .store(clamp_threshold(value, 0.001, 1.0));
    }

    pub fn silence_threshold(&self) -> f32 {
        self.silence_threshold.load()
    }

    pub fn set_silence_threshold(&self, value: f32) {
        self.silence_threshold.store(clamp_threshold(value, 0.0, 0.5));
    }

    pub fn release_delay(&self) -> Duration {
        Duration::from_millis(self.release_delay_ms.load(Ordering::Relaxed))
    }

    pub fn set_release_delay(&self, delay: Duration) {
        let ms = (delay.as_millis() as u64).min(MAX_RELEASE_DELAY_MS);
        self.release_delay_ms.store(ms, Ordering::Relaxed);
    }
}

impl Default for LiveTuning {
    fn default() -> Self {
        Self::from_config(&CoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_clamp_into_range() {
        let tuning = LiveTuning::default();
        tuning.set_vad_activation_threshold(-3.0);
        tuning.set_barge_in_threshold(f32::NAN);
        tuning.set_release_delay(Duration::from_secs(3600));

        assert_eq!(tuning.vad_activation_threshold(), 0.01);
        assert_eq!(tuning.barge_in_threshold(), 0.001);
        assert_eq!(
            tuning.release_delay(),
            Duration::from_millis(MAX_RELEASE_DELAY_MS)
        );
    }

    #[test]
    fn from_config_copies_thresholds() {
        let mut config = CoreConfig::default();
        config.gate.release_delay_ms = 300;
        config.barge_in.threshold = 0.2;
        let tuning = LiveTuning::from_config(&config);
        assert_eq!(tuning.release_delay(), Duration::from_millis(300));
        assert_eq!(tuning.barge_in_threshold(), 0.2);
    }
}
