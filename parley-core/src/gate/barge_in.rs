//! Barge-in detection: the user talking over device speech.
//!
//! Edge-triggered. Fires once when loudness crosses the threshold while the
//! gate is closed, then stays disarmed until loudness falls back below it.

use std::sync::Arc;

use tracing::info;

use crate::engine::tuning::LiveTuning;

pub struct BargeInDetector {
    tuning: Arc<LiveTuning>,
    armed: bool,
}

impl BargeInDetector {
    pub fn new(tuning: Arc<LiveTuning>) -> Self {
        Self {
            tuning,
            armed: true,
        }
    }

    /// Returns `true` on the first loud block of an interval while gated.
    pub fn check(&mut self, block_loudness: f32, gate_is_closed: bool) -> bool {
        let threshold = self.tuning.barge_in_threshold();

        if block_loudness <= threshold {
            self.armed = true;
            return false;
        }

        if gate_is_closed && self.armed {
            self.armed = false;
            info!(
                loudness = block_loudness,
                threshold, "barge-in detected"
            );
            return true;
        }

        false
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(threshold: f32) -> BargeInDetector {
        let tuning = Arc::new(LiveTuning::default());
        tuning.set_barge_in_threshold(threshold);
        BargeInDetector::new(tuning)
    }

    #[test]
    fn fires_once_per_loud_interval() {
        let mut d = detector(0.2);
        let fired: Vec<bool> = [0.1, 0.5, 0.6, 0.7, 0.1, 0.4]
            .iter()
            .map(|&l| d.check(l, true))
            .collect();
        assert_eq!(fired, vec![false, true, false, false, false, true]);
    }

    #[test]
    fn never_fires_while_gate_open() {
        let mut d = detector(0.2);
        for loudness in [0.9, 1.0, 0.05, 0.95] {
            assert!(!d.check(loudness, false));
        }
    }

    #[test]
    fn threshold_is_live_tunable() {
        let tuning = Arc::new(LiveTuning::default());
        tuning.set_barge_in_threshold(0.5);
        let mut d = BargeInDetector::new(tuning.clone());
        assert!(!d.check(0.3, true));
        tuning.set_barge_in_threshold(0.2);
        assert!(d.check(0.3, true));
    }
}
