//! Reference ring buffer: the most recent playback samples, kept for echo awareness.
//!
//! Fixed capacity, pre-allocated, never grows. Writes past capacity evict the
//! oldest samples. Reads never block on writes because both happen under the
//! single playback-state lock for the duration of one call only.

/// Ring of recently played-back mono samples.
#[derive(Debug, Clone)]
pub struct ReferenceRing {
    buffer: Box<[f32]>,
    /// Next slot to write.
    write_pos: usize,
    /// Number of valid samples (saturates at capacity).
    filled: usize,
    sample_rate: u32,
}

impl ReferenceRing {
    /// Ring sized for `window_ms` of audio at `sample_rate`.
    pub fn with_window(sample_rate: u32, window_ms: u64) -> Self {
        let capacity = (sample_rate as u64 * window_ms / 1000).max(1) as usize;
        Self::with_capacity(capacity, sample_rate)
    }

    pub fn with_capacity(capacity: usize, sample_rate: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: vec![0.0f32; capacity].into_boxed_slice(),
            write_pos: 0,
            filled: 0,
            sample_rate,
        }
    }

    /// Append samples, evicting oldest-first once full.
    pub fn write(&mut self, samples: &[f32]) {
        let cap = self.buffer.len();
        // Only the newest `cap` samples can survive.
        let samples = if samples.len() > cap {
            &samples[samples.len() - cap..]
        } else {
            samples
        };

        let first = (cap - self.write_pos).min(samples.len());
        self.buffer[self.write_pos..self.write_pos + first].copy_from_slice(&samples[..first]);
        let rest = samples.len() - first;
        if rest > 0 {
            self.buffer[..rest].copy_from_slice(&samples[first..]);
        }

        self.write_pos = (self.write_pos + samples.len()) % cap;
        self.filled = (self.filled + samples.len()).min(cap);
    }

    /// Fill `out` with the most recent `out.len()` samples, oldest first.
    ///
    /// When fewer samples are available than requested the front of `out` is
    /// zero-padded. Allocation-free.
    pub fn lookback_into(&self, out: &mut [f32]) {
        let cap = self.buffer.len();
        let want = out.len();
        let have = want.min(self.filled);
        let pad = want - have;

        out[..pad].iter_mut().for_each(|s| *s = 0.0);

        let start = (self.write_pos + cap - have) % cap;
        for (i, slot) in out[pad..].iter_mut().enumerate() {
            *slot = self.buffer[(start + i) % cap];
        }
    }

    /// The most recent `n` samples, oldest first, left-padded with zeros.
    pub fn lookback(&self, n: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; n];
        self.lookback_into(&mut out);
        out
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of valid samples currently held.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Forget all history.
    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.filled = 0;
    }
}
