//! Duplex I/O: playback and capture through a single streaming callback.
//!
//! ```text
//! producer ──enqueue_playback(PCM16)──► output ring ──► DuplexCallback::process ──► speaker
//!                                                              │
//!                                      reference ring ◄────────┤ (try_lock, skipped if contended)
//!                                                              │
//! mic ──────────────────────────────────────────────────────────┘ gated? zeros : samples
//!                                                              ▼
//!                                  input ring ──► DuplexHandle::next_capture_block
//! ```
//!
//! `DuplexCallback::process` runs on the device thread. It never allocates,
//! never blocks and does a bounded amount of work per call. Gating uses the
//! same rule as [`crate::gate::Gate`]: closed while output is audible and
//! for `release_delay` after it stops. A manual playing override on the
//! shared [`PlaybackMonitor`] wins over the callback's own output state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    buffering::{
        block::{AudioBlock, BlockFormat},
        create_sample_ring, Consumer, Observer, Producer, SampleConsumer, SampleProducer,
    },
    engine::tuning::LiveTuning,
    playback::PlaybackMonitor,
};

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Ring sizes for a duplex pair, in samples.
#[derive(Debug, Clone, Copy)]
pub struct DuplexCapacities {
    pub output: usize,
    pub input: usize,
}

impl DuplexCapacities {
    /// Two seconds of output lead and one second of capture backlog.
    pub fn for_format(format: BlockFormat) -> Self {
        let rate = format.sample_rate as usize;
        Self {
            output: rate * 2,
            input: rate.max(format.block_len * 4),
        }
    }
}

#[derive(Debug, Default)]
struct DuplexShared {
    muted: AtomicBool,
    ended: AtomicBool,
    gated: AtomicBool,
    output_active: AtomicBool,
    underruns: AtomicU64,
    gated_samples: AtomicU64,
    dropped_input: AtomicU64,
    dropped_output: AtomicU64,
    reference_skips: AtomicU64,
}

/// Counters for operators and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DuplexStats {
    pub underruns: u64,
    pub gated_samples: u64,
    pub dropped_input: u64,
    pub dropped_output: u64,
    pub reference_skips: u64,
    pub queued_output: usize,
}

/// Create the producer-side handle and the device-side callback.
pub fn duplex_pair(
    format: BlockFormat,
    tuning: Arc<LiveTuning>,
    monitor: PlaybackMonitor,
    capacities: DuplexCapacities,
) -> (DuplexHandle, DuplexCallback) {
    let (output_prod, output_cons) = create_sample_ring(capacities.output);
    let (input_prod, input_cons) = create_sample_ring(capacities.input.max(format.block_len));
    let shared = Arc::new(DuplexShared::default());

    let handle = DuplexHandle {
        format,
        output: output_prod,
        input: input_cons,
        carry: None,
        shared: Arc::clone(&shared),
    };
    let callback = DuplexCallback {
        format,
        output: output_cons,
        input: input_prod,
        tuning,
        monitor,
        shared,
        samples_since_output: None,
    };
    (handle, callback)
}

/// Producer/consumer side, owned by the host's audio task.
pub struct DuplexHandle {
    format: BlockFormat,
    output: SampleProducer,
    input: SampleConsumer,
    /// Low byte of a sample split across two `enqueue_playback` calls.
    carry: Option<u8>,
    shared: Arc<DuplexShared>,
}

impl DuplexHandle {
    /// Queue PCM16 LE mono bytes for output. Returns the number of samples
    /// accepted; the rest are dropped when the ring is full.
    pub fn enqueue_playback(&mut self, bytes: &[u8]) -> usize {
        self.shared.ended.store(false, Ordering::Release);

        let mut bytes = bytes;
        let mut offered = 0usize;
        let mut accepted = 0usize;

        if let Some(lo) = self.carry.take() {
            match bytes.split_first() {
                Some((&hi, rest)) => {
                    offered += 1;
                    if self.output.try_push(pcm16_sample(lo, hi)).is_ok() {
                        accepted += 1;
                    }
                    bytes = rest;
                }
                None => {
                    self.carry = Some(lo);
                    return 0;
                }
            }
        }

        let mut pairs = bytes.chunks_exact(2);
        offered += bytes.len() / 2;
        accepted += self
            .output
            .push_iter(pairs.by_ref().map(|p| pcm16_sample(p[0], p[1])));
        self.carry = pairs.remainder().first().copied();

        let dropped = offered - accepted;
        if dropped > 0 {
            self.shared
                .dropped_output
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        accepted
    }

    /// The producer has nothing more to send; the coming drain is not an underrun.
    pub fn signal_end(&mut self) {
        self.carry = None;
        self.shared.ended.store(true, Ordering::Release);
    }

    /// Next fixed-size capture block, or `None` if none arrived within `timeout`.
    pub fn next_capture_block(&mut self, timeout: Duration) -> Option<AudioBlock> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.input.occupied_len() >= self.format.block_len {
                let mut samples = vec![0.0f32; self.format.block_len];
                let n = self.input.pop_slice(&mut samples);
                samples.truncate(n);
                return Some(AudioBlock::new(samples, self.format.sample_rate));
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Mute the microphone path regardless of output activity.
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Release);
    }

    /// Gate decision taken by the most recent callback.
    pub fn is_gated(&self) -> bool {
        self.shared.gated.load(Ordering::Acquire)
    }

    pub fn is_output_active(&self) -> bool {
        self.shared.output_active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DuplexStats {
        let s = &self.shared;
        DuplexStats {
            underruns: s.underruns.load(Ordering::Relaxed),
            gated_samples: s.gated_samples.load(Ordering::Relaxed),
            dropped_input: s.dropped_input.load(Ordering::Relaxed),
            dropped_output: s.dropped_output.load(Ordering::Relaxed),
            reference_skips: s.reference_skips.load(Ordering::Relaxed),
            queued_output: self.output.occupied_len(),
        }
    }
}

fn pcm16_sample(lo: u8, hi: u8) -> f32 {
    i16::from_le_bytes([lo, hi]) as f32 / 32768.0
}

/// Device side. Move this into the audio callback.
pub struct DuplexCallback {
    format: BlockFormat,
    output: SampleConsumer,
    input: SampleProducer,
    tuning: Arc<LiveTuning>,
    monitor: PlaybackMonitor,
    shared: Arc<DuplexShared>,
    /// Samples rendered since output was last audible; `None` before any output.
    samples_since_output: Option<u64>,
}

impl DuplexCallback {
    /// One device cycle: render `output`, then gate and queue `input`.
    ///
    /// `input` and `output` are mono at the pipeline rate and need not be the
    /// same length.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        self.render(output);
        self.capture(input);
    }

    fn render(&mut self, output: &mut [f32]) {
        let popped = self.output.pop_slice(output);
        output[popped..].fill(0.0);

        let active = popped > 0;
        if active {
            self.samples_since_output = Some((output.len() - popped) as u64);
        } else if let Some(since) = self.samples_since_output.as_mut() {
            *since = since.saturating_add(output.len() as u64);
        }
        if popped < output.len()
            && self.shared.output_active.load(Ordering::Relaxed)
            && !self.shared.ended.load(Ordering::Acquire)
        {
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.output_active.store(active, Ordering::Release);

        if !output.is_empty() && !self.monitor.try_write_reference(output) {
            self.shared.reference_skips.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn capture(&mut self, input: &[f32]) {
        let gated = self.should_gate();
        self.shared.gated.store(gated, Ordering::Release);

        let pushed = if gated {
            self.shared
                .gated_samples
                .fetch_add(input.len() as u64, Ordering::Relaxed);
            self.input
                .push_iter(std::iter::repeat(0.0f32).take(input.len()))
        } else {
            self.input.push_slice(input)
        };
        let dropped = input.len() - pushed;
        if dropped > 0 {
            self.shared
                .dropped_input
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }

    fn should_gate(&mut self) -> bool {
        let muted = self.shared.muted.load(Ordering::Acquire);
        match self.monitor.override_hint() {
            Some(true) => {
                // Release delay runs from the end of the override.
                self.samples_since_output = Some(0);
                return true;
            }
            Some(false) => return muted,
            None => {}
        }
        if muted || self.shared.output_active.load(Ordering::Relaxed) {
            return true;
        }
        match self.samples_since_output {
            Some(since) => {
                let release = self.tuning.release_delay().as_secs_f64()
                    * self.format.sample_rate as f64;
                (since as f64) < release
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::block::f32_to_pcm16le;
    use crate::playback::PlaybackStatus;

    const RATE: u32 = 16_000;
    const BLOCK: usize = 160;

    fn pair(release_ms: u64) -> (DuplexHandle, DuplexCallback, PlaybackMonitor) {
        let format = BlockFormat::new(RATE, BLOCK);
        let tuning = Arc::new(LiveTuning::default());
        tuning.set_release_delay(Duration::from_millis(release_ms));
        let monitor = PlaybackMonitor::new(RATE, 500, 1e-3);
        let (handle, callback) = duplex_pair(
            format,
            tuning,
            monitor.clone(),
            DuplexCapacities::for_format(format),
        );
        (handle, callback, monitor)
    }

    #[test]
    fn odd_byte_is_carried_to_the_next_enqueue() {
        let (mut handle, _cb, _) = pair(0);
        let bytes = f32_to_pcm16le(&[0.5, -0.25]);
        assert_eq!(handle.enqueue_playback(&bytes[..3]), 1);
        assert_eq!(handle.enqueue_playback(&bytes[3..]), 1);
        assert_eq!(handle.stats().queued_output, 2);
    }

    #[test]
    fn underrun_is_padded_with_silence_and_counted() {
        let (mut handle, mut cb, _) = pair(0);
        handle.enqueue_playback(&f32_to_pcm16le(&[0.5; 100]));

        let mut out = [1.0f32; BLOCK];
        cb.process(&[0.0; BLOCK], &mut out);
        assert!(out[..100].iter().all(|&s| (s - 0.5).abs() < 1e-3));
        assert!(out[100..].iter().all(|&s| s == 0.0));

        // Output was active and no end was signalled.
        cb.process(&[0.0; BLOCK], &mut out);
        assert_eq!(handle.stats().underruns, 1);
    }

    #[test]
    fn signalled_end_is_not_an_underrun() {
        let (mut handle, mut cb, _) = pair(0);
        handle.enqueue_playback(&f32_to_pcm16le(&[0.5; 50]));
        handle.signal_end();
        let mut out = [0.0f32; BLOCK];
        cb.process(&[0.0; BLOCK], &mut out);
        cb.process(&[0.0; BLOCK], &mut out);
        assert_eq!(handle.stats().underruns, 0);
    }

    #[test]
    fn capture_is_gated_while_output_plays_and_for_the_release_delay() {
        // 20 ms release = 320 samples = 2 blocks.
        let (mut handle, mut cb, monitor) = pair(20);
        let mut out = [0.0f32; BLOCK];
        let mic = [0.3f32; BLOCK];

        cb.process(&mic, &mut out);
        assert!(!handle.is_gated());

        handle.enqueue_playback(&f32_to_pcm16le(&[0.5; BLOCK]));
        cb.process(&mic, &mut out);
        assert!(handle.is_gated());
        assert!(monitor.is_playing());

        cb.process(&mic, &mut out); // 160 samples since output
        assert!(handle.is_gated());
        cb.process(&mic, &mut out); // 320
        assert!(!handle.is_gated());
        assert!(!monitor.is_playing());

        let first = handle.next_capture_block(Duration::ZERO).unwrap();
        assert!(first.samples.iter().all(|&s| s == 0.3));
        let gated = handle.next_capture_block(Duration::ZERO).unwrap();
        assert!(gated.samples.iter().all(|&s| s == 0.0));
        assert_eq!(handle.stats().gated_samples, 2 * BLOCK as u64);
    }

    #[test]
    fn mute_gates_without_output() {
        let (mut handle, mut cb, _) = pair(0);
        handle.set_muted(true);
        let mut out = [0.0f32; BLOCK];
        cb.process(&[0.3; BLOCK], &mut out);
        assert!(handle.is_gated());
        let block = handle.next_capture_block(Duration::ZERO).unwrap();
        assert_eq!(block.rms(), 0.0);
    }

    #[test]
    fn manual_playing_override_gates_capture() {
        // 20 ms release = 2 blocks of 160.
        let (mut handle, mut cb, monitor) = pair(20);
        let mut out = [0.0f32; BLOCK];
        let mic = [0.3f32; BLOCK];

        monitor.set_playing_state(true);
        cb.process(&mic, &mut out);
        assert!(handle.is_gated());
        let block = handle.next_capture_block(Duration::ZERO).unwrap();
        assert_eq!(block.rms(), 0.0);

        monitor.clear_playing_override();
        cb.process(&mic, &mut out); // 160 samples since the override
        assert!(handle.is_gated());
        cb.process(&mic, &mut out); // 320
        assert!(!handle.is_gated());
    }

    #[test]
    fn override_off_beats_audible_output() {
        let (mut handle, mut cb, monitor) = pair(0);
        monitor.set_playing_state(false);
        handle.enqueue_playback(&f32_to_pcm16le(&[0.5; BLOCK]));
        let mut out = [0.0f32; BLOCK];
        cb.process(&[0.3; BLOCK], &mut out);
        assert!(handle.is_output_active());
        assert!(!handle.is_gated());

        handle.set_muted(true);
        cb.process(&[0.3; BLOCK], &mut out);
        assert!(handle.is_gated(), "mute still applies");
    }

    #[test]
    fn next_capture_block_times_out_on_partial_input() {
        let (mut handle, mut cb, _) = pair(0);
        let mut out = [0.0f32; 10];
        cb.process(&[0.1; 10], &mut out);
        assert!(handle
            .next_capture_block(Duration::from_millis(5))
            .is_none());
    }
}
