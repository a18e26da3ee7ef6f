//! Blocking capture loop.
//!
//! ## Per block
//!
//! ```text
//! 1. Apply pending operator gate commands
//! 2. Read one block (short timeout so a stop request is observed)
//! 3. Gate → Forwarded | Silenced | Gated
//! 4. Barge-in check on the raw loudness
//! 5. Gate closed this block while speech active → end the utterance
//! 6. VAD on blocks that reach it → on_speech_start / on_speech_end
//! 7. Activity event + diagnostics
//! ```
//!
//! Device failures abort the current stream, release it, and retry with
//! exponential backoff up to the ceiling, after which the loop exits with
//! status `Unavailable`. Nothing in here panics across the thread boundary.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{process::RestartPolicy, BlockReader, CaptureDevice},
    buffering::block::{AudioBlock, BlockFormat},
    engine::diagnostics::StatusReporter,
    error::ParleyError,
    gate::{barge_in::BargeInDetector, Gate, GateCommand},
    ipc::{
        events::{AudioActivityEvent, Component, LoopStatus},
        listener::SpeechListener,
    },
    vad::{SpeechDetector, SpeechEvent},
};

/// Log a level line every this many blocks.
const LEVEL_LOG_EVERY: u64 = 50;
/// Backoff sleeps are split into slices this long to observe the stop flag.
const BACKOFF_SLICE: Duration = Duration::from_millis(20);

/// Everything the capture thread owns, passed as one struct so the closure stays tidy.
pub struct CaptureContext {
    pub format: BlockFormat,
    pub read_timeout: Duration,
    pub policy: RestartPolicy,
    pub gate: Gate,
    pub barge_in: BargeInDetector,
    pub vad: SpeechDetector,
    pub listener: Arc<dyn SpeechListener>,
    pub commands: Receiver<GateCommand>,
    pub running: Arc<AtomicBool>,
    pub reporter: StatusReporter,
    pub activity_tx: broadcast::Sender<AudioActivityEvent>,
    seq: u64,
}

impl CaptureContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        format: BlockFormat,
        read_timeout: Duration,
        policy: RestartPolicy,
        gate: Gate,
        barge_in: BargeInDetector,
        vad: SpeechDetector,
        listener: Arc<dyn SpeechListener>,
        commands: Receiver<GateCommand>,
        running: Arc<AtomicBool>,
        reporter: StatusReporter,
        activity_tx: broadcast::Sender<AudioActivityEvent>,
    ) -> Self {
        Self {
            format,
            read_timeout,
            policy,
            gate,
            barge_in,
            vad,
            listener,
            commands,
            running,
            reporter,
            activity_tx,
            seq: 0,
        }
    }

    /// Invoke a listener callback; a panicking listener is logged and the loop keeps going.
    fn notify(&self, event: &'static str, callback: impl FnOnce(&dyn SpeechListener)) {
        let listener = self.listener.as_ref();
        if catch_unwind(AssertUnwindSafe(|| callback(listener))).is_err() {
            error!(event, "speech listener panicked");
        }
    }

    fn apply_commands(&mut self) {
        for command in self.commands.try_iter() {
            debug!(?command, "gate command");
            self.gate.apply(command);
        }
    }

    /// Run one captured block through gate, barge-in and VAD.
    pub fn handle_block(&mut self, block: AudioBlock) {
        self.handle_block_at(block, Instant::now());
    }

    /// [`handle_block`](Self::handle_block) with an explicit arrival time.
    pub fn handle_block_at(&mut self, block: AudioBlock, now: Instant) {
        self.apply_commands();
        let diagnostics = &self.reporter.diagnostics;
        diagnostics.blocks_in.fetch_add(1, Ordering::Relaxed);

        let was_closed = self.gate.is_closed();
        let processed = match self.gate.process_at(block, now) {
            Ok(processed) => processed,
            Err(e) => {
                diagnostics.rejected_blocks.fetch_add(1, Ordering::Relaxed);
                warn!("capture block rejected: {e}");
                return;
            }
        };
        let gate_closed = self.gate.is_closed();

        if self.barge_in.check(processed.rms, gate_closed) {
            diagnostics.barge_ins.fetch_add(1, Ordering::Relaxed);
            self.notify("barge_in", |l| l.on_barge_in());
        }

        if gate_closed && !was_closed {
            // Playback started over the user; the utterance cannot continue.
            if let Some(SpeechEvent::End) = self.vad.interrupt() {
                self.notify("speech_end", |l| l.on_speech_end());
            }
        }

        if processed.reaches_vad() {
            match self.vad.process(&processed.block) {
                Some(SpeechEvent::Start) => self.notify("speech_start", |l| l.on_speech_start()),
                Some(SpeechEvent::End) => self.notify("speech_end", |l| l.on_speech_end()),
                None => {}
            }
        }

        let is_speech = self.vad.is_active();
        diagnostics.current_rms.store(processed.rms);
        diagnostics.gate_closed.store(gate_closed, Ordering::Relaxed);
        diagnostics.speech_active.store(is_speech, Ordering::Relaxed);
        diagnostics
            .gated_samples
            .store(self.gate.gated_samples(), Ordering::Relaxed);
        diagnostics
            .ungated_samples
            .store(self.gate.ungated_samples(), Ordering::Relaxed);

        let _ = self.activity_tx.send(AudioActivityEvent {
            seq: self.seq,
            rms: processed.rms,
            gate_closed,
            is_speech,
        });
        self.seq = self.seq.saturating_add(1);

        if self.seq % LEVEL_LOG_EVERY == 0 {
            debug!(
                rms = format_args!("{:.4}", processed.rms),
                gate = ?self.gate.state(),
                speech = is_speech,
                probability = format_args!("{:.2}", self.vad.last_probability()),
                "audio level check"
            );
        }
    }

    fn sleep_backoff(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(BACKOFF_SLICE));
        }
    }

    /// Record a failure; returns `false` once retries are exhausted.
    fn backoff_after(&mut self, failures: u32, device: &str, error: &ParleyError) -> bool {
        self.reporter
            .diagnostics
            .capture_failures
            .fetch_add(1, Ordering::Relaxed);
        match self.policy.next_delay(failures) {
            Some(delay) => {
                self.reporter.report(
                    Component::Capture,
                    LoopStatus::Failed,
                    Some(format!("{device}: {error} (retry {failures} in {delay:?})")),
                );
                self.sleep_backoff(delay);
                true
            }
            None => {
                self.reporter.report(
                    Component::Capture,
                    LoopStatus::Unavailable,
                    Some(format!(
                        "{device}: {error}; giving up after {} retries",
                        self.policy.max_retries()
                    )),
                );
                false
            }
        }
    }
}

/// Reports `Failed` if the capture thread unwinds, so status never claims `Running` for a dead loop.
struct PanicGuard(StatusReporter);

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.report(
                Component::Capture,
                LoopStatus::Failed,
                Some("capture thread panicked".into()),
            );
        }
    }
}

/// Run the capture loop until `ctx.running` goes false or retries run out.
pub fn run(mut ctx: CaptureContext, mut device: Box<dyn CaptureDevice>) {
    let _guard = PanicGuard(ctx.reporter.clone());
    info!(device = device.name(), vad = ctx.vad.backend_name(), "capture loop started");
    ctx.reporter
        .diagnostics
        .set_vad_backend(ctx.vad.backend_name());

    let mut failures = 0u32;

    'outer: while ctx.running.load(Ordering::SeqCst) {
        ctx.reporter
            .report(Component::Capture, LoopStatus::Starting, None);
        let mut reader: Box<dyn BlockReader> = match device.open(ctx.format) {
            Ok(reader) => reader,
            Err(e) => {
                failures += 1;
                if !ctx.backoff_after(failures, device.name(), &e) {
                    break;
                }
                continue;
            }
        };
        ctx.reporter
            .report(Component::Capture, LoopStatus::Running, None);

        while ctx.running.load(Ordering::SeqCst) {
            match reader.read_block(ctx.read_timeout) {
                Ok(Some(block)) => {
                    failures = 0;
                    ctx.handle_block(block);
                }
                Ok(None) => ctx.apply_commands(),
                Err(e) => {
                    // Release the stream before backing off.
                    drop(reader);
                    failures += 1;
                    if !ctx.backoff_after(failures, device.name(), &e) {
                        break 'outer;
                    }
                    continue 'outer;
                }
            }
        }
    }

    if let Some(SpeechEvent::End) = ctx.vad.interrupt() {
        ctx.notify("speech_end", |l| l.on_speech_end());
    }
    let snap = ctx.reporter.diagnostics.snapshot();
    info!(
        blocks_in = snap.blocks_in,
        rejected = snap.rejected_blocks,
        gated_samples = snap.gated_samples,
        ungated_samples = snap.ungated_samples,
        barge_ins = snap.barge_ins,
        failures = snap.capture_failures,
        "capture loop stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{RetryConfig, VadConfig},
        engine::tuning::LiveTuning,
        playback::monitor::PlaybackMonitor,
        vad::{LoudnessVad, VadBackend},
    };
    use crossbeam_channel::unbounded;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl SpeechListener for Recorder {
        fn on_speech_start(&self) {
            self.0.lock().push("start");
        }
        fn on_speech_end(&self) {
            self.0.lock().push("end");
        }
        fn on_barge_in(&self) {
            self.0.lock().push("barge-in");
        }
    }

    struct Fixture {
        ctx: CaptureContext,
        monitor: PlaybackMonitor,
        events: Arc<Recorder>,
        commands: crossbeam_channel::Sender<GateCommand>,
    }

    fn fixture() -> Fixture {
        let format = BlockFormat::new(16_000, 320);
        let tuning = Arc::new(LiveTuning::default());
        tuning.set_release_delay(Duration::from_millis(100));
        tuning.set_barge_in_threshold(0.3);
        let monitor = PlaybackMonitor::new(16_000, 200, 1e-4);
        let gate = Gate::new(format, Arc::new(monitor.clone()), Arc::clone(&tuning));
        let vad = SpeechDetector::new(
            VadBackend::Fallback(LoudnessVad::new(VadConfig::default().reference_rms)),
            Arc::clone(&tuning),
            Duration::from_millis(40),
            Duration::from_millis(40),
        );
        let events = Arc::new(Recorder::default());
        let (commands, rx) = unbounded();
        let (activity_tx, _) = broadcast::channel(16);
        let ctx = CaptureContext::new(
            format,
            Duration::from_millis(10),
            RestartPolicy::new(RetryConfig::default()),
            gate,
            BargeInDetector::new(Arc::clone(&tuning)),
            vad,
            events.clone(),
            rx,
            Arc::new(AtomicBool::new(true)),
            StatusReporter::detached(),
            activity_tx,
        );
        Fixture {
            ctx,
            monitor,
            events,
            commands,
        }
    }

    fn loud() -> AudioBlock {
        AudioBlock::new(vec![0.5; 320], 16_000)
    }

    #[test]
    fn speech_then_playback_interrupts_utterance() {
        let mut f = fixture();
        let t0 = Instant::now();
        for i in 0..3 {
            f.ctx.handle_block_at(loud(), t0 + Duration::from_millis(20 * i));
        }
        assert_eq!(*f.events.0.lock(), vec!["start"]);

        f.monitor.set_playing_state(true);
        f.ctx.handle_block_at(loud(), t0 + Duration::from_millis(60));
        assert_eq!(*f.events.0.lock(), vec!["start", "barge-in", "end"]);
        assert!(f.ctx.gate.is_closed());
        assert!(!f.ctx.vad.is_active());
    }

    #[test]
    fn gated_blocks_never_reach_vad() {
        let mut f = fixture();
        f.monitor.set_playing_state(true);
        let t0 = Instant::now();
        for i in 0..10 {
            f.ctx.handle_block_at(loud(), t0 + Duration::from_millis(20 * i));
        }
        // One barge-in for the whole loud interval, no speech.
        assert_eq!(*f.events.0.lock(), vec!["barge-in"]);
        assert_eq!(f.ctx.gate.gated_samples(), 3_200);
    }

    #[test]
    fn operator_commands_apply_before_the_next_block() {
        let mut f = fixture();
        f.commands.send(GateCommand::ForceClose).unwrap();
        f.ctx.handle_block_at(AudioBlock::silent(320, 16_000), Instant::now());
        assert!(f.ctx.gate.is_closed());
        assert!(f.ctx.reporter.diagnostics.gate_closed.load(Ordering::Relaxed));
    }

    struct PanickingListener;

    impl SpeechListener for PanickingListener {
        fn on_speech_start(&self) {
            panic!("listener bug");
        }
        fn on_speech_end(&self) {}
        fn on_barge_in(&self) {}
    }

    #[test]
    fn panicking_listener_does_not_stop_block_processing() {
        let mut f = fixture();
        f.ctx.listener = Arc::new(PanickingListener);
        let t0 = Instant::now();
        for i in 0..5 {
            f.ctx.handle_block_at(loud(), t0 + Duration::from_millis(20 * i));
        }
        assert!(f.ctx.vad.is_active());
        assert_eq!(
            f.ctx.reporter.diagnostics.blocks_in.load(Ordering::Relaxed),
            5
        );
    }

    #[test]
    fn unwinding_capture_thread_reports_failed() {
        let reporter = StatusReporter::detached();
        reporter.report(Component::Capture, LoopStatus::Running, None);
        let guard_reporter = reporter.clone();
        let joined = std::thread::spawn(move || {
            let _guard = PanicGuard(guard_reporter);
            panic!("capture bug");
        })
        .join();
        assert!(joined.is_err());
        assert_eq!(reporter.status(Component::Capture), LoopStatus::Failed);
    }

    #[test]
    fn mismatched_block_is_counted_and_dropped() {
        let mut f = fixture();
        f.ctx.handle_block(AudioBlock::new(vec![0.0; 100], 16_000));
        let snap = f.ctx.reporter.diagnostics.snapshot();
        assert_eq!(snap.rejected_blocks, 1);
        assert_eq!(f.ctx.gate.ungated_samples(), 0);
    }
}
