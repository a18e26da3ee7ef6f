//! Playback engine: FIFO of sound requests played on a dedicated thread.
//!
//! ## Volume ordering
//!
//! ```text
//! start()  → volume ramped to 0, then the worker spawns
//! first block of the first sound written → volume ramped to the restore level
//! stop()   → worker joined, volume ramped to 0
//! ```
//!
//! Every block is written to the reference ring *before* it is handed to the
//! device, so the gate sees playback no later than the speaker does.

pub mod monitor;
pub mod source;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    audio::{process::RestartPolicy, volume::VolumeControl, volume::VolumeRamp, PlaybackDevice, SampleWriter},
    buffering::block::BlockFormat,
    config::{CoreConfig, PlaybackConfig},
    engine::{diagnostics::StatusReporter, worker::WorkerHandle},
    error::{ParleyError, Result},
    ipc::events::{Component, LoopStatus},
};

pub use monitor::{PlaybackMonitor, PlaybackStatus};
pub use source::SoundSource;

/// How long the idle worker blocks on its queues before re-checking the stop flag.
const IDLE_POLL: Duration = Duration::from_millis(50);
/// Blocks the writer may run ahead of real time.
const MAX_LEAD_BLOCKS: u32 = 2;

/// One pending sound.
#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    pub source: SoundSource,
    /// Target RMS; non-positive plays the source unchanged.
    pub target_loudness: f32,
}

struct BlockingRequest {
    request: PlaybackRequest,
    reply: Sender<Result<()>>,
}

struct Shared {
    format: BlockFormat,
    config: PlaybackConfig,
    policy: RestartPolicy,
    shutdown_timeout: Duration,
    monitor: PlaybackMonitor,
    volume: VolumeRamp,
    reporter: StatusReporter,
    running: Arc<AtomicBool>,
    stopped: AtomicBool,
    first_sound: AtomicBool,
    ramp_thread: Mutex<Option<JoinHandle<()>>>,
    queue_tx: Sender<PlaybackRequest>,
    queue_rx: Receiver<PlaybackRequest>,
    priority_tx: Sender<BlockingRequest>,
    priority_rx: Receiver<BlockingRequest>,
}

pub struct PlaybackEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl PlaybackEngine {
    pub fn new(
        config: &CoreConfig,
        monitor: PlaybackMonitor,
        volume: Arc<dyn VolumeControl>,
        reporter: StatusReporter,
    ) -> Self {
        let playback = config.playback.clone();
        let (queue_tx, queue_rx) = bounded(playback.queue_capacity);
        let (priority_tx, priority_rx) = bounded(4);
        let ramp = VolumeRamp::new(
            volume,
            playback.volume_ramp_steps,
            Duration::from_millis(playback.volume_ramp_ms),
        );
        Self {
            shared: Arc::new(Shared {
                format: config.format,
                config: playback,
                policy: RestartPolicy::from(&config.retry),
                shutdown_timeout: config.shutdown_timeout(),
                monitor,
                volume: ramp,
                reporter,
                running: Arc::new(AtomicBool::new(false)),
                stopped: AtomicBool::new(false),
                first_sound: AtomicBool::new(false),
                ramp_thread: Mutex::new(None),
                queue_tx,
                queue_rx,
                priority_tx,
                priority_rx,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Open `device` and start the playback thread.
    ///
    /// # Errors
    /// `ParleyError::AlreadyRunning` if the worker is already up.
    pub fn start(&self, device: Box<dyn PlaybackDevice>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(ParleyError::AlreadyRunning);
        }

        self.shared.volume.ramp_to(0);
        self.shared.stopped.store(false, Ordering::SeqCst);
        self.shared.first_sound.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared
            .reporter
            .report(Component::Playback, LoopStatus::Starting, None);

        let shared = Arc::clone(&self.shared);
        let hook = device.force_stop_hook();
        *worker = Some(WorkerHandle::spawn(
            "parley-playback",
            Arc::clone(&self.shared.running),
            hook,
            move || run(shared, device),
        )?);
        info!("playback engine started");
        Ok(())
    }

    /// Queue a sound. Returns `false` only when the engine is stopped or the
    /// queue is full.
    pub fn enqueue(&self, source: SoundSource, target_loudness: f32) -> bool {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return false;
        }
        match self.shared.queue_tx.try_send(PlaybackRequest {
            source,
            target_loudness,
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                warn!(source = %request.source.describe(), "playback queue full; request dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Play `source` ahead of the queue and return once it has finished.
    pub fn play_blocking(&self, source: SoundSource, target_loudness: f32) -> Result<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(ParleyError::EngineStopped);
        }
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(ParleyError::NotRunning);
        }

        let (reply, done) = bounded(1);
        self.shared
            .priority_tx
            .send(BlockingRequest {
                request: PlaybackRequest {
                    source,
                    target_loudness,
                },
                reply,
            })
            .map_err(|_| ParleyError::EngineStopped)?;

        loop {
            match done.recv_timeout(IDLE_POLL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => return Err(ParleyError::EngineStopped),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.shared.running.load(Ordering::SeqCst) {
                        return Err(ParleyError::EngineStopped);
                    }
                    if self.status() == LoopStatus::Unavailable {
                        return Err(ParleyError::DeviceUnavailable("playback".into()));
                    }
                }
            }
        }
    }

    /// Drop every pending request without executing it. Returns how many were dropped.
    pub fn clear_queue(&self) -> usize {
        let dropped = self.shared.queue_rx.try_iter().count();
        if dropped > 0 {
            debug!(dropped, "playback queue cleared");
        }
        dropped
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue_rx.len()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.monitor.is_playing()
    }

    pub fn playback_loudness(&self) -> f32 {
        self.shared.monitor.playback_loudness()
    }

    /// Feed externally rendered audio (e.g. streamed TTS) into the reference ring.
    pub fn write_reference(&self, samples: &[f32]) {
        self.shared.monitor.write_reference(samples);
    }

    pub fn monitor(&self) -> &PlaybackMonitor {
        &self.shared.monitor
    }

    pub fn status(&self) -> LoopStatus {
        self.shared.reporter.status(Component::Playback)
    }

    /// Stop the worker, drop pending requests and ramp volume to 0.
    /// Idempotent. `enqueue` refuses until the next `start`.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(mut worker) = self.worker.lock().take() {
            worker.join_timeout(self.shared.shutdown_timeout);
        }
        if let Some(ramp) = self.shared.ramp_thread.lock().take() {
            let _ = ramp.join();
        }
        self.shared.volume.ramp_to(0);
        self.clear_queue();
        for pending in self.shared.priority_rx.try_iter() {
            let _ = pending.reply.send(Err(ParleyError::EngineStopped));
        }
        self.shared.monitor.mark_idle();
        self.shared
            .reporter
            .report(Component::Playback, LoopStatus::Stopped, None);
        info!("playback engine stopped");
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Job {
    Queued(PlaybackRequest),
    Blocking(BlockingRequest),
}

fn next_job(shared: &Shared) -> Option<Job> {
    if let Ok(blocking) = shared.priority_rx.try_recv() {
        return Some(Job::Blocking(blocking));
    }
    select! {
        recv(shared.priority_rx) -> msg => msg.ok().map(Job::Blocking),
        recv(shared.queue_rx) -> msg => msg.ok().map(Job::Queued),
        default(IDLE_POLL) => None,
    }
}

/// Sleep in short slices so a stop request is noticed during backoff.
fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(IDLE_POLL));
    }
}

fn run(shared: Arc<Shared>, mut device: Box<dyn PlaybackDevice>) {
    let reporter = &shared.reporter;
    let mut writer: Option<Box<dyn SampleWriter>> = None;
    let mut failures = 0u32;

    while shared.running.load(Ordering::SeqCst) {
        if writer.is_none() {
            match device.open(shared.format) {
                Ok(w) => {
                    info!(device = device.name(), "playback device open");
                    reporter.report(Component::Playback, LoopStatus::Running, None);
                    writer = Some(w);
                }
                Err(e) => {
                    failures += 1;
                    match shared.policy.next_delay(failures) {
                        Some(delay) => {
                            reporter.report(Component::Playback, LoopStatus::Failed, Some(e.to_string()));
                            sleep_while_running(&shared.running, delay);
                            continue;
                        }
                        None => {
                            reporter.report(
                                Component::Playback,
                                LoopStatus::Unavailable,
                                Some(format!("{} after {} retries: {e}", device.name(), failures - 1)),
                            );
                            break;
                        }
                    }
                }
            }
        }

        let Some(job) = next_job(&shared) else {
            continue;
        };
        let (request, reply) = match job {
            Job::Queued(request) => (request, None),
            Job::Blocking(blocking) => (blocking.request, Some(blocking.reply)),
        };

        let result = match prepare(&shared, &request) {
            Ok(samples) => {
                let Some(w) = writer.as_mut() else {
                    continue;
                };
                shared.reporter.diagnostics.playback_entries.fetch_add(1, Ordering::Relaxed);
                let played = play_samples(&shared, w.as_mut(), &samples);
                match &played {
                    Ok(()) => failures = 0,
                    Err(ParleyError::EntryTimedOut(budget)) => {
                        // The device stopped accepting audio in time; start the next entry on a fresh handle.
                        warn!(source = %request.source.describe(), ?budget, "playback entry timed out; abandoning");
                        shared.reporter.diagnostics.playback_timeouts.fetch_add(1, Ordering::Relaxed);
                        writer = None;
                    }
                    Err(ParleyError::EngineStopped) => {}
                    Err(e) => {
                        warn!(source = %request.source.describe(), "playback failed, reopening device: {e}");
                        shared.reporter.diagnostics.playback_failures.fetch_add(1, Ordering::Relaxed);
                        reporter.report(Component::Playback, LoopStatus::Failed, Some(e.to_string()));
                        writer = None;
                    }
                }
                played
            }
            Err(e) => {
                warn!(source = %request.source.describe(), "skipping sound: {e}");
                shared.reporter.diagnostics.playback_skipped.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    shared.monitor.mark_idle();
    debug!("playback loop exited");
}

fn prepare(shared: &Shared, request: &PlaybackRequest) -> Result<Vec<f32>> {
    let mut samples = request.source.load(shared.format.sample_rate)?;
    source::normalize_loudness(&mut samples, request.target_loudness);
    Ok(samples)
}

/// Time budget for one entry: its nominal duration plus a margin, capped.
pub fn entry_budget(config: &PlaybackConfig, samples: usize, sample_rate: u32) -> Duration {
    let nominal = Duration::from_secs_f64(samples as f64 / sample_rate.max(1) as f64);
    (nominal + Duration::from_millis(config.entry_timeout_margin_ms))
        .min(Duration::from_millis(config.max_entry_ms))
}

fn play_samples(shared: &Shared, writer: &mut dyn SampleWriter, samples: &[f32]) -> Result<()> {
    let budget = entry_budget(&shared.config, samples.len(), shared.format.sample_rate);
    let result = write_paced(shared, writer, samples, budget);
    shared.monitor.mark_idle();
    result
}

fn write_paced(
    shared: &Shared,
    writer: &mut dyn SampleWriter,
    samples: &[f32],
    budget: Duration,
) -> Result<()> {
    let format = shared.format;
    let started = Instant::now();
    let deadline = started + budget;
    let block_dur = Duration::from_secs_f64(format.block_secs());

    for (i, block) in samples.chunks(format.block_len).enumerate() {
        if !shared.running.load(Ordering::SeqCst) {
            debug!("stop requested mid-entry");
            return Err(ParleyError::EngineStopped);
        }
        if Instant::now() >= deadline {
            return Err(ParleyError::EntryTimedOut(budget));
        }

        shared.monitor.write_reference(block);
        writer
            .write(block, deadline)
            .map_err(|e| past_deadline(e, deadline, budget))?;
        if i == 0 {
            on_first_sound(shared);
        }

        // Stay at most MAX_LEAD_BLOCKS ahead of real time.
        let written_until = started + block_dur * (i as u32 + 1);
        if let Some(wake_at) = written_until.checked_sub(block_dur * MAX_LEAD_BLOCKS) {
            let now = Instant::now();
            if wake_at > now {
                std::thread::sleep(wake_at - now);
            }
        }
    }
    writer
        .drain(deadline)
        .map_err(|e| past_deadline(e, deadline, budget))
}

/// A writer that gave up at the entry deadline reports the timeout, not its own error.
fn past_deadline(e: ParleyError, deadline: Instant, budget: Duration) -> ParleyError {
    if Instant::now() >= deadline {
        ParleyError::EntryTimedOut(budget)
    } else {
        e
    }
}

fn on_first_sound(shared: &Shared) {
    if shared.first_sound.swap(true, Ordering::SeqCst) {
        return;
    }
    let ramp = shared.volume.clone();
    let target = shared.config.restore_volume_percent;
    match std::thread::Builder::new()
        .name("parley-volume".into())
        .spawn(move || ramp.ramp_to(target))
    {
        Ok(handle) => *shared.ramp_thread.lock() = Some(handle),
        Err(e) => warn!("failed to spawn volume ramp: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::volume::NoopVolume;

    fn engine(config: &CoreConfig) -> PlaybackEngine {
        let monitor = PlaybackMonitor::new(config.format.sample_rate, 200, 1e-4);
        PlaybackEngine::new(config, monitor, Arc::new(NoopVolume), StatusReporter::detached())
    }

    #[test]
    fn entry_budget_is_duration_plus_margin_capped() {
        let mut config = PlaybackConfig::default();
        config.entry_timeout_margin_ms = 500;
        config.max_entry_ms = 3_000;
        assert_eq!(entry_budget(&config, 16_000, 16_000), Duration::from_millis(1_500));
        assert_eq!(entry_budget(&config, 160_000, 16_000), Duration::from_millis(3_000));
    }

    #[test]
    fn enqueue_refused_after_stop() {
        let config = CoreConfig::default();
        let engine = engine(&config);
        assert!(engine.enqueue(SoundSource::samples(vec![0.1; 320], 16_000), 0.0));
        engine.stop();
        assert!(!engine.enqueue(SoundSource::samples(vec![0.1; 320], 16_000), 0.0));
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(engine.status(), LoopStatus::Stopped);
    }

    #[test]
    fn enqueue_refused_when_full() {
        let mut config = CoreConfig::default();
        config.playback.queue_capacity = 2;
        let engine = engine(&config);
        let sound = || SoundSource::samples(vec![0.1; 320], 16_000);
        assert!(engine.enqueue(sound(), 0.0));
        assert!(engine.enqueue(sound(), 0.0));
        assert!(!engine.enqueue(sound(), 0.0));
        assert_eq!(engine.clear_queue(), 2);
    }

    /// Accepts every block but takes `per_block` to do it.
    struct SlowWriter {
        per_block: Duration,
        fail_with: Option<&'static str>,
    }

    impl SampleWriter for SlowWriter {
        fn write(&mut self, _samples: &[f32], _deadline: Instant) -> Result<()> {
            std::thread::sleep(self.per_block);
            match self.fail_with {
                Some(message) => Err(ParleyError::AudioStream(message.into())),
                None => Ok(()),
            }
        }

        fn drain(&mut self, _deadline: Instant) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn entry_cut_off_at_its_budget_reports_timeout() {
        let config = CoreConfig::default();
        let engine = engine(&config);
        engine.shared.running.store(true, Ordering::SeqCst);
        let mut writer = SlowWriter {
            per_block: Duration::from_millis(30),
            fail_with: None,
        };
        let samples = vec![0.1; config.format.block_len * 20];

        let err = write_paced(&engine.shared, &mut writer, &samples, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, ParleyError::EntryTimedOut(b) if b == Duration::from_millis(100)));
    }

    #[test]
    fn writer_error_before_the_deadline_is_passed_through() {
        let config = CoreConfig::default();
        let engine = engine(&config);
        engine.shared.running.store(true, Ordering::SeqCst);
        let mut writer = SlowWriter {
            per_block: Duration::ZERO,
            fail_with: Some("device gone"),
        };
        let samples = vec![0.1; config.format.block_len];

        let err = write_paced(&engine.shared, &mut writer, &samples, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, ParleyError::AudioStream(_)));
    }

    #[test]
    fn play_blocking_requires_a_started_engine() {
        let config = CoreConfig::default();
        let engine = engine(&config);
        let err = engine
            .play_blocking(SoundSource::samples(vec![0.1; 320], 16_000), 0.0)
            .unwrap_err();
        assert!(matches!(err, ParleyError::NotRunning));
    }
}
