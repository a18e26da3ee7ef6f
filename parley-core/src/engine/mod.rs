//! `AudioCore`, the top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! AudioCore::new()
//!     └─► start()   → VAD negotiated, playback worker + capture worker spawned
//!         └─► stop() → both workers joined (with timeout), volume ramped to 0
//! ```
//!
//! `start()`/`stop()` return an error when called in the wrong state rather
//! than panicking.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send`. Devices are moved into their worker thread
//! unopened and opened there, so no stream ever crosses a thread boundary.
//! The only shared mutable state between the two workers is the
//! `PlaybackMonitor`.

pub mod diagnostics;
pub mod tuning;
pub mod worker;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    audio::{
        process::{ProcessCaptureDevice, ProcessPlaybackDevice, RestartPolicy},
        volume::{AmixerVolume, NoopVolume, VolumeControl},
        CaptureDevice, PlaybackDevice,
    },
    capture::{self, CaptureContext},
    config::{CoreConfig, DeviceBackend},
    error::{ParleyError, Result},
    gate::{barge_in::BargeInDetector, Gate, GateCommand, GateState},
    ipc::{
        events::{AudioActivityEvent, Component, CoreStatusEvent, LoopStatus},
        listener::SpeechListener,
    },
    playback::{PlaybackEngine, PlaybackMonitor},
    vad::{SpeechDetector, VadBackend},
};

use diagnostics::{CoreDiagnostics, DiagnosticsSnapshot, StatusReporter, BROADCAST_CAP};
use tuning::LiveTuning;
use worker::WorkerHandle;

/// The top-level handle.
///
/// `AudioCore` is `Send + Sync`; wrap it in an `Arc` to share it between the
/// host's threads. Construct exactly one per device.
pub struct AudioCore {
    config: CoreConfig,
    tuning: Arc<LiveTuning>,
    monitor: PlaybackMonitor,
    playback: PlaybackEngine,
    listener: Arc<dyn SpeechListener>,
    reporter: StatusReporter,
    activity_tx: broadcast::Sender<AudioActivityEvent>,
    gate_tx: Sender<GateCommand>,
    gate_rx: Receiver<GateCommand>,
    /// `true` while the capture worker should keep going.
    capture_running: Arc<AtomicBool>,
    capture_worker: Mutex<Option<WorkerHandle>>,
}

impl AudioCore {
    /// Build a core; volume goes through `amixer` when a mixer control is configured.
    pub fn new(config: CoreConfig, listener: Arc<dyn SpeechListener>) -> Self {
        let volume: Arc<dyn VolumeControl> = match &config.playback.mixer_control {
            Some(control) => Arc::new(AmixerVolume::new(control.clone())),
            None => Arc::new(NoopVolume),
        };
        Self::with_volume(config, listener, volume)
    }

    pub fn with_volume(
        mut config: CoreConfig,
        listener: Arc<dyn SpeechListener>,
        volume: Arc<dyn VolumeControl>,
    ) -> Self {
        config.normalize();

        let (status_tx, _) = broadcast::channel::<CoreStatusEvent>(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        let reporter = StatusReporter::new(Arc::new(CoreDiagnostics::default()), status_tx);
        let tuning = Arc::new(LiveTuning::from_config(&config));
        let monitor = PlaybackMonitor::new(
            config.format.sample_rate,
            config.reference_window_ms,
            config.playback.playing_epsilon,
        );
        let playback = PlaybackEngine::new(&config, monitor.clone(), volume, reporter.clone());
        let (gate_tx, gate_rx) = unbounded();

        Self {
            config,
            tuning,
            monitor,
            playback,
            listener,
            reporter,
            activity_tx,
            gate_tx,
            gate_rx,
            capture_running: Arc::new(AtomicBool::new(false)),
            capture_worker: Mutex::new(None),
        }
    }

    /// Start with devices chosen by `config.devices`.
    pub fn start_from_config(&self) -> Result<()> {
        let (capture, playback) = devices_from_config(&self.config)?;
        self.start(capture, playback)
    }

    /// Negotiate the VAD backend, then start playback and capture.
    pub fn start(
        &self,
        capture: Box<dyn CaptureDevice>,
        playback: Box<dyn PlaybackDevice>,
    ) -> Result<()> {
        let backend = VadBackend::negotiate(&self.config.vad, self.config.format.sample_rate);
        self.start_with_backend(capture, playback, backend)
    }

    /// Start with an already negotiated VAD backend.
    ///
    /// # Errors
    /// `ParleyError::AlreadyRunning` if started twice.
    pub fn start_with_backend(
        &self,
        capture: Box<dyn CaptureDevice>,
        playback: Box<dyn PlaybackDevice>,
        backend: VadBackend,
    ) -> Result<()> {
        let mut worker = self.capture_worker.lock();
        if worker.is_some() {
            return Err(ParleyError::AlreadyRunning);
        }

        self.reporter.diagnostics.reset();
        info!(
            sample_rate = self.config.format.sample_rate,
            block_len = self.config.format.block_len,
            vad = backend.name(),
            capture = capture.name(),
            playback = playback.name(),
            "starting audio core"
        );

        self.playback.start(playback)?;

        let format = self.config.format;
        let gate = Gate::new(
            format,
            Arc::new(self.monitor.clone()),
            Arc::clone(&self.tuning),
        );
        let vad = SpeechDetector::new(
            backend,
            Arc::clone(&self.tuning),
            std::time::Duration::from_millis(self.config.vad.min_speech_ms),
            std::time::Duration::from_millis(self.config.vad.min_silence_ms),
        );
        let ctx = CaptureContext::new(
            format,
            self.config.read_timeout(),
            RestartPolicy::from(&self.config.retry),
            gate,
            BargeInDetector::new(Arc::clone(&self.tuning)),
            vad,
            Arc::clone(&self.listener),
            self.gate_rx.clone(),
            Arc::clone(&self.capture_running),
            self.reporter.clone(),
            self.activity_tx.clone(),
        );

        // Stale overrides from a previous run do not carry over.
        self.gate_rx.try_iter().for_each(drop);
        self.capture_running.store(true, Ordering::SeqCst);
        let hook = capture.force_stop_hook();
        match WorkerHandle::spawn(
            "parley-capture",
            Arc::clone(&self.capture_running),
            hook,
            move || capture::run(ctx, capture),
        ) {
            Ok(handle) => *worker = Some(handle),
            Err(e) => {
                self.capture_running.store(false, Ordering::SeqCst);
                self.playback.stop();
                return Err(e);
            }
        }
        info!("audio core started");
        Ok(())
    }

    /// Stop both loops, waiting up to the shutdown timeout for each.
    ///
    /// # Errors
    /// `ParleyError::NotRunning` if not started.
    pub fn stop(&self) -> Result<()> {
        let Some(mut worker) = self.capture_worker.lock().take() else {
            return Err(ParleyError::NotRunning);
        };
        info!("audio core stop requested");
        self.capture_running.store(false, Ordering::SeqCst);
        worker.join_timeout(self.config.shutdown_timeout());
        self.reporter
            .report(Component::Capture, LoopStatus::Stopped, None);
        self.playback.stop();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.capture_worker.lock().is_some()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn playback(&self) -> &PlaybackEngine {
        &self.playback
    }

    /// Live thresholds; setters take effect on the next block.
    pub fn tuning(&self) -> &Arc<LiveTuning> {
        &self.tuning
    }

    /// Audio about to be played by an external renderer (e.g. streamed TTS).
    pub fn write_reference_audio(&self, samples: &[f32]) {
        self.monitor.write_reference(samples);
    }

    /// The external renderer has finished; measured loudness drops to zero now
    /// instead of expiring after one reference window.
    pub fn release_reference_audio(&self) {
        self.monitor.mark_idle();
    }

    /// Manual playing flag; wins over measured loudness until cleared.
    pub fn set_playing_state(&self, playing: bool) {
        self.monitor.set_playing_state(playing);
    }

    pub fn clear_playing_override(&self) {
        self.monitor.clear_playing_override();
    }

    /// The most recent `n` reference samples, zero-padded on the left.
    pub fn lookback(&self, n: usize) -> Vec<f32> {
        self.monitor.lookback(n)
    }

    /// Hold the gate in `state` until its automatic state next changes;
    /// `None` returns to automatic immediately.
    pub fn set_gate_override(&self, state: Option<GateState>) {
        let command = match state {
            Some(GateState::Open) => GateCommand::ForceOpen,
            Some(GateState::Closed) => GateCommand::ForceClose,
            None => GateCommand::Automatic,
        };
        let _ = self.gate_tx.send(command);
    }

    pub fn force_gate_open(&self) {
        self.set_gate_override(Some(GateState::Open));
    }

    pub fn force_gate_close(&self) {
        self.set_gate_override(Some(GateState::Closed));
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.reporter.diagnostics.snapshot()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<CoreStatusEvent> {
        self.reporter.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.activity_tx.subscribe()
    }
}

impl Drop for AudioCore {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// Build the capture/playback device pair named by `config.devices`.
pub fn devices_from_config(
    config: &CoreConfig,
) -> Result<(Box<dyn CaptureDevice>, Box<dyn PlaybackDevice>)> {
    let devices = &config.devices;
    match devices.backend {
        DeviceBackend::Process => Ok((
            Box::new(ProcessCaptureDevice::arecord(
                devices.input_device.as_deref(),
                config.format,
            )),
            Box::new(ProcessPlaybackDevice::aplay(
                devices.output_device.as_deref(),
                config.format,
            )),
        )),
        #[cfg(feature = "audio-cpal")]
        DeviceBackend::Cpal => {
            use crate::audio::cpal_io::{CpalCaptureDevice, CpalPlaybackDevice};
            Ok((
                Box::new(CpalCaptureDevice::new(devices.input_device.clone())),
                Box::new(CpalPlaybackDevice::new(devices.output_device.clone())),
            ))
        }
        #[cfg(not(feature = "audio-cpal"))]
        DeviceBackend::Cpal => Err(ParleyError::AudioDevice(
            "compiled without audio-cpal feature".into(),
        )),
    }
}
