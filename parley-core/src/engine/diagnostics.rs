//! Counters shared by the worker loops and read by `AudioCore::snapshot`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::tuning::AtomicF32;
use crate::ipc::events::{Component, CoreStatusEvent, LoopStatus};

/// Broadcast channel capacity for status and activity events.
pub const BROADCAST_CAP: usize = 256;

pub struct CoreDiagnostics {
    pub current_rms: AtomicF32,
    pub gate_closed: AtomicBool,
    pub speech_active: AtomicBool,
    pub gated_samples: AtomicU64,
    pub ungated_samples: AtomicU64,
    pub blocks_in: AtomicU64,
    pub rejected_blocks: AtomicU64,
    pub barge_ins: AtomicU64,
    pub capture_failures: AtomicU64,
    pub playback_entries: AtomicU64,
    pub playback_skipped: AtomicU64,
    pub playback_failures: AtomicU64,
    pub playback_timeouts: AtomicU64,
    vad_backend: Mutex<&'static str>,
    capture_status: Mutex<LoopStatus>,
    playback_status: Mutex<LoopStatus>,
}

impl Default for CoreDiagnostics {
    fn default() -> Self {
        Self {
            current_rms: AtomicF32::new(0.0),
            gate_closed: AtomicBool::new(false),
            speech_active: AtomicBool::new(false),
            gated_samples: AtomicU64::new(0),
            ungated_samples: AtomicU64::new(0),
            blocks_in: AtomicU64::new(0),
            rejected_blocks: AtomicU64::new(0),
            barge_ins: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            playback_entries: AtomicU64::new(0),
            playback_skipped: AtomicU64::new(0),
            playback_failures: AtomicU64::new(0),
            playback_timeouts: AtomicU64::new(0),
            vad_backend: Mutex::new("none"),
            capture_status: Mutex::new(LoopStatus::Idle),
            playback_status: Mutex::new(LoopStatus::Idle),
        }
    }
}

impl CoreDiagnostics {
    pub fn reset(&self) {
        self.current_rms.store(0.0);
        self.gate_closed.store(false, Ordering::Relaxed);
        self.speech_active.store(false, Ordering::Relaxed);
        for counter in [
            &self.gated_samples,
            &self.ungated_samples,
            &self.blocks_in,
            &self.rejected_blocks,
            &self.barge_ins,
            &self.capture_failures,
            &self.playback_entries,
            &self.playback_skipped,
            &self.playback_failures,
            &self.playback_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn set_vad_backend(&self, name: &'static str) {
        *self.vad_backend.lock() = name;
    }

    pub fn set_capture_status(&self, status: LoopStatus) {
        *self.capture_status.lock() = status;
    }

    pub fn set_playback_status(&self, status: LoopStatus) {
        *self.playback_status.lock() = status;
    }

    pub fn capture_status(&self) -> LoopStatus {
        *self.capture_status.lock()
    }

    pub fn playback_status(&self) -> LoopStatus {
        *self.playback_status.lock()
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            current_rms: self.current_rms.load(),
            gate_closed: self.gate_closed.load(Ordering::Relaxed),
            speech_active: self.speech_active.load(Ordering::Relaxed),
            vad_backend: *self.vad_backend.lock(),
            gated_samples: self.gated_samples.load(Ordering::Relaxed),
            ungated_samples: self.ungated_samples.load(Ordering::Relaxed),
            blocks_in: self.blocks_in.load(Ordering::Relaxed),
            rejected_blocks: self.rejected_blocks.load(Ordering::Relaxed),
            barge_ins: self.barge_ins.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            playback_entries: self.playback_entries.load(Ordering::Relaxed),
            playback_skipped: self.playback_skipped.load(Ordering::Relaxed),
            playback_failures: self.playback_failures.load(Ordering::Relaxed),
            playback_timeouts: self.playback_timeouts.load(Ordering::Relaxed),
            capture_status: self.capture_status(),
            playback_status: self.playback_status(),
        }
    }
}

/// Records loop status transitions in the diagnostics and broadcasts them.
#[derive(Clone)]
pub struct StatusReporter {
    pub diagnostics: Arc<CoreDiagnostics>,
    status_tx: broadcast::Sender<CoreStatusEvent>,
}

impl StatusReporter {
    pub fn new(diagnostics: Arc<CoreDiagnostics>, status_tx: broadcast::Sender<CoreStatusEvent>) -> Self {
        Self {
            diagnostics,
            status_tx,
        }
    }

    /// Reporter with its own diagnostics and channel (tests, standalone engines).
    pub fn detached() -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self::new(Arc::new(CoreDiagnostics::default()), status_tx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn status(&self, component: Component) -> LoopStatus {
        match component {
            Component::Capture => self.diagnostics.capture_status(),
            Component::Playback => self.diagnostics.playback_status(),
        }
    }

    pub fn report(&self, component: Component, status: LoopStatus, detail: Option<String>) {
        let previous = match component {
            Component::Capture => {
                let previous = self.diagnostics.capture_status();
                self.diagnostics.set_capture_status(status);
                previous
            }
            Component::Playback => {
                let previous = self.diagnostics.playback_status();
                self.diagnostics.set_playback_status(status);
                previous
            }
        };
        match status {
            LoopStatus::Failed | LoopStatus::Unavailable => {
                warn!(?component, ?status, detail = detail.as_deref().unwrap_or(""), "loop status")
            }
            _ if previous != status => info!(?component, ?status, "loop status"),
            _ => {}
        }
        let _ = self.status_tx.send(CoreStatusEvent {
            component,
            status,
            detail,
        });
    }
}

/// Read-only view of the core for operators and health checks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub current_rms: f32,
    pub gate_closed: bool,
    pub speech_active: bool,
    pub vad_backend: &'static str,
    pub gated_samples: u64,
    pub ungated_samples: u64,
    pub blocks_in: u64,
    pub rejected_blocks: u64,
    pub barge_ins: u64,
    pub capture_failures: u64,
    pub playback_entries: u64,
    pub playback_skipped: u64,
    pub playback_failures: u64,
    /// Entries cut off at their time budget.
    pub playback_timeouts: u64,
    pub capture_status: LoopStatus,
    pub playback_status: LoopStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_camel_case() {
        let diagnostics = CoreDiagnostics::default();
        diagnostics.gated_samples.fetch_add(320, Ordering::Relaxed);
        diagnostics.set_vad_backend("loudness");
        diagnostics.set_capture_status(LoopStatus::Running);

        let json = serde_json::to_value(diagnostics.snapshot()).unwrap();
        assert_eq!(json["gatedSamples"], 320);
        assert_eq!(json["vadBackend"], "loudness");
        assert_eq!(json["captureStatus"], "running");
        assert_eq!(json["playbackStatus"], "idle");
    }

    #[test]
    fn reporter_updates_status_and_broadcasts() {
        let reporter = StatusReporter::detached();
        let mut rx = reporter.subscribe();
        reporter.report(Component::Playback, LoopStatus::Failed, Some("no device".into()));

        assert_eq!(reporter.status(Component::Playback), LoopStatus::Failed);
        assert_eq!(reporter.status(Component::Capture), LoopStatus::Idle);
        let event = rx.try_recv().expect("status event");
        assert_eq!(event.component, Component::Playback);
        assert_eq!(event.detail.as_deref(), Some("no device"));
    }

    #[test]
    fn reset_clears_counters_but_not_status() {
        let diagnostics = CoreDiagnostics::default();
        diagnostics.blocks_in.fetch_add(5, Ordering::Relaxed);
        diagnostics.set_playback_status(LoopStatus::Running);
        diagnostics.reset();
        assert_eq!(diagnostics.snapshot().blocks_in, 0);
        assert_eq!(diagnostics.playback_status(), LoopStatus::Running);
    }
}
