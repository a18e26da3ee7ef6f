//! Named worker threads with a stop flag and join-with-timeout.
//!
//! `std::thread::JoinHandle::join` cannot time out, so each worker holds the
//! sender half of a crossbeam channel that is dropped when the thread body
//! returns (or unwinds). `join_timeout` waits on the receiver instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::audio::ForceStop;
use crate::error::Result;

/// Drops the done sender when the worker body finishes, even on panic.
struct DoneGuard(#[allow(dead_code)] Sender<()>);

pub struct WorkerHandle {
    name: String,
    running: Arc<AtomicBool>,
    done: Receiver<()>,
    thread: Option<JoinHandle<()>>,
    force_stop: Option<ForceStop>,
}

impl WorkerHandle {
    /// Spawn `body` on a thread called `name`. `body` must return promptly
    /// once `running` goes false.
    pub fn spawn<F>(name: &str, running: Arc<AtomicBool>, force_stop: Option<ForceStop>, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, done) = bounded::<()>(0);
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = DoneGuard(tx);
                body();
            })?;
        debug!(worker = name, "worker started");
        Ok(Self {
            name: name.to_string(),
            running,
            done,
            thread: Some(thread),
            force_stop,
        })
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.done.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        )
    }

    /// Clear the stop flag and wait up to `timeout` for the thread to exit.
    /// On timeout the force-stop hook releases the OS handle the worker is
    /// blocked on, and the join is retried for the same budget once more.
    ///
    /// Returns `true` when the thread was joined.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::SeqCst);

        if !self.wait_done(timeout) {
            warn!(worker = %self.name, ?timeout, "worker did not stop in time; forcing handles closed");
            if let Some(force) = &self.force_stop {
                force();
            }
            if !self.wait_done(timeout) {
                warn!(worker = %self.name, "worker still running; detaching");
                self.thread.take();
                return false;
            }
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker = %self.name, "worker panicked");
            }
        }
        debug!(worker = %self.name, "worker joined");
        true
    }

    fn wait_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.done.recv_deadline(deadline) {
                Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => return false,
                Ok(()) => continue,
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.join_timeout(Duration::from_secs(2));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn joins_a_cooperative_worker() {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let mut worker = WorkerHandle::spawn("test-coop", Arc::clone(&running), None, move || {
            while flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
        assert!(!worker.is_finished());
        assert!(worker.join_timeout(Duration::from_secs(2)));
    }

    #[test]
    fn force_stop_runs_when_worker_is_stuck() {
        let running = Arc::new(AtomicBool::new(true));
        let release = Arc::new(AtomicBool::new(false));
        let forced = Arc::new(AtomicUsize::new(0));

        let hook: ForceStop = {
            let release = Arc::clone(&release);
            let forced = Arc::clone(&forced);
            Arc::new(move || {
                forced.fetch_add(1, Ordering::SeqCst);
                release.store(true, Ordering::SeqCst);
            })
        };

        // Ignores `running`; only the force-stop hook unblocks it.
        let stuck = Arc::clone(&release);
        let mut worker = WorkerHandle::spawn("test-stuck", running, Some(hook), move || {
            while !stuck.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        assert!(worker.join_timeout(Duration::from_millis(100)));
        assert_eq!(forced.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_worker_still_reports_done() {
        let running = Arc::new(AtomicBool::new(true));
        let mut worker =
            WorkerHandle::spawn("test-panic", running, None, || panic!("boom")).unwrap();
        assert!(worker.join_timeout(Duration::from_secs(2)));
    }
}
