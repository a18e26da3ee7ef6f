//! Subprocess audio I/O (`arecord` / `aplay` with raw PCM16 LE pipes).
//!
//! Some boards only expose a working capture path through ALSA userspace
//! tools. A `ManagedProcess` owns the child and its lifecycle; the device
//! types here plug it into the same `CaptureDevice` / `PlaybackDevice`
//! traits as cpal so the loops cannot tell the difference.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{BlockReader, CaptureDevice, ForceStop, PlaybackDevice, SampleWriter};
use crate::{
    buffering::block::{f32_to_pcm16le, pcm16le_to_f32, AudioBlock, BlockFormat},
    config::RetryConfig,
    error::{ParleyError, Result},
};

/// Blocks buffered between the pipe reader thread and the capture loop.
const PIPE_QUEUE_BLOCKS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Starting,
    Running,
    Failed,
    Stopped,
}

/// Program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `arecord` writing mono S16_LE at the pipeline rate to stdout.
    pub fn arecord(device: Option<&str>, format: BlockFormat) -> Self {
        Self::alsa("arecord", device, format)
    }

    /// `aplay` reading mono S16_LE at the pipeline rate from stdin.
    pub fn aplay(device: Option<&str>, format: BlockFormat) -> Self {
        Self::alsa("aplay", device, format)
    }

    fn alsa(program: &str, device: Option<&str>, format: BlockFormat) -> Self {
        let mut args: Vec<String> = vec!["-q".into()];
        if let Some(device) = device {
            args.push("-D".into());
            args.push(device.into());
        }
        args.extend(
            [
                "-f",
                "S16_LE",
                "-r",
                &format.sample_rate.to_string(),
                "-c",
                "1",
                "-t",
                "raw",
            ]
            .map(String::from),
        );
        Self::new(program, args)
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Which pipe the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    /// Read the child's stdout.
    Capture,
    /// Write the child's stdin.
    Playback,
}

/// Pipes taken from a freshly spawned child.
pub struct ProcessPipes {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
}

/// A child process with an explicit lifecycle. Dropping it kills the child.
pub struct ManagedProcess {
    spec: CommandSpec,
    slot: Arc<Mutex<Option<Child>>>,
    state: ProcessState,
}

impl ManagedProcess {
    pub fn new(spec: CommandSpec) -> Self {
        Self::with_slot(spec, Arc::new(Mutex::new(None)))
    }

    /// Share the child slot with a kill switch that outlives this value.
    pub fn with_slot(spec: CommandSpec, slot: Arc<Mutex<Option<Child>>>) -> Self {
        Self {
            spec,
            slot,
            state: ProcessState::Stopped,
        }
    }

    pub fn start(&mut self, direction: PipeDirection) -> Result<ProcessPipes> {
        self.terminate();
        self.state = ProcessState::Starting;

        let mut command = Command::new(&self.spec.program);
        command.args(&self.spec.args).stderr(Stdio::null());
        match direction {
            PipeDirection::Capture => command.stdin(Stdio::null()).stdout(Stdio::piped()),
            PipeDirection::Playback => command.stdin(Stdio::piped()).stdout(Stdio::null()),
        };

        let mut child = command.spawn().map_err(|e| {
            self.state = ProcessState::Failed;
            ParleyError::Process(format!("spawn `{}`: {e}", self.spec.display()))
        })?;

        let pipes = ProcessPipes {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
        };
        info!(pid = child.id(), command = %self.spec.display(), "audio process started");
        *self.slot.lock() = Some(child);
        self.state = ProcessState::Running;
        Ok(pipes)
    }

    /// Refresh and return the state, noticing a child that exited on its own.
    pub fn poll(&mut self) -> ProcessState {
        if self.state != ProcessState::Running {
            return self.state;
        }
        let mut slot = self.slot.lock();
        let polled = slot.as_mut().map(Child::try_wait);
        match polled {
            Some(Ok(None)) => {}
            Some(Ok(Some(status))) => {
                warn!(%status, command = %self.spec.program, "audio process exited");
                slot.take();
                self.state = ProcessState::Failed;
            }
            Some(Err(e)) => {
                warn!("failed to poll audio process: {e}");
                self.state = ProcessState::Failed;
            }
            // Killed through the shared slot.
            None => self.state = ProcessState::Failed,
        }
        self.state
    }

    pub fn mark_failed(&mut self) {
        if self.state == ProcessState::Running || self.state == ProcessState::Starting {
            self.state = ProcessState::Failed;
        }
    }

    /// Kill and reap the child if one is running.
    pub fn terminate(&mut self) {
        if let Some(mut child) = self.slot.lock().take() {
            let pid = child.id();
            if let Err(e) = child.kill() {
                debug!(pid, "kill audio process: {e}");
            }
            let _ = child.wait();
            debug!(pid, "audio process reaped");
        }
        self.state = ProcessState::Stopped;
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn command(&self) -> String {
        self.spec.display()
    }

    pub fn kill_switch(&self) -> ForceStop {
        kill_switch(&self.slot)
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn kill_switch(slot: &Arc<Mutex<Option<Child>>>) -> ForceStop {
    let slot = Arc::clone(slot);
    Arc::new(move || {
        if let Some(mut child) = slot.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    })
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    retry: RetryConfig,
}

impl RestartPolicy {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    /// Delay before consecutive failure number `attempt` (1-based), or `None`
    /// once the ceiling is exceeded.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt <= self.retry.max_retries).then(|| self.retry.backoff(attempt))
    }

    pub fn max_retries(&self) -> u32 {
        self.retry.max_retries
    }
}

impl From<&RetryConfig> for RestartPolicy {
    fn from(retry: &RetryConfig) -> Self {
        Self::new(retry.clone())
    }
}

/// Capture through a subprocess that writes raw PCM16 LE to stdout.
pub struct ProcessCaptureDevice {
    name: String,
    spec: CommandSpec,
    slot: Arc<Mutex<Option<Child>>>,
}

impl ProcessCaptureDevice {
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn arecord(device: Option<&str>, format: BlockFormat) -> Self {
        Self::new(
            device.unwrap_or("arecord:default"),
            CommandSpec::arecord(device, format),
        )
    }
}

impl CaptureDevice for ProcessCaptureDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, format: BlockFormat) -> Result<Box<dyn BlockReader>> {
        let mut process = ManagedProcess::with_slot(self.spec.clone(), Arc::clone(&self.slot));
        let pipes = process.start(PipeDirection::Capture)?;
        let mut stdout = pipes
            .stdout
            .ok_or_else(|| ParleyError::Process("capture process has no stdout".into()))?;

        let (tx, rx) = bounded::<AudioBlock>(PIPE_QUEUE_BLOCKS);
        let block_bytes = format.block_len * 2;
        let sample_rate = format.sample_rate;
        std::thread::Builder::new()
            .name("parley-pipe-reader".into())
            .spawn(move || {
                let mut buf = vec![0u8; block_bytes];
                loop {
                    if let Err(e) = stdout.read_exact(&mut buf) {
                        debug!("capture pipe closed: {e}");
                        break;
                    }
                    let block = AudioBlock::new(pcm16le_to_f32(&buf), sample_rate);
                    if tx.send(block).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Box::new(ProcessBlockReader { process, rx }))
    }

    fn force_stop_hook(&self) -> Option<ForceStop> {
        Some(kill_switch(&self.slot))
    }
}

struct ProcessBlockReader {
    process: ManagedProcess,
    rx: Receiver<AudioBlock>,
}

impl BlockReader for ProcessBlockReader {
    fn read_block(&mut self, timeout: Duration) -> Result<Option<AudioBlock>> {
        match self.rx.recv_timeout(timeout) {
            Ok(block) => Ok(Some(block)),
            Err(RecvTimeoutError::Timeout) => match self.process.poll() {
                ProcessState::Running => Ok(None),
                state => Err(ParleyError::Process(format!("capture process {state:?}"))),
            },
            Err(RecvTimeoutError::Disconnected) => {
                self.process.mark_failed();
                Err(ParleyError::Process("capture pipe closed".into()))
            }
        }
    }
}

/// Playback through a subprocess that reads raw PCM16 LE from stdin.
///
/// Pipe writes run on a helper thread. A child that stops reading cannot hold
/// the caller past its deadline: the child is killed and the write fails.
pub struct ProcessPlaybackDevice {
    name: String,
    spec: CommandSpec,
    slot: Arc<Mutex<Option<Child>>>,
}

impl ProcessPlaybackDevice {
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn aplay(device: Option<&str>, format: BlockFormat) -> Self {
        Self::new(device.unwrap_or("aplay:default"), CommandSpec::aplay(device, format))
    }
}

impl PlaybackDevice for ProcessPlaybackDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, _format: BlockFormat) -> Result<Box<dyn SampleWriter>> {
        let mut process = ManagedProcess::with_slot(self.spec.clone(), Arc::clone(&self.slot));
        let pipes = process.start(PipeDirection::Playback)?;
        let mut stdin = pipes
            .stdin
            .ok_or_else(|| ParleyError::Process("playback process has no stdin".into()))?;

        let (chunks_tx, chunks_rx) = bounded::<Vec<u8>>(1);
        let (done_tx, done_rx) = bounded::<std::io::Result<()>>(1);
        std::thread::Builder::new()
            .name("parley-pipe-writer".into())
            .spawn(move || {
                for chunk in chunks_rx {
                    let result = stdin.write_all(&chunk);
                    let failed = result.is_err();
                    if done_tx.send(result).is_err() || failed {
                        break;
                    }
                }
                debug!("playback pipe writer exited");
            })?;

        Ok(Box::new(ProcessSampleWriter {
            process,
            chunks: Some(chunks_tx),
            done: done_rx,
        }))
    }

    fn force_stop_hook(&self) -> Option<ForceStop> {
        Some(kill_switch(&self.slot))
    }
}

struct ProcessSampleWriter {
    process: ManagedProcess,
    /// Dropped on failure so the pipe thread exits.
    chunks: Option<Sender<Vec<u8>>>,
    done: Receiver<std::io::Result<()>>,
}

impl ProcessSampleWriter {
    fn fail(&mut self, message: String) -> ParleyError {
        self.chunks = None;
        // Killing the child unblocks a pipe write stuck on a full buffer.
        self.process.terminate();
        ParleyError::Process(message)
    }
}

impl SampleWriter for ProcessSampleWriter {
    fn write(&mut self, samples: &[f32], deadline: Instant) -> Result<()> {
        if Instant::now() >= deadline {
            return Err(ParleyError::AudioStream("playback write deadline passed".into()));
        }
        if self.process.poll() != ProcessState::Running {
            return Err(ParleyError::Process("playback process not running".into()));
        }
        let Some(chunks) = self.chunks.as_ref() else {
            return Err(ParleyError::Process("playback pipe closed".into()));
        };
        if chunks.send(f32_to_pcm16le(samples)).is_err() {
            return Err(self.fail("playback pipe writer exited".into()));
        }
        match self.done.recv_deadline(deadline) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.fail(format!("playback pipe: {e}"))),
            Err(RecvTimeoutError::Timeout) => {
                warn!(command = %self.process.command(), "playback process stopped reading; killing it");
                Err(self.fail("playback pipe write did not finish before deadline".into()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.fail("playback pipe writer exited".into())),
        }
    }

    fn drain(&mut self, _deadline: Instant) -> Result<()> {
        // Every write already waited for the pipe to take its bytes.
        Ok(())
    }
}
