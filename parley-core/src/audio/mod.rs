//! Audio device abstractions.
//!
//! The capture and playback loops talk to hardware only through the traits
//! below, so the same loop drives an in-process cpal stream, an
//! `arecord`/`aplay` subprocess pair, or a scripted test double.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms. Devices are therefore opened
//! *on the worker thread*: a `CaptureDevice` is `Send` and moved into the
//! thread, and the `BlockReader` it opens never leaves that thread.

pub mod device;
pub mod process;
pub mod resample;
pub mod volume;

#[cfg(feature = "audio-cpal")]
pub mod cpal_io;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    buffering::block::{AudioBlock, BlockFormat},
    error::Result,
};

/// Callback that forcibly releases a device's OS handle from another thread
/// (e.g. kills the child process) when a worker misses its join deadline.
pub type ForceStop = Arc<dyn Fn() + Send + Sync>;

/// A source of capture blocks that can be (re)opened.
pub trait CaptureDevice: Send {
    fn name(&self) -> &str;

    /// Open the device for blocks of `format`. Called again after every
    /// failure, so implementations must release the previous handle on drop.
    fn open(&mut self, format: BlockFormat) -> Result<Box<dyn BlockReader>>;

    /// Hook that tears the current handle down from outside the worker.
    fn force_stop_hook(&self) -> Option<ForceStop> {
        None
    }
}

/// An open capture handle.
pub trait BlockReader {
    /// Read the next block. `Ok(None)` means nothing arrived within `timeout`;
    /// `Err` means the stream failed and must be reopened.
    fn read_block(&mut self, timeout: Duration) -> Result<Option<AudioBlock>>;
}

/// A sink for rendered playback audio that can be (re)opened.
pub trait PlaybackDevice: Send {
    fn name(&self) -> &str;

    fn open(&mut self, format: BlockFormat) -> Result<Box<dyn SampleWriter>>;

    fn force_stop_hook(&self) -> Option<ForceStop> {
        None
    }
}

/// An open playback handle.
pub trait SampleWriter {
    /// Queue `samples` for output, failing if they cannot be accepted by
    /// `deadline`.
    fn write(&mut self, samples: &[f32], deadline: Instant) -> Result<()>;

    /// Wait until queued audio has been handed to the hardware, or `deadline`.
    fn drain(&mut self, deadline: Instant) -> Result<()>;
}
