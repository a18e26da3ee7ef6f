use thiserror::Error;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no audio device matching '{0}' and no default device available")]
    DeviceUnavailable(String),

    #[error("block format mismatch: expected {expected_len} samples @ {expected_rate} Hz, got {len} @ {rate} Hz")]
    FormatMismatch {
        expected_len: usize,
        expected_rate: u32,
        len: usize,
        rate: u32,
    },

    #[error("audio process error: {0}")]
    Process(String),

    #[error("failed to decode sound source: {0}")]
    Decode(String),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("playback entry cut off after {0:?}")]
    EntryTimedOut(std::time::Duration),

    #[error("playback engine is stopped")]
    EngineStopped,

    #[error("core is already running")]
    AlreadyRunning,

    #[error("core is not running")]
    NotRunning,

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {}", path.display())]
    ModelNotFound { path: std::path::PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ParleyError>;
