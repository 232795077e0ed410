use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by a [`SampleSource`](crate::input::SampleSource)
#[derive(Debug, Error)]
pub enum SourceError {
    /// Connection or tuning failure; the previously active frequency stays in effect
    #[error("device error: {0}")]
    Device(String),

    /// No complete batch arrived before the read timeout
    #[error("acquisition timed out after {0} ms")]
    AcquisitionTimeout(u64),

    /// The device went away (closed, EOF on the transport)
    #[error("device disconnected")]
    DeviceDisconnected,
}

impl SourceError {
    pub fn device<S: Into<String>>(msg: S) -> Self {
        SourceError::Device(msg.into())
    }

    /// Read failures the scheduler recovers from by reporting status and retrying next tick
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::AcquisitionTimeout(_))
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to access state file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse state file {0}: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TuneError {
    #[error("retune to {mhz:.2} MHz failed: {source}")]
    Source {
        mhz: f64,
        #[source]
        source: SourceError,
    },
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("display maximum must be positive and finite, got {0}")]
    InvalidDisplayMax(f32),
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audio sink closed")]
    Closed,
}
