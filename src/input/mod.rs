pub mod stream;
pub mod synthetic;
pub mod wav;

pub use stream::{RtlTcpSource, StreamFormat};
pub use synthetic::SyntheticSource;
pub use wav::WavFileSource;

use crate::error::SourceError;
use rustfft::num_complex::Complex;
use std::sync::{Arc, Mutex};

/// IQ sample pair (In-phase, Quadrature)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IqSample {
    pub i: f32,
    pub q: f32,
}

impl IqSample {
    pub fn new(i: f32, q: f32) -> Self {
        Self { i, q }
    }

    /// Instantaneous phase in radians, `(-π, π]`
    pub fn arg(&self) -> f32 {
        self.q.atan2(self.i)
    }

    pub fn magnitude(&self) -> f32 {
        self.i.hypot(self.q)
    }

    pub fn to_complex(self) -> Complex<f32> {
        Complex::new(self.i, self.q)
    }
}

/// A batch of IQ samples tagged with the tuning it was captured at
#[derive(Debug, Clone)]
pub struct IqBatch {
    samples: Vec<IqSample>,
    pub sample_rate: u32,
    pub center_freq_hz: u64,
}

impl IqBatch {
    pub fn new(samples: Vec<IqSample>, sample_rate: u32, center_freq_hz: u64) -> Self {
        Self {
            samples,
            sample_rate,
            center_freq_hz,
        }
    }

    pub fn samples(&self) -> &[IqSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Anything that can be tuned and read from like a receiver.
///
/// `read` is the only blocking call. Implementations return exactly the
/// requested number of samples or an error, never a short batch.
pub trait SampleSource: Send {
    /// Short human-readable description for logs
    fn name(&self) -> String;

    fn sample_rate(&self) -> u32;

    fn center_freq_hz(&self) -> u64;

    /// Move the center frequency. On error the previous frequency stays active.
    fn retune(&mut self, freq_hz: u64) -> Result<(), SourceError>;

    fn read(&mut self, batch_size: usize) -> Result<IqBatch, SourceError>;

    /// Release the device. Safe to call more than once.
    fn close(&mut self);
}

/// Source shared between the tuner (retune) and the acquisition loop (read).
/// Holding the lock across a call keeps reads and retunes from interleaving.
pub type SharedSource = Arc<Mutex<Box<dyn SampleSource>>>;

pub fn shared(source: Box<dyn SampleSource>) -> SharedSource {
    Arc::new(Mutex::new(source))
}

/// Inclusive tunable range in Hz, as reported for the attached tuner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunableRange {
    pub min_hz: u64,
    pub max_hz: u64,
}

impl TunableRange {
    pub const UNLIMITED: TunableRange = TunableRange {
        min_hz: 0,
        max_hz: u64::MAX,
    };

    pub fn check(&self, freq_hz: u64) -> Result<(), SourceError> {
        if freq_hz < self.min_hz || freq_hz > self.max_hz {
            return Err(SourceError::device(format!(
                "{} Hz outside tunable range {}..={} Hz",
                freq_hz, self.min_hz, self.max_hz
            )));
        }
        Ok(())
    }

    /// Nearest frequency the tuner accepts
    pub fn clamp(&self, freq_hz: u64) -> u64 {
        freq_hz.clamp(self.min_hz, self.max_hz)
    }
}

impl Default for TunableRange {
    fn default() -> Self {
        Self::UNLIMITED
    }
}
