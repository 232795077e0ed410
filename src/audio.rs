use chrono::{DateTime, Local};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::f32::consts::FRAC_1_PI;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::demod::AudioBuffer;
use crate::error::AudioError;

/// Buffers queued for the writer thread before new ones are dropped
const QUEUE_DEPTH: usize = 16;

/// Where demodulated audio goes. `submit` must not block.
pub trait AudioSink: Send {
    fn submit(&mut self, buffer: AudioBuffer);

    /// Flush and release the output
    fn close(&mut self) {}
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullAudioSink {
    pub submitted: usize,
}

impl AudioSink for NullAudioSink {
    fn submit(&mut self, _buffer: AudioBuffer) {
        self.submitted += 1;
    }
}

/// Generate output filename for a recording
pub fn generate_filename(frequency_mhz: f64, start_time: DateTime<Local>) -> String {
    format!(
        "audio_{:.2}MHz_{}.wav",
        frequency_mhz,
        start_time.format("%Y-%m-%d_%H-%M-%S")
    )
}

/// Scale discriminator output (radians/sample) to [-1, 1] audio
fn to_pcm(sample: f32, gain: f32) -> f32 {
    (sample * gain).clamp(-1.0, 1.0)
}

/// Writes audio to a mono WAV file on a background thread.
///
/// Submission hands the buffer to a bounded queue; when the writer falls
/// behind, buffers are dropped rather than stalling the caller.
pub struct WavRecorder {
    tx: Option<mpsc::Sender<AudioBuffer>>,
    writer: Option<JoinHandle<Result<usize, AudioError>>>,
    path: PathBuf,
    dropped: usize,
}

impl WavRecorder {
    /// Create `audio_<MHz>_<timestamp>.wav` in `output_dir`
    pub fn create(
        output_dir: &Path,
        frequency_mhz: f64,
        sample_rate: u32,
        float32: bool,
    ) -> Result<Self, AudioError> {
        std::fs::create_dir_all(output_dir)?;
        let path = output_dir.join(generate_filename(frequency_mhz, Local::now()));
        Self::create_at(path, sample_rate, float32, FRAC_1_PI)
    }

    /// Create a recorder writing to exactly `path`. `gain` scales
    /// discriminator output before clipping to full scale.
    pub fn create_at(
        path: PathBuf,
        sample_rate: u32,
        float32: bool,
        gain: f32,
    ) -> Result<Self, AudioError> {
        let spec = if float32 {
            WavSpec {
                channels: 1,
                sample_rate,
                bits_per_sample: 32,
                sample_format: SampleFormat::Float,
            }
        } else {
            WavSpec {
                channels: 1,
                sample_rate,
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            }
        };
        let mut writer = WavWriter::create(&path, spec)?;
        info!("Recording audio to {}", path.display());

        let (tx, mut rx) = mpsc::channel::<AudioBuffer>(QUEUE_DEPTH);
        let handle = std::thread::spawn(move || -> Result<usize, AudioError> {
            let mut written = 0usize;
            while let Some(buffer) = rx.blocking_recv() {
                if buffer.sample_rate != sample_rate {
                    warn!(
                        "Skipping buffer at {} Hz, recording is {} Hz",
                        buffer.sample_rate, sample_rate
                    );
                    continue;
                }
                for &sample in &buffer.samples {
                    let pcm = to_pcm(sample, gain);
                    if float32 {
                        writer.write_sample(pcm)?;
                    } else {
                        // Convert f32 [-1.0, 1.0] to i16, with some headroom
                        writer.write_sample((pcm * 32000.0) as i16)?;
                    }
                }
                written += buffer.samples.len();
            }
            writer.finalize()?;
            Ok(written)
        });

        Ok(Self {
            tx: Some(tx),
            writer: Some(handle),
            path,
            dropped: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting audio, flush the file and return the samples written
    pub fn finish(&mut self) -> Result<usize, AudioError> {
        self.tx = None;
        match self.writer.take() {
            Some(handle) => handle.join().map_err(|_| AudioError::Closed)?,
            None => Err(AudioError::Closed),
        }
    }
}

impl AudioSink for WavRecorder {
    fn submit(&mut self, buffer: AudioBuffer) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        match tx.try_send(buffer) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped += 1;
                debug!("Audio writer behind, dropped buffer ({} total)", self.dropped);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Audio writer for {} stopped", self.path.display());
                self.tx = None;
            }
        }
    }

    fn close(&mut self) {
        if self.writer.is_none() {
            return;
        }
        if self.dropped > 0 {
            warn!("{} audio buffer(s) dropped while recording", self.dropped);
        }
        match self.finish() {
            Ok(written) => info!("Wrote {} audio samples to {}", written, self.path.display()),
            Err(e) => warn!("Recording {} incomplete: {}", self.path.display(), e),
        }
    }
}

impl Drop for WavRecorder {
    fn drop(&mut self) {
        self.close();
    }
}
