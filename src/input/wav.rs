use hound::{SampleFormat, WavReader};
use std::path::Path;
use tracing::info;

use super::{IqBatch, IqSample, SampleSource};
use crate::error::SourceError;

/// Read IQ samples from a stereo WAV recording (I = left, Q = right)
pub fn read_iq_wav<P: AsRef<Path>>(path: P) -> Result<(Vec<IqSample>, u32), SourceError> {
    let reader = WavReader::open(path).map_err(|e| SourceError::device(e.to_string()))?;
    let spec = reader.spec();

    if spec.channels != 2 {
        return Err(SourceError::device(format!(
            "Expected stereo WAV (I/Q), got {} channels",
            spec.channels
        )));
    }

    let samples = match spec.sample_format {
        SampleFormat::Float => read_float_samples(reader)?,
        SampleFormat::Int => read_int_samples(reader, spec.bits_per_sample)?,
    };

    Ok((samples, spec.sample_rate))
}

fn read_float_samples<R: std::io::Read>(mut reader: WavReader<R>) -> Result<Vec<IqSample>, SourceError> {
    let mut samples = Vec::new();
    let mut iter = reader.samples::<f32>();

    while let (Some(i_result), Some(q_result)) = (iter.next(), iter.next()) {
        let i = i_result.map_err(|e| SourceError::device(e.to_string()))?;
        let q = q_result.map_err(|e| SourceError::device(e.to_string()))?;
        samples.push(IqSample::new(i, q));
    }

    Ok(samples)
}

fn read_int_samples<R: std::io::Read>(mut reader: WavReader<R>, bits: u16) -> Result<Vec<IqSample>, SourceError> {
    let mut samples = Vec::new();
    let max_val = (1i64 << (bits - 1)) as f32;

    let mut iter = reader.samples::<i32>();

    while let (Some(i_result), Some(q_result)) = (iter.next(), iter.next()) {
        let i = i_result.map_err(|e| SourceError::device(e.to_string()))? as f32 / max_val;
        let q = q_result.map_err(|e| SourceError::device(e.to_string()))? as f32 / max_val;
        samples.push(IqSample::new(i, q));
    }

    Ok(samples)
}

/// Replays an IQ recording in a loop as if it were a live receiver.
///
/// The recording was captured at one fixed frequency; retuning only changes
/// the center tag on the batches handed out.
pub struct WavFileSource {
    samples: Vec<IqSample>,
    sample_rate: u32,
    center_freq_hz: u64,
    position: usize,
    label: String,
    closed: bool,
}

impl WavFileSource {
    pub fn open<P: AsRef<Path>>(path: P, center_freq_hz: u64) -> Result<Self, SourceError> {
        let label = path.as_ref().display().to_string();
        let (samples, sample_rate) = read_iq_wav(&path)?;
        if samples.is_empty() {
            return Err(SourceError::device(format!("{} contains no samples", label)));
        }
        info!(
            "Loaded {} samples at {} Hz ({:.2}s) from {}",
            samples.len(),
            sample_rate,
            samples.len() as f32 / sample_rate as f32,
            label
        );
        Ok(Self {
            samples,
            sample_rate,
            center_freq_hz,
            position: 0,
            label,
            closed: false,
        })
    }
}

impl SampleSource for WavFileSource {
    fn name(&self) -> String {
        format!("wav {}", self.label)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn center_freq_hz(&self) -> u64 {
        self.center_freq_hz
    }

    fn retune(&mut self, freq_hz: u64) -> Result<(), SourceError> {
        if self.closed {
            return Err(SourceError::DeviceDisconnected);
        }
        self.center_freq_hz = freq_hz;
        Ok(())
    }

    fn read(&mut self, batch_size: usize) -> Result<IqBatch, SourceError> {
        if self.closed {
            return Err(SourceError::DeviceDisconnected);
        }
        let mut out = Vec::with_capacity(batch_size);
        while out.len() < batch_size {
            let take = (batch_size - out.len()).min(self.samples.len() - self.position);
            out.extend_from_slice(&self.samples[self.position..self.position + take]);
            self.position = (self.position + take) % self.samples.len();
        }
        Ok(IqBatch::new(out, self.sample_rate, self.center_freq_hz))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.samples = Vec::new();
            info!("Closed {}", self.label);
        }
    }
}
