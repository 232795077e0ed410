use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use tracing::{debug, info, warn};

use super::{IqBatch, IqSample, SampleSource, TunableRange};
use crate::error::SourceError;

/// Audio tone frequency-modulated onto the synthetic carrier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneModulation {
    pub audio_hz: f64,
    pub deviation_hz: f64,
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub sample_rate: u32,
    pub center_freq_hz: u64,
    /// Carrier offset from the tuned center, in Hz
    pub tone_offset_hz: f64,
    pub modulation: Option<ToneModulation>,
    /// Standard deviation of added Gaussian noise per component; 0 disables it
    pub noise_amplitude: f32,
    pub seed: u64,
    pub range: TunableRange,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            sample_rate: 2_400_000,
            center_freq_hz: 100_000_000,
            tone_offset_hz: 1_000.0,
            modulation: None,
            noise_amplitude: 0.0,
            seed: 0x5eed,
            range: TunableRange::UNLIMITED,
        }
    }
}

/// Stand-in receiver producing a deterministic complex tone.
///
/// The carrier phase runs on across reads, so consecutive batches join
/// without a discontinuity. Noise comes from a seeded generator and repeats
/// exactly for the same seed.
pub struct SyntheticSource {
    config: SyntheticConfig,
    center_freq_hz: u64,
    carrier_phase: f64,
    audio_phase: f64,
    rng: StdRng,
    closed: bool,
    total_samples: u64,
}

impl SyntheticSource {
    /// A center outside `range` starts at the nearest accepted frequency
    pub fn new(mut config: SyntheticConfig) -> Result<Self, SourceError> {
        let center = config.range.clamp(config.center_freq_hz);
        if center != config.center_freq_hz {
            warn!(
                "{} Hz outside tunable range, starting at {} Hz",
                config.center_freq_hz, center
            );
            config.center_freq_hz = center;
        }
        info!(
            "Synthetic source at {} Hz ({} Hz sample rate, tone offset {:.0} Hz)",
            config.center_freq_hz, config.sample_rate, config.tone_offset_hz
        );
        Ok(Self {
            center_freq_hz: config.center_freq_hz,
            carrier_phase: 0.0,
            audio_phase: 0.0,
            rng: StdRng::seed_from_u64(config.seed),
            closed: false,
            total_samples: 0,
            config,
        })
    }

    /// Box-Muller transform over the seeded uniform generator
    fn gaussian(&mut self) -> f32 {
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen();
        ((-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()) as f32
    }
}

impl SampleSource for SyntheticSource {
    fn name(&self) -> String {
        "synthetic".to_string()
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn center_freq_hz(&self) -> u64 {
        self.center_freq_hz
    }

    fn retune(&mut self, freq_hz: u64) -> Result<(), SourceError> {
        if self.closed {
            return Err(SourceError::DeviceDisconnected);
        }
        self.config.range.check(freq_hz)?;
        self.center_freq_hz = freq_hz;
        debug!("Synthetic source retuned to {} Hz", freq_hz);
        Ok(())
    }

    fn read(&mut self, batch_size: usize) -> Result<IqBatch, SourceError> {
        if self.closed {
            return Err(SourceError::DeviceDisconnected);
        }

        let fs = self.config.sample_rate as f64;
        let mut samples = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let mut inst_freq = self.config.tone_offset_hz;
            if let Some(m) = self.config.modulation {
                inst_freq += m.deviation_hz * self.audio_phase.sin();
                self.audio_phase = (self.audio_phase + TAU * m.audio_hz / fs) % TAU;
            }

            let (q, i) = self.carrier_phase.sin_cos();
            let mut sample = IqSample::new(i as f32, q as f32);
            if self.config.noise_amplitude > 0.0 {
                sample.i += self.config.noise_amplitude * self.gaussian();
                sample.q += self.config.noise_amplitude * self.gaussian();
            }
            samples.push(sample);

            self.carrier_phase = (self.carrier_phase + TAU * inst_freq / fs) % TAU;
        }

        self.total_samples += batch_size as u64;
        Ok(IqBatch::new(samples, self.config.sample_rate, self.center_freq_hz))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            info!("Synthetic source closed after {} samples", self.total_samples);
        }
    }
}
