use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::{PI, TAU};

use crate::input::{IqBatch, IqSample};

/// Default audio output rate
pub const AUDIO_RATE: u32 = 44_100;

/// Mono audio produced from one IQ batch
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn empty(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_ms(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32 * 1000.0
    }
}

/// FM phase discriminator followed by band-limited resampling to the audio rate.
///
/// Every batch is processed on its own: no phase history is carried from the
/// previous batch, so the first output of each batch is a zero placeholder
/// rather than the true deviation across the batch boundary.
pub struct Demodulator {
    audio_rate: u32,
    planner: FftPlanner<f32>,
}

impl Demodulator {
    pub fn new(audio_rate: u32) -> Self {
        Self {
            audio_rate,
            planner: FftPlanner::new(),
        }
    }

    /// Number of audio samples produced for a batch of `n` IQ samples
    pub fn output_len(&self, n: usize, iq_rate: u32) -> usize {
        if n == 0 || iq_rate == 0 {
            return 0;
        }
        ((n as u64 - 1) * self.audio_rate as u64 / iq_rate as u64) as usize
    }

    pub fn demodulate(&mut self, batch: &IqBatch) -> AudioBuffer {
        let out_len = self.output_len(batch.len(), batch.sample_rate);
        if out_len == 0 {
            return AudioBuffer::empty(self.audio_rate);
        }

        let mut deviation = discriminate(batch.samples());
        unwrap_phase(&mut deviation);
        let samples = resample(&deviation, out_len, &mut self.planner);

        AudioBuffer {
            samples,
            sample_rate: self.audio_rate,
        }
    }
}

/// Phase rotation between consecutive samples, in radians per sample.
/// The first sample has no predecessor and yields 0.
pub fn discriminate(samples: &[IqSample]) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len());
    let mut prev_phase = None;
    for sample in samples {
        let phase = sample.arg();
        out.push(match prev_phase {
            Some(prev) => phase - prev,
            None => 0.0,
        });
        prev_phase = Some(phase);
    }
    out
}

/// Remove 2π jumps between consecutive values, in place.
///
/// A step larger than π in magnitude is replaced by its equivalent within
/// `[-π, π]` and the correction carries forward to every later value.
pub fn unwrap_phase(values: &mut [f32]) {
    let Some(&first) = values.first() else {
        return;
    };
    let mut prev = first;
    let mut correction = 0.0f32;
    for value in values.iter_mut().skip(1) {
        let original = *value;
        let dd = original - prev;
        let mut dd_mod = (dd + PI).rem_euclid(TAU) - PI;
        if dd_mod == -PI && dd > 0.0 {
            dd_mod = PI;
        }
        if dd.abs() >= PI {
            correction += dd_mod - dd;
        }
        *value = original + correction;
        prev = original;
    }
}

/// Fourier-domain resampling of a real sequence to `out_len` points.
///
/// The spectrum is truncated (downsampling) or zero padded (upsampling), so
/// the result is band limited to the lower of the two Nyquist rates. The
/// input is treated as one period of a periodic signal.
pub fn resample(input: &[f32], out_len: usize, planner: &mut FftPlanner<f32>) -> Vec<f32> {
    let n = input.len();
    if n == 0 || out_len == 0 {
        return Vec::new();
    }
    if n == out_len {
        return input.to_vec();
    }

    let mut spectrum: Vec<Complex<f32>> = input.iter().map(|&x| Complex::new(x, 0.0)).collect();
    planner.plan_fft_forward(n).process(&mut spectrum);

    let keep = n.min(out_len);
    let nyq = keep / 2 + 1;
    let mut resized = vec![Complex::new(0.0, 0.0); out_len];
    let positive = nyq.min(keep);
    resized[..positive].copy_from_slice(&spectrum[..positive]);
    let negative = keep - positive;
    if negative > 0 {
        resized[out_len - negative..].copy_from_slice(&spectrum[n - negative..]);
    }

    // An even-length kept band has a shared Nyquist bin: fold it when
    // shrinking, split it between +N/2 and -N/2 when growing.
    if keep % 2 == 0 {
        let half = keep / 2;
        if out_len < n {
            resized[half] += spectrum[n - half];
        } else {
            resized[half] *= 0.5;
            resized[out_len - half] = resized[half];
        }
    }

    planner.plan_fft_inverse(out_len).process(&mut resized);
    let scale = 1.0 / n as f32;
    resized.iter().map(|c| c.re * scale).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complex_tone(freq_hz: f64, sample_rate: u32, len: usize, start_phase: f64) -> Vec<IqSample> {
        (0..len)
            .map(|n| {
                let phase = start_phase + std::f64::consts::TAU * freq_hz * n as f64 / sample_rate as f64;
                IqSample::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect()
    }

    fn assert_approx_eq(a: f32, b: f32, tol: f32, label: &str) {
        assert!(
            (a - b).abs() <= tol,
            "{}: expected {} ≈ {} (tol {})",
            label,
            a,
            b,
            tol
        );
    }

    #[test]
    fn test_empty_batch_gives_empty_audio() {
        let mut demod = Demodulator::new(AUDIO_RATE);
        let audio = demod.demodulate(&IqBatch::new(Vec::new(), 2_400_000, 100_000_000));
        assert!(audio.is_empty());
        assert_eq!(audio.sample_rate, AUDIO_RATE);
    }

    #[test]
    fn test_output_length_follows_rate_ratio() {
        let mut demod = Demodulator::new(AUDIO_RATE);
        let n = 16_384;
        let batch = IqBatch::new(complex_tone(1_000.0, 2_400_000, n, 0.0), 2_400_000, 100_000_000);
        let audio = demod.demodulate(&batch);
        assert_eq!(audio.len(), (n - 1) * 44_100 / 2_400_000);
        assert_eq!(audio.len(), 301);

        let batch = IqBatch::new(complex_tone(1_000.0, 48_000, 1_001, 0.0), 48_000, 0);
        assert_eq!(demod.demodulate(&batch).len(), 918);
    }

    #[test]
    fn test_single_sample_batch_is_empty() {
        let mut demod = Demodulator::new(AUDIO_RATE);
        let batch = IqBatch::new(vec![IqSample::new(1.0, 0.0)], 2_400_000, 0);
        assert!(demod.demodulate(&batch).is_empty());
    }

    #[test]
    fn test_constant_offset_tone_demodulates_to_constant() {
        let mut demod = Demodulator::new(AUDIO_RATE);
        let fs = 240_000;
        let batch = IqBatch::new(complex_tone(12_000.0, fs, 24_000, 0.3), fs, 0);
        let audio = demod.demodulate(&batch);
        let expected = TAU * 12_000.0 / fs as f32;

        let mid = audio.len() / 2;
        for (idx, &sample) in audio.samples[mid - 100..mid + 100].iter().enumerate() {
            assert_approx_eq(sample, expected, expected * 0.05, &format!("audio sample {idx}"));
        }
    }

    #[test]
    fn test_discriminator_first_sample_is_zero() {
        let out = discriminate(&complex_tone(1_000.0, 8_000, 8, 1.0));
        assert_eq!(out.len(), 8);
        assert_eq!(out[0], 0.0);
        for &d in &out[1..] {
            // raw differences may still carry a 2π wrap
            let wrapped = (d + PI).rem_euclid(TAU) - PI;
            assert_approx_eq(wrapped, TAU / 8.0, 1e-4, "phase step");
        }
    }

    #[test]
    fn test_unwrap_removes_two_pi_jumps() {
        let step = 0.2f32;
        let mut values = vec![step, step - TAU, step, step + TAU, step];
        unwrap_phase(&mut values);
        for &v in &values {
            assert_approx_eq(v, step, 1e-5, "unwrapped");
        }

        // steps below π are left alone
        let mut ramp = vec![0.0, 3.0, 6.0];
        unwrap_phase(&mut ramp);
        assert_eq!(ramp, vec![0.0, 3.0, 6.0]);

        let mut ramp = vec![0.0, 4.0, 8.0];
        unwrap_phase(&mut ramp);
        assert_approx_eq(ramp[1], 4.0 - TAU, 1e-5, "ramp[1]");
        assert_approx_eq(ramp[2], 8.0 - 2.0 * TAU, 1e-5, "ramp[2]");
    }

    #[test]
    fn test_resample_preserves_dc_level() {
        let mut planner = FftPlanner::new();
        let down = resample(&vec![0.75; 1000], 37, &mut planner);
        assert_eq!(down.len(), 37);
        let up = resample(&vec![0.75; 10], 64, &mut planner);
        assert_eq!(up.len(), 64);
        for &v in down.iter().chain(up.iter()) {
            assert_approx_eq(v, 0.75, 1e-4, "dc");
        }
    }

    #[test]
    fn test_resample_keeps_in_band_sine() {
        let mut planner = FftPlanner::new();
        let n = 800;
        let input: Vec<f32> = (0..n).map(|k| (TAU * 5.0 * k as f32 / n as f32).sin()).collect();
        let out = resample(&input, 100, &mut planner);
        for (k, &v) in out.iter().enumerate() {
            let expected = (TAU * 5.0 * k as f32 / 100.0).sin();
            assert_approx_eq(v, expected, 1e-3, &format!("sine {k}"));
        }
    }

    #[test]
    fn test_stateless_batches_restart_phase_history() {
        // The second batch continues the same tone, but without carried
        // history its first deviation is the zero placeholder instead of the
        // true phase step across the boundary.
        let fs = 48_000;
        let whole = complex_tone(3_000.0, fs, 200, 0.0);
        let (first, second) = whole.split_at(100);
        let true_step = TAU * 3_000.0 / fs as f32;

        let joined = discriminate(&whole);
        let restarted = discriminate(second);
        assert_approx_eq(joined[100], true_step, 1e-4, "continuous boundary");
        assert_eq!(restarted[0], 0.0);
        assert_eq!(discriminate(first)[0], 0.0);
    }
}
