//! Log-mel spectrogram extraction.
//!
//! STFT with a periodic Hann window, magnitude raised to the configured
//! power, Slaney-normalized mel filterbank over [0, sr/2], then the log
//! compression `20/power * log10(mel + eps)`. The resulting map is resized
//! bilinearly to the canonical (128, 312) shape and min-max normalized to
//! [0, 1] per sample.

use std::sync::Arc;

use anyhow::bail;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tch::{Kind, Tensor};

/// Canonical sample shape. Every normalized spectrogram is (1, 128, 312);
/// 312 rather than 313 keeps the time axis divisible by the predictor's
/// three downsampling stages.
pub const MEL_BANDS: i64 = 128;
pub const TIME_FRAMES: i64 = 312;

pub struct FeatureExtractor {
    n_fft: usize,
    hop_length: usize,
    n_mels: usize,
    power: f64,
    window: Vec<f64>,
    fft: Arc<dyn Fft<f64>>,
}

impl FeatureExtractor {
    pub fn new(n_fft: usize, hop_length: usize, n_mels: usize, power: f64) -> Self {
        let window = hann_window(n_fft);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n_fft);
        Self { n_fft, hop_length, n_mels, power, window, fft }
    }

    /// Extract a normalized log-mel spectrogram, shape (1, 128, 312),
    /// values in [0, 1]. The min/max used for normalization are the
    /// sample's own, never a global statistic.
    pub fn extract(&self, samples: &[f32], sample_rate: u32) -> anyhow::Result<Tensor> {
        if samples.len() < self.n_fft {
            bail!(
                "clip too short for feature extraction: {} samples, n_fft {}",
                samples.len(),
                self.n_fft
            );
        }
        let samples: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        // Center the frames by reflect-padding half a window on each side.
        let padded = reflect_pad(&samples, self.n_fft / 2);
        let spectra = self.power_spectrogram(&padded);
        let filterbank = mel_filterbank(self.n_fft, self.n_mels, sample_rate);

        let num_frames = spectra.len();
        let mut log_mel = vec![0.0f32; self.n_mels * num_frames];
        let log_scale = 20.0 / self.power;
        for (frame_idx, frame) in spectra.iter().enumerate() {
            for (mel_idx, filter) in filterbank.iter().enumerate() {
                let mut acc = 0.0;
                for (bin_idx, &weight) in filter.iter().enumerate() {
                    if weight > 0.0 {
                        acc += weight * frame[bin_idx];
                    }
                }
                log_mel[mel_idx * num_frames + frame_idx] =
                    (log_scale * (acc + f64::EPSILON).log10()) as f32;
            }
        }

        let spec = Tensor::from_slice(&log_mel).view([1, 1, self.n_mels as i64, num_frames as i64]);
        let spec = spec
            .upsample_bilinear2d([MEL_BANDS, TIME_FRAMES], false, None, None)
            .squeeze_dim(0);
        let min = spec.min();
        let max = spec.max();
        // Epsilon keeps the division defined for constant segments; the
        // scaling still degenerates when max ~ min.
        let normalized = (spec - &min) / (&max - &min + 1e-8);
        Ok(normalized.to_kind(Kind::Float))
    }

    /// Magnitude spectra raised to `power`, one vec of `n_fft/2 + 1` bins
    /// per frame.
    fn power_spectrogram(&self, padded: &[f64]) -> Vec<Vec<f64>> {
        let num_bins = self.n_fft / 2 + 1;
        let num_frames = (padded.len() - self.n_fft) / self.hop_length + 1;
        let mut frames = Vec::with_capacity(num_frames);
        for frame_idx in 0..num_frames {
            let start = frame_idx * self.hop_length;
            let mut buffer: Vec<Complex<f64>> = (0..self.n_fft)
                .map(|i| Complex::new(padded[start + i] * self.window[i], 0.0))
                .collect();
            self.fft.process(&mut buffer);
            let spectrum: Vec<f64> = buffer[..num_bins]
                .iter()
                .map(|c| (c.re * c.re + c.im * c.im).sqrt().powf(self.power))
                .collect();
            frames.push(spectrum);
        }
        frames
    }
}

fn hann_window(length: usize) -> Vec<f64> {
    (0..length)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / length as f64;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

fn reflect_pad(signal: &[f64], pad: usize) -> Vec<f64> {
    let len = signal.len();
    let mut padded = Vec::with_capacity(len + 2 * pad);
    for i in (1..=pad).rev() {
        padded.push(signal[i.min(len - 1)]);
    }
    padded.extend_from_slice(signal);
    for i in 0..pad {
        padded.push(signal[len.saturating_sub(2 + i)]);
    }
    padded
}

/// Slaney-normalized triangular mel filterbank covering [0, sr/2].
/// Returns `n_mels` filters of `n_fft/2 + 1` weights each.
fn mel_filterbank(n_fft: usize, n_mels: usize, sample_rate: u32) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;

    let mel_min = hz_to_mel(0.0);
    let mel_max = hz_to_mel(sr / 2.0);
    let hz_points: Vec<f64> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();
    let bin_freqs: Vec<f64> = (0..num_bins).map(|i| sr * i as f64 / n_fft as f64).collect();

    let mut filters = Vec::with_capacity(n_mels);
    for i in 0..n_mels {
        let f_left = hz_points[i];
        let f_center = hz_points[i + 1];
        let f_right = hz_points[i + 2];
        let norm = 2.0 / (f_right - f_left);
        let filter: Vec<f64> = bin_freqs
            .iter()
            .map(|&f| {
                if f < f_left || f > f_right {
                    0.0
                } else if f <= f_center {
                    norm * (f - f_left) / (f_center - f_left)
                } else {
                    norm * (f_right - f) / (f_right - f_center)
                }
            })
            .collect();
        filters.push(filter);
    }
    filters
}

/// Hz to Slaney mel: linear below 1000 Hz, logarithmic above.
fn hz_to_mel(hz: f64) -> f64 {
    if hz < 1000.0 {
        3.0 * hz / 200.0
    } else {
        15.0 + 27.0 * (hz / 1000.0).ln() / (6.4f64).ln()
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel < 15.0 {
        200.0 * mel / 3.0
    } else {
        1000.0 * ((mel - 15.0) * (6.4f64).ln() / 27.0).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hann_window_is_periodic_and_symmetric() {
        let w = hann_window(1024);
        assert!(w[0].abs() < 1e-12);
        assert!((w[512] - 1.0).abs() < 1e-12);
        assert!((w[100] - w[1024 - 100]).abs() < 1e-12);
    }

    #[test]
    fn mel_scale_roundtrip() {
        for hz in [0.0, 100.0, 440.0, 1000.0, 8000.0] {
            let back = mel_to_hz(hz_to_mel(hz));
            assert!((hz - back).abs() < 1e-6, "roundtrip failed for {hz} Hz");
        }
    }

    #[test]
    fn filterbank_covers_all_bands() {
        let fb = mel_filterbank(1024, 128, 16000);
        assert_eq!(fb.len(), 128);
        assert_eq!(fb[0].len(), 513);
        for (i, filter) in fb.iter().enumerate() {
            assert!(filter.iter().all(|&w| w >= 0.0));
            assert!(filter.iter().sum::<f64>() > 0.0, "filter {i} is all zeros");
        }
    }

    #[test]
    fn extract_yields_canonical_normalized_shape() {
        let extractor = FeatureExtractor::new(1024, 512, 128, 2.0);
        let samples: Vec<f32> = (0..16000)
            .map(|i| (2.0 * std::f64::consts::PI * 440.0 * i as f64 / 16000.0).sin() as f32)
            .collect();
        let spec = extractor.extract(&samples, 16000).unwrap();
        assert_eq!(spec.size(), vec![1, MEL_BANDS, TIME_FRAMES]);
        let min = spec.min().double_value(&[]);
        let max = spec.max().double_value(&[]);
        assert!(min >= 0.0 && max <= 1.0);
        assert!(max > min, "a sine wave must produce variation");
    }

    #[test]
    fn rejects_too_short_clips() {
        let extractor = FeatureExtractor::new(1024, 512, 128, 2.0);
        assert!(extractor.extract(&[0.0; 100], 16000).is_err());
    }
}
