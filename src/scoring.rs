//! Anomaly scoring from the reconstruction residual.

use tch::{Kind, Tensor};

use crate::error::EngineError;

/// Scores a batch of samples against their reconstructions by aggregating
/// the largest per-pixel absolute errors.
///
/// The per-sample score is `sum(top_k errors) / canonical_pixels`, where
/// `k = floor(num_pixels * k_fraction)` and the normalization constant is
/// the canonical sample's total pixel count (mel_bands * time_frames), not
/// the top-k count. Shapes are fixed by construction upstream, which is
/// what keeps scores comparable across samples.
pub struct AnomalyScorer {
    k_fraction: f64,
    canonical_pixels: i64,
}

impl AnomalyScorer {
    pub fn new(k_fraction: f64, mel_bands: i64, time_frames: i64) -> Result<Self, EngineError> {
        if !(k_fraction > 0.0 && k_fraction <= 1.0) {
            return Err(EngineError::InvalidFraction(k_fraction));
        }
        if mel_bands <= 0 || time_frames <= 0 {
            return Err(EngineError::Configuration(format!(
                "canonical shape must be positive, got {mel_bands}x{time_frames}"
            )));
        }
        Ok(Self { k_fraction, canonical_pixels: mel_bands * time_frames })
    }

    /// Per-sample anomaly scores, shape `[batch]`. Non-negative, zero only
    /// for an exact reconstruction of the most-erroneous pixels.
    ///
    /// A reconstruction longer than the original in the trailing (time)
    /// dimension is cropped before differencing; any other disagreement is
    /// a `ShapeMismatch`.
    pub fn score(&self, original: &Tensor, reconstructed: &Tensor) -> Result<Tensor, EngineError> {
        let orig_dims = original.size();
        let rec_dims = reconstructed.size();
        if orig_dims.len() != rec_dims.len() || orig_dims.is_empty() {
            return Err(EngineError::ShapeMismatch {
                expected: orig_dims,
                actual: rec_dims,
            });
        }
        let last = orig_dims.len() - 1;
        let reconstructed = if rec_dims[last] > orig_dims[last] {
            reconstructed.narrow(last as i64, 0, orig_dims[last])
        } else {
            reconstructed.shallow_clone()
        };
        if reconstructed.size() != orig_dims {
            return Err(EngineError::ShapeMismatch {
                expected: orig_dims,
                actual: reconstructed.size(),
            });
        }
        let batch = orig_dims[0];
        let errors = (original - reconstructed).abs().view([batch, -1]);
        let per_sample = errors.size()[1];
        let k = ((per_sample as f64) * self.k_fraction).floor() as i64;
        let (top, _) = errors.topk(k, 1, true, true);
        let scores = top.sum_dim_intlist(1, false, Kind::Float) / self.canonical_pixels as f64;
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    const SHAPE: [i64; 4] = [2, 1, 128, 312];

    fn scorer() -> AnomalyScorer {
        AnomalyScorer::new(0.1, 128, 312).unwrap()
    }

    #[test]
    fn identical_tensors_score_zero() {
        let x = Tensor::rand(SHAPE, (Kind::Float, Device::Cpu));
        let scores = scorer().score(&x, &x).unwrap();
        assert_eq!(scores.size(), vec![2]);
        assert_eq!(scores.max().double_value(&[]), 0.0);
    }

    #[test]
    fn score_grows_with_perturbation() {
        let x = Tensor::zeros(SHAPE, (Kind::Float, Device::Cpu));
        let s = scorer();
        let mut previous = 0.0;
        for magnitude in [0.1, 0.2, 0.5, 1.0] {
            let rec = &x + magnitude;
            let score = s.score(&x, &rec).unwrap().max().double_value(&[]);
            assert!(score > previous, "larger perturbation must not lower the score");
            previous = score;
        }
    }

    #[test]
    fn normalizes_by_canonical_pixel_count() {
        // Uniform error e: top-k sum = k * e, score = k * e / (128 * 312).
        let x = Tensor::zeros(SHAPE, (Kind::Float, Device::Cpu));
        let rec = &x + 1.0;
        let score = scorer().score(&x, &rec).unwrap().max().double_value(&[]);
        let pixels = 128 * 312;
        let k = ((pixels as f64) * 0.1).floor();
        let expected = k / pixels as f64;
        assert!((score - expected).abs() < 1e-5);
    }

    #[test]
    fn crops_longer_reconstruction() {
        let x = Tensor::zeros(SHAPE, (Kind::Float, Device::Cpu));
        let rec = Tensor::zeros([2, 1, 128, 313], (Kind::Float, Device::Cpu));
        let scores = scorer().score(&x, &rec).unwrap();
        assert_eq!(scores.max().double_value(&[]), 0.0);
    }

    #[test]
    fn rejects_mel_band_mismatch() {
        let x = Tensor::zeros(SHAPE, (Kind::Float, Device::Cpu));
        let rec = Tensor::zeros([2, 1, 64, 312], (Kind::Float, Device::Cpu));
        assert!(matches!(
            scorer().score(&x, &rec),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_invalid_fraction() {
        assert!(matches!(
            AnomalyScorer::new(0.0, 128, 312),
            Err(EngineError::InvalidFraction(_))
        ));
        assert!(matches!(
            AnomalyScorer::new(1.5, 128, 312),
            Err(EngineError::InvalidFraction(_))
        ));
        assert!(AnomalyScorer::new(1.0, 128, 312).is_ok());
    }
}
