//! The diffusion process engine: closed-form forward noising and the
//! iterative reverse (partial) denoising procedure driven by a learned
//! noise predictor.

use tch::{Device, Kind, Tensor};

use crate::error::EngineError;
use crate::schedulers::NoiseSchedule;

/// A trained model predicting the noise contained in a noised sample.
///
/// `x` is a batched sample tensor of shape `[B, C, M, W]` and `t` an Int64
/// tensor of per-sample timesteps, shape `[B]`. The output must match `x`
/// in the batch, channel and mel dimensions; a wider time dimension is
/// tolerated and cropped by the caller.
pub trait NoisePredictor {
    fn predict_noise(&self, x: &Tensor, t: &Tensor) -> Tensor;
}

/// Source of the stochastic draws used by the engine. Threading this
/// through explicitly keeps tests deterministic.
pub trait NoiseSource {
    fn sample_like(&self, reference: &Tensor) -> Tensor;
}

/// Standard normal draws on the reference tensor's device.
pub struct GaussianNoise;

impl NoiseSource for GaussianNoise {
    fn sample_like(&self, reference: &Tensor) -> Tensor {
        Tensor::randn_like(reference)
    }
}

pub struct Diffuser {
    schedule: NoiseSchedule,
    device: Device,
    // [T] gather tables for batched forward noising.
    sqrt_alpha_bars: Tensor,
    sqrt_one_minus_alpha_bars: Tensor,
    noise_source: Box<dyn NoiseSource>,
}

impl Diffuser {
    pub fn new(schedule: NoiseSchedule, device: Device) -> Self {
        let sqrt_ab: Vec<f64> = schedule.alpha_bars().iter().map(|a| a.sqrt()).collect();
        let sqrt_omab: Vec<f64> =
            schedule.alpha_bars().iter().map(|a| (1.0 - a).sqrt()).collect();
        let sqrt_alpha_bars =
            Tensor::from_slice(&sqrt_ab).to_kind(Kind::Float).to_device(device);
        let sqrt_one_minus_alpha_bars =
            Tensor::from_slice(&sqrt_omab).to_kind(Kind::Float).to_device(device);
        Self {
            schedule,
            device,
            sqrt_alpha_bars,
            sqrt_one_minus_alpha_bars,
            noise_source: Box::new(GaussianNoise),
        }
    }

    pub fn with_noise_source(mut self, noise_source: Box<dyn NoiseSource>) -> Self {
        self.noise_source = noise_source;
        self
    }

    pub fn num_timesteps(&self) -> i64 {
        self.schedule.num_timesteps()
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Forward process: noise `sample` to its state at the given per-sample
    /// timesteps in a single closed-form step.
    ///
    /// `x_t = sqrt(alpha_bar_t) * sample + sqrt(1 - alpha_bar_t) * noise`
    ///
    /// When `noise` is `None` a fresh draw is taken from the engine's noise
    /// source; passing it explicitly is the reproducible path used by tests
    /// and by the training loop's loss computation.
    pub fn add_noise(
        &self,
        sample: &Tensor,
        t: &Tensor,
        noise: Option<Tensor>,
    ) -> Result<(Tensor, Tensor), EngineError> {
        let dims = sample.size();
        if dims.len() != 4 {
            return Err(EngineError::ShapeMismatch {
                expected: vec![-1, -1, -1, -1],
                actual: dims,
            });
        }
        if t.numel() as i64 != dims[0] {
            return Err(EngineError::ShapeMismatch {
                expected: vec![dims[0]],
                actual: t.size(),
            });
        }
        self.check_timesteps(t)?;
        let noise = match noise {
            Some(n) => {
                if n.size() != dims {
                    return Err(EngineError::ShapeMismatch {
                        expected: dims,
                        actual: n.size(),
                    });
                }
                n
            }
            None => self.noise_source.sample_like(sample),
        };
        let idx = (t.to_kind(Kind::Int64) - 1).to_device(self.device);
        let scale = self.sqrt_alpha_bars.index_select(0, &idx).view([-1, 1, 1, 1]);
        let sigma = self
            .sqrt_one_minus_alpha_bars
            .index_select(0, &idx)
            .view([-1, 1, 1, 1]);
        let x_t = scale * sample + sigma * &noise;
        Ok((x_t, noise))
    }

    /// Reverse process: starting from `x_t` at timestep `t`, iterate the
    /// predictor down to timestep 0 and return the reconstruction.
    ///
    /// Each step computes the posterior mean
    /// `(x_s - (beta_s / sqrt(1 - alpha_bar_s)) * eps_hat) / sqrt(alpha_s)`
    /// and, for s > 1, perturbs it with fresh noise scaled by sqrt(beta_s).
    /// The terminal step (s == 1) adds no noise.
    ///
    /// Cost is exactly `t` predictor calls; anomaly scoring runs this with a
    /// small fixed `t`, trading reconstruction fidelity for sensitivity to
    /// near-input-level perturbations.
    pub fn denoise(
        &self,
        predictor: &dyn NoisePredictor,
        x_t: &Tensor,
        t: i64,
    ) -> Result<Tensor, EngineError> {
        let max = self.schedule.num_timesteps();
        if t < 1 || t > max {
            return Err(EngineError::TimestepOutOfRange { t, max });
        }
        let dims = x_t.size();
        let (batch, channels, mel, frames) = match dims.as_slice() {
            &[b, c, m, w] => (b, c, m, w),
            _ => {
                return Err(EngineError::ShapeMismatch {
                    expected: vec![-1, -1, -1, -1],
                    actual: dims,
                })
            }
        };
        let mut x = x_t.shallow_clone();
        for s in (1..=t).rev() {
            let step = Tensor::ones([batch], (Kind::Int64, self.device)) * s;
            let eps = predictor.predict_noise(&x, &step);
            let eps_dims = eps.size();
            let agrees = eps_dims.len() == 4
                && eps_dims[0] == batch
                && eps_dims[1] == channels
                && eps_dims[2] == mel
                && eps_dims[3] >= frames;
            if !agrees {
                return Err(EngineError::ShapeMismatch {
                    expected: vec![batch, channels, mel, frames],
                    actual: eps_dims,
                });
            }
            // A predictor output one frame too wide (upstream resize
            // rounding) is cropped; narrower output is an error above.
            let eps = if eps_dims[3] > frames {
                eps.narrow(3, 0, frames)
            } else {
                eps
            };
            let beta = self.schedule.beta(s);
            let alpha = self.schedule.alpha(s);
            let alpha_bar = self.schedule.alpha_bar(s);
            let mean = (&x - eps * (beta / (1.0 - alpha_bar).sqrt())) / alpha.sqrt();
            x = if s > 1 {
                &mean + self.noise_source.sample_like(&mean) * beta.sqrt()
            } else {
                mean
            };
        }
        Ok(x)
    }

    fn check_timesteps(&self, t: &Tensor) -> Result<(), EngineError> {
        let max = self.schedule.num_timesteps();
        let t_min = t.min().int64_value(&[]);
        let t_max = t.max().int64_value(&[]);
        if t_min < 1 {
            return Err(EngineError::TimestepOutOfRange { t: t_min, max });
        }
        if t_max > max {
            return Err(EngineError::TimestepOutOfRange { t: t_max, max });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPE: [i64; 4] = [2, 1, 128, 312];

    fn diffuser(num_timesteps: i64) -> Diffuser {
        let schedule = NoiseSchedule::build(num_timesteps, 1e-4, 0.02).unwrap();
        Diffuser::new(schedule, Device::Cpu)
    }

    /// Predictor stub returning zeros, optionally wider in the time
    /// dimension or wrong in the channel dimension.
    struct StubPredictor {
        extra_frames: i64,
        channels: i64,
    }

    impl StubPredictor {
        fn zeros() -> Self {
            Self { extra_frames: 0, channels: 1 }
        }
    }

    impl NoisePredictor for StubPredictor {
        fn predict_noise(&self, x: &Tensor, _t: &Tensor) -> Tensor {
            let (b, _, m, w) = x.size4().unwrap();
            Tensor::zeros(
                [b, self.channels, m, w + self.extra_frames],
                (Kind::Float, x.device()),
            )
        }
    }

    /// Noise source that must never be consulted.
    struct ForbiddenNoise;

    impl NoiseSource for ForbiddenNoise {
        fn sample_like(&self, _reference: &Tensor) -> Tensor {
            panic!("noise source consulted in a deterministic path");
        }
    }

    struct ZeroNoise;

    impl NoiseSource for ZeroNoise {
        fn sample_like(&self, reference: &Tensor) -> Tensor {
            Tensor::zeros_like(reference)
        }
    }

    #[test]
    fn add_noise_with_injected_noise_is_closed_form() {
        let d = diffuser(1000);
        let sample = Tensor::ones(SHAPE, (Kind::Float, Device::Cpu));
        let noise = Tensor::zeros(SHAPE, (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[1i64, 1]);
        let (x_t, _) = d.add_noise(&sample, &t, Some(noise)).unwrap();
        // With zero noise, x_1 = sqrt(alpha_bar_1) * sample.
        let expected = d.schedule().alpha_bar(1).sqrt();
        let diff = (&x_t - expected).abs().max().double_value(&[]);
        assert!(diff < 1e-6, "x_1 should be the sample scaled by sqrt(alpha_bar_1)");
    }

    #[test]
    fn low_timestep_is_near_identity() {
        let d = diffuser(1000);
        let sample = Tensor::ones(SHAPE, (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[1i64, 1]);
        let (x_t, _) = d.add_noise(&sample, &t, None).unwrap();
        // sqrt(alpha_bar_1) ~ 1 and sqrt(1 - alpha_bar_1) ~ 0.01, so the
        // output stays close to the sample.
        let diff = (&x_t - &sample).abs().mean(Kind::Float).double_value(&[]);
        assert!(diff < 0.05, "t=1 output drifted too far from the input: {diff}");
    }

    #[test]
    fn high_timestep_is_noise_dominated() {
        let d = diffuser(1000);
        let sample = Tensor::ones(SHAPE, (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[1000i64, 1000]);
        let (x_t, noise) = d.add_noise(&sample, &t, None).unwrap();
        // alpha_bar_T is near zero, so x_T is essentially the noise tensor.
        let diff = (&x_t - &noise).abs().mean(Kind::Float).double_value(&[]);
        assert!(diff < 0.3, "t=T output should be dominated by noise: {diff}");
    }

    #[test]
    fn per_sample_timesteps_are_independent() {
        let d = diffuser(1000);
        let sample = Tensor::ones(SHAPE, (Kind::Float, Device::Cpu));
        let noise = Tensor::zeros(SHAPE, (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[1i64, 1000]);
        let (x_t, _) = d.add_noise(&sample, &t, Some(noise)).unwrap();
        let first = x_t.narrow(0, 0, 1).mean(Kind::Float).double_value(&[]);
        let second = x_t.narrow(0, 1, 1).mean(Kind::Float).double_value(&[]);
        assert!((first - d.schedule().alpha_bar(1).sqrt()).abs() < 1e-6);
        assert!((second - d.schedule().alpha_bar(1000).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn rejects_out_of_range_timesteps() {
        let d = diffuser(1000);
        let sample = Tensor::zeros(SHAPE, (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[0i64, 50]);
        assert!(matches!(
            d.add_noise(&sample, &t, None),
            Err(EngineError::TimestepOutOfRange { .. })
        ));
        let t = Tensor::from_slice(&[50i64, 1001]);
        assert!(matches!(
            d.add_noise(&sample, &t, None),
            Err(EngineError::TimestepOutOfRange { .. })
        ));
    }

    #[test]
    fn denoise_terminal_step_adds_no_noise() {
        // At t=1 the reverse process is deterministic: the noise source
        // must never be drawn from.
        let d = diffuser(1000).with_noise_source(Box::new(ForbiddenNoise));
        let x_1 = Tensor::ones(SHAPE, (Kind::Float, Device::Cpu));
        let rec = d.denoise(&StubPredictor::zeros(), &x_1, 1).unwrap();
        // With eps_hat = 0 the mean reduces to x_1 / sqrt(alpha_1).
        let expected = 1.0 / d.schedule().alpha(1).sqrt();
        let diff = (&rec - expected).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn denoise_from_zeros_with_zero_predictor_stays_zero() {
        // End-to-end scenario: T=1000, zero sample, zero injected noise,
        // zero-predicting stub; everything stays exactly zero.
        let d = diffuser(1000).with_noise_source(Box::new(ZeroNoise));
        let sample = Tensor::zeros(SHAPE, (Kind::Float, Device::Cpu));
        let noise = Tensor::zeros(SHAPE, (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[50i64, 50]);
        let (x_t, _) = d.add_noise(&sample, &t, Some(noise)).unwrap();
        assert_eq!(x_t.abs().max().double_value(&[]), 0.0);
        let rec = d.denoise(&StubPredictor::zeros(), &x_t, 50).unwrap();
        assert_eq!(rec.abs().max().double_value(&[]), 0.0);
        assert_eq!(rec.size(), SHAPE.to_vec());
    }

    #[test]
    fn denoise_rejects_channel_mismatch() {
        let d = diffuser(1000).with_noise_source(Box::new(ZeroNoise));
        let x_t = Tensor::zeros(SHAPE, (Kind::Float, Device::Cpu));
        let bad = StubPredictor { extra_frames: 0, channels: 2 };
        assert!(matches!(
            d.denoise(&bad, &x_t, 10),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn denoise_crops_wider_predictor_output() {
        let d = diffuser(1000).with_noise_source(Box::new(ZeroNoise));
        let x_t = Tensor::zeros(SHAPE, (Kind::Float, Device::Cpu));
        let wide = StubPredictor { extra_frames: 1, channels: 1 };
        let rec = d.denoise(&wide, &x_t, 10).unwrap();
        assert_eq!(rec.size(), SHAPE.to_vec());
    }

    #[test]
    fn denoise_rejects_out_of_range_start() {
        let d = diffuser(100);
        let x_t = Tensor::zeros(SHAPE, (Kind::Float, Device::Cpu));
        assert!(matches!(
            d.denoise(&StubPredictor::zeros(), &x_t, 0),
            Err(EngineError::TimestepOutOfRange { .. })
        ));
        assert!(matches!(
            d.denoise(&StubPredictor::zeros(), &x_t, 101),
            Err(EngineError::TimestepOutOfRange { .. })
        ));
    }
}
