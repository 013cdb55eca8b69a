//! Variance schedules for the forward and reverse diffusion processes.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// This represents how beta ranges from its minimum value to the maximum
/// over the diffusion steps.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Linear interpolation.
    #[default]
    Linear,
}

/// Precomputed per-timestep coefficients `(beta_t, alpha_t, alpha_bar_t)`
/// for timesteps 1..=T. Built once at startup and never mutated; readers
/// may share it freely.
///
/// Index `i` of each vector holds the entry for timestep `i + 1`.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    num_timesteps: i64,
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alpha_bars: Vec<f64>,
}

impl NoiseSchedule {
    pub fn build(num_timesteps: i64, beta_min: f64, beta_max: f64) -> Result<Self, EngineError> {
        Self::build_with(BetaSchedule::Linear, num_timesteps, beta_min, beta_max)
    }

    pub fn build_with(
        schedule: BetaSchedule,
        num_timesteps: i64,
        beta_min: f64,
        beta_max: f64,
    ) -> Result<Self, EngineError> {
        if num_timesteps <= 0 {
            return Err(EngineError::Configuration(format!(
                "num_timesteps must be positive, got {num_timesteps}"
            )));
        }
        if !(beta_min > 0.0 && beta_max < 1.0 && beta_min < beta_max) {
            return Err(EngineError::Configuration(format!(
                "beta range must satisfy 0 < beta_min < beta_max < 1, got [{beta_min}, {beta_max}]"
            )));
        }
        let n = num_timesteps as usize;
        let betas: Vec<f64> = match schedule {
            BetaSchedule::Linear => (0..n)
                .map(|i| {
                    if n == 1 {
                        beta_min
                    } else {
                        beta_min + (beta_max - beta_min) * i as f64 / (n - 1) as f64
                    }
                })
                .collect(),
        };
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        // alpha_bar_t = alpha_bar_{t-1} * alpha_t, with alpha_bar_0 = 1.
        let mut alpha_bars = Vec::with_capacity(n);
        let mut cum_prod = 1.0f64;
        for &a in &alphas {
            cum_prod *= a;
            alpha_bars.push(cum_prod);
        }
        Ok(Self { num_timesteps, betas, alphas, alpha_bars })
    }

    pub fn num_timesteps(&self) -> i64 {
        self.num_timesteps
    }

    /// `beta_t` for a timestep in [1, T]. Callers validate the range.
    pub fn beta(&self, t: i64) -> f64 {
        self.betas[(t - 1) as usize]
    }

    pub fn alpha(&self, t: i64) -> f64 {
        self.alphas[(t - 1) as usize]
    }

    pub fn alpha_bar(&self, t: i64) -> f64 {
        self.alpha_bars[(t - 1) as usize]
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alpha_bars(&self) -> &[f64] {
        &self.alpha_bars
    }
}
