use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::utils::ComputeTarget;

fn default_num_threads() -> i32 {
    0
}

/// Full application configuration, loaded from a TOML file.
///
/// The diffusion-engine fields (`num_timesteps`, `beta_min`, `beta_max`,
/// `scoring_timestep`, `k_fraction`) are required; a missing or invalid
/// value fails at load time, before any tensor work starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // data
    pub train_data_path: String,
    pub test_data_path: String,
    pub model_directory: String,
    pub result_directory: String,
    // features
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub power: f64,
    // training
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    // diffusion engine
    pub num_timesteps: i64,
    pub beta_min: f64,
    pub beta_max: f64,
    pub scoring_timestep: i64,
    pub k_fraction: f64,
    #[serde(default)]
    pub compute_target: ComputeTarget,
    /// Intra-op thread count for the tensor backend. 0 keeps the backend
    /// default. Explicit here rather than an env var set at process start.
    #[serde(default = "default_num_threads")]
    pub num_threads: i32,
}

impl AppConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: AppConfig =
            toml::from_str(&file).map_err(|e| EngineError::Configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.num_timesteps <= 0 {
            return Err(EngineError::Configuration(format!(
                "num_timesteps must be positive, got {}",
                self.num_timesteps
            )));
        }
        if !(self.beta_min > 0.0 && self.beta_max < 1.0 && self.beta_min < self.beta_max) {
            return Err(EngineError::Configuration(format!(
                "beta range must satisfy 0 < beta_min < beta_max < 1, got [{}, {}]",
                self.beta_min, self.beta_max
            )));
        }
        if self.scoring_timestep < 1 || self.scoring_timestep > self.num_timesteps {
            return Err(EngineError::Configuration(format!(
                "scoring_timestep {} outside [1, {}]",
                self.scoring_timestep, self.num_timesteps
            )));
        }
        if !(self.k_fraction > 0.0 && self.k_fraction <= 1.0) {
            return Err(EngineError::InvalidFraction(self.k_fraction));
        }
        if self.batch_size == 0 || self.epochs == 0 {
            return Err(EngineError::Configuration(
                "batch_size and epochs must be positive".to_string(),
            ));
        }
        if self.learning_rate <= 0.0 {
            return Err(EngineError::Configuration(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.n_fft == 0 || self.hop_length == 0 || self.n_mels == 0 || self.power <= 0.0 {
            return Err(EngineError::Configuration(
                "n_fft, hop_length, n_mels and power must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply process-level settings (thread count) once at startup.
    pub fn apply_runtime_settings(&self) {
        if self.num_threads > 0 {
            tch::set_num_threads(self.num_threads);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AppConfig;
    use crate::error::EngineError;

    fn base_toml() -> String {
        r#"
            train_data_path = "data/train"
            test_data_path = "data/test"
            model_directory = "models"
            result_directory = "results"
            n_fft = 1024
            hop_length = 512
            n_mels = 128
            power = 2.0
            batch_size = 16
            epochs = 10
            learning_rate = 1e-4
            num_timesteps = 1000
            beta_min = 1e-4
            beta_max = 0.02
            scoring_timestep = 50
            k_fraction = 0.1
        "#
        .to_string()
    }

    #[test]
    fn test_load_default_config() {
        let cfg = AppConfig::from_file("config.default.toml").unwrap();
        assert_eq!(cfg.num_timesteps, 1000);
        assert_eq!(cfg.scoring_timestep, 50);
    }

    #[test]
    fn missing_engine_field_fails() {
        let toml = base_toml().replace("k_fraction = 0.1", "");
        let err = toml::from_str::<AppConfig>(&toml);
        assert!(err.is_err());
    }

    #[test]
    fn bad_beta_range_fails_validation() {
        let mut cfg: AppConfig = toml::from_str(&base_toml()).unwrap();
        cfg.beta_min = 0.5;
        cfg.beta_max = 0.1;
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn bad_k_fraction_fails_validation() {
        let mut cfg: AppConfig = toml::from_str(&base_toml()).unwrap();
        cfg.k_fraction = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::InvalidFraction(_))
        ));
    }

    #[test]
    fn scoring_timestep_bounded_by_num_timesteps() {
        let mut cfg: AppConfig = toml::from_str(&base_toml()).unwrap();
        cfg.scoring_timestep = 2000;
        assert!(cfg.validate().is_err());
    }
}
