use thiserror::Error;

/// Failures of the diffusion engine. All of these indicate a configuration
/// or programming defect, never a recoverable runtime condition.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("timestep {t} out of range [1, {max}]")]
    TimestepOutOfRange { t: i64, max: i64 },

    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<i64>, actual: Vec<i64> },

    #[error("k_fraction must lie in (0, 1], got {0}")]
    InvalidFraction(f64),
}
