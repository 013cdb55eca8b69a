pub mod config;
pub mod dataset;
pub mod diffusion;
pub mod error;
pub mod eval;
pub mod features;
pub mod metrics;
pub mod schedulers;
pub mod scoring;
pub mod train;
pub mod unet;
pub mod utils;
