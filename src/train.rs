//! Training loop: per batch, noise the clean samples at random timesteps
//! and regress the predictor onto the exact injected noise.

use std::path::Path;

use anyhow::Result;
use tch::nn::{self, OptimizerConfig};
use tch::{Kind, Tensor};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::dataset::AudioDataset;
use crate::diffusion::Diffuser;
use crate::features::FeatureExtractor;
use crate::schedulers::NoiseSchedule;
use crate::unet::{UNet2D, UNetConfig};

pub const MODEL_FILE: &str = "autoencoder_with_diffusion.ot";

pub fn run(config: &AppConfig) -> Result<()> {
    config.apply_runtime_settings();
    let device = config.compute_target.resolve();
    info!(?device, "starting training");

    let schedule = NoiseSchedule::build(config.num_timesteps, config.beta_min, config.beta_max)?;
    let diffuser = Diffuser::new(schedule, device);
    let extractor =
        FeatureExtractor::new(config.n_fft, config.hop_length, config.n_mels, config.power);
    let dataset = AudioDataset::from_dir(&config.train_data_path, extractor, device)?;
    info!(clips = dataset.len(), "loaded training data");

    let vs = nn::VarStore::new(device);
    let unet = UNet2D::new(vs.root(), UNetConfig::default());
    let mut opt = nn::Adam::default().build(&vs, config.learning_rate)?;

    for epoch in 1..=config.epochs {
        let mut running_loss = 0.0;
        let mut batches = 0usize;
        for batch in dataset.batches(config.batch_size, true) {
            let (data, _labels) = batch?;
            let batch_len = data.size()[0];
            let t = Tensor::randint_low(
                1,
                config.num_timesteps + 1,
                [batch_len],
                (Kind::Int64, device),
            );
            let (x_t, noise) = diffuser.add_noise(&data, &t, None)?;
            let noise_pred = unet.forward(&x_t, &t);
            let loss = noise_pred.mse_loss(&noise, tch::Reduction::Mean);
            opt.backward_step(&loss);

            let loss_value = loss.double_value(&[]);
            if loss_value.is_nan() {
                warn!(epoch, batch = batches, "NaN loss");
            }
            running_loss += loss_value;
            batches += 1;
        }
        info!(
            epoch,
            epochs = config.epochs,
            avg_loss = running_loss / batches.max(1) as f64,
            "epoch complete"
        );
    }

    std::fs::create_dir_all(&config.model_directory)?;
    let model_path = Path::new(&config.model_directory).join(MODEL_FILE);
    vs.save(&model_path)?;
    info!(path = %model_path.display(), "saved model");
    Ok(())
}
