//! Evaluation loop: noise each clip to the fixed scoring timestep,
//! reconstruct through the reverse process, score the residual, and report
//! AUC / pAUC over the accumulated records.

use std::path::Path;

use anyhow::Result;
use tch::{nn, Device, Kind, Tensor};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::dataset::AudioDataset;
use crate::diffusion::Diffuser;
use crate::features::{FeatureExtractor, MEL_BANDS, TIME_FRAMES};
use crate::metrics::{self, ResultRecord};
use crate::schedulers::NoiseSchedule;
use crate::scoring::AnomalyScorer;
use crate::train::MODEL_FILE;
use crate::unet::{UNet2D, UNetConfig};
use crate::utils::has_nan;

/// pAUC integrates the ROC curve over FPR <= this limit.
const PAUC_FPR_LIMIT: f64 = 0.1;

pub fn run(config: &AppConfig) -> Result<()> {
    config.apply_runtime_settings();
    let device = config.compute_target.resolve();
    info!(?device, scoring_timestep = config.scoring_timestep, "starting evaluation");

    let schedule = NoiseSchedule::build(config.num_timesteps, config.beta_min, config.beta_max)?;
    let diffuser = Diffuser::new(schedule, device);
    let extractor =
        FeatureExtractor::new(config.n_fft, config.hop_length, config.n_mels, config.power);
    let dataset = AudioDataset::from_dir(&config.test_data_path, extractor, device)?;
    info!(clips = dataset.len(), "loaded test data");

    let mut vs = nn::VarStore::new(device);
    let unet = UNet2D::new(vs.root(), UNetConfig::default());
    let model_path = Path::new(&config.model_directory).join(MODEL_FILE);
    vs.load(&model_path)?;

    let scorer = AnomalyScorer::new(config.k_fraction, MEL_BANDS, TIME_FRAMES)?;
    let records = collect_records(config, device, &diffuser, &unet, &scorer, &dataset)?;

    std::fs::create_dir_all(&config.result_directory)?;
    let results_path = Path::new(&config.result_directory).join("results.csv");
    write_results(&results_path, &records)?;
    info!(path = %results_path.display(), records = records.len(), "wrote results");

    let auc = metrics::roc_auc_score(&records);
    let pauc = metrics::partial_auc(&records, PAUC_FPR_LIMIT);
    info!(auc, pauc, fpr_limit = PAUC_FPR_LIMIT, "evaluation complete");
    Ok(())
}

fn collect_records(
    config: &AppConfig,
    device: Device,
    diffuser: &Diffuser,
    unet: &UNet2D,
    scorer: &AnomalyScorer,
    dataset: &AudioDataset,
) -> Result<Vec<ResultRecord>> {
    let _guard = tch::no_grad_guard();
    let mut records = Vec::with_capacity(dataset.len());
    for batch in dataset.batches(config.batch_size, false) {
        let (data, labels) = batch?;
        if has_nan(&data) {
            warn!("NaN in input features; scores for this batch may be unusable");
        }
        let batch_len = data.size()[0];
        let t = Tensor::ones([batch_len], (Kind::Int64, device)) * config.scoring_timestep;
        let (x_t, _noise) = diffuser.add_noise(&data, &t, None)?;
        let reconstructed = diffuser.denoise(unet, &x_t, config.scoring_timestep)?;
        let scores = scorer.score(&data, &reconstructed)?;

        let scores = Vec::<f64>::try_from(&scores.to_kind(Kind::Double).to_device(Device::Cpu))?;
        let labels = Vec::<i64>::try_from(&labels.to_device(Device::Cpu))?;
        for (score, label) in scores.into_iter().zip(labels) {
            records.push(ResultRecord { score, label });
        }
    }
    Ok(records)
}

/// Persist the records as a delimited table. The header row and the
/// score-before-label column order are what downstream metric tooling
/// expects.
pub fn write_results(path: &Path, records: &[ResultRecord]) -> Result<()> {
    let mut out = String::from("loss,label\n");
    for record in records {
        out.push_str(&format!("{},{}\n", record.score, record.label));
    }
    std::fs::write(path, out)?;
    Ok(())
}
