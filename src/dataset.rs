//! Directory-backed audio dataset: WAV clips labelled by file name
//! ("normal" in the name means label 0, anything else is an anomaly).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tch::{Device, Kind, Tensor};

use crate::features::FeatureExtractor;

pub struct AudioDataset {
    files: Vec<PathBuf>,
    labels: Vec<i64>,
    extractor: FeatureExtractor,
    device: Device,
}

impl AudioDataset {
    pub fn from_dir<P: AsRef<Path>>(
        dir: P,
        extractor: FeatureExtractor,
        device: Device,
    ) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("error reading dataset directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "wav").unwrap_or(false))
            .collect();
        files.sort();
        if files.is_empty() {
            bail!("no .wav files found under {}", dir.display());
        }
        let labels = files.iter().map(|p| label_for(p)).collect();
        Ok(Self { files, labels, extractor, device })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Mini-batches of `(data [B, 1, 128, 312], labels [B])`. The shuffle
    /// permutation comes from the tensor backend's generator, so a seeded
    /// process iterates reproducibly.
    pub fn batches(&self, batch_size: usize, shuffle: bool) -> BatchIter<'_> {
        let n = self.files.len();
        let order: Vec<usize> = if shuffle {
            let perm = Tensor::randperm(n as i64, (Kind::Int64, Device::Cpu));
            Vec::<i64>::try_from(&perm)
                .map(|v| v.into_iter().map(|i| i as usize).collect())
                .unwrap_or_else(|_| (0..n).collect())
        } else {
            (0..n).collect()
        };
        BatchIter { dataset: self, order, cursor: 0, batch_size: batch_size.max(1) }
    }

    fn load_item(&self, idx: usize) -> anyhow::Result<Tensor> {
        let path = &self.files[idx];
        let reader = hound::WavReader::open(path)
            .with_context(|| format!("error opening {}", path.display()))?;
        let spec = reader.spec();
        let channels = spec.channels as usize;
        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .collect::<Result<Vec<_>, _>>()
                    .with_context(|| format!("error decoding {}", path.display()))?
                    .into_iter()
                    .map(|s| s as f32 / scale)
                    .collect()
            }
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("error decoding {}", path.display()))?,
        };
        // Interleaved multi-channel audio is averaged down to mono.
        let mono: Vec<f32> = if channels > 1 {
            samples
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        } else {
            samples
        };
        let features = self.extractor.extract(&mono, spec.sample_rate)?;
        Ok(features.to_device(self.device))
    }
}

fn label_for(path: &Path) -> i64 {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if name.contains("normal") {
        0
    } else {
        1
    }
}

pub struct BatchIter<'a> {
    dataset: &'a AudioDataset,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = anyhow::Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let mut items = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &idx in indices {
            match self.dataset.load_item(idx) {
                Ok(features) => {
                    items.push(features);
                    labels.push(self.dataset.labels[idx]);
                }
                Err(e) => return Some(Err(e)),
            }
        }
        let data = Tensor::stack(&items, 0);
        let labels = Tensor::from_slice(&labels).to_device(self.dataset.device);
        Some(Ok((data, labels)))
    }
}
