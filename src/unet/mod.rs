//! 2D UNet noise predictor.
//!
//! Takes a noisy log-mel sample and the current diffusion timestep and
//! returns the predicted noise with the same shape as the input.

use tch::nn;
use tch::{Kind, Tensor};

use crate::diffusion::NoisePredictor;

#[derive(Debug, Clone)]
pub struct UNetConfig {
    pub in_channels: i64,
    pub block_out_channels: Vec<i64>,
    pub time_embed_dim: i64,
    pub norm_num_groups: i64,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            block_out_channels: vec![64, 128, 256],
            time_embed_dim: 256,
            norm_num_groups: 8,
        }
    }
}

/// Sinusoidal projection of integer timesteps to `num_channels` features.
#[derive(Debug)]
struct Timesteps {
    num_channels: i64,
}

impl Timesteps {
    fn forward(&self, timesteps: &Tensor) -> Tensor {
        let half = self.num_channels / 2;
        let exponent = Tensor::arange(half, (Kind::Float, timesteps.device()))
            * -((10000f64).ln() / half as f64);
        let freqs = exponent.exp();
        let args = timesteps.to_kind(Kind::Float).unsqueeze(-1) * freqs.unsqueeze(0);
        Tensor::cat(&[args.sin(), args.cos()], -1)
    }
}

#[derive(Debug)]
struct TimestepEmbedding {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
}

impl TimestepEmbedding {
    fn new(vs: nn::Path, channel: i64, time_embed_dim: i64) -> Self {
        let linear_cfg = Default::default();
        let linear_1 = nn::linear(&vs / "linear_1", channel, time_embed_dim, linear_cfg);
        let linear_2 = nn::linear(&vs / "linear_2", time_embed_dim, time_embed_dim, linear_cfg);
        Self { linear_1, linear_2 }
    }

    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.linear_1).silu().apply(&self.linear_2)
    }
}

/// Two 3x3 convolutions with group norm and SiLU, the timestep embedding
/// added between them, and a 1x1 skip when the channel count changes.
#[derive(Debug)]
struct ResBlock {
    norm_1: nn::GroupNorm,
    conv_1: nn::Conv2D,
    time_proj: nn::Linear,
    norm_2: nn::GroupNorm,
    conv_2: nn::Conv2D,
    skip: Option<nn::Conv2D>,
}

impl ResBlock {
    fn new(
        vs: nn::Path,
        in_channels: i64,
        out_channels: i64,
        time_embed_dim: i64,
        norm_num_groups: i64,
    ) -> Self {
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let group_cfg = nn::GroupNormConfig { eps: 1e-5, ..Default::default() };
        let norm_1 = nn::group_norm(&vs / "norm1", norm_num_groups, in_channels, group_cfg);
        let conv_1 = nn::conv2d(&vs / "conv1", in_channels, out_channels, 3, conv_cfg);
        let time_proj =
            nn::linear(&vs / "time_proj", time_embed_dim, out_channels, Default::default());
        let norm_2 = nn::group_norm(&vs / "norm2", norm_num_groups, out_channels, group_cfg);
        let conv_2 = nn::conv2d(&vs / "conv2", out_channels, out_channels, 3, conv_cfg);
        let skip = if in_channels != out_channels {
            Some(nn::conv2d(&vs / "skip", in_channels, out_channels, 1, Default::default()))
        } else {
            None
        };
        Self { norm_1, conv_1, time_proj, norm_2, conv_2, skip }
    }

    fn forward(&self, xs: &Tensor, temb: &Tensor) -> Tensor {
        let h = xs.apply(&self.norm_1).silu().apply(&self.conv_1);
        let t = temb.silu().apply(&self.time_proj);
        let h = h + t.unsqueeze(-1).unsqueeze(-1);
        let h = h.apply(&self.norm_2).silu().apply(&self.conv_2);
        match &self.skip {
            Some(skip) => xs.apply(skip) + h,
            None => xs + h,
        }
    }
}

#[derive(Debug)]
pub struct UNet2D {
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    conv_in: nn::Conv2D,
    down_blocks: Vec<ResBlock>,
    downsamplers: Vec<nn::Conv2D>,
    mid_block: ResBlock,
    upsamplers: Vec<nn::ConvTranspose2D>,
    up_blocks: Vec<ResBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
}

impl UNet2D {
    pub fn new(vs: nn::Path, config: UNetConfig) -> Self {
        let blocks = &config.block_out_channels;
        let n_blocks = blocks.len();
        let b_channels = blocks[0];
        let bl_channels = *blocks.last().unwrap();
        let time_embed_dim = config.time_embed_dim;
        let groups = config.norm_num_groups;

        let time_proj = Timesteps { num_channels: b_channels };
        let time_embedding =
            TimestepEmbedding::new(&vs / "time_embedding", b_channels, time_embed_dim);

        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let conv_in = nn::conv2d(&vs / "conv_in", config.in_channels, b_channels, 3, conv_cfg);

        let vs_db = &vs / "down_blocks";
        let down_blocks: Vec<ResBlock> = (0..n_blocks)
            .map(|i| {
                let in_channels = if i > 0 { blocks[i - 1] } else { b_channels };
                ResBlock::new(&vs_db / i, in_channels, blocks[i], time_embed_dim, groups)
            })
            .collect();
        let down_cfg = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
        let vs_ds = &vs / "downsamplers";
        let downsamplers: Vec<nn::Conv2D> = (0..n_blocks)
            .map(|i| nn::conv2d(&vs_ds / i, blocks[i], blocks[i], 3, down_cfg))
            .collect();

        let mid_block =
            ResBlock::new(&vs / "mid_block", bl_channels, bl_channels, time_embed_dim, groups);

        // Up path mirrors the down path: deepest level first.
        let up_cfg = nn::ConvTransposeConfig { stride: 2, padding: 1, ..Default::default() };
        let vs_us = &vs / "upsamplers";
        let vs_ub = &vs / "up_blocks";
        let mut upsamplers = Vec::with_capacity(n_blocks);
        let mut up_blocks = Vec::with_capacity(n_blocks);
        for i in (0..n_blocks).rev() {
            let carried = if i == n_blocks - 1 { bl_channels } else { blocks[i + 1] };
            // After upsampling, the skip from the matching down level is
            // concatenated along the channel dimension.
            upsamplers.push(nn::conv_transpose2d(&vs_us / i, carried, carried, 4, up_cfg));
            let out_channels = if i > 0 { blocks[i] } else { b_channels };
            up_blocks.push(ResBlock::new(
                &vs_ub / i,
                carried + blocks[i],
                out_channels,
                time_embed_dim,
                groups,
            ));
        }

        let group_cfg = nn::GroupNormConfig { eps: 1e-5, ..Default::default() };
        let conv_norm_out = nn::group_norm(&vs / "conv_norm_out", groups, b_channels, group_cfg);
        let conv_out = nn::conv2d(&vs / "conv_out", b_channels, config.in_channels, 3, conv_cfg);

        Self {
            time_proj,
            time_embedding,
            conv_in,
            down_blocks,
            downsamplers,
            mid_block,
            upsamplers,
            up_blocks,
            conv_norm_out,
            conv_out,
        }
    }

    pub fn forward(&self, xs: &Tensor, timesteps: &Tensor) -> Tensor {
        let temb = self.time_embedding.forward(&self.time_proj.forward(timesteps));
        let mut h = xs.apply(&self.conv_in);
        let mut skips = Vec::with_capacity(self.down_blocks.len());
        for (block, down) in self.down_blocks.iter().zip(self.downsamplers.iter()) {
            h = block.forward(&h, &temb);
            skips.push(h.shallow_clone());
            h = h.apply(down);
        }
        h = self.mid_block.forward(&h, &temb);
        for (up, block) in self.upsamplers.iter().zip(self.up_blocks.iter()) {
            h = h.apply(up);
            let skip = skips.pop().unwrap();
            h = Tensor::cat(&[h, skip], 1);
            h = block.forward(&h, &temb);
        }
        h.apply(&self.conv_norm_out).silu().apply(&self.conv_out)
    }
}

impl NoisePredictor for UNet2D {
    fn predict_noise(&self, x: &Tensor, t: &Tensor) -> Tensor {
        self.forward(x, t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn forward_preserves_the_canonical_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = UNet2D::new(vs.root(), UNetConfig::default());
        let xs = Tensor::zeros([1, 1, 128, 312], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[50i64]);
        let out = unet.forward(&xs, &t);
        assert_eq!(out.size(), vec![1, 1, 128, 312]);
    }

    #[test]
    fn sinusoidal_embedding_distinguishes_timesteps() {
        let proj = Timesteps { num_channels: 64 };
        let t = Tensor::from_slice(&[1i64, 500, 1000]);
        let emb = proj.forward(&t);
        assert_eq!(emb.size(), vec![3, 64]);
        let d = (emb.narrow(0, 0, 1) - emb.narrow(0, 2, 1))
            .abs()
            .sum(Kind::Float)
            .double_value(&[]);
        assert!(d > 1.0, "embeddings for distant timesteps should differ");
    }
}
