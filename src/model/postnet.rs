//! Postnet: residual conv refinement of the decoder's mel frames, plus the
//! optional linear-spectrogram head.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::layers::{ConvBlock, Noise};
use crate::config::ModelConfig;

/// `n` non-causal conv blocks, tanh on all but the last.
#[derive(Debug, Clone)]
pub struct Postnet {
    convs: Vec<ConvBlock>,
    dropout: f32,
}

impl Postnet {
    pub fn new(cfg: &ModelConfig, num_mels: usize, vb: VarBuilder) -> Result<Self> {
        let n = cfg.postnet_num_layers;
        let mut convs = Vec::with_capacity(n);
        for i in 0..n {
            let in_ch = if i == 0 { num_mels } else { cfg.postnet_channels };
            let out_ch = if i + 1 == n { num_mels } else { cfg.postnet_channels };
            convs.push(ConvBlock::new(
                in_ch,
                out_ch,
                cfg.postnet_kernel_size,
                vb.pp(format!("convs.{i}")),
            )?);
        }
        Ok(Self {
            convs,
            dropout: cfg.dropout_rate,
        })
    }

    /// Residual for `mel`.
    ///
    /// - `mel`: `[B, T, n_mels]`
    /// - `mask`: `[B, T]` float, 1 for valid frames
    ///
    /// Returns the residual `[B, T, n_mels]`, zero on padded frames.
    pub fn forward(&self, mel: &Tensor, mask: &Tensor, noise: &mut Noise) -> Result<Tensor> {
        let train = noise.is_training();
        let conv_mask = mask.unsqueeze(1)?;
        let last = self.convs.len().saturating_sub(1);

        let mut h = mel.transpose(1, 2)?.broadcast_mul(&conv_mask)?;
        for (i, conv) in self.convs.iter().enumerate() {
            h = conv.forward(&h, train)?;
            if i != last {
                h = h.tanh()?;
            }
            h = noise.dropout(&h, self.dropout)?;
            h = h.broadcast_mul(&conv_mask)?;
        }
        h.transpose(1, 2)
    }
}

/// Conv + ReLU, then a projection to `num_freq` linear bins.
#[derive(Debug, Clone)]
pub struct LinearHead {
    conv: ConvBlock,
    projection: Linear,
}

impl LinearHead {
    pub fn new(cfg: &ModelConfig, num_mels: usize, num_freq: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: ConvBlock::new(
                num_mels,
                cfg.linear_head_channels,
                cfg.postnet_kernel_size,
                vb.pp("conv"),
            )?,
            projection: candle_nn::linear(cfg.linear_head_channels, num_freq, vb.pp("projection"))?,
        })
    }

    /// `mel`: `[B, T, n_mels]` → `[B, T, num_freq]`, zero on padded frames.
    pub fn forward(&self, mel: &Tensor, mask: &Tensor, noise: &mut Noise) -> Result<Tensor> {
        let conv_mask = mask.unsqueeze(1)?;
        let h = mel.transpose(1, 2)?.broadcast_mul(&conv_mask)?;
        let h = self
            .conv
            .forward(&h, noise.is_training())?
            .relu()?
            .broadcast_mul(&conv_mask)?
            .transpose(1, 2)?;
        self.projection
            .forward(&h)?
            .broadcast_mul(&mask.unsqueeze(2)?)
    }
}
