//! Building blocks shared by the encoder, decoder and postnet.
//!
//! - [`Noise`] — seeded randomness for dropout and zoneout
//! - [`ConvBlock`] — Conv1d + BatchNorm over `[B, C, T]`
//! - [`zoneout_lstm_step`] — one LSTM step with zoneout on `(h, c)`

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::rnn::{LSTM, LSTMState, RNN};
use candle_nn::{BatchNorm, Conv1d, Conv1dConfig, VarBuilder};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seeded randomness source threaded through a forward pass.
///
/// In training mode dropout and stochastic zoneout are active. In inference
/// mode only the prenet dropout is sampled (Tacotron keeps it on to vary
/// output), so a fixed seed gives bit-identical synthesis.
pub struct Noise {
    rng: ChaCha8Rng,
    training: bool,
}

impl Noise {
    pub fn training(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            training: true,
        }
    }

    pub fn inference(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            training: false,
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Inverted dropout, active in training only.
    pub fn dropout(&mut self, xs: &Tensor, p: f32) -> Result<Tensor> {
        if !self.training {
            return Ok(xs.clone());
        }
        self.always_dropout(xs, p)
    }

    /// Inverted dropout regardless of mode.
    pub fn always_dropout(&mut self, xs: &Tensor, p: f32) -> Result<Tensor> {
        if p <= 0.0 {
            return Ok(xs.clone());
        }
        let scale = 1.0 / (1.0 - p);
        let keep: Vec<f32> = (0..xs.elem_count())
            .map(|_| if self.rng.random::<f32>() >= p { scale } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(keep, xs.dims(), xs.device())?.to_dtype(xs.dtype())?;
        xs * mask
    }

    /// Zoneout: keep each unit of `prev` with probability `p`.
    ///
    /// Training samples a binary mask; inference uses the expectation
    /// `p * prev + (1 - p) * new`.
    pub fn zoneout(&mut self, prev: &Tensor, new: &Tensor, p: f32) -> Result<Tensor> {
        if p <= 0.0 {
            return Ok(new.clone());
        }
        if !self.training {
            return (prev * p as f64)? + (new * (1.0 - p as f64))?;
        }
        let keep: Vec<f32> = (0..prev.elem_count())
            .map(|_| if self.rng.random::<f32>() < p { 1.0 } else { 0.0 })
            .collect();
        let keep = Tensor::from_vec(keep, prev.dims(), prev.device())?.to_dtype(prev.dtype())?;
        let update = keep.affine(-1.0, 1.0)?;
        (prev * keep)? + (new * update)?
    }
}

/// One LSTM step followed by zoneout on both hidden and cell state.
pub fn zoneout_lstm_step(
    lstm: &LSTM,
    input: &Tensor,
    state: &LSTMState,
    zoneout: f32,
    noise: &mut Noise,
) -> Result<LSTMState> {
    let next = lstm.step(input, state)?;
    Ok(LSTMState {
        h: noise.zoneout(&state.h, &next.h, zoneout)?,
        c: noise.zoneout(&state.c, &next.c, zoneout)?,
    })
}

/// Non-causal `Conv1d` ("same" padding) followed by batch normalization.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    conv: Conv1d,
    norm: BatchNorm,
}

impl ConvBlock {
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: kernel / 2,
            ..Default::default()
        };
        let conv = candle_nn::conv1d(in_channels, out_channels, kernel, cfg, vb.pp("conv"))?;
        let norm = candle_nn::batch_norm(out_channels, 1e-5, vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }

    /// `xs`: `[B, C_in, T]` → `[B, C_out, T]` (before activation).
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.conv.forward(xs)?;
        self.norm.forward_t(&h, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn dropout_is_seeded() {
        let dev = Device::Cpu;
        let xs = Tensor::ones((4, 32), DType::F32, &dev).unwrap();
        let a: Vec<Vec<f32>> = Noise::training(7).dropout(&xs, 0.5).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = Noise::training(7).dropout(&xs, 0.5).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
        assert!(a.iter().flatten().all(|&v| v == 0.0 || v == 2.0));
        assert!(a.iter().flatten().any(|&v| v == 0.0));
    }

    #[test]
    fn dropout_off_at_inference() {
        let dev = Device::Cpu;
        let xs = Tensor::ones((2, 8), DType::F32, &dev).unwrap();
        let out: Vec<Vec<f32>> = Noise::inference(0).dropout(&xs, 0.5).unwrap().to_vec2().unwrap();
        assert!(out.iter().flatten().all(|&v| v == 1.0));
    }

    #[test]
    fn zoneout_inference_is_expectation() {
        let dev = Device::Cpu;
        let prev = Tensor::zeros((1, 4), DType::F32, &dev).unwrap();
        let new = Tensor::ones((1, 4), DType::F32, &dev).unwrap();
        let out: Vec<Vec<f32>> = Noise::inference(0)
            .zoneout(&prev, &new, 0.1)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert!(out[0].iter().all(|&v| (v - 0.9).abs() < 1e-6));
    }

    #[test]
    fn conv_block_keeps_length() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let block = ConvBlock::new(8, 16, 5, vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 8, 11), &dev).unwrap();
        let out = block.forward(&xs, true).unwrap();
        assert_eq!(out.dims(), &[2, 16, 11]);
    }
}
