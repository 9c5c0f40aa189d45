//! Text encoder: symbol embedding → conv stack → bidirectional LSTM.
//!
//! ```text
//! ids [B, T] → embed [B, T, E] → 3 × (conv → bn → relu → dropout) → BiLSTM → [B, T, 2H]
//! ```
//!
//! Padding positions are zeroed after every conv layer and on the output. The
//! backward LSTM runs over each example's valid prefix reversed, so padding
//! never enters either direction's recurrent state for valid positions.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Embedding, LSTM, LSTMConfig, RNN, VarBuilder};

use super::layers::{ConvBlock, Noise};
use super::mask::{float_mask, reverse_index};
use crate::config::ModelConfig;

#[derive(Debug, Clone)]
pub struct Encoder {
    embedding: Embedding,
    convs: Vec<ConvBlock>,
    lstm_fw: LSTM,
    lstm_bw: LSTM,
    dropout: f32,
}

impl Encoder {
    pub fn new(cfg: &ModelConfig, num_symbols: usize, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(num_symbols, cfg.embedding_dim, vb.pp("embedding"))?;

        let mut convs = Vec::with_capacity(cfg.enc_conv_num_layers);
        for i in 0..cfg.enc_conv_num_layers {
            let in_channels = if i == 0 {
                cfg.embedding_dim
            } else {
                cfg.enc_conv_channels
            };
            convs.push(ConvBlock::new(
                in_channels,
                cfg.enc_conv_channels,
                cfg.enc_conv_kernel_size,
                vb.pp(format!("convs.{i}")),
            )?);
        }

        let lstm_in = if cfg.enc_conv_num_layers == 0 {
            cfg.embedding_dim
        } else {
            cfg.enc_conv_channels
        };
        let units = cfg.encoder_lstm_units;
        let lstm_fw = candle_nn::lstm(lstm_in, units, LSTMConfig::default(), vb.pp("lstm_fw"))?;
        let lstm_bw = candle_nn::lstm(lstm_in, units, LSTMConfig::default(), vb.pp("lstm_bw"))?;

        Ok(Self {
            embedding,
            convs,
            lstm_fw,
            lstm_bw,
            dropout: cfg.dropout_rate,
        })
    }

    /// Encode a padded batch.
    ///
    /// - `ids`: `[B, T]` u32 symbol ids
    /// - `lengths`: true length per example
    ///
    /// Returns `[B, T, 2 * encoder_lstm_units]`, zero past each length.
    pub fn forward(&self, ids: &Tensor, lengths: &[usize], noise: &mut Noise) -> Result<Tensor> {
        let (_b, t) = ids.dims2()?;
        let dev = ids.device();
        let train = noise.is_training();

        let xs = self.embedding.forward(ids)?;
        let mask = float_mask(lengths, t, xs.dtype(), dev)?;
        // [B, 1, T] for channel-first convs
        let conv_mask = mask.unsqueeze(1)?;

        let mut h = xs.transpose(1, 2)?.broadcast_mul(&conv_mask)?;
        for conv in &self.convs {
            h = conv.forward(&h, train)?.relu()?;
            h = noise.dropout(&h, self.dropout)?;
            h = h.broadcast_mul(&conv_mask)?;
        }
        let h = h.transpose(1, 2)?.contiguous()?;

        let forward = self.lstm_fw.states_to_tensor(&self.lstm_fw.seq(&h)?)?;

        let (_, _, c) = h.dims3()?;
        let rev = reverse_index(lengths, t, dev)?.unsqueeze(2)?;
        let rev_in = rev.broadcast_as((lengths.len(), t, c))?.contiguous()?;
        let reversed = h.gather(&rev_in, 1)?;
        let backward = self.lstm_bw.states_to_tensor(&self.lstm_bw.seq(&reversed)?)?;
        let units = backward.dim(2)?;
        let rev_out = rev.broadcast_as((lengths.len(), t, units))?.contiguous()?;
        let backward = backward.gather(&rev_out, 1)?;

        Tensor::cat(&[&forward, &backward], 2)?.broadcast_mul(&mask.unsqueeze(2)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn tiny_cfg() -> ModelConfig {
        ModelConfig {
            embedding_dim: 8,
            enc_conv_num_layers: 2,
            enc_conv_channels: 8,
            enc_conv_kernel_size: 3,
            encoder_lstm_units: 4,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_encoder_shape_and_padding() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let enc = Encoder::new(&tiny_cfg(), 20, vb).unwrap();

        let ids = Tensor::new(&[[3u32, 4, 5, 0, 0], [6, 7, 8, 9, 10]], &dev).unwrap();
        let out = enc.forward(&ids, &[3, 5], &mut Noise::inference(0)).unwrap();
        assert_eq!(out.dims(), &[2, 5, 8]);

        let padded: Vec<Vec<f32>> = out.i(0).unwrap().i(3..).unwrap().to_vec2().unwrap();
        assert!(padded.iter().flatten().all(|&v| v == 0.0));
    }

    #[test]
    fn test_valid_outputs_ignore_padding_content() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let enc = Encoder::new(&tiny_cfg(), 20, vb).unwrap();

        let a = Tensor::new(&[[3u32, 4, 5, 0, 0]], &dev).unwrap();
        let b = Tensor::new(&[[3u32, 4, 5, 11, 12]], &dev).unwrap();
        let out_a = enc.forward(&a, &[3], &mut Noise::inference(0)).unwrap();
        let out_b = enc.forward(&b, &[3], &mut Noise::inference(0)).unwrap();
        let diff = (out_a - out_b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6, "padding leaked into valid outputs: {diff}");
    }
}
