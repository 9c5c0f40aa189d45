//! Location-sensitive attention.
//!
//! Hybrid (content + location) additive attention from Chorowski et al. 2015:
//!
//! ```text
//! f_i      = conv(α_{i-1})                    location features
//! e_{i,j}  = vᵀ tanh(W_k h_j + W_q s_i + W_f f_{i,j})
//! α_i      = softmax(e_i)                     or sigmoid(e_i) / Σ sigmoid(e_i)
//! c_i      = Σ_j α_{i,j} h_j
//! ```
//!
//! Scores of padded encoder positions are set to `-inf` before normalization,
//! so padding receives exactly zero weight and the remaining weights sum to 1.

use candle_core::{D, DType, Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Linear, VarBuilder};

use super::mask::{mask_scores, sequence_mask};
use crate::config::ModelConfig;

/// Floor for the smoothing normalizer.
const SMOOTHING_EPS: f64 = 1e-12;

/// Encoder output prepared once per generation.
#[derive(Debug, Clone)]
pub struct AttentionMemory {
    /// `[B, T_in, D_enc]`
    pub values: Tensor,
    /// `W_k h`, `[B, T_in, A]`
    keys: Tensor,
    /// `[B, T_in]` u8, 1 for valid positions.
    mask: Tensor,
    lengths: Vec<usize>,
}

impl AttentionMemory {
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn max_len(&self) -> usize {
        self.mask.dims()[1]
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn mask(&self) -> &Tensor {
        &self.mask
    }
}

/// Recurrent attention state carried between decoder steps.
#[derive(Debug, Clone)]
pub struct AttentionState {
    /// Previous step's alignment, `[B, T_in]`.
    pub alignment: Tensor,
    /// Sum of all previous alignments, `[B, T_in]`.
    pub cumulative: Tensor,
}

/// Append-only per-step alignment record for one generation.
#[derive(Debug, Default)]
pub struct AlignmentHistory {
    steps: Vec<Tensor>,
}

impl AlignmentHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, alignment: Tensor) {
        self.steps.push(alignment);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Stack into an immutable `[B, steps, T_in]` matrix.
    pub fn finalize(self) -> Result<Alignments> {
        Ok(Alignments(Tensor::stack(&self.steps, 1)?))
    }
}

/// Finalized alignment matrix, `[B, decoder_steps, T_in]`.
#[derive(Debug, Clone)]
pub struct Alignments(Tensor);

impl Alignments {
    pub fn as_tensor(&self) -> &Tensor {
        &self.0
    }

    /// Alignment of one example trimmed to `steps` decoder steps and
    /// `input_len` encoder positions, `[steps][input_len]`.
    pub fn example(&self, index: usize, steps: usize, input_len: usize) -> Result<Vec<Vec<f32>>> {
        self.0
            .get(index)?
            .narrow(0, 0, steps)?
            .narrow(1, 0, input_len)?
            .to_dtype(DType::F32)?
            .to_vec2()
    }
}

/// Location-sensitive attention layer.
#[derive(Debug, Clone)]
pub struct LocationSensitiveAttention {
    query_layer: Linear,
    memory_layer: Linear,
    location_conv: Conv1d,
    location_layer: Linear,
    v: Linear,
    smoothing: bool,
    cumulative: bool,
}

impl LocationSensitiveAttention {
    pub fn new(cfg: &ModelConfig, query_dim: usize, vb: VarBuilder) -> Result<Self> {
        let attn = cfg.attention_dim;
        let memory_dim = cfg.encoder_output_dim();
        let location_channels = if cfg.cumulative_weights { 2 } else { 1 };
        let conv_cfg = Conv1dConfig {
            padding: cfg.attention_kernel / 2,
            ..Default::default()
        };
        Ok(Self {
            query_layer: candle_nn::linear_no_bias(query_dim, attn, vb.pp("query_layer"))?,
            memory_layer: candle_nn::linear_no_bias(memory_dim, attn, vb.pp("memory_layer"))?,
            location_conv: candle_nn::conv1d_no_bias(
                location_channels,
                cfg.attention_filters,
                cfg.attention_kernel,
                conv_cfg,
                vb.pp("location_conv"),
            )?,
            location_layer: candle_nn::linear_no_bias(
                cfg.attention_filters,
                attn,
                vb.pp("location_layer"),
            )?,
            v: candle_nn::linear_no_bias(attn, 1, vb.pp("v"))?,
            smoothing: cfg.smoothing,
            cumulative: cfg.cumulative_weights,
        })
    }

    /// Project the encoder output into keys and build the length mask.
    ///
    /// - `memory`: `[B, T_in, D_enc]`, already zero past each length
    pub fn prepare(&self, memory: &Tensor, lengths: &[usize]) -> Result<AttentionMemory> {
        let (_b, t_in, _d) = memory.dims3()?;
        Ok(AttentionMemory {
            values: memory.clone(),
            keys: self.memory_layer.forward(memory)?,
            mask: sequence_mask(lengths, t_in, memory.device())?,
            lengths: lengths.to_vec(),
        })
    }

    /// All-zero alignments for the first decoder step.
    pub fn initial_state(&self, memory: &AttentionMemory) -> Result<AttentionState> {
        let zeros = Tensor::zeros(
            (memory.batch_size(), memory.max_len()),
            memory.values.dtype(),
            memory.values.device(),
        )?;
        Ok(AttentionState {
            alignment: zeros.clone(),
            cumulative: zeros,
        })
    }

    /// Attend once.
    ///
    /// - `query`: `[B, Q]` (attention RNN output)
    ///
    /// Returns `(context [B, D_enc], next_state)`; the new alignment is
    /// `next_state.alignment`.
    pub fn forward(
        &self,
        query: &Tensor,
        memory: &AttentionMemory,
        state: &AttentionState,
    ) -> Result<(Tensor, AttentionState)> {
        let energy = self.energy(query, memory, state)?;
        let alignment = self.normalize(&energy, memory.mask())?;

        // [B, 1, T] x [B, T, D] → [B, D]
        let context = alignment
            .unsqueeze(1)?
            .matmul(&memory.values)?
            .squeeze(1)?;

        let cumulative = (&state.cumulative + &alignment)?;
        Ok((
            context,
            AttentionState {
                alignment,
                cumulative,
            },
        ))
    }

    /// Unnormalized scores `[B, T_in]`.
    fn energy(
        &self,
        query: &Tensor,
        memory: &AttentionMemory,
        state: &AttentionState,
    ) -> Result<Tensor> {
        // [B, Q] → [B, 1, A]
        let processed_query = self.query_layer.forward(query)?.unsqueeze(1)?;

        // [B, C, T] → conv → [B, F, T] → [B, T, F] → [B, T, A]
        let location_input = if self.cumulative {
            Tensor::stack(&[&state.alignment, &state.cumulative], 1)?
        } else {
            state.alignment.unsqueeze(1)?
        };
        let location = self
            .location_conv
            .forward(&location_input)?
            .transpose(1, 2)?;
        let processed_location = self.location_layer.forward(&location)?;

        let hidden = memory
            .keys
            .broadcast_add(&processed_query)?
            .add(&processed_location)?
            .tanh()?;
        self.v.forward(&hidden)?.squeeze(2)
    }

    /// Normalize scores over valid positions only.
    fn normalize(&self, energy: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let masked = mask_scores(energy, mask)?;
        if self.smoothing {
            let sig = candle_nn::ops::sigmoid(&masked)?;
            // Every valid score can underflow to 0.
            let total = sig.sum_keepdim(D::Minus1)?.maximum(SMOOTHING_EPS)?;
            sig.broadcast_div(&total)
        } else {
            candle_nn::ops::softmax(&masked, D::Minus1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn tiny_cfg(smoothing: bool, cumulative: bool) -> ModelConfig {
        ModelConfig {
            encoder_lstm_units: 4,
            attention_dim: 6,
            attention_filters: 3,
            attention_kernel: 5,
            smoothing,
            cumulative_weights: cumulative,
            ..ModelConfig::default()
        }
    }

    fn check_alignment(alignment: &Tensor, lengths: &[usize]) {
        let rows: Vec<Vec<f32>> = alignment.to_vec2().unwrap();
        for (row, &len) in rows.iter().zip(lengths) {
            let valid: f32 = row[..len].iter().sum();
            assert!((valid - 1.0).abs() < 1e-5, "valid mass {valid}");
            assert!(row[len..].iter().all(|&w| w == 0.0), "padding got weight: {row:?}");
        }
    }

    fn run(smoothing: bool, cumulative: bool) {
        let dev = Device::Cpu;
        let cfg = tiny_cfg(smoothing, cumulative);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let attn = LocationSensitiveAttention::new(&cfg, 10, vb).unwrap();

        let lengths = [3, 7];
        let memory = Tensor::randn(0f32, 1.0, (2, 7, 8), &dev).unwrap();
        let memory = memory
            .broadcast_mul(
                &super::super::mask::float_mask(&lengths, 7, DType::F32, &dev)
                    .unwrap()
                    .unsqueeze(2)
                    .unwrap(),
            )
            .unwrap();
        let prepared = attn.prepare(&memory, &lengths).unwrap();
        let mut state = attn.initial_state(&prepared).unwrap();

        for _ in 0..3 {
            let query = Tensor::randn(0f32, 1.0, (2, 10), &dev).unwrap();
            let (context, next) = attn.forward(&query, &prepared, &state).unwrap();
            assert_eq!(context.dims(), &[2, 8]);
            check_alignment(&next.alignment, &lengths);
            state = next;
        }
        let total: Vec<Vec<f32>> = state.cumulative.to_vec2().unwrap();
        assert!((total[0].iter().sum::<f32>() - 3.0).abs() < 1e-4);
    }

    #[test]
    fn softmax_alignment_respects_mask() {
        run(false, false);
    }

    #[test]
    fn smoothing_alignment_respects_mask() {
        run(true, false);
    }

    #[test]
    fn cumulative_location_features() {
        run(false, true);
    }

    fn alignment_after(attn: &LocationSensitiveAttention, prev_focus: usize) -> Vec<f32> {
        let dev = Device::Cpu;
        let lengths = [7];
        let memory = Tensor::arange(0f32, 56.0, &dev)
            .unwrap()
            .affine(0.05, -1.0)
            .unwrap()
            .sin()
            .unwrap()
            .reshape((1, 7, 8))
            .unwrap();
        let prepared = attn.prepare(&memory, &lengths).unwrap();
        let mut one_hot = vec![0f32; 7];
        one_hot[prev_focus] = 1.0;
        let prev = Tensor::from_vec(one_hot, (1, 7), &dev).unwrap();
        let state = AttentionState {
            alignment: prev.clone(),
            cumulative: prev,
        };
        let query = Tensor::full(0.3f32, (1, 10), &dev).unwrap();
        let (_, next) = attn.forward(&query, &prepared, &state).unwrap();
        next.alignment.squeeze(0).unwrap().to_vec1().unwrap()
    }

    fn location_changes_alignment(cumulative: bool) {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let attn = LocationSensitiveAttention::new(&tiny_cfg(false, cumulative), 10, vb).unwrap();

        let near_start = alignment_after(&attn, 1);
        let near_end = alignment_after(&attn, 5);
        let diff = near_start
            .iter()
            .zip(&near_end)
            .map(|(a, b)| (a - b).abs())
            .fold(0f32, f32::max);
        assert!(
            diff > 1e-6,
            "previous alignment had no effect: {near_start:?} vs {near_end:?}"
        );
        // Same inputs give the same alignment.
        assert_eq!(near_start, alignment_after(&attn, 1));
    }

    #[test]
    fn previous_alignment_shapes_next() {
        location_changes_alignment(false);
    }

    #[test]
    fn cumulative_alignment_shapes_next() {
        location_changes_alignment(true);
    }

    #[test]
    fn smoothing_survives_underflow() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let attn = LocationSensitiveAttention::new(&tiny_cfg(true, false), 10, vb).unwrap();

        let mask = sequence_mask(&[2, 4], 4, &dev).unwrap();
        let energy = Tensor::new(
            &[[-1000f32, -1000.0, 5.0, 5.0], [0.0, 0.0, 0.0, 0.0]],
            &dev,
        )
        .unwrap();
        let rows: Vec<Vec<f32>> = attn.normalize(&energy, &mask).unwrap().to_vec2().unwrap();

        assert!(rows.iter().flatten().all(|w| w.is_finite()), "{rows:?}");
        // Padded positions stay at zero even with large scores.
        assert_eq!(&rows[0][2..], &[0.0, 0.0]);
        for w in &rows[1] {
            assert!((w - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn history_finalizes_in_order() {
        let dev = Device::Cpu;
        let mut history = AlignmentHistory::new();
        for i in 0..4 {
            history.push(Tensor::full(i as f32, (2, 3), &dev).unwrap());
        }
        assert_eq!(history.len(), 4);
        let alignments = history.finalize().unwrap();
        assert_eq!(alignments.as_tensor().dims(), &[2, 4, 3]);
        let ex = alignments.example(1, 3, 2).unwrap();
        assert_eq!(ex, vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]]);
    }
}
