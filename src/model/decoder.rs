//! Autoregressive decoder.
//!
//! One step:
//!
//! ```text
//! prev frame → prenet ─┐
//!                      ├→ attention LSTM ──→ attention ─→ context
//! prev context ────────┘        │                           │
//!                               └──── ⊕ ────────────────────┘
//!                                     ↓
//!                           decoder LSTM stack ⊕ context
//!                                     ↓
//!                     frame projection (r × n_mels), stop projection (r)
//! ```
//!
//! Generation walks `Initial → Stepping → Done`. What the prenet sees as the
//! previous frame is decided by [`Feedback`]: teacher forcing reads the
//! ground-truth target and ends after the known length, free running feeds the
//! last predicted frame back and ends on the stop token or the step bound.
//! Training, GTA and free-running synthesis all go through [`Decoder::step`].

use candle_core::{D, DType, IndexOp, Module, Tensor};
use candle_nn::rnn::LSTMState;
use candle_nn::{LSTM, LSTMConfig, Linear, RNN, VarBuilder};
use tracing::{debug, warn};

use super::attention::{
    AlignmentHistory, Alignments, AttentionMemory, AttentionState, LocationSensitiveAttention,
};
use super::layers::{Noise, zoneout_lstm_step};
use crate::config::ModelConfig;
use crate::{Error, Result};

/// Source of the decoder's previous-frame input.
#[derive(Debug, Clone, Copy)]
pub enum Feedback<'a> {
    /// Previous frame is the ground truth; runs exactly `ceil(T / r)` steps.
    TeacherForced {
        /// `[B, T, n_mels]`
        targets: &'a Tensor,
        /// True frame count per example (`<= T`).
        lengths: &'a [usize],
    },
    /// Previous frame is the model's own last prediction.
    FreeRunning {
        /// An example stops once a stop probability is strictly above this.
        stop_threshold: f32,
        /// Hard bound on decoder steps.
        max_steps: usize,
    },
}

/// Why generation reached `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Teacher forcing exhausted the known target length.
    TargetLength,
    /// The stop token fired.
    StopToken,
    /// The step bound was hit first; output is truncated (degenerate alignment).
    MaxSteps,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::TargetLength => "target_length",
            StopReason::StopToken => "stop_token",
            StopReason::MaxSteps => "max_steps",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initial,
    Stepping,
    Done(StopReason),
}

/// Mutable per-generation decoder state.
#[derive(Debug)]
pub struct DecoderState {
    phase: Phase,
    step: usize,
    attention_rnn: LSTMState,
    decoder_rnns: Vec<LSTMState>,
    attention: AttentionState,
    /// Previous attention context, `[B, D_enc]`.
    context: Tensor,
    /// Last predicted frame, `[B, n_mels]`.
    last_frame: Tensor,
    /// Decoder steps taken when each example's stop token fired.
    stopped_at: Vec<Option<usize>>,
}

impl DecoderState {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Decoder steps taken so far.
    pub fn steps(&self) -> usize {
        self.step
    }
}

/// Output of one decoder step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// `[B, r, n_mels]`
    pub frames: Tensor,
    /// `[B, r]`
    pub stop_logits: Tensor,
    /// `[B, T_in]`
    pub alignment: Tensor,
}

/// A finished generation.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `[B, steps * r, n_mels]`
    pub frames: Tensor,
    /// `[B, steps * r]`
    pub stop_logits: Tensor,
    /// `[B, steps, T_in]`
    pub alignments: Alignments,
    /// Valid frames per example.
    pub lengths: Vec<usize>,
    /// Decoder steps taken.
    pub steps: usize,
    /// Batch-level reason for reaching `Done`.
    pub stop_reason: StopReason,
    /// Per-example reason.
    pub stop_reasons: Vec<StopReason>,
}

#[derive(Debug, Clone)]
struct Prenet {
    layers: Vec<Linear>,
    dropout: f32,
}

impl Prenet {
    fn new(in_dim: usize, sizes: &[usize], dropout: f32, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut layers = Vec::with_capacity(sizes.len());
        let mut dim = in_dim;
        for (i, &size) in sizes.iter().enumerate() {
            layers.push(candle_nn::linear(dim, size, vb.pp(format!("layers.{i}")))?);
            dim = size;
        }
        Ok(Self { layers, dropout })
    }

    /// Dropout stays on at inference to add output variation.
    fn forward(&self, xs: &Tensor, noise: &mut Noise) -> candle_core::Result<Tensor> {
        let mut h = xs.clone();
        for layer in &self.layers {
            h = layer.forward(&h)?.relu()?;
            h = noise.always_dropout(&h, self.dropout)?;
        }
        Ok(h)
    }
}

#[derive(Debug, Clone)]
pub struct Decoder {
    prenet: Prenet,
    attention_rnn: LSTM,
    attention: LocationSensitiveAttention,
    decoder_rnns: Vec<LSTM>,
    frame_projection: Linear,
    stop_projection: Linear,
    num_mels: usize,
    outputs_per_step: usize,
    zoneout: f32,
}

impl Decoder {
    pub fn new(cfg: &ModelConfig, num_mels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let enc_dim = cfg.encoder_output_dim();
        let prenet = Prenet::new(num_mels, &cfg.prenet_layers, cfg.prenet_dropout, vb.pp("prenet"))?;
        let prenet_dim = cfg.prenet_layers.last().copied().unwrap_or(num_mels);

        let attention_rnn = candle_nn::lstm(
            prenet_dim + enc_dim,
            cfg.attention_rnn_units,
            LSTMConfig::default(),
            vb.pp("attention_rnn"),
        )?;
        let attention =
            LocationSensitiveAttention::new(cfg, cfg.attention_rnn_units, vb.pp("attention"))?;

        let mut decoder_rnns = Vec::with_capacity(cfg.decoder_layers);
        for i in 0..cfg.decoder_layers {
            let in_dim = if i == 0 {
                cfg.attention_rnn_units + enc_dim
            } else {
                cfg.decoder_lstm_units
            };
            decoder_rnns.push(candle_nn::lstm(
                in_dim,
                cfg.decoder_lstm_units,
                LSTMConfig::default(),
                vb.pp(format!("decoder_rnns.{i}")),
            )?);
        }

        let proj_in = cfg.decoder_lstm_units + enc_dim;
        let r = cfg.outputs_per_step;
        Ok(Self {
            prenet,
            attention_rnn,
            attention,
            decoder_rnns,
            frame_projection: candle_nn::linear(proj_in, num_mels * r, vb.pp("frame_projection"))?,
            stop_projection: candle_nn::linear(proj_in, r, vb.pp("stop_projection"))?,
            num_mels,
            outputs_per_step: r,
            zoneout: cfg.zoneout_rate,
        })
    }

    pub fn attention(&self) -> &LocationSensitiveAttention {
        &self.attention
    }

    pub fn outputs_per_step(&self) -> usize {
        self.outputs_per_step
    }

    /// A fresh `Initial` state for `memory`.
    pub fn initial_state(&self, memory: &AttentionMemory) -> Result<DecoderState> {
        let b = memory.batch_size();
        let dtype = memory.values.dtype();
        let dev = memory.values.device();
        let enc_dim = memory.values.dim(2)?;

        let attention_rnn = self.attention_rnn.zero_state(b)?;
        let decoder_rnns = self
            .decoder_rnns
            .iter()
            .map(|rnn| rnn.zero_state(b))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(DecoderState {
            phase: Phase::Initial,
            step: 0,
            attention_rnn,
            decoder_rnns,
            attention: self.attention.initial_state(memory)?,
            context: Tensor::zeros((b, enc_dim), dtype, dev)?,
            last_frame: Tensor::zeros((b, self.num_mels), dtype, dev)?,
            stopped_at: vec![None; b],
        })
    }

    /// Check a feedback policy against the batch before decoding.
    fn validate_feedback(&self, feedback: &Feedback, batch: usize) -> Result<()> {
        match *feedback {
            Feedback::TeacherForced { targets, lengths } => {
                let (b, t, n) = targets.dims3()?;
                if b != batch || lengths.len() != batch {
                    return Err(Error::InvalidInput(format!(
                        "teacher forcing: {b} targets and {} lengths for a batch of {batch}",
                        lengths.len()
                    )));
                }
                if n != self.num_mels {
                    return Err(Error::InvalidInput(format!(
                        "teacher forcing: targets have {n} channels, expected {}",
                        self.num_mels
                    )));
                }
                if t == 0 || lengths.iter().any(|&len| len == 0 || len > t) {
                    return Err(Error::InvalidInput(format!(
                        "teacher forcing: lengths {lengths:?} outside 1..={t}"
                    )));
                }
            }
            Feedback::FreeRunning { max_steps, .. } => {
                if max_steps == 0 {
                    return Err(Error::InvalidInput("max_steps must be >= 1".into()));
                }
            }
        }
        Ok(())
    }

    /// Advance one step under `feedback`.
    ///
    /// `Initial` and `Stepping` states produce a [`StepOutput`] and may move to
    /// `Done`. Stepping a `Done` state is an error.
    pub fn step(
        &self,
        state: &mut DecoderState,
        feedback: &Feedback,
        memory: &AttentionMemory,
        noise: &mut Noise,
    ) -> Result<StepOutput> {
        if let Phase::Done(reason) = state.phase {
            return Err(Error::InvalidInput(format!(
                "decoder already done ({reason}) after {} steps",
                state.step
            )));
        }
        let r = self.outputs_per_step;

        let prev_frame = match *feedback {
            Feedback::TeacherForced { targets, .. } if state.step > 0 => {
                targets.i((.., state.step * r - 1, ..))?
            }
            _ => state.last_frame.clone(),
        };

        let prenet_out = self.prenet.forward(&prev_frame, noise)?;
        let rnn_in = Tensor::cat(&[&prenet_out, &state.context], D::Minus1)?;
        let attention_rnn = zoneout_lstm_step(
            &self.attention_rnn,
            &rnn_in,
            &state.attention_rnn,
            self.zoneout,
            noise,
        )?;

        let (context, attention) =
            self.attention
                .forward(&attention_rnn.h, memory, &state.attention)?;

        let mut input = Tensor::cat(&[&attention_rnn.h, &context], D::Minus1)?;
        let mut decoder_rnns = Vec::with_capacity(self.decoder_rnns.len());
        for (rnn, prev) in self.decoder_rnns.iter().zip(&state.decoder_rnns) {
            let next = zoneout_lstm_step(rnn, &input, prev, self.zoneout, noise)?;
            input = next.h.clone();
            decoder_rnns.push(next);
        }

        let proj_in = Tensor::cat(&[&input, &context], D::Minus1)?;
        let b = proj_in.dim(0)?;
        let frames = self
            .frame_projection
            .forward(&proj_in)?
            .reshape((b, r, self.num_mels))?;
        let stop_logits = self.stop_projection.forward(&proj_in)?;

        state.last_frame = frames.i((.., r - 1, ..))?;
        state.attention_rnn = attention_rnn;
        state.decoder_rnns = decoder_rnns;
        state.context = context;
        state.attention = attention;
        state.step += 1;
        state.phase = self.next_phase(state, feedback, &stop_logits)?;

        Ok(StepOutput {
            frames,
            stop_logits,
            alignment: state.attention.alignment.clone(),
        })
    }

    fn next_phase(
        &self,
        state: &mut DecoderState,
        feedback: &Feedback,
        stop_logits: &Tensor,
    ) -> Result<Phase> {
        match *feedback {
            Feedback::TeacherForced { targets, .. } => {
                let total = targets.dim(1)?.div_ceil(self.outputs_per_step);
                Ok(if state.step >= total {
                    Phase::Done(StopReason::TargetLength)
                } else {
                    Phase::Stepping
                })
            }
            Feedback::FreeRunning {
                stop_threshold,
                max_steps,
            } => {
                let probs: Vec<Vec<f32>> = candle_nn::ops::sigmoid(stop_logits)?
                    .to_dtype(DType::F32)?
                    .to_vec2()?;
                for (stopped, row) in state.stopped_at.iter_mut().zip(&probs) {
                    if stopped.is_none() && row.iter().any(|&p| p > stop_threshold) {
                        *stopped = Some(state.step);
                    }
                }
                Ok(if state.stopped_at.iter().all(Option::is_some) {
                    Phase::Done(StopReason::StopToken)
                } else if state.step >= max_steps {
                    Phase::Done(StopReason::MaxSteps)
                } else {
                    Phase::Stepping
                })
            }
        }
    }

    /// Run a whole generation from `Initial` to `Done`.
    pub fn decode(
        &self,
        memory: &AttentionMemory,
        feedback: &Feedback,
        noise: &mut Noise,
    ) -> Result<DecoderOutput> {
        self.validate_feedback(feedback, memory.batch_size())?;

        let mut state = self.initial_state(memory)?;
        let mut frames = Vec::new();
        let mut stop_logits = Vec::new();
        let mut history = AlignmentHistory::new();

        let reason = loop {
            if let Phase::Done(reason) = state.phase {
                break reason;
            }
            let out = self.step(&mut state, feedback, memory, noise)?;
            frames.push(out.frames);
            stop_logits.push(out.stop_logits);
            history.push(out.alignment);
        };

        let steps = state.step;
        let r = self.outputs_per_step;
        let (lengths, stop_reasons) = match *feedback {
            Feedback::TeacherForced { lengths, .. } => {
                (lengths.to_vec(), vec![StopReason::TargetLength; lengths.len()])
            }
            Feedback::FreeRunning { .. } => state
                .stopped_at
                .iter()
                .map(|stopped| match stopped {
                    Some(s) => (s * r, StopReason::StopToken),
                    None => (steps * r, StopReason::MaxSteps),
                })
                .unzip(),
        };

        if reason == StopReason::MaxSteps {
            let truncated = stop_reasons
                .iter()
                .filter(|&&s| s == StopReason::MaxSteps)
                .count();
            warn!(
                steps,
                truncated, "decoder hit the step bound before the stop token, output truncated"
            );
        } else {
            debug!(steps, %reason, "decoder done");
        }

        Ok(DecoderOutput {
            frames: Tensor::cat(&frames, 1)?,
            stop_logits: Tensor::cat(&stop_logits, 1)?,
            alignments: history.finalize()?,
            lengths,
            steps,
            stop_reason: reason,
            stop_reasons,
        })
    }
}
