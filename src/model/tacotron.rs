//! The full feature prediction network.
//!
//! ```text
//! ids → Encoder → AttentionMemory → Decoder (Feedback) → mel_before
//!                                                           ↓
//!                                    mel_after = mel_before + Postnet(mel_before)
//!                                                           ↓
//!                                                   LinearHead (optional)
//! ```

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use super::attention::Alignments;
use super::decoder::{Decoder, Feedback, StopReason};
use super::encoder::Encoder;
use super::layers::Noise;
use super::mask::float_mask;
use super::postnet::{LinearHead, Postnet};
use crate::config::HParams;
use crate::text::{self, num_symbols};
use crate::{Error, Result};

/// Everything one forward pass produces.
#[derive(Debug, Clone)]
pub struct TacotronOutput {
    /// Decoder frames before the postnet, `[B, T_out, n_mels]`.
    pub mel_before: Tensor,
    /// Postnet-refined frames, `[B, T_out, n_mels]`, zero past each length.
    pub mel_after: Tensor,
    /// `[B, T_out, num_freq]` when the linear head is enabled.
    pub linear: Option<Tensor>,
    /// `[B, T_out]`
    pub stop_logits: Tensor,
    pub alignments: Alignments,
    /// Valid output frames per example.
    pub lengths: Vec<usize>,
    pub steps: usize,
    pub stop_reason: StopReason,
    pub stop_reasons: Vec<StopReason>,
}

#[derive(Debug, Clone)]
pub struct Tacotron {
    encoder: Encoder,
    decoder: Decoder,
    postnet: Postnet,
    linear_head: Option<LinearHead>,
}

impl Tacotron {
    pub fn new(hp: &HParams, vb: VarBuilder) -> candle_core::Result<Self> {
        let m = &hp.model;
        let num_mels = hp.audio.num_mels;
        let linear_head = if m.predict_linear {
            Some(LinearHead::new(
                m,
                num_mels,
                hp.audio.num_freq(),
                vb.pp("linear_head"),
            )?)
        } else {
            None
        };
        Ok(Self {
            encoder: Encoder::new(m, num_symbols(), vb.pp("encoder"))?,
            decoder: Decoder::new(m, num_mels, vb.pp("decoder"))?,
            postnet: Postnet::new(m, num_mels, vb.pp("postnet"))?,
            linear_head,
        })
    }

    /// A freshly initialized model together with the map holding its variables.
    pub fn with_varmap(hp: &HParams, device: &Device) -> candle_core::Result<(Self, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(hp, vb)?;
        Ok((model, varmap))
    }

    pub fn outputs_per_step(&self) -> usize {
        self.decoder.outputs_per_step()
    }

    /// Run the network.
    ///
    /// - `ids`: `[B, T_in]` u32, padded with the pad id
    /// - `input_lengths`: true symbol count per example
    /// - `feedback`: teacher forcing (training, GTA) or free running
    ///
    /// Malformed sequences are rejected before the encoder runs.
    pub fn forward(
        &self,
        ids: &Tensor,
        input_lengths: &[usize],
        feedback: &Feedback,
        noise: &mut Noise,
    ) -> Result<TacotronOutput> {
        check_inputs(ids, input_lengths)?;

        let memory = self.encoder.forward(ids, input_lengths, noise)?;
        let memory = self.decoder.attention().prepare(&memory, input_lengths)?;
        let decoded = self.decoder.decode(&memory, feedback, noise)?;

        let (_b, t_out, _n) = decoded.frames.dims3()?;
        let mask = float_mask(&decoded.lengths, t_out, decoded.frames.dtype(), ids.device())?;
        let residual = self.postnet.forward(&decoded.frames, &mask, noise)?;
        let mel_after = (&decoded.frames + residual)?.broadcast_mul(&mask.unsqueeze(2)?)?;

        let linear = match &self.linear_head {
            Some(head) => Some(head.forward(&mel_after, &mask, noise)?),
            None => None,
        };

        Ok(TacotronOutput {
            mel_before: decoded.frames,
            mel_after,
            linear,
            stop_logits: decoded.stop_logits,
            alignments: decoded.alignments,
            lengths: decoded.lengths,
            steps: decoded.steps,
            stop_reason: decoded.stop_reason,
            stop_reasons: decoded.stop_reasons,
        })
    }
}

fn check_inputs(ids: &Tensor, input_lengths: &[usize]) -> Result<()> {
    let (b, t) = ids.dims2()?;
    if b == 0 || input_lengths.len() != b {
        return Err(Error::InvalidInput(format!(
            "{} input lengths for a batch of {b}",
            input_lengths.len()
        )));
    }
    let rows: Vec<Vec<u32>> = ids.to_vec2()?;
    for (i, (row, &len)) in rows.iter().zip(input_lengths).enumerate() {
        if len > t {
            return Err(Error::InvalidInput(format!(
                "example {i}: length {len} exceeds padded length {t}"
            )));
        }
        text::check_sequence(&row[..len])
            .map_err(|e| Error::InvalidInput(format!("example {i}: {e}")))?;
    }
    Ok(())
}
