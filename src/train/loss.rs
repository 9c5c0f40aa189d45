//! Masked training losses.
//!
//! Every term averages over valid frames only, so padded positions contribute
//! neither to the value nor to the gradient.

use candle_core::{DType, Tensor};

use crate::config::{MelLoss, TrainConfig};
use crate::data::Batch;
use crate::model::TacotronOutput;
use crate::model::mask::float_mask;
use crate::{Error, Result};

/// Loss terms of one batch. `total` carries the graph for backprop.
#[derive(Debug, Clone)]
pub struct Losses {
    pub total: Tensor,
    pub mel_before: Tensor,
    pub mel_after: Tensor,
    pub stop: Tensor,
    pub linear: Option<Tensor>,
}

/// Scalar loss values for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossValues {
    pub total: f32,
    pub mel_before: f32,
    pub mel_after: f32,
    pub stop: f32,
    pub linear: f32,
}

impl LossValues {
    pub fn is_finite(&self) -> bool {
        [self.total, self.mel_before, self.mel_after, self.stop, self.linear]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Running mean helper for evaluation.
    pub fn accumulate(&mut self, other: &LossValues, weight: f32) {
        self.total += other.total * weight;
        self.mel_before += other.mel_before * weight;
        self.mel_after += other.mel_after * weight;
        self.stop += other.stop * weight;
        self.linear += other.linear * weight;
    }
}

impl Losses {
    pub fn values(&self) -> Result<LossValues> {
        let scalar = |t: &Tensor| -> Result<f32> { Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?) };
        Ok(LossValues {
            total: scalar(&self.total)?,
            mel_before: scalar(&self.mel_before)?,
            mel_after: scalar(&self.mel_after)?,
            stop: scalar(&self.stop)?,
            linear: match &self.linear {
                Some(l) => scalar(l)?,
                None => 0.0,
            },
        })
    }
}

/// Combine all loss terms for a teacher-forced forward pass over `batch`.
pub fn tacotron_loss(output: &TacotronOutput, batch: &Batch, cfg: &TrainConfig) -> Result<Losses> {
    let (b, t, _) = batch.mel_targets.dims3()?;
    let (ob, ot, _) = output.mel_before.dims3()?;
    if (ob, ot) != (b, t) {
        return Err(Error::InvalidInput(format!(
            "prediction [{ob}, {ot}] does not match targets [{b}, {t}]"
        )));
    }
    let dtype = output.mel_before.dtype();
    let mask = float_mask(&batch.target_lengths, t, dtype, batch.mel_targets.device())?;
    let targets = batch.mel_targets.to_dtype(dtype)?;

    let mel_before = masked_frame_loss(&output.mel_before, &targets, &mask, cfg.mel_loss)?;
    let mel_after = masked_frame_loss(&output.mel_after, &targets, &mask, cfg.mel_loss)?;
    let stop = masked_stop_loss(&output.stop_logits, &batch.stop_targets.to_dtype(dtype)?, &mask)?;

    let linear = match (&output.linear, &batch.linear_targets) {
        (Some(pred), Some(target)) => Some(masked_frame_loss(
            pred,
            &target.to_dtype(dtype)?,
            &mask,
            MelLoss::L1,
        )?),
        (None, None) => None,
        _ => {
            return Err(Error::InvalidInput(
                "linear prediction and linear targets must both be present".into(),
            ));
        }
    };

    let mut total = ((&mel_before + &mel_after)? + (&stop * cfg.stop_loss_weight)?)?;
    if let Some(linear) = &linear {
        total = (total + (linear * cfg.linear_loss_weight)?)?;
    }

    Ok(Losses {
        total,
        mel_before,
        mel_after,
        stop,
        linear,
    })
}

/// Mean L1/L2 error over valid frames and all channels.
///
/// - `pred`, `target`: `[B, T, C]`
/// - `mask`: `[B, T]` float
pub fn masked_frame_loss(pred: &Tensor, target: &Tensor, mask: &Tensor, kind: MelLoss) -> Result<Tensor> {
    let channels = pred.dim(2)? as f64;
    let diff = (pred - target)?;
    let elem = match kind {
        MelLoss::L1 => diff.abs()?,
        MelLoss::L2 => diff.sqr()?,
    };
    let total = elem.broadcast_mul(&mask.unsqueeze(2)?)?.sum_all()?;
    let count = (mask.sum_all()? * channels)?;
    Ok(total.div(&count)?)
}

/// Binary cross-entropy with logits, averaged over valid frames.
///
/// Uses `max(x, 0) - x z + log(1 + exp(-|x|))`, which stays finite for large
/// `|x|`.
pub fn masked_stop_loss(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let bce = ((logits.relu()? - (logits * targets)?)? + (logits.abs()?.neg()?.exp()? + 1.0)?.log()?)?;
    let total = (bce * mask)?.sum_all()?;
    Ok(total.div(&mask.sum_all()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp, Var};

    fn grad_rows(grad: &Tensor, example: usize) -> Vec<Vec<f32>> {
        grad.i(example).unwrap().to_vec2().unwrap()
    }

    #[test]
    fn test_padding_gets_zero_gradient() {
        let dev = Device::Cpu;
        let lengths = [10, 20];
        let pred = Var::from_tensor(&Tensor::randn(0f32, 1.0, (2, 20, 4), &dev).unwrap()).unwrap();
        let target = Tensor::randn(0f32, 1.0, (2, 20, 4), &dev).unwrap();
        let mask = float_mask(&lengths, 20, DType::F32, &dev).unwrap();

        for kind in [MelLoss::L1, MelLoss::L2] {
            let loss = masked_frame_loss(pred.as_tensor(), &target, &mask, kind).unwrap();
            let grads = loss.backward().unwrap();
            let g = grads.get(pred.as_tensor()).unwrap();
            let first = grad_rows(g, 0);
            assert!(first[10..].iter().flatten().all(|&v| v == 0.0));
            assert!(first[..10].iter().flatten().any(|&v| v != 0.0));
            assert!(grad_rows(g, 1).iter().flatten().any(|&v| v != 0.0));
        }

        let logits = Var::from_tensor(&Tensor::randn(0f32, 3.0, (2, 20), &dev).unwrap()).unwrap();
        let stop_targets = Tensor::ones((2, 20), DType::F32, &dev).unwrap();
        let loss = masked_stop_loss(logits.as_tensor(), &stop_targets, &mask).unwrap();
        let grads = loss.backward().unwrap();
        let g: Vec<Vec<f32>> = grads.get(logits.as_tensor()).unwrap().to_vec2().unwrap();
        assert!(g[0][10..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_padding_content_does_not_change_loss() {
        let dev = Device::Cpu;
        let mask = float_mask(&[3, 5], 5, DType::F32, &dev).unwrap();
        let pred = Tensor::randn(0f32, 1.0, (2, 5, 3), &dev).unwrap();
        let target = Tensor::randn(0f32, 1.0, (2, 5, 3), &dev).unwrap();
        let noise = Tensor::randn(0f32, 100.0, (2, 5, 3), &dev).unwrap();
        let padding = mask.affine(-1.0, 1.0).unwrap().unsqueeze(2).unwrap();
        let pad_only = noise.broadcast_mul(&padding).unwrap();
        let a = masked_frame_loss(&pred, &target, &mask, MelLoss::L2)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let perturbed = (&pred + &pad_only).unwrap();
        let b = masked_frame_loss(&perturbed, &target, &mask, MelLoss::L2)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
    }

    #[test]
    fn test_stop_loss_is_stable_for_large_logits() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[1000f32, -1000.0]], &dev).unwrap();
        let targets = Tensor::new(&[[1f32, 0.0]], &dev).unwrap();
        let mask = Tensor::ones((1, 2), DType::F32, &dev).unwrap();
        let loss = masked_stop_loss(&logits, &targets, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss.is_finite());
        assert!(loss.abs() < 1e-6);
    }
}
