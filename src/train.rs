//! Teacher-forced training.
//!
//! All mutable training state lives in [`TrainContext`] and is threaded
//! through [`train_step`] explicitly:
//!
//! ```text
//! TrainContext::init (fresh | restore) → loop { train_step → log / eval / checkpoint }
//! ```
//!
//! - [`loss`] — masked mel, stop and linear losses
//! - [`optim`] — Adam with checkpointable moments, clipping, lr decay
//! - [`checkpoint`] — atomic snapshots, newest-N retention

pub mod checkpoint;
pub mod loss;
pub mod optim;

use std::path::{Path, PathBuf};

use candle_core::Device;
use candle_nn::{Optimizer, VarMap};

use crate::config::{HParams, NonFinitePolicy};
use crate::data::{Batch, Entry, EpochSampler, FeatureDataset};
use crate::model::{Feedback, Noise, Tacotron};
use crate::{Error, Result};
use checkpoint::{Checkpoint, CheckpointManager};
use loss::{LossValues, tacotron_loss};
use optim::{Adam, AdamConfig, clip_scale, learning_rate_at};

/// Where training state comes from at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restore {
    /// Start from freshly initialized parameters.
    Fresh,
    /// Resume from the newest snapshot in the checkpoint directory.
    Latest,
    /// Resume from a specific snapshot.
    Path(PathBuf),
}

/// Mutable state of one training run.
#[derive(Debug)]
pub struct TrainContext {
    /// Parameter updates applied so far.
    pub step: usize,
    /// Batches consumed so far, skipped ones included. Positions the data
    /// order on resume.
    pub batches: usize,
    pub optimizer: Adam,
    pub checkpoints: CheckpointManager,
    /// Batches dropped in a row because of NaN/Inf.
    pub consecutive_skips: usize,
    /// Total batches dropped in this process.
    pub skipped: usize,
}

/// Result of one [`train_step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Updated(StepReport),
    /// The batch produced NaN/Inf and was dropped without an update.
    Skipped { what: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Step counter after the update.
    pub step: usize,
    pub losses: LossValues,
    pub grad_norm: f64,
    pub learning_rate: f64,
    /// Set when this step wrote a checkpoint.
    pub checkpointed: bool,
}

impl TrainContext {
    /// Set up optimizer and checkpoint state for `varmap`.
    ///
    /// With [`Restore::Latest`] or [`Restore::Path`], a missing or unreadable
    /// snapshot is fatal unless `allow_fresh_init` is set, in which case
    /// training starts from the current (fresh) parameters.
    ///
    /// Snapshots newer than the starting step are deleted: they belong to a
    /// run this one replaces.
    pub fn init(
        hp: &HParams,
        varmap: &VarMap,
        checkpoint_dir: impl AsRef<Path>,
        restore: &Restore,
        allow_fresh_init: bool,
    ) -> Result<Self> {
        let checkpoints = CheckpointManager::new(checkpoint_dir, hp.train.keep_checkpoints)?;
        let optimizer = Adam::from_varmap(varmap, AdamConfig::from(&hp.train))?;
        let mut ctx = Self {
            step: 0,
            batches: 0,
            optimizer,
            checkpoints,
            consecutive_skips: 0,
            skipped: 0,
        };

        let path = match restore {
            Restore::Fresh => {
                tracing::info!("starting from fresh parameters");
                ctx.discard_stale()?;
                return Ok(ctx);
            }
            Restore::Path(path) => Ok(path.clone()),
            Restore::Latest => ctx.checkpoints.latest()?.ok_or_else(|| {
                Error::Checkpoint(format!(
                    "no checkpoint in {}",
                    ctx.checkpoints.dir().display()
                ))
            }),
        };

        let restored = path.and_then(|path| {
            let ckpt = Checkpoint::load(&path, &varmap_device(varmap))?;
            ckpt.restore_params(varmap)?;
            ckpt.restore_optimizer(&mut ctx.optimizer)?;
            Ok(ckpt)
        });

        match restored {
            Ok(ckpt) => {
                ctx.step = ckpt.step;
                ctx.batches = ckpt.batches;
                ctx.discard_stale()?;
                tracing::info!(
                    step = ckpt.step,
                    params = ckpt.num_params(),
                    path = %ckpt.path.display(),
                    "restored checkpoint"
                );
                Ok(ctx)
            }
            Err(error) if allow_fresh_init => {
                tracing::warn!(%error, "could not restore checkpoint, starting fresh");
                ctx.discard_stale()?;
                Ok(ctx)
            }
            Err(error) => Err(error),
        }
    }

    fn discard_stale(&self) -> Result<()> {
        let removed = self.checkpoints.discard_after(self.step)?;
        if !removed.is_empty() {
            tracing::warn!(
                start_step = self.step,
                steps = ?removed,
                dir = %self.checkpoints.dir().display(),
                "removed checkpoints newer than the starting step"
            );
        }
        Ok(())
    }

    /// Apply the non-finite policy for `what` at the current step.
    pub fn on_non_finite(
        &mut self,
        what: &'static str,
        policy: NonFinitePolicy,
        max_consecutive: usize,
    ) -> Result<StepOutcome> {
        let error = Error::NonFinite {
            step: self.step,
            what,
        };
        match policy {
            NonFinitePolicy::Abort => Err(error),
            NonFinitePolicy::Skip => {
                self.consecutive_skips += 1;
                self.skipped += 1;
                if self.consecutive_skips > max_consecutive {
                    tracing::error!(
                        consecutive = self.consecutive_skips,
                        "too many consecutive non-finite batches"
                    );
                    return Err(error);
                }
                tracing::warn!(
                    step = self.step,
                    what,
                    consecutive = self.consecutive_skips,
                    "non-finite values, skipping batch"
                );
                Ok(StepOutcome::Skipped { what })
            }
        }
    }
}

/// Device the parameters live on (CPU for an empty map).
fn varmap_device(varmap: &VarMap) -> Device {
    varmap
        .all_vars()
        .first()
        .map(|v| v.device().clone())
        .unwrap_or(Device::Cpu)
}

/// Noise seed for a given step, so resumed runs draw the same masks.
/// A skipped batch leaves `step` unchanged, so the next batch reuses its seed.
fn step_seed(seed: u64, step: usize) -> u64 {
    seed.wrapping_add((step as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// One teacher-forced forward + backward + update.
///
/// NaN/Inf in the loss or gradients never reaches the parameters: the batch is
/// skipped or training aborts, per `hp.train.non_finite_policy`.
pub fn train_step(
    ctx: &mut TrainContext,
    model: &Tacotron,
    varmap: &VarMap,
    batch: &Batch,
    hp: &HParams,
) -> Result<StepOutcome> {
    let cfg = &hp.train;
    ctx.batches += 1;
    let mut noise = Noise::training(step_seed(cfg.seed, ctx.step));
    let feedback = Feedback::TeacherForced {
        targets: &batch.mel_targets,
        lengths: &batch.target_lengths,
    };
    let output = model.forward(&batch.inputs, &batch.input_lengths, &feedback, &mut noise)?;
    let losses = tacotron_loss(&output, batch, cfg)?;
    let values = losses.values()?;
    if !values.is_finite() {
        return ctx.on_non_finite("loss", cfg.non_finite_policy, cfg.max_consecutive_skips);
    }

    let grads = losses.total.backward()?;
    let norm = ctx.optimizer.grad_norm(&grads)?;
    if !norm.finite {
        return ctx.on_non_finite("gradients", cfg.non_finite_policy, cfg.max_consecutive_skips);
    }

    let learning_rate = learning_rate_at(ctx.step, cfg);
    ctx.optimizer.set_learning_rate(learning_rate);
    ctx.optimizer
        .step_scaled(&grads, clip_scale(norm.norm, cfg.clip_gradient_norm))?;
    ctx.step += 1;
    ctx.consecutive_skips = 0;

    let checkpointed = ctx.step % cfg.checkpoint_interval == 0;
    if checkpointed {
        ctx.checkpoints.save(ctx.step, ctx.batches, varmap, &ctx.optimizer)?;
    }

    tracing::debug!(
        step = ctx.step,
        loss = values.total,
        grad_norm = norm.norm,
        batch = batch.len(),
        "train step"
    );

    Ok(StepOutcome::Updated(StepReport {
        step: ctx.step,
        losses: values,
        grad_norm: norm.norm,
        learning_rate,
        checkpointed,
    }))
}

/// Mean teacher-forced loss over `entries` (no dropout, no update).
pub fn evaluate(
    model: &Tacotron,
    dataset: &FeatureDataset,
    entries: &[Entry],
    hp: &HParams,
    device: &Device,
) -> Result<LossValues> {
    let mut mean = LossValues::default();
    if entries.is_empty() {
        return Ok(mean);
    }
    for chunk in entries.chunks(hp.train.batch_size) {
        let refs: Vec<&Entry> = chunk.iter().collect();
        let batch = dataset.load_batch(&refs, hp, device)?;
        let feedback = Feedback::TeacherForced {
            targets: &batch.mel_targets,
            lengths: &batch.target_lengths,
        };
        let mut noise = Noise::inference(hp.synthesis.seed);
        let output = model.forward(&batch.inputs, &batch.input_lengths, &feedback, &mut noise)?;
        let values = tacotron_loss(&output, &batch, &hp.train)?.values()?;
        mean.accumulate(&values, chunk.len() as f32 / entries.len() as f32);
    }
    Ok(mean)
}

/// Options for [`train`].
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub checkpoint_dir: PathBuf,
    pub restore: Restore,
    pub allow_fresh_init: bool,
}

/// What a finished run reports.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub final_step: usize,
    pub skipped_batches: usize,
    pub last_losses: Option<LossValues>,
    pub last_checkpoint: Option<PathBuf>,
}

/// Train until `hp.train.max_steps`, resuming per `options.restore`.
pub fn train(
    hp: &HParams,
    dataset: &FeatureDataset,
    options: &TrainOptions,
    device: &Device,
) -> Result<TrainSummary> {
    hp.validate()?;
    let (model, varmap) = Tacotron::with_varmap(hp, device)?;
    let mut ctx = TrainContext::init(
        hp,
        &varmap,
        &options.checkpoint_dir,
        &options.restore,
        options.allow_fresh_init,
    )?;
    hp.to_json_file(options.checkpoint_dir.join("hparams.json"))?;

    let cfg = &hp.train;
    let entries = dataset.train_entries();
    let batches_per_epoch = entries.len().div_ceil(cfg.batch_size).max(1);
    let mut epoch = ctx.batches / batches_per_epoch;
    let mut offset = ctx.batches % batches_per_epoch;
    let mut last_losses = None;

    tracing::info!(
        start_step = ctx.step,
        max_steps = cfg.max_steps,
        examples = entries.len(),
        batches_per_epoch,
        "training"
    );

    while ctx.step < cfg.max_steps {
        let mut sampler =
            EpochSampler::new(cfg.seed.wrapping_add(epoch as u64), cfg.batch_size, cfg.batch_group_size);
        for indices in sampler.epoch(entries).into_iter().skip(offset) {
            if ctx.step >= cfg.max_steps {
                break;
            }
            let refs: Vec<&Entry> = indices.iter().map(|&i| &entries[i]).collect();
            let batch = dataset.load_batch(&refs, hp, device)?;

            let StepOutcome::Updated(report) = train_step(&mut ctx, &model, &varmap, &batch, hp)?
            else {
                continue;
            };
            last_losses = Some(report.losses);

            if report.step % cfg.log_interval.max(1) == 0 {
                tracing::info!(
                    step = report.step,
                    epoch,
                    loss = report.losses.total,
                    mel_before = report.losses.mel_before,
                    mel_after = report.losses.mel_after,
                    stop = report.losses.stop,
                    linear = report.losses.linear,
                    grad_norm = report.grad_norm,
                    lr = report.learning_rate,
                    "step"
                );
            }
            if cfg.eval_interval > 0 && report.step % cfg.eval_interval == 0 {
                let eval = evaluate(&model, dataset, dataset.test_entries(), hp, device)?;
                tracing::info!(
                    step = report.step,
                    loss = eval.total,
                    mel_after = eval.mel_after,
                    stop = eval.stop,
                    "eval"
                );
            }
        }
        epoch += 1;
        offset = 0;
    }

    let last_checkpoint = if ctx.step % cfg.checkpoint_interval != 0 {
        Some(ctx.checkpoints.save(ctx.step, ctx.batches, &varmap, &ctx.optimizer)?)
    } else {
        ctx.checkpoints.latest()?
    };

    tracing::info!(
        step = ctx.step,
        skipped = ctx.skipped,
        "training finished"
    );

    Ok(TrainSummary {
        final_step: ctx.step,
        skipped_batches: ctx.skipped,
        last_losses,
        last_checkpoint,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::Spectrograms;
    use crate::data::{INDEX_FILE, write_features};
    use crate::model::tiny_hparams;

    /// Write a small feature directory with `n` examples.
    pub(crate) fn write_tiny_dataset(dir: &Path, hp: &HParams, n: usize) {
        let mut index = String::new();
        for i in 0..n {
            let frames = 4 + i % 3;
            let mel = (0..frames)
                .map(|t| {
                    (0..hp.audio.num_mels)
                        .map(|c| ((t * 7 + c * 3 + i) % 11) as f32 / 11.0 - 0.5)
                        .collect()
                })
                .collect();
            let linear = vec![vec![0.0; hp.audio.num_freq()]; frames];
            let file = format!("mel-{i}.safetensors");
            write_features(dir.join(&file), &Spectrograms { mel, linear }).unwrap();
            let entry = Entry {
                id: format!("utt{i:03}"),
                feature_file: file,
                mel_frames: frames,
                text: format!("speech sample {}", ["one", "two", "three"][i % 3]),
            };
            index.push_str(&entry.to_line());
            index.push('\n');
        }
        std::fs::write(dir.join(INDEX_FILE), index).unwrap();
    }

    pub(crate) fn tiny_train_hparams() -> HParams {
        let mut hp = tiny_hparams(2, false);
        hp.model.cleaners = "basic".into();
        hp.train.batch_size = 2;
        hp.train.test_size = 2;
        hp.train.checkpoint_interval = 2;
        hp.train.keep_checkpoints = 2;
        hp.train.max_steps = 3;
        hp.train.eval_interval = 2;
        hp.train.log_interval = 1;
        hp
    }

    #[test]
    fn test_train_step_updates_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let hp = tiny_train_hparams();
        write_tiny_dataset(dir.path(), &hp, 6);
        let dataset = FeatureDataset::open(dir.path(), &hp).unwrap();

        let device = Device::Cpu;
        let (model, varmap) = Tacotron::with_varmap(&hp, &device).unwrap();
        let mut ctx =
            TrainContext::init(&hp, &varmap, dir.path().join("ckpt"), &Restore::Fresh, false).unwrap();

        let entries: Vec<&Entry> = dataset.train_entries()[..2].iter().collect();
        let batch = dataset.load_batch(&entries, &hp, &device).unwrap();

        let before: Vec<f32> = varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().sum_all().unwrap().to_scalar::<f32>().unwrap())
            .collect();
        let outcome = train_step(&mut ctx, &model, &varmap, &batch, &hp).unwrap();
        let StepOutcome::Updated(report) = outcome else {
            panic!("step was skipped: {outcome:?}");
        };
        assert_eq!(report.step, 1);
        assert!(report.losses.is_finite());
        assert!(!report.checkpointed);

        let after: Vec<f32> = varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().sum_all().unwrap().to_scalar::<f32>().unwrap())
            .collect();
        assert_ne!(before, after);

        let outcome = train_step(&mut ctx, &model, &varmap, &batch, &hp).unwrap();
        assert!(matches!(outcome, StepOutcome::Updated(StepReport { checkpointed: true, .. })));
        assert_eq!(ctx.checkpoints.list().unwrap().len(), 1);
    }

    #[test]
    fn test_non_finite_policy() {
        let dir = tempfile::tempdir().unwrap();
        let hp = tiny_train_hparams();
        let (_model, varmap) = Tacotron::with_varmap(&hp, &Device::Cpu).unwrap();
        let mut ctx = TrainContext::init(&hp, &varmap, dir.path(), &Restore::Fresh, false).unwrap();

        let outcome = ctx.on_non_finite("loss", NonFinitePolicy::Skip, 2).unwrap();
        assert_eq!(outcome, StepOutcome::Skipped { what: "loss" });
        ctx.on_non_finite("loss", NonFinitePolicy::Skip, 2).unwrap();
        assert!(matches!(
            ctx.on_non_finite("loss", NonFinitePolicy::Skip, 2),
            Err(Error::NonFinite { what: "loss", .. })
        ));
        assert!(matches!(
            ctx.on_non_finite("gradients", NonFinitePolicy::Abort, 100),
            Err(Error::NonFinite { what: "gradients", .. })
        ));
        assert_eq!(ctx.step, 0);
    }

    #[test]
    fn test_restore_requires_checkpoint_unless_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let hp = tiny_train_hparams();
        let (_model, varmap) = Tacotron::with_varmap(&hp, &Device::Cpu).unwrap();

        let missing = TrainContext::init(&hp, &varmap, dir.path(), &Restore::Latest, false);
        assert!(matches!(missing, Err(Error::Checkpoint(_))));

        let corrupt = dir.path().join("ckpt-5.safetensors");
        std::fs::write(&corrupt, b"garbage").unwrap();
        let bad = TrainContext::init(&hp, &varmap, dir.path(), &Restore::Path(corrupt.clone()), false);
        assert!(matches!(bad, Err(Error::Checkpoint(_))));

        let ctx = TrainContext::init(&hp, &varmap, dir.path(), &Restore::Path(corrupt), true).unwrap();
        assert_eq!(ctx.step, 0);
    }

    #[test]
    fn test_train_resumes_from_latest() {
        let dir = tempfile::tempdir().unwrap();
        let mut hp = tiny_train_hparams();
        write_tiny_dataset(dir.path(), &hp, 6);
        let dataset = FeatureDataset::open(dir.path(), &hp).unwrap();
        let options = TrainOptions {
            checkpoint_dir: dir.path().join("logs"),
            restore: Restore::Fresh,
            allow_fresh_init: false,
        };

        let summary = train(&hp, &dataset, &options, &Device::Cpu).unwrap();
        assert_eq!(summary.final_step, 3);
        assert_eq!(summary.last_checkpoint, Some(options.checkpoint_dir.join("ckpt-3.safetensors")));
        assert!(options.checkpoint_dir.join("hparams.json").is_file());

        hp.train.max_steps = 5;
        let resumed = TrainOptions {
            restore: Restore::Latest,
            ..options.clone()
        };
        let summary = train(&hp, &dataset, &resumed, &Device::Cpu).unwrap();
        assert_eq!(summary.final_step, 5);

        let manager = CheckpointManager::new(&options.checkpoint_dir, 2).unwrap();
        let steps: Vec<usize> = manager.list().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![4, 5]);
    }

    #[test]
    fn test_fresh_run_replaces_newer_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let hp = tiny_train_hparams();
        write_tiny_dataset(dir.path(), &hp, 6);
        let dataset = FeatureDataset::open(dir.path(), &hp).unwrap();
        let logs = dir.path().join("logs");

        let (_model, old) = Tacotron::with_varmap(&hp, &Device::Cpu).unwrap();
        let opt = Adam::from_varmap(&old, AdamConfig::default()).unwrap();
        let manager = CheckpointManager::new(&logs, hp.train.keep_checkpoints).unwrap();
        for step in [500, 600] {
            manager.save(step, step, &old, &opt).unwrap();
        }

        let options = TrainOptions {
            checkpoint_dir: logs.clone(),
            restore: Restore::Fresh,
            allow_fresh_init: false,
        };
        let summary = train(&hp, &dataset, &options, &Device::Cpu).unwrap();
        let last = summary.last_checkpoint.unwrap();
        assert!(last.is_file());

        let steps: Vec<usize> = manager.list().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![2, 3]);
        assert_eq!(manager.latest().unwrap(), Some(last));
    }

    #[test]
    fn test_restore_from_older_path_drops_newer_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let hp = tiny_train_hparams();
        let (_model, varmap) = Tacotron::with_varmap(&hp, &Device::Cpu).unwrap();
        let opt = Adam::from_varmap(&varmap, AdamConfig::default()).unwrap();
        let manager = CheckpointManager::new(dir.path(), 5).unwrap();
        let older = manager.save(2, 5, &varmap, &opt).unwrap();
        manager.save(8, 9, &varmap, &opt).unwrap();

        let ctx = TrainContext::init(&hp, &varmap, dir.path(), &Restore::Path(older.clone()), false)
            .unwrap();
        assert_eq!(ctx.step, 2);
        assert_eq!(ctx.batches, 5);
        assert_eq!(manager.latest().unwrap(), Some(older));
    }

    #[test]
    fn test_batches_count_survives_resume() {
        let dir = tempfile::tempdir().unwrap();
        let hp = tiny_train_hparams();
        write_tiny_dataset(dir.path(), &hp, 6);
        let dataset = FeatureDataset::open(dir.path(), &hp).unwrap();

        let (model, varmap) = Tacotron::with_varmap(&hp, &Device::Cpu).unwrap();
        let mut ctx =
            TrainContext::init(&hp, &varmap, dir.path().join("ckpt"), &Restore::Fresh, false).unwrap();
        let entries: Vec<&Entry> = dataset.train_entries()[..2].iter().collect();
        let batch = dataset.load_batch(&entries, &hp, &Device::Cpu).unwrap();
        train_step(&mut ctx, &model, &varmap, &batch, &hp).unwrap();
        // A dropped batch still counts as consumed.
        ctx.batches += 1;
        ctx.on_non_finite("loss", NonFinitePolicy::Skip, 2).unwrap();
        train_step(&mut ctx, &model, &varmap, &batch, &hp).unwrap();
        assert_eq!((ctx.step, ctx.batches), (2, 3));

        let (_model, restored) = Tacotron::with_varmap(&hp, &Device::Cpu).unwrap();
        let resumed =
            TrainContext::init(&hp, &restored, dir.path().join("ckpt"), &Restore::Latest, false).unwrap();
        assert_eq!((resumed.step, resumed.batches), (2, 3));
    }
}
