//! Synthesis driver.
//!
//! | Mode      | Previous-frame input       | Ends on                 | Inputs              |
//! |-----------|----------------------------|-------------------------|---------------------|
//! | `eval`    | own prediction             | stop token / step bound | custom text         |
//! | `natural` | own prediction             | stop token / step bound | held-out utterances |
//! | `gta`     | ground-truth target frame  | target length           | all utterances      |
//!
//! The mode only picks the [`Feedback`] handed to the model; every mode runs
//! the same encoder, attention, decoder and postnet.
//!
//! Output per utterance: `<out>/mel-<id>.safetensors` (`mel`, optional
//! `linear`, `alignment`) and one line in `<out>/map.txt`:
//! `id|output_file|frames|stop_reason|text`.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::{DType, Device, IndexOp, Tensor};

use crate::config::HParams;
use crate::data::{Entry, FeatureDataset, frames_to_tensor};
use crate::model::{Feedback, Noise, StopReason, Tacotron};
use crate::text::{self, Cleaner, PAD_ID};
use crate::train::checkpoint::Checkpoint;
use crate::{Error, Result};

/// Name of the synthesis index inside an output directory.
pub const MAP_FILE: &str = "map.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Free running on arbitrary text.
    Eval,
    /// Free running on held-out utterances.
    Natural,
    /// Teacher forced on known utterances; output is time-aligned with the target.
    #[default]
    Gta,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Eval => "eval",
            Mode::Natural => "natural",
            Mode::Gta => "gta",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eval" => Ok(Mode::Eval),
            "natural" => Ok(Mode::Natural),
            "gta" => Ok(Mode::Gta),
            other => Err(format!("unknown synthesis mode '{other}' (eval, natural, gta)")),
        }
    }
}

/// One synthesis input.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub id: String,
    pub text: String,
    pub sequence: Vec<u32>,
    /// `[T, n_mels]` ground truth, required in GTA mode.
    pub target: Option<Tensor>,
}

impl Utterance {
    /// Tokenize free text.
    pub fn from_text(id: impl Into<String>, text: &str, cleaner: Cleaner) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            text: text.to_string(),
            sequence: text::text_to_sequence(text, cleaner)?,
            target: None,
        })
    }
}

/// One synthesized utterance, trimmed to its valid length.
#[derive(Debug, Clone)]
pub struct Synthesized {
    pub id: String,
    pub text: String,
    /// `[frames, n_mels]`
    pub mel: Tensor,
    /// `[frames, num_freq]`
    pub linear: Option<Tensor>,
    /// `[decoder_steps][input_len]`
    pub alignment: Vec<Vec<f32>>,
    pub frames: usize,
    pub stop_reason: StopReason,
}

/// A loaded model ready for inference.
pub struct Synthesizer {
    hp: HParams,
    model: Tacotron,
    device: Device,
    checkpoint_step: usize,
}

impl Synthesizer {
    /// Build the model and load `checkpoint` into it. Any load failure is fatal.
    pub fn load(hp: &HParams, checkpoint: impl AsRef<Path>, device: &Device) -> Result<Self> {
        hp.validate()?;
        let (model, varmap) = Tacotron::with_varmap(hp, device)?;
        let ckpt = Checkpoint::load(checkpoint, device)?;
        ckpt.restore_params(&varmap)?;
        tracing::info!(
            step = ckpt.step,
            path = %ckpt.path.display(),
            "loaded checkpoint for synthesis"
        );
        Ok(Self {
            hp: hp.clone(),
            model,
            device: device.clone(),
            checkpoint_step: ckpt.step,
        })
    }

    pub fn checkpoint_step(&self) -> usize {
        self.checkpoint_step
    }

    pub fn hparams(&self) -> &HParams {
        &self.hp
    }

    /// Synthesize a batch. The noise source is reseeded on every call, so
    /// identical inputs give identical outputs.
    pub fn synthesize(&self, utterances: &[Utterance], mode: Mode) -> Result<Vec<Synthesized>> {
        if utterances.is_empty() {
            return Ok(Vec::new());
        }
        let input_lengths: Vec<usize> = utterances.iter().map(|u| u.sequence.len()).collect();
        let max_input = input_lengths.iter().copied().max().unwrap_or(0);
        let mut ids = Vec::with_capacity(utterances.len() * max_input);
        for u in utterances {
            ids.extend_from_slice(&u.sequence);
            ids.extend(std::iter::repeat_n(PAD_ID, max_input - u.sequence.len()));
        }
        let ids = Tensor::from_vec(ids, (utterances.len(), max_input), &self.device)?;

        let mut noise = Noise::inference(self.hp.synthesis.seed);
        let output = match mode {
            Mode::Eval | Mode::Natural => {
                let feedback = Feedback::FreeRunning {
                    stop_threshold: self.hp.synthesis.stop_threshold,
                    max_steps: self.hp.synthesis.max_decoder_steps,
                };
                self.model.forward(&ids, &input_lengths, &feedback, &mut noise)?
            }
            Mode::Gta => {
                let (targets, lengths) = self.gta_targets(utterances)?;
                let feedback = Feedback::TeacherForced {
                    targets: &targets,
                    lengths: &lengths,
                };
                self.model.forward(&ids, &input_lengths, &feedback, &mut noise)?
            }
        };

        let r = self.model.outputs_per_step();
        let mut results = Vec::with_capacity(utterances.len());
        for (i, u) in utterances.iter().enumerate() {
            let frames = output.lengths[i];
            let stop_reason = output.stop_reasons[i];
            if stop_reason == StopReason::MaxSteps {
                tracing::warn!(
                    id = %u.id,
                    frames,
                    "no stop token within max_decoder_steps, alignment likely degenerate"
                );
            }
            results.push(Synthesized {
                id: u.id.clone(),
                text: u.text.clone(),
                mel: output.mel_after.i(i)?.narrow(0, 0, frames)?,
                linear: match &output.linear {
                    Some(linear) => Some(linear.i(i)?.narrow(0, 0, frames)?),
                    None => None,
                },
                alignment: output
                    .alignments
                    .example(i, frames.div_ceil(r), input_lengths[i])?,
                frames,
                stop_reason,
            });
        }
        Ok(results)
    }

    /// Pad targets into `[B, T, n_mels]`.
    fn gta_targets(&self, utterances: &[Utterance]) -> Result<(Tensor, Vec<usize>)> {
        let num_mels = self.hp.audio.num_mels;
        let mut targets = Vec::with_capacity(utterances.len());
        for u in utterances {
            let target = u.target.as_ref().ok_or_else(|| {
                Error::InvalidInput(format!("'{}': GTA synthesis needs a target", u.id))
            })?;
            let (frames, channels) = target.dims2()?;
            if channels != num_mels {
                return Err(Error::LengthMismatch {
                    id: u.id.clone(),
                    what: "mel channels",
                    expected: num_mels,
                    actual: channels,
                });
            }
            if frames == 0 {
                return Err(Error::InvalidInput(format!("'{}': empty target", u.id)));
            }
            targets.push(target.to_dtype(DType::F32)?);
        }
        let lengths: Vec<usize> = targets.iter().map(|t| t.dim(0)).collect::<candle_core::Result<_>>()?;
        let max = lengths.iter().copied().max().unwrap_or(0);
        let pad_value = self.hp.audio.target_pad_value();
        let padded = targets
            .iter()
            .zip(&lengths)
            .map(|(t, &len)| {
                if len == max {
                    return Ok(t.clone());
                }
                let pad = Tensor::full(pad_value, (max - len, num_mels), t.device())?;
                Tensor::cat(&[t, &pad], 0)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok((Tensor::stack(&padded, 0)?.to_device(&self.device)?, lengths))
    }
}

/// Where a synthesis run takes its inputs from.
#[derive(Debug, Clone)]
pub enum Inputs {
    /// Custom sentences (eval mode).
    Texts(Vec<String>),
    /// Entries of a preprocessed dataset (natural and GTA modes).
    Dataset(PathBuf),
}

/// One `map.txt` line.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub id: String,
    pub output_file: String,
    pub frames: usize,
    pub stop_reason: StopReason,
    pub text: String,
}

impl MapEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.id, self.output_file, self.frames, self.stop_reason, self.text
        )
    }
}

/// Build the utterance list for `mode`.
///
/// Natural mode uses the held-out split; GTA covers every entry so a vocoder
/// can be trained on the aligned output.
pub fn collect_utterances(synth: &Synthesizer, mode: Mode, inputs: &Inputs) -> Result<Vec<Utterance>> {
    let hp = synth.hparams();
    let cleaner = Cleaner::parse(&hp.model.cleaners)?;
    match (mode, inputs) {
        (Mode::Eval, Inputs::Texts(texts)) => texts
            .iter()
            .enumerate()
            .map(|(i, text)| Utterance::from_text(format!("eval-{i:03}"), text, cleaner))
            .collect(),
        (Mode::Natural | Mode::Gta, Inputs::Dataset(dir)) => {
            let dataset = FeatureDataset::open(dir, hp)?;
            let entries: Vec<&Entry> = match mode {
                Mode::Natural => dataset.test_entries().iter().collect(),
                _ => dataset
                    .train_entries()
                    .iter()
                    .chain(dataset.test_entries())
                    .collect(),
            };
            entries
                .into_iter()
                .map(|entry| {
                    let example = dataset.load(entry)?;
                    let (frames, _) = example.mel.dims2()?;
                    if frames != example.declared_frames {
                        return Err(Error::LengthMismatch {
                            id: example.id,
                            what: "mel frames",
                            expected: example.declared_frames,
                            actual: frames,
                        });
                    }
                    Ok(Utterance {
                        id: example.id,
                        text: example.text,
                        sequence: example.sequence,
                        target: (mode == Mode::Gta).then_some(example.mel),
                    })
                })
                .collect()
        }
        (Mode::Eval, Inputs::Dataset(_)) => Err(Error::InvalidInput(
            "eval mode synthesizes custom text, pass sentences instead of a dataset".into(),
        )),
        (_, Inputs::Texts(_)) => Err(Error::InvalidInput(format!(
            "{mode} mode needs a preprocessed dataset with ground truth"
        ))),
    }
}

/// Synthesize everything in `utterances` into `output_dir`, batch by batch.
pub fn run(
    synth: &Synthesizer,
    mode: Mode,
    utterances: &[Utterance],
    output_dir: impl AsRef<Path>,
) -> Result<Vec<MapEntry>> {
    let output_dir = output_dir.as_ref();
    std::fs::create_dir_all(output_dir)?;
    let batch_size = synth.hparams().synthesis.batch_size.max(1);

    tracing::info!(
        %mode,
        utterances = utterances.len(),
        checkpoint_step = synth.checkpoint_step(),
        out = %output_dir.display(),
        "synthesizing"
    );

    let mut map = Vec::with_capacity(utterances.len());
    for chunk in utterances.chunks(batch_size) {
        for result in synth.synthesize(chunk, mode)? {
            let file = format!("mel-{}.safetensors", result.id);
            write_output(&output_dir.join(&file), &result)?;
            tracing::debug!(id = %result.id, frames = result.frames, stop = %result.stop_reason, "wrote");
            map.push(MapEntry {
                id: result.id,
                output_file: file,
                frames: result.frames,
                stop_reason: result.stop_reason,
                text: result.text,
            });
        }
    }

    let mut index = std::fs::File::create(output_dir.join(MAP_FILE))?;
    for entry in &map {
        writeln!(index, "{}", entry.to_line())?;
    }
    let truncated = map
        .iter()
        .filter(|e| e.stop_reason == StopReason::MaxSteps)
        .count();
    tracing::info!(written = map.len(), truncated, "synthesis finished");
    Ok(map)
}

fn write_output(path: &Path, result: &Synthesized) -> Result<()> {
    let mut tensors = std::collections::HashMap::new();
    tensors.insert("mel".to_string(), result.mel.to_device(&Device::Cpu)?);
    if let Some(linear) = &result.linear {
        tensors.insert("linear".to_string(), linear.to_device(&Device::Cpu)?);
    }
    if !result.alignment.is_empty() && !result.alignment[0].is_empty() {
        tensors.insert("alignment".to_string(), frames_to_tensor(&result.alignment)?);
    }
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::checkpoint::CheckpointManager;
    use crate::train::optim::{Adam, AdamConfig};
    use crate::train::tests::{tiny_train_hparams, write_tiny_dataset};

    /// Fresh model saved as a checkpoint; returns its path.
    fn saved_checkpoint(hp: &HParams, dir: &Path) -> PathBuf {
        let (_model, varmap) = Tacotron::with_varmap(hp, &Device::Cpu).unwrap();
        let opt = Adam::from_varmap(&varmap, AdamConfig::default()).unwrap();
        CheckpointManager::new(dir, 2).unwrap().save(1, 1, &varmap, &opt).unwrap()
    }

    fn mel_rows(s: &Synthesized) -> Vec<Vec<f32>> {
        s.mel.to_vec2().unwrap()
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("GTA".parse::<Mode>().unwrap(), Mode::Gta);
        assert_eq!("natural".parse::<Mode>().unwrap(), Mode::Natural);
        assert!("teacher".parse::<Mode>().is_err());
        assert_eq!(Mode::default(), Mode::Gta);
    }

    #[test]
    fn test_missing_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let hp = tiny_train_hparams();
        let result = Synthesizer::load(&hp, dir.path().join("ckpt-9.safetensors"), &Device::Cpu);
        assert!(matches!(result, Err(Error::Checkpoint(_))));
    }

    #[test]
    fn test_synthesis_is_deterministic_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let mut hp = tiny_train_hparams();
        hp.synthesis.max_decoder_steps = 8;
        let path = saved_checkpoint(&hp, dir.path());

        let a = Synthesizer::load(&hp, &path, &Device::Cpu).unwrap();
        let b = Synthesizer::load(&hp, &path, &Device::Cpu).unwrap();
        let utt = Utterance::from_text("x", "hello there", Cleaner::Basic).unwrap();

        let first = a.synthesize(std::slice::from_ref(&utt), Mode::Eval).unwrap();
        let again = a.synthesize(std::slice::from_ref(&utt), Mode::Eval).unwrap();
        let other = b.synthesize(std::slice::from_ref(&utt), Mode::Eval).unwrap();
        assert_eq!(mel_rows(&first[0]), mel_rows(&again[0]));
        assert_eq!(mel_rows(&first[0]), mel_rows(&other[0]));
        assert!(first[0].frames <= 8 * hp.model.outputs_per_step);
    }

    #[test]
    fn test_gta_keeps_target_length() {
        let dir = tempfile::tempdir().unwrap();
        let hp = tiny_train_hparams();
        write_tiny_dataset(dir.path(), &hp, 5);
        let path = saved_checkpoint(&hp, &dir.path().join("logs"));
        let synth = Synthesizer::load(&hp, &path, &Device::Cpu).unwrap();

        let inputs = Inputs::Dataset(dir.path().to_path_buf());
        let utterances = collect_utterances(&synth, Mode::Gta, &inputs).unwrap();
        assert_eq!(utterances.len(), 5);

        let out_dir = dir.path().join("gta");
        let map = run(&synth, Mode::Gta, &utterances, &out_dir).unwrap();
        for (entry, utt) in map.iter().zip(&utterances) {
            let target_frames = utt.target.as_ref().unwrap().dim(0).unwrap();
            assert_eq!(entry.frames, target_frames);
            assert_eq!(entry.stop_reason, StopReason::TargetLength);
        }

        let lines = std::fs::read_to_string(out_dir.join(MAP_FILE)).unwrap();
        assert_eq!(lines.lines().count(), 5);
        let first = &map[0];
        let saved = candle_core::safetensors::load(out_dir.join(&first.output_file), &Device::Cpu).unwrap();
        assert_eq!(saved["mel"].dims(), &[first.frames, hp.audio.num_mels]);
        assert!(saved.contains_key("alignment"));
    }

    #[test]
    fn test_eval_without_stop_is_truncated_at_bound() {
        let dir = tempfile::tempdir().unwrap();
        let mut hp = tiny_train_hparams();
        hp.synthesis.stop_threshold = 1.0;
        hp.synthesis.max_decoder_steps = 6;
        let path = saved_checkpoint(&hp, dir.path());
        let synth = Synthesizer::load(&hp, &path, &Device::Cpu).unwrap();

        let inputs = Inputs::Texts(vec!["abcd".into()]);
        let utterances = collect_utterances(&synth, Mode::Eval, &inputs).unwrap();
        assert_eq!(utterances[0].sequence.len(), 5);

        let out = synth.synthesize(&utterances, Mode::Eval).unwrap();
        assert_eq!(out[0].stop_reason, StopReason::MaxSteps);
        assert_eq!(out[0].frames, 6 * hp.model.outputs_per_step);
        assert_eq!(out[0].alignment.len(), 6);
    }

    #[test]
    fn test_mode_input_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let hp = tiny_train_hparams();
        let path = saved_checkpoint(&hp, dir.path());
        let synth = Synthesizer::load(&hp, &path, &Device::Cpu).unwrap();
        assert!(collect_utterances(&synth, Mode::Gta, &Inputs::Texts(vec!["hi".into()])).is_err());
        let utt = Utterance::from_text("x", "hi", Cleaner::Basic).unwrap();
        assert!(matches!(
            synth.synthesize(&[utt], Mode::Gta),
            Err(Error::InvalidInput(_))
        ));
    }
}
