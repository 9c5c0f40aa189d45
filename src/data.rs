//! Preprocessed feature cache, batching and epoch sampling.
//!
//! ## On-disk layout
//!
//! ```text
//! <dir>/train.txt              id|feature_file|mel_frames|text
//! <dir>/<feature_file>         safetensors: mel [T, n_mels], linear [T, num_freq]
//! ```
//!
//! Batches are padded to the longest example; target frames are further padded
//! to a multiple of `outputs_per_step`. Length disagreements are rejected here,
//! never truncated or padded to fit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::audio::Spectrograms;
use crate::config::HParams;
use crate::text::{self, Cleaner, PAD_ID};
use crate::{Error, Result};

/// Name of the dataset index inside a feature directory.
pub const INDEX_FILE: &str = "train.txt";

/// One line of `train.txt`.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: String,
    pub feature_file: String,
    /// Mel frame count recorded at preprocessing time.
    pub mel_frames: usize,
    pub text: String,
}

impl Entry {
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.splitn(4, '|').collect();
        let [id, feature_file, frames, text] = fields[..] else {
            return Err(Error::Dataset(format!(
                "expected id|feature_file|mel_frames|text, got {line:?}"
            )));
        };
        let mel_frames = frames
            .trim()
            .parse()
            .map_err(|_| Error::Dataset(format!("bad frame count {frames:?} for '{id}'")))?;
        Ok(Self {
            id: id.to_string(),
            feature_file: feature_file.to_string(),
            mel_frames,
            text: text.to_string(),
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.id, self.feature_file, self.mel_frames, self.text
        )
    }
}

/// A loaded training pair. Tensors live on the CPU until collated.
#[derive(Debug, Clone)]
pub struct Example {
    pub id: String,
    pub text: String,
    pub sequence: Vec<u32>,
    /// `[T, n_mels]`
    pub mel: Tensor,
    /// `[T, num_freq]`
    pub linear: Option<Tensor>,
    /// Frame count declared in the index.
    pub declared_frames: usize,
}

/// A padded batch ready for the model.
#[derive(Debug, Clone)]
pub struct Batch {
    pub ids: Vec<String>,
    /// `[B, T_in]` u32
    pub inputs: Tensor,
    pub input_lengths: Vec<usize>,
    /// `[B, T_out, n_mels]`, `T_out` a multiple of `r`
    pub mel_targets: Tensor,
    /// `[B, T_out, num_freq]`
    pub linear_targets: Option<Tensor>,
    /// `[B, T_out]`, 1 from the last true frame on
    pub stop_targets: Tensor,
    pub target_lengths: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Validate and pad `examples` into one batch on `device`.
    pub fn collate(examples: &[Example], hp: &HParams, device: &Device) -> Result<Self> {
        if examples.is_empty() {
            return Err(Error::Dataset("cannot collate an empty batch".into()));
        }
        let num_mels = hp.audio.num_mels;
        let num_freq = hp.audio.num_freq();
        let r = hp.model.outputs_per_step;
        let want_linear = hp.model.predict_linear;

        let mut target_lengths = Vec::with_capacity(examples.len());
        for ex in examples {
            text::check_sequence(&ex.sequence)
                .map_err(|e| Error::InvalidInput(format!("'{}': {e}", ex.id)))?;
            let (frames, channels) = ex.mel.dims2()?;
            if channels != num_mels {
                return Err(length_mismatch(ex, "mel channels", num_mels, channels));
            }
            if frames == 0 {
                return Err(Error::InvalidInput(format!("'{}': empty mel target", ex.id)));
            }
            if frames != ex.declared_frames {
                return Err(length_mismatch(ex, "mel frames", ex.declared_frames, frames));
            }
            if want_linear {
                let linear = ex.linear.as_ref().ok_or_else(|| {
                    Error::Dataset(format!("'{}': no linear target in feature file", ex.id))
                })?;
                let (lin_frames, bins) = linear.dims2()?;
                if lin_frames != frames {
                    return Err(length_mismatch(ex, "linear frames", frames, lin_frames));
                }
                if bins != num_freq {
                    return Err(length_mismatch(ex, "linear bins", num_freq, bins));
                }
            }
            target_lengths.push(frames);
        }

        let input_lengths: Vec<usize> = examples.iter().map(|ex| ex.sequence.len()).collect();
        let max_input = input_lengths.iter().copied().max().unwrap_or(0);
        let mut padded_ids = Vec::with_capacity(examples.len() * max_input);
        for ex in examples {
            padded_ids.extend_from_slice(&ex.sequence);
            padded_ids.extend(std::iter::repeat_n(PAD_ID, max_input - ex.sequence.len()));
        }
        let inputs = Tensor::from_vec(padded_ids, (examples.len(), max_input), device)?;

        let max_frames = target_lengths.iter().copied().max().unwrap_or(0);
        let padded_frames = max_frames.div_ceil(r) * r;
        let pad_value = hp.audio.target_pad_value();

        let mel_targets = pad_stack(
            examples.iter().map(|ex| &ex.mel),
            padded_frames,
            pad_value,
        )?
        .to_device(device)?;

        let linear_targets = if want_linear {
            let linears = examples.iter().filter_map(|ex| ex.linear.as_ref());
            Some(pad_stack(linears, padded_frames, pad_value)?.to_device(device)?)
        } else {
            None
        };

        let stop: Vec<f32> = target_lengths
            .iter()
            .flat_map(|&len| (0..padded_frames).map(move |t| if t + 1 >= len { 1.0 } else { 0.0 }))
            .collect();
        let stop_targets = Tensor::from_vec(stop, (examples.len(), padded_frames), device)?;

        Ok(Self {
            ids: examples.iter().map(|ex| ex.id.clone()).collect(),
            inputs,
            input_lengths,
            mel_targets,
            linear_targets,
            stop_targets,
            target_lengths,
        })
    }
}

fn length_mismatch(ex: &Example, what: &'static str, expected: usize, actual: usize) -> Error {
    Error::LengthMismatch {
        id: ex.id.clone(),
        what,
        expected,
        actual,
    }
}

/// Pad each `[T_i, C]` tensor to `[frames, C]` with `value`, then stack.
fn pad_stack<'a>(
    tensors: impl Iterator<Item = &'a Tensor>,
    frames: usize,
    value: f32,
) -> Result<Tensor> {
    let mut padded = Vec::new();
    for t in tensors {
        let (len, channels) = t.dims2()?;
        let t = t.to_dtype(DType::F32)?;
        padded.push(if len < frames {
            let pad = Tensor::full(value, (frames - len, channels), t.device())?;
            Tensor::cat(&[&t, &pad], 0)?
        } else {
            t
        });
    }
    Ok(Tensor::stack(&padded, 0)?)
}

/// Write one example's features as safetensors.
pub fn write_features(path: impl AsRef<Path>, spectrograms: &Spectrograms) -> Result<()> {
    let mut tensors = HashMap::new();
    tensors.insert("mel".to_string(), frames_to_tensor(&spectrograms.mel)?);
    tensors.insert("linear".to_string(), frames_to_tensor(&spectrograms.linear)?);
    candle_core::safetensors::save(&tensors, path.as_ref())?;
    Ok(())
}

/// Frame-major rows to a `[T, C]` CPU tensor.
pub fn frames_to_tensor(frames: &[Vec<f32>]) -> Result<Tensor> {
    let channels = frames.first().map_or(0, Vec::len);
    if frames.iter().any(|f| f.len() != channels) {
        return Err(Error::Audio("ragged spectrogram frames".into()));
    }
    let flat: Vec<f32> = frames.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (frames.len(), channels), &Device::Cpu)?)
}

/// Read-only view over a preprocessed feature directory.
#[derive(Debug, Clone)]
pub struct FeatureDataset {
    dir: PathBuf,
    cleaner: Cleaner,
    train: Vec<Entry>,
    test: Vec<Entry>,
}

impl FeatureDataset {
    /// Read `train.txt` and hold out `hp.train.test_size` examples, chosen by
    /// a shuffle seeded with `hp.train.seed`.
    pub fn open(dir: impl AsRef<Path>, hp: &HParams) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let index = dir.join(INDEX_FILE);
        let content = std::fs::read_to_string(&index)
            .map_err(|e| Error::Dataset(format!("{}: {e}", index.display())))?;
        let mut entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(Entry::parse)
            .collect::<Result<Vec<_>>>()?;

        let test_size = hp.train.test_size;
        if entries.len() <= test_size {
            return Err(Error::Dataset(format!(
                "{} examples in {}, need more than test_size ({test_size})",
                entries.len(),
                index.display()
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(hp.train.seed);
        entries.shuffle(&mut rng);
        let train = entries.split_off(test_size);
        let mut test = entries;
        test.sort_by(|a, b| a.id.cmp(&b.id));

        tracing::info!(
            train = train.len(),
            test = test.len(),
            dir = %dir.display(),
            "opened feature dataset"
        );

        Ok(Self {
            dir,
            cleaner: Cleaner::parse(&hp.model.cleaners)?,
            train,
            test,
        })
    }

    pub fn train_entries(&self) -> &[Entry] {
        &self.train
    }

    pub fn test_entries(&self) -> &[Entry] {
        &self.test
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Tokenize the text and load the features of one entry.
    pub fn load(&self, entry: &Entry) -> Result<Example> {
        let path = self.dir.join(&entry.feature_file);
        let mut tensors = candle_core::safetensors::load(&path, &Device::Cpu)
            .map_err(|e| Error::Dataset(format!("{}: {e}", path.display())))?;
        let mel = tensors
            .remove("mel")
            .ok_or_else(|| Error::Dataset(format!("{}: no 'mel' tensor", path.display())))?;
        Ok(Example {
            id: entry.id.clone(),
            sequence: text::text_to_sequence(&entry.text, self.cleaner)?,
            text: entry.text.clone(),
            mel,
            linear: tensors.remove("linear"),
            declared_frames: entry.mel_frames,
        })
    }

    pub fn load_batch(&self, entries: &[&Entry], hp: &HParams, device: &Device) -> Result<Batch> {
        let examples = entries
            .iter()
            .map(|e| self.load(e))
            .collect::<Result<Vec<_>>>()?;
        Batch::collate(&examples, hp, device)
    }
}

/// Seeded epoch order: shuffle, sort groups of batches by length, shuffle batches.
///
/// Sorting within a group keeps padding low without making every batch the
/// same length bucket.
#[derive(Debug, Clone)]
pub struct EpochSampler {
    rng: ChaCha8Rng,
    batch_size: usize,
    group_size: usize,
}

impl EpochSampler {
    pub fn new(seed: u64, batch_size: usize, group_size: usize) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            batch_size: batch_size.max(1),
            group_size: group_size.max(1),
        }
    }

    /// Batches of indices into `entries` for one epoch.
    pub fn epoch(&mut self, entries: &[Entry]) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.shuffle(&mut self.rng);

        let mut batches = Vec::new();
        for group in order.chunks_mut(self.batch_size * self.group_size) {
            group.sort_by_key(|&i| entries[i].mel_frames);
            batches.extend(group.chunks(self.batch_size).map(<[usize]>::to_vec));
        }
        batches.shuffle(&mut self.rng);
        batches
    }
}
