//! LJSpeech-style corpus to feature directory.
//!
//! Input: `<dir>/metadata.csv` with `id|text|normalized_text` lines and
//! `<dir>/wavs/<id>.wav`. Output: one `mel-<id>.safetensors` per utterance
//! plus the [`INDEX_FILE`] read by [`crate::data::FeatureDataset`].

use std::path::{Path, PathBuf};

use crate::audio::{FeatureExtractor, read_wav_mono, rescale};
use crate::config::AudioConfig;
use crate::data::{Entry, INDEX_FILE, write_features};
use crate::{Error, Result};

pub const METADATA_FILE: &str = "metadata.csv";

#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Peak-normalize each waveform to this magnitude before analysis.
    pub rescale: Option<f32>,
    /// Drop utterances longer than this many mel frames.
    pub max_mel_frames: Option<usize>,
}

impl PreprocessOptions {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            rescale: Some(0.999),
            max_mel_frames: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreprocessSummary {
    pub written: usize,
    pub skipped_long: usize,
    pub total_frames: usize,
}

/// One `metadata.csv` record. The normalized column wins when present.
#[derive(Debug, Clone, PartialEq)]
struct Record {
    id: String,
    text: String,
}

fn parse_metadata_line(line: &str, number: usize) -> Result<Record> {
    let fields: Vec<&str> = line.split('|').collect();
    let (id, text) = match fields[..] {
        [id, _, normalized] if !normalized.trim().is_empty() => (id, normalized),
        [id, text, ..] => (id, text),
        _ => {
            return Err(Error::Dataset(format!(
                "{METADATA_FILE}:{number}: expected id|text|normalized_text"
            )));
        }
    };
    let (id, text) = (id.trim(), text.trim());
    if id.is_empty() || text.is_empty() {
        return Err(Error::Dataset(format!(
            "{METADATA_FILE}:{number}: empty id or text"
        )));
    }
    Ok(Record {
        id: id.to_string(),
        text: text.to_string(),
    })
}

fn read_metadata(path: &Path) -> Result<Vec<Record>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Dataset(format!("cannot read {}: {e}", path.display()))
    })?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| parse_metadata_line(line, i + 1))
        .collect()
}

/// Extract features for every utterance in the corpus.
pub fn preprocess(opts: &PreprocessOptions, audio: &AudioConfig) -> Result<PreprocessSummary> {
    let records = read_metadata(&opts.input_dir.join(METADATA_FILE))?;
    std::fs::create_dir_all(&opts.output_dir)?;
    let extractor = FeatureExtractor::new(audio);

    tracing::info!(
        utterances = records.len(),
        input = %opts.input_dir.display(),
        output = %opts.output_dir.display(),
        "preprocessing corpus"
    );

    let mut summary = PreprocessSummary::default();
    let mut index = String::new();
    for (i, record) in records.iter().enumerate() {
        let wav_path = opts.input_dir.join("wavs").join(format!("{}.wav", record.id));
        let mut samples = read_wav_mono(&wav_path, audio.sample_rate)?;
        if samples.is_empty() {
            return Err(Error::Audio(format!("{}: no samples", wav_path.display())));
        }
        if let Some(max) = opts.rescale {
            rescale(&mut samples, max);
        }

        let spectrograms = extractor.compute(&samples);
        let frames = spectrograms.num_frames();
        if frames == 0 {
            return Err(Error::Audio(format!(
                "{}: shorter than one analysis frame",
                wav_path.display()
            )));
        }
        if opts.max_mel_frames.is_some_and(|max| frames > max) {
            tracing::debug!(id = %record.id, frames, "skipping long utterance");
            summary.skipped_long += 1;
            continue;
        }

        let feature_file = format!("mel-{}.safetensors", record.id);
        write_features(opts.output_dir.join(&feature_file), &spectrograms)?;
        let entry = Entry {
            id: record.id.clone(),
            feature_file,
            mel_frames: frames,
            text: record.text.clone(),
        };
        index.push_str(&entry.to_line());
        index.push('\n');

        summary.written += 1;
        summary.total_frames += frames;
        if (i + 1) % 500 == 0 {
            tracing::info!(done = i + 1, total = records.len(), "preprocessing");
        }
    }

    std::fs::write(opts.output_dir.join(INDEX_FILE), index)?;
    let hours = (summary.total_frames * audio.hop_length) as f64 / audio.sample_rate as f64 / 3600.0;
    tracing::info!(
        written = summary.written,
        skipped_long = summary.skipped_long,
        frames = summary.total_frames,
        hours = format!("{hours:.2}"),
        "preprocessing finished"
    );
    Ok(summary)
}
