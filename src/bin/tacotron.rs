//! Tacotron-2 feature prediction CLI.
//!
//! ```text
//! tacotron preprocess --input LJSpeech-1.1 --output training_data
//! tacotron train --data training_data --logs logs-tacotron --fresh
//! tacotron synthesize --logs logs-tacotron --data training_data            # GTA
//! tacotron synthesize --logs logs-tacotron --mode eval --text "Hello."
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tacotron_rs::{
    config::HParams,
    data::FeatureDataset,
    preprocess::{PreprocessOptions, preprocess},
    synthesis::{self, Inputs, Mode, Synthesizer},
    train::{Restore, TrainOptions, checkpoint::CheckpointManager, train},
};

const HPARAMS_FILE: &str = "hparams.json";

#[derive(Parser, Debug)]
#[command(
    name = "tacotron",
    about = "Tacotron-2 text to mel-spectrogram feature prediction",
    long_about = "Preprocess an LJSpeech-style corpus, train the feature prediction \
                  network, and synthesize mel-spectrograms in eval, natural or GTA mode."
)]
struct Args {
    /// JSON hyperparameter file. Missing fields take their defaults.
    #[arg(long, global = true)]
    hparams: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract mel/linear features from metadata.csv + wavs/.
    Preprocess {
        /// Corpus directory holding metadata.csv and wavs/.
        #[arg(long, short = 'i')]
        input: PathBuf,

        /// Feature directory to write.
        #[arg(long, short = 'o', default_value = "training_data")]
        output: PathBuf,

        /// Skip utterances longer than this many mel frames.
        #[arg(long)]
        max_mel_frames: Option<usize>,

        /// Keep the original waveform level instead of peak normalizing.
        #[arg(long)]
        no_rescale: bool,
    },

    /// Teacher-forced training with periodic checkpoints.
    Train {
        /// Preprocessed feature directory.
        #[arg(long, short = 'd', default_value = "training_data")]
        data: PathBuf,

        /// Checkpoint directory.
        #[arg(long, default_value = "logs-tacotron")]
        logs: PathBuf,

        /// Start from freshly initialized parameters.
        #[arg(long, conflicts_with = "checkpoint")]
        fresh: bool,

        /// Resume from this checkpoint instead of the newest one.
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Fall back to fresh parameters when no usable checkpoint exists.
        #[arg(long)]
        allow_fresh_init: bool,

        /// Override `train.max_steps`.
        #[arg(long)]
        max_steps: Option<usize>,
    },

    /// Generate mel-spectrograms from a checkpoint.
    Synthesize {
        /// eval (custom text), natural (held-out set, free running) or gta.
        #[arg(long, short = 'm', default_value = "gta")]
        mode: Mode,

        /// Checkpoint directory, searched for the newest snapshot.
        #[arg(long, default_value = "logs-tacotron")]
        logs: PathBuf,

        /// Specific checkpoint file.
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Preprocessed feature directory (natural and gta modes).
        #[arg(long, short = 'd', default_value = "training_data")]
        data: PathBuf,

        /// Sentence to synthesize in eval mode. Repeatable.
        #[arg(long, short = 't')]
        text: Vec<String>,

        /// File with one sentence per line (eval mode).
        #[arg(long)]
        text_file: Option<PathBuf>,

        /// Output directory. Defaults to `<mode>-output`.
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
}

fn load_hparams(explicit: Option<&Path>, fallback_dir: Option<&Path>) -> anyhow::Result<HParams> {
    if let Some(path) = explicit {
        return Ok(HParams::from_json_file(path)?);
    }
    if let Some(saved) = fallback_dir.map(|dir| dir.join(HPARAMS_FILE))
        && saved.is_file()
    {
        tracing::info!("Using hyperparameters from {}", saved.display());
        return Ok(HParams::from_json_file(saved)?);
    }
    Ok(HParams::default())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Preprocess {
            input,
            output,
            max_mel_frames,
            no_rescale,
        } => {
            let hp = load_hparams(args.hparams.as_deref(), None)?;
            let mut opts = PreprocessOptions::new(input, output);
            opts.max_mel_frames = max_mel_frames;
            if no_rescale {
                opts.rescale = None;
            }
            let summary = preprocess(&opts, &hp.audio)?;
            println!(
                "{}",
                serde_json::json!({
                    "written": summary.written,
                    "skipped_long": summary.skipped_long,
                    "frames": summary.total_frames,
                })
            );
        }

        Command::Train {
            data,
            logs,
            fresh,
            checkpoint,
            allow_fresh_init,
            max_steps,
        } => {
            let mut hp = load_hparams(args.hparams.as_deref(), None)?;
            if let Some(max_steps) = max_steps {
                hp.train.max_steps = max_steps;
            }
            let restore = match (fresh, checkpoint) {
                (true, _) => Restore::Fresh,
                (false, Some(path)) => Restore::Path(path),
                (false, None) => Restore::Latest,
            };

            let device = candle_core::Device::cuda_if_available(0)?;
            tracing::info!("Using device: {:?}", device);

            let dataset = FeatureDataset::open(&data, &hp)?;
            let options = TrainOptions {
                checkpoint_dir: logs,
                restore,
                allow_fresh_init,
            };
            let summary = train(&hp, &dataset, &options, &device)?;
            println!(
                "{}",
                serde_json::json!({
                    "final_step": summary.final_step,
                    "skipped_batches": summary.skipped_batches,
                    "loss": summary.last_losses.map(|l| l.total),
                    "checkpoint": summary.last_checkpoint.map(|p| p.display().to_string()),
                })
            );
        }

        Command::Synthesize {
            mode,
            logs,
            checkpoint,
            data,
            text,
            text_file,
            output,
        } => {
            let hp = load_hparams(args.hparams.as_deref(), Some(logs.as_path()))?;
            let checkpoint = match checkpoint {
                Some(path) => path,
                None => {
                    if !logs.is_dir() {
                        anyhow::bail!("checkpoint directory {} does not exist", logs.display());
                    }
                    CheckpointManager::new(&logs, hp.train.keep_checkpoints)?
                        .latest()?
                        .ok_or_else(|| anyhow::anyhow!("no checkpoint found in {}", logs.display()))?
                }
            };

            let inputs = match mode {
                Mode::Eval => {
                    let mut sentences = text;
                    if let Some(path) = text_file {
                        let content = std::fs::read_to_string(&path)?;
                        sentences.extend(
                            content
                                .lines()
                                .map(str::trim)
                                .filter(|line| !line.is_empty())
                                .map(String::from),
                        );
                    }
                    if sentences.is_empty() {
                        anyhow::bail!("eval mode needs --text or --text-file");
                    }
                    Inputs::Texts(sentences)
                }
                Mode::Natural | Mode::Gta => Inputs::Dataset(data),
            };

            let device = candle_core::Device::cuda_if_available(0)?;
            tracing::info!("Using device: {:?}", device);

            let synth = Synthesizer::load(&hp, &checkpoint, &device)?;
            let utterances = synthesis::collect_utterances(&synth, mode, &inputs)?;
            let output = output.unwrap_or_else(|| PathBuf::from(format!("{mode}-output")));
            let map = synthesis::run(&synth, mode, &utterances, &output)?;
            println!(
                "{}",
                serde_json::json!({
                    "mode": mode.as_str(),
                    "checkpoint_step": synth.checkpoint_step(),
                    "utterances": map.len(),
                    "output": output.display().to_string(),
                })
            );
        }
    }

    Ok(())
}
