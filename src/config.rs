//! Hyperparameters for the feature prediction network.
//!
//! Defaults follow the Tacotron-2 (LJSpeech, 22.05 kHz) setup. Every section
//! is `#[serde(default)]`, so a JSON file only needs the fields it changes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level hyperparameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HParams {
    pub audio: AudioConfig,
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub synthesis: SynthesisConfig,
}

impl HParams {
    /// Load hyperparameters from a JSON file and validate them.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let hparams: HParams = serde_json::from_str(&text)?;
        hparams.validate()?;
        Ok(hparams)
    }

    /// Write hyperparameters as pretty JSON (saved next to checkpoints).
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject combinations the model or training loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        let a = &self.audio;
        let m = &self.model;
        let t = &self.train;
        let s = &self.synthesis;

        if a.hop_length == 0 || a.win_length == 0 || a.win_length > a.n_fft {
            return Err(Error::Config(format!(
                "need 0 < hop_length and 0 < win_length <= n_fft (hop {}, win {}, n_fft {})",
                a.hop_length, a.win_length, a.n_fft
            )));
        }
        if a.num_mels == 0 || a.fmax <= a.fmin || a.fmax > a.sample_rate as f64 / 2.0 {
            return Err(Error::Config(format!(
                "bad mel range: {} mels, {}..{} Hz at {} Hz",
                a.num_mels, a.fmin, a.fmax, a.sample_rate
            )));
        }
        if m.outputs_per_step == 0 {
            return Err(Error::Config("outputs_per_step must be >= 1".into()));
        }
        for (name, k) in [
            ("enc_conv_kernel_size", m.enc_conv_kernel_size),
            ("attention_kernel", m.attention_kernel),
            ("postnet_kernel_size", m.postnet_kernel_size),
        ] {
            if k % 2 == 0 {
                return Err(Error::Config(format!("{name} must be odd, got {k}")));
            }
        }
        if m.prenet_layers.is_empty() || m.decoder_layers == 0 || m.postnet_num_layers < 2 {
            return Err(Error::Config(
                "need at least one prenet layer, one decoder layer and two postnet layers".into(),
            ));
        }
        for (name, p) in [
            ("prenet_dropout", m.prenet_dropout),
            ("dropout_rate", m.dropout_rate),
            ("zoneout_rate", m.zoneout_rate),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Config(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        if t.batch_size == 0 || t.checkpoint_interval == 0 || t.keep_checkpoints == 0 {
            return Err(Error::Config(
                "batch_size, checkpoint_interval and keep_checkpoints must be >= 1".into(),
            ));
        }
        if t.decay_steps == 0 || !(0.0..=1.0).contains(&t.decay_rate) {
            return Err(Error::Config(format!(
                "bad lr decay: steps {}, rate {}",
                t.decay_steps, t.decay_rate
            )));
        }
        if s.max_decoder_steps == 0 || s.batch_size == 0 {
            return Err(Error::Config(
                "max_decoder_steps and synthesis batch_size must be >= 1".into(),
            ));
        }
        if !(s.stop_threshold > 0.0 && s.stop_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "stop_threshold must be in (0, 1], got {}",
                s.stop_threshold
            )));
        }
        Ok(())
    }
}

/// Audio feature parameters shared by preprocessing and the model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub num_mels: usize,
    pub fmin: f64,
    pub fmax: f64,
    pub preemphasis: f64,
    pub min_level_db: f64,
    pub ref_level_db: f64,
    /// Normalized features live in `[-max_abs_value, max_abs_value]`.
    pub max_abs_value: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            n_fft: 2048,
            hop_length: 275,
            win_length: 1100,
            num_mels: 80,
            fmin: 55.0,
            fmax: 7600.0,
            preemphasis: 0.97,
            min_level_db: -100.0,
            ref_level_db: 20.0,
            max_abs_value: 4.0,
        }
    }
}

impl AudioConfig {
    /// Number of linear-spectrogram bins (`n_fft / 2 + 1`).
    pub fn num_freq(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Value used to pad target spectrograms past their true length.
    pub fn target_pad_value(&self) -> f32 {
        -(self.max_abs_value as f32) - 0.1
    }
}

/// Feature prediction network architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Text cleaner pipeline name (`basic`, `transliteration`, `english`).
    pub cleaners: String,

    // --- Encoder ---
    pub embedding_dim: usize,
    pub enc_conv_num_layers: usize,
    pub enc_conv_channels: usize,
    pub enc_conv_kernel_size: usize,
    /// Units per direction of the bidirectional encoder LSTM.
    pub encoder_lstm_units: usize,

    // --- Attention ---
    pub attention_dim: usize,
    pub attention_filters: usize,
    pub attention_kernel: usize,
    /// Replace softmax with `sigmoid(e) / sum(sigmoid(e))`.
    pub smoothing: bool,
    /// Feed the cumulative alignment as a second location-feature channel.
    pub cumulative_weights: bool,

    // --- Decoder ---
    pub prenet_layers: Vec<usize>,
    pub prenet_dropout: f32,
    pub attention_rnn_units: usize,
    pub decoder_layers: usize,
    pub decoder_lstm_units: usize,
    pub zoneout_rate: f32,
    /// Frames emitted per decoder step (`r`).
    pub outputs_per_step: usize,

    // --- Postnet ---
    pub postnet_num_layers: usize,
    pub postnet_channels: usize,
    pub postnet_kernel_size: usize,

    /// Dropout for encoder convolutions and postnet (training only).
    pub dropout_rate: f32,

    /// Add a linear-spectrogram head after the postnet.
    pub predict_linear: bool,
    pub linear_head_channels: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            cleaners: "english".to_string(),
            embedding_dim: 512,
            enc_conv_num_layers: 3,
            enc_conv_channels: 512,
            enc_conv_kernel_size: 5,
            encoder_lstm_units: 256,
            attention_dim: 128,
            attention_filters: 32,
            attention_kernel: 31,
            smoothing: false,
            cumulative_weights: false,
            prenet_layers: vec![256, 256],
            prenet_dropout: 0.5,
            attention_rnn_units: 1024,
            decoder_layers: 2,
            decoder_lstm_units: 1024,
            zoneout_rate: 0.1,
            outputs_per_step: 1,
            postnet_num_layers: 5,
            postnet_channels: 512,
            postnet_kernel_size: 5,
            dropout_rate: 0.5,
            predict_linear: false,
            linear_head_channels: 256,
        }
    }
}

impl ModelConfig {
    /// Width of one encoder output vector (both LSTM directions).
    pub fn encoder_output_dim(&self) -> usize {
        2 * self.encoder_lstm_units
    }
}

/// Mel reconstruction loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MelLoss {
    L1,
    L2,
}

/// What the training loop does when a step produces NaN/Inf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonFinitePolicy {
    /// Drop the batch without updating parameters.
    Skip,
    /// Stop training with an error.
    Abort,
}

/// Training loop parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub seed: u64,
    pub max_steps: usize,

    // --- Adam ---
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,

    // --- Learning rate ---
    pub initial_learning_rate: f64,
    pub start_decay: usize,
    pub decay_steps: usize,
    pub decay_rate: f64,
    pub final_learning_rate: f64,

    /// Global gradient norm clip; `None` disables clipping.
    pub clip_gradient_norm: Option<f64>,

    // --- Losses ---
    pub mel_loss: MelLoss,
    pub stop_loss_weight: f64,
    pub linear_loss_weight: f64,

    // --- Bookkeeping ---
    pub checkpoint_interval: usize,
    pub keep_checkpoints: usize,
    pub log_interval: usize,
    pub eval_interval: usize,
    /// Number of examples held out for evaluation and natural/GTA synthesis.
    pub test_size: usize,
    /// Number of batches sorted together by length within an epoch.
    pub batch_group_size: usize,

    pub non_finite_policy: NonFinitePolicy,
    /// Abort anyway after this many consecutive skipped batches.
    pub max_consecutive_skips: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            seed: 5339,
            max_steps: 100_000,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-6,
            initial_learning_rate: 1e-3,
            start_decay: 50_000,
            decay_steps: 50_000,
            decay_rate: 0.5,
            final_learning_rate: 1e-5,
            clip_gradient_norm: Some(1.0),
            mel_loss: MelLoss::L2,
            stop_loss_weight: 1.0,
            linear_loss_weight: 1.0,
            checkpoint_interval: 100,
            keep_checkpoints: 5,
            log_interval: 10,
            eval_interval: 1000,
            test_size: 48,
            batch_group_size: 32,
            non_finite_policy: NonFinitePolicy::Skip,
            max_consecutive_skips: 10,
        }
    }
}

/// Inference parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Generation stops once the stop probability strictly exceeds this.
    pub stop_threshold: f32,
    /// Hard bound on free-running decoder steps.
    pub max_decoder_steps: usize,
    pub batch_size: usize,
    /// Seed for the always-on prenet dropout.
    pub seed: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            stop_threshold: 0.5,
            max_decoder_steps: 1000,
            batch_size: 1,
            seed: 1234,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hparams_valid() {
        let hp = HParams::default();
        hp.validate().unwrap();
        assert_eq!(hp.audio.num_freq(), 1025);
        assert_eq!(hp.model.encoder_output_dim(), 512);
        assert_eq!(hp.train.checkpoint_interval, 100);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let hp: HParams =
            serde_json::from_str(r#"{"model": {"outputs_per_step": 3}, "train": {"mel_loss": "l1"}}"#)
                .unwrap();
        assert_eq!(hp.model.outputs_per_step, 3);
        assert_eq!(hp.model.embedding_dim, 512);
        assert_eq!(hp.train.mel_loss, MelLoss::L1);
        assert_eq!(hp.audio.num_mels, 80);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut hp = HParams::default();
        hp.model.outputs_per_step = 0;
        assert!(hp.validate().is_err());

        let mut hp = HParams::default();
        hp.model.attention_kernel = 30;
        assert!(hp.validate().is_err());

        let mut hp = HParams::default();
        hp.synthesis.stop_threshold = 0.0;
        assert!(hp.validate().is_err());

        let mut hp = HParams::default();
        hp.train.keep_checkpoints = 0;
        assert!(hp.validate().is_err());
    }

    #[test]
    fn test_json_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hparams.json");
        let mut hp = HParams::default();
        hp.model.cumulative_weights = true;
        hp.to_json_file(&path).unwrap();
        let loaded = HParams::from_json_file(&path).unwrap();
        assert_eq!(loaded, hp);
    }
}
