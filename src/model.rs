//! Feature prediction network.
//!
//! ## Components
//!
//! - [`encoder`] — symbol embedding, conv stack, bidirectional LSTM
//! - [`attention`] — location-sensitive attention and alignment history
//! - [`decoder`] — prenet, recurrent stack, the feedback-parameterized step
//! - [`postnet`] — residual conv refinement and the optional linear head
//! - [`tacotron`] — everything wired together
//! - [`layers`], [`mask`] — shared building blocks

pub mod attention;
pub mod decoder;
pub mod encoder;
pub mod layers;
pub mod mask;
pub mod postnet;
pub mod tacotron;

pub use attention::Alignments;
pub use decoder::{Feedback, StopReason};
pub use layers::Noise;
pub use tacotron::{Tacotron, TacotronOutput};

#[cfg(test)]
pub(crate) fn tiny_hparams(r: usize, predict_linear: bool) -> crate::config::HParams {
    use crate::config::{AudioConfig, HParams, ModelConfig};

    HParams {
        audio: AudioConfig {
            num_mels: 6,
            n_fft: 16,
            win_length: 16,
            hop_length: 4,
            ..AudioConfig::default()
        },
        model: ModelConfig {
            embedding_dim: 8,
            enc_conv_num_layers: 1,
            enc_conv_channels: 8,
            enc_conv_kernel_size: 3,
            encoder_lstm_units: 4,
            attention_dim: 6,
            attention_filters: 3,
            attention_kernel: 3,
            prenet_layers: vec![8],
            attention_rnn_units: 8,
            decoder_layers: 1,
            decoder_lstm_units: 8,
            outputs_per_step: r,
            postnet_num_layers: 2,
            postnet_channels: 6,
            postnet_kernel_size: 3,
            predict_linear,
            linear_head_channels: 4,
            ..ModelConfig::default()
        },
        ..HParams::default()
    }
}
