//! Tacotron-2 feature prediction network in pure Rust.
//!
//! A candle-based implementation of the sequence-to-sequence model that
//! turns character or phoneme sequences into mel-spectrogram frames for a
//! separately trained vocoder.
//!
//! ## Architecture
//!
//! ```text
//! text → cleaners → symbol ids
//!                      ↓
//!        embedding → 3 × conv → BiLSTM          (encoder)
//!                      ↓
//!        location-sensitive attention ←──┐
//!                      ↓                 │
//!        prenet → LSTM stack → r frames ─┘      (decoder, one step at a time)
//!                      ↓
//!        postnet residual [→ linear head]
//! ```
//!
//! The decoder step is shared by teacher-forced training, GTA synthesis and
//! free-running inference; only the [`model::Feedback`] differs.
//!
//! ## Modules
//!
//! - [`text`] — cleaners, symbol table, number expansion
//! - [`audio`] — STFT, mel filterbank, normalization, WAV input
//! - [`preprocess`] — corpus to feature directory
//! - [`data`] — feature dataset, batching, epoch sampling
//! - [`model`] — encoder, attention, decoder, postnet
//! - [`train`] — losses, Adam, checkpoints, the training loop
//! - [`synthesis`] — eval / natural / GTA generation

pub mod audio;
pub mod config;
pub mod data;
pub mod model;
pub mod preprocess;
pub mod synthesis;
pub mod text;
pub mod train;

mod error;

pub use error::{Error, Result};
