//! Audio feature extraction.
//!
//! Turns speech recordings into the normalized mel / linear spectrograms the
//! feature prediction network is trained on, and maps model output back to
//! dB scale for downstream consumers.
//!
//! - [`wav`] — WAV loading (mono, fixed sample rate) and rescaling
//! - [`mel`] — STFT, Slaney mel filterbank, dB conversion and normalization

pub mod mel;
pub mod wav;

pub use mel::{FeatureExtractor, Spectrograms};
pub use wav::{read_wav_mono, rescale};
