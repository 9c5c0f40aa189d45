//! Spectrogram features via STFT + mel filterbank.
//!
//! Pipeline per utterance:
//! - pre-emphasis `y[n] = x[n] - k * x[n-1]`
//! - reflect padding of `n_fft / 2` on both sides (centered frames)
//! - Hann window of `win_length`, zero-padded to `n_fft`
//! - magnitude STFT → linear spectrogram; Slaney mel filterbank → mel spectrogram
//! - `20 * log10(max(1e-5, x)) - ref_level_db`
//! - symmetric normalization to `[-max_abs_value, max_abs_value]`
//!
//! Output is frame-major: one `Vec` per frame.

use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

use crate::config::AudioConfig;

/// Normalized features for one utterance, frame-major.
#[derive(Debug, Clone)]
pub struct Spectrograms {
    /// `[frames][num_mels]`
    pub mel: Vec<Vec<f32>>,
    /// `[frames][n_fft / 2 + 1]`
    pub linear: Vec<Vec<f32>>,
}

impl Spectrograms {
    pub fn num_frames(&self) -> usize {
        self.mel.len()
    }
}

/// Spectrogram processor.
///
/// Pre-computes the window, FFT plan and mel filterbank on construction.
pub struct FeatureExtractor {
    config: AudioConfig,
    window: Vec<f64>,
    filterbank: Vec<Vec<f64>>,
    fft: std::sync::Arc<dyn rustfft::Fft<f64>>,
}

impl FeatureExtractor {
    pub fn new(config: &AudioConfig) -> Self {
        let window = padded_hann_window(config.win_length, config.n_fft);
        let filterbank = mel_filterbank(
            config.n_fft,
            config.num_mels,
            config.sample_rate,
            config.fmin,
            config.fmax,
        );
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.n_fft);

        Self {
            config: config.clone(),
            window,
            filterbank,
            fft,
        }
    }

    /// Compute normalized mel and linear spectrograms from mono samples.
    pub fn compute(&self, samples: &[f32]) -> Spectrograms {
        let emphasized = preemphasis(samples, self.config.preemphasis);
        let pad = self.config.n_fft / 2;
        let padded = reflect_pad(&emphasized, pad, pad);
        let magnitudes = self.stft(&padded);

        let mut mel = Vec::with_capacity(magnitudes.len());
        let mut linear = Vec::with_capacity(magnitudes.len());
        for frame in &magnitudes {
            linear.push(frame.iter().map(|&m| self.to_normalized_db(m)).collect());
            mel.push(
                self.filterbank
                    .iter()
                    .map(|filter| {
                        let energy: f64 = filter
                            .iter()
                            .zip(frame)
                            .filter(|(w, _)| **w > 0.0)
                            .map(|(w, m)| w * m)
                            .sum();
                        self.to_normalized_db(energy)
                    })
                    .collect(),
            );
        }

        Spectrograms { mel, linear }
    }

    fn to_normalized_db(&self, amplitude: f64) -> f32 {
        let db = 20.0 * amplitude.max(1e-5).log10() - self.config.ref_level_db;
        normalize(db, &self.config) as f32
    }

    /// Short-time Fourier transform. Returns magnitude spectra per frame.
    ///
    /// Each inner vec has `n_fft/2 + 1` elements (one-sided).
    fn stft(&self, padded: &[f64]) -> Vec<Vec<f64>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_bins = n_fft / 2 + 1;

        if padded.len() < n_fft {
            return Vec::new();
        }
        let num_frames = (padded.len() - n_fft) / hop + 1;
        let mut frames = Vec::with_capacity(num_frames);

        for frame_idx in 0..num_frames {
            let start = frame_idx * hop;
            let mut buffer: Vec<Complex<f64>> = (0..n_fft)
                .map(|i| Complex::new(padded[start + i] * self.window[i], 0.0))
                .collect();

            self.fft.process(&mut buffer);

            frames.push(buffer[..num_bins].iter().map(|c| c.norm()).collect());
        }

        frames
    }
}

/// Map dB values into the symmetric normalized range, clipped.
pub fn normalize(db: f64, config: &AudioConfig) -> f64 {
    let max_abs = config.max_abs_value;
    let scaled = 2.0 * max_abs * ((db - config.min_level_db) / -config.min_level_db) - max_abs;
    scaled.clamp(-max_abs, max_abs)
}

/// Inverse of [`normalize`] (for feeding a vocoder that expects dB input).
pub fn denormalize(value: f64, config: &AudioConfig) -> f64 {
    let max_abs = config.max_abs_value;
    let clipped = value.clamp(-max_abs, max_abs);
    (clipped + max_abs) * -config.min_level_db / (2.0 * max_abs) + config.min_level_db
}

fn preemphasis(samples: &[f32], k: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(samples.len());
    let mut prev = 0.0f64;
    for &s in samples {
        let s = s as f64;
        out.push(s - k * prev);
        prev = s;
    }
    out
}

/// Periodic Hann window of `win_length`, centered in `n_fft` zeros.
fn padded_hann_window(win_length: usize, n_fft: usize) -> Vec<f64> {
    let offset = (n_fft - win_length) / 2;
    let mut window = vec![0.0; n_fft];
    for i in 0..win_length {
        let phase = 2.0 * std::f64::consts::PI * i as f64 / win_length as f64;
        window[offset + i] = 0.5 * (1.0 - phase.cos());
    }
    window
}

/// Reflect-pad a signal on both sides.
fn reflect_pad(signal: &[f64], pad_left: usize, pad_right: usize) -> Vec<f64> {
    let len = signal.len();
    if len < 2 {
        let fill = signal.first().copied().unwrap_or(0.0);
        return vec![fill; pad_left + len + pad_right];
    }
    let mut padded = Vec::with_capacity(pad_left + len + pad_right);

    // Left reflection: signal[pad_left], ..., signal[1]
    for i in (1..=pad_left).rev() {
        padded.push(signal[i.min(len - 1)]);
    }

    padded.extend_from_slice(signal);

    // Right reflection: signal[len-2], signal[len-3], ...
    for i in 0..pad_right {
        let idx = len.saturating_sub(2 + i);
        padded.push(signal[idx]);
    }

    padded
}

/// Build a Slaney-normalized mel filterbank.
///
/// Returns `n_mels` filters, each with `n_fft/2 + 1` weights.
fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;

    let mel_min = hz_to_mel_slaney(f_min);
    let mel_max = hz_to_mel_slaney(f_max);

    let hz_points: Vec<f64> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz_slaney(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let bin_freqs: Vec<f64> = (0..num_bins)
        .map(|i| sr * i as f64 / n_fft as f64)
        .collect();

    (0..n_mels)
        .map(|i| {
            let (f_left, f_center, f_right) = (hz_points[i], hz_points[i + 1], hz_points[i + 2]);
            let norm = 2.0 / (f_right - f_left);
            bin_freqs
                .iter()
                .map(|&f| {
                    if f < f_left || f > f_right {
                        0.0
                    } else if f <= f_center {
                        norm * (f - f_left) / (f_center - f_left)
                    } else {
                        norm * (f_right - f) / (f_right - f_center)
                    }
                })
                .collect()
        })
        .collect()
}

/// Hz to Slaney mel: linear below 1 kHz, logarithmic above.
fn hz_to_mel_slaney(hz: f64) -> f64 {
    if hz < 1000.0 {
        3.0 * hz / 200.0
    } else {
        15.0 + 27.0 * (hz / 1000.0).ln() / (6.4_f64).ln()
    }
}

fn mel_to_hz_slaney(mel: f64) -> f64 {
    if mel < 15.0 {
        200.0 * mel / 3.0
    } else {
        1000.0 * ((mel - 15.0) * (6.4_f64).ln() / 27.0).exp()
    }
}
