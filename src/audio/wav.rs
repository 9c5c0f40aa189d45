//! WAV loading for preprocessing.

use std::path::Path;

use crate::{Error, Result};

/// Read a WAV file as mono f32 in [-1, 1], requiring `expected_rate`.
///
/// Multi-channel audio is averaged down to one channel.
pub fn read_wav_mono(path: impl AsRef<Path>, expected_rate: u32) -> Result<Vec<f32>> {
    let path = path.as_ref();
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.sample_rate != expected_rate {
        return Err(Error::Audio(format!(
            "{}: sample rate {} Hz, expected {} Hz",
            path.display(),
            spec.sample_rate,
            expected_rate
        )));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    let channels = spec.channels.max(1) as usize;
    if channels == 1 {
        return Ok(interleaved);
    }
    Ok(interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect())
}

/// Peak-normalize samples so the loudest one has magnitude `max`.
pub fn rescale(samples: &mut [f32], max: f32) {
    let max_abs = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    if max_abs > 1e-8 {
        let scale = max / max_abs;
        for s in samples.iter_mut() {
            *s *= scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_wav(path: &Path, samples: &[i16], rate: u32, channels: u16) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_rescale() {
        let mut samples = vec![0.5, -0.25, 0.1];
        rescale(&mut samples, 0.999);
        assert!((samples[0] - 0.999).abs() < 1e-6);
        assert!((samples[1] + 0.4995).abs() < 1e-6);
    }

    #[test]
    fn test_stereo_downmix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_test_wav(&path, &[16384, 0, -16384, -16384], 22050, 2);
        let mono = read_wav_mono(&path, 22050).unwrap();
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.25).abs() < 1e-4);
        assert!((mono[1] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_wrong_rate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fast.wav");
        write_test_wav(&path, &[0, 1, 2], 44100, 1);
        assert!(matches!(read_wav_mono(&path, 22050), Err(Error::Audio(_))));
    }
}
