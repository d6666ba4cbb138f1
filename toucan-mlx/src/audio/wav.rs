//! WAV I/O and resampling

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::warn;

use crate::error::Result;

/// Load a WAV file as mono f32 samples in [-1, 1].
///
/// Integer and float formats are supported; multi-channel files are mixed
/// down by averaging the channels.
///
/// Returns (samples, sample_rate)
pub fn load_wav(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32)> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
    };

    let samples = if channels > 1 {
        samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        samples
    };

    Ok((samples, spec.sample_rate))
}

/// Save mono samples as a 16-bit WAV file; values are clamped to [-1, 1].
pub fn save_wav(samples: &[f32], sample_rate: u32, path: impl AsRef<Path>) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Resample audio using windowed sinc interpolation.
///
/// Falls back to linear interpolation if the sinc resampler cannot be built
/// or fails on the input.
pub fn resample(samples: &[f32], src_rate: u32, target_rate: u32) -> Vec<f32> {
    if src_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = target_rate as f64 / src_rate as f64;

    let mut resampler = match SincFixedIn::<f32>::new(ratio, 2.0, params, samples.len(), 1) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Failed to create sinc resampler, falling back to linear");
            return resample_linear(samples, src_rate, target_rate);
        }
    };

    // Whole input as one chunk
    let input = vec![samples.to_vec()];
    match resampler.process(&input, None) {
        Ok(mut output) if !output.is_empty() => output.swap_remove(0),
        Ok(_) => resample_linear(samples, src_rate, target_rate),
        Err(e) => {
            warn!(error = %e, "Sinc resampling failed, falling back to linear");
            resample_linear(samples, src_rate, target_rate)
        }
    }
}

/// Linear interpolation resampler
pub fn resample_linear(samples: &[f32], src_rate: u32, target_rate: u32) -> Vec<f32> {
    if src_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / target_rate as f64;
    let out_len = (samples.len() as f64 / ratio).ceil() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let src_idx = i as f64 * ratio;
            let lo = (src_idx.floor() as usize).min(last);
            let hi = (lo + 1).min(last);
            let frac = (src_idx - lo as f64) as f32;
            samples[lo] * (1.0 - frac) + samples[hi] * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_resample_length() {
        let samples = vec![0.5f32; 24000];
        let out = resample_linear(&samples, 24000, 16000);
        assert_eq!(out.len(), 16000);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples = vec![0.1, -0.2, 0.3];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_sinc_resample_length() {
        let samples: Vec<f32> = (0..24000).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        let out = resample(&samples, 24000, 16000);
        assert!((out.len() as i64 - 16000).abs() < 200, "got {} samples", out.len());
    }

    #[test]
    fn test_wav_roundtrip_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..1600).map(|i| (i as f32 * 0.05).sin() * 0.8).collect();

        save_wav(&samples, 16000, &path).unwrap();
        let (loaded, sr) = load_wav(&path).unwrap();

        assert_eq!(sr, 16000);
        assert_eq!(loaded.len(), samples.len());
        for (a, b) in loaded.iter().zip(samples.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_stereo_is_mixed_to_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample(16384i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let (loaded, sr) = load_wav(&path).unwrap();
        assert_eq!(sr, 8000);
        assert_eq!(loaded.len(), 100);
        assert!(loaded.iter().all(|&s| (s - 0.25).abs() < 1e-4));
    }
}
