//! Log-mel spectrogram extraction using MLX's rfft
//!
//! All spectrograms fed to the acoustic model and the style embedding are
//! computed at 16 kHz with the settings of [`MelConfig::default`]. Audio at
//! any other rate is resampled first.

use std::f32::consts::PI;

use mlx_rs::{
    array,
    error::Exception,
    fft::rfft,
    ops::{abs, log10, matmul, maximum},
    Array, Dtype,
};

use super::wav::resample;
use crate::error::{Error, Result};

/// Configuration for mel spectrogram computation
#[derive(Debug, Clone, PartialEq)]
pub struct MelConfig {
    /// FFT size (default: 1024)
    pub n_fft: i32,
    /// Hop length in samples (default: 256)
    pub hop_length: i32,
    /// Window length (default: 1024)
    pub win_length: i32,
    /// Sample rate the spectrogram is computed at (default: 16000)
    pub sample_rate: u32,
    /// Number of mel bins (default: 128)
    pub n_mels: i32,
    /// Minimum frequency of the filterbank (default: 40.0)
    pub fmin: f32,
    /// Maximum frequency of the filterbank (default: 8000.0)
    pub fmax: f32,
    /// Floor applied before the logarithm
    pub log_floor: f32,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            n_fft: 1024,
            hop_length: 256,
            win_length: 1024,
            sample_rate: 16000,
            n_mels: 128,
            fmin: 40.0,
            fmax: 8000.0,
            log_floor: 1e-10,
        }
    }
}

/// Hann window
fn hann_window(size: i32) -> Vec<f32> {
    (0..size as usize)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / (size as f32 - 1.0)).cos()))
        .collect()
}

fn hz_to_mel(freq: f32) -> f32 {
    2595.0 * (1.0 + freq / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filterbank, shape [n_fft/2 + 1, n_mels]
pub fn mel_filterbank(config: &MelConfig) -> Array {
    let n_freqs = (config.n_fft / 2 + 1) as usize;
    let n_mels = config.n_mels as usize;

    let mel_min = hz_to_mel(config.fmin);
    let mel_max = hz_to_mel(config.fmax);
    let hz_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let bin_hz = config.sample_rate as f32 / config.n_fft as f32;
    let mut filterbank = vec![0.0f32; n_freqs * n_mels];

    for m in 0..n_mels {
        let (lower, center, upper) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
        for k in 0..n_freqs {
            let freq = k as f32 * bin_hz;
            let weight = if freq >= lower && freq <= center && center > lower {
                (freq - lower) / (center - lower)
            } else if freq > center && freq <= upper && upper > center {
                (upper - freq) / (upper - center)
            } else {
                0.0
            };
            // Transposed layout so frames @ filterbank gives [frames, n_mels]
            filterbank[k * n_mels + m] = weight;
        }
    }

    Array::from_slice(&filterbank, &[n_freqs as i32, config.n_mels])
}

/// Centered STFT magnitude
///
/// Input: samples (1D)
/// Output: magnitude [frames, n_fft/2+1]
pub fn stft_magnitude(
    samples: &[f32],
    n_fft: i32,
    hop_length: i32,
    win_length: i32,
) -> std::result::Result<Array, Exception> {
    // Center padding (like librosa center=True)
    let pad = (n_fft / 2) as usize;
    let mut padded = vec![0.0f32; samples.len() + 2 * pad];
    padded[pad..pad + samples.len()].copy_from_slice(samples);

    let n_fft_u = n_fft as usize;
    let hop = hop_length as usize;
    let n_frames = (padded.len() - n_fft_u) / hop + 1;

    // Window centered inside the FFT frame when shorter than n_fft
    let window = hann_window(win_length);
    let win_offset = (n_fft_u - win_length as usize) / 2;

    let mut frames = vec![0.0f32; n_frames * n_fft_u];
    for frame_idx in 0..n_frames {
        let start = frame_idx * hop;
        let frame = &mut frames[frame_idx * n_fft_u..(frame_idx + 1) * n_fft_u];
        for (i, w) in window.iter().enumerate() {
            frame[win_offset + i] = padded[start + win_offset + i] * w;
        }
    }

    let frames = Array::from_slice(&frames, &[n_frames as i32, n_fft]);
    let spectrum = rfft(&frames, n_fft, -1)?;
    abs(&spectrum)
}

/// Log-mel spectrogram extractor
#[derive(Debug, Clone)]
pub struct MelSpectrogram {
    config: MelConfig,
    filterbank: Array,
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Result<Self> {
        if config.win_length > config.n_fft || config.hop_length <= 0 || config.n_mels <= 0 {
            return Err(Error::audio(format!("invalid mel configuration: {:?}", config)));
        }
        let filterbank = mel_filterbank(&config);
        Ok(Self { config, filterbank })
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Number of mel channels of the output
    pub fn n_mels(&self) -> i32 {
        self.config.n_mels
    }

    /// Log-mel spectrogram of a 1D waveform given at `explicit_sampling_rate`.
    ///
    /// Returns [frames, n_mels]
    pub fn audio_to_mel(&self, wave: &Array, explicit_sampling_rate: u32) -> Result<Array> {
        let wave = wave.as_dtype(Dtype::Float32)?.flatten(None, None)?;
        self.samples_to_mel(wave.as_slice::<f32>(), explicit_sampling_rate)
    }

    /// Same as [`Self::audio_to_mel`] for samples already on the host
    pub fn samples_to_mel(&self, samples: &[f32], sampling_rate: u32) -> Result<Array> {
        if samples.is_empty() {
            return Err(Error::audio("cannot compute a spectrogram of empty audio"));
        }
        let resampled;
        let samples = if sampling_rate != self.config.sample_rate {
            resampled = resample(samples, sampling_rate, self.config.sample_rate);
            resampled.as_slice()
        } else {
            samples
        };

        let magnitude = stft_magnitude(
            samples,
            self.config.n_fft,
            self.config.hop_length,
            self.config.win_length,
        )?;
        let mel = matmul(&magnitude, &self.filterbank)?;
        let mel = maximum(&mel, array!(self.config.log_floor))?;
        Ok(log10(&mel)?)
    }
}
