//! Vocoder training data: high-rate wave segments paired with 16 kHz spectrograms
//!
//! The vocoder learns to produce 24 kHz audio from the 16 kHz spectrogram the
//! acoustic model predicts, so each item pairs a random wave crop with the
//! spectrogram of its resampled copy.

use std::path::PathBuf;

use mlx_rs::Array;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audio::{load_wav, resample, MelSpectrogram};
use crate::error::{Error, Result};

/// Silence inserted when a short wave is tiled up to segment length
const SILENCE_GAP: usize = 1000;
/// Extra samples required beyond one segment
const SEGMENT_MARGIN: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VocoderDatasetConfig {
    /// Rate of the target waves
    pub sample_rate: u32,
    pub samples_per_segment: usize,
    /// Randomly blur half of the spectrograms
    pub use_random_corruption: bool,
    pub seed: u64,
}

impl Default for VocoderDatasetConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            samples_per_segment: 12288,
            use_random_corruption: false,
            seed: 42,
        }
    }
}

/// One training pair
#[derive(Debug, Clone)]
pub struct VocoderSample {
    /// Wave segment [samples_per_segment] at the dataset rate
    pub segment: Array,
    /// Spectrogram of the 16 kHz segment [frames, n_mels], last frame dropped
    pub mel: Array,
}

/// Waves cached in memory, cropped at random on access.
pub struct VocoderDataset {
    waves: Vec<Vec<f32>>,
    config: VocoderDatasetConfig,
    mel: MelSpectrogram,
    rng: StdRng,
}

impl VocoderDataset {
    /// Load and resample every readable file; unreadable files are skipped.
    pub fn from_paths(paths: &[PathBuf], config: VocoderDatasetConfig, mel: MelSpectrogram) -> Result<Self> {
        let mut waves = Vec::with_capacity(paths.len());
        for path in paths {
            match load_wav(path) {
                Ok((samples, rate)) => {
                    let samples = if rate != config.sample_rate {
                        resample(&samples, rate, config.sample_rate)
                    } else {
                        samples
                    };
                    waves.push(samples);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable audio"),
            }
        }
        info!(eligible = waves.len(), total = paths.len(), "Vocoder audio loaded");
        Self::from_waves(waves, config, mel)
    }

    /// Waves must already be at `config.sample_rate`
    pub fn from_waves(waves: Vec<Vec<f32>>, config: VocoderDatasetConfig, mel: MelSpectrogram) -> Result<Self> {
        if config.samples_per_segment == 0 {
            return Err(Error::config("samples_per_segment must be at least 1"));
        }
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self { waves, config, mel, rng })
    }

    pub fn len(&self) -> usize {
        self.waves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    pub fn config(&self) -> &VocoderDatasetConfig {
        &self.config
    }

    /// A random crop of wave `index` and its spectrogram.
    ///
    /// When extraction fails, the preceding wave is used instead.
    pub fn get(&mut self, index: usize) -> Result<VocoderSample> {
        if self.waves.is_empty() {
            return Err(Error::dataset("vocoder dataset is empty"));
        }
        let len = self.waves.len();
        let mut index = index % len;
        let mut last_error = None;
        for _ in 0..len {
            match self.sample_at(index) {
                Ok(sample) => return Ok(sample),
                Err(e) => {
                    warn!(index, error = %e, "Vocoder sample failed, using fallback");
                    last_error = Some(e);
                    index = (index + len - 1) % len;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::dataset("no usable vocoder sample")))
    }

    fn sample_at(&mut self, index: usize) -> Result<VocoderSample> {
        let wave = extend_to_length(&self.waves[index], self.config.samples_per_segment + SEGMENT_MARGIN);

        let max_start = wave.len() - self.config.samples_per_segment;
        let start = self.rng.gen_range(0..=max_start);
        let segment = &wave[start..start + self.config.samples_per_segment];

        let mel = self.mel.samples_to_mel(segment, self.config.sample_rate)?;
        let frames = mel.shape()[0] as usize;
        let n_mels = mel.shape()[1] as usize;
        if frames < 2 {
            return Err(Error::audio(format!("segment yields only {} frames", frames)));
        }
        let mut values = mel.as_slice::<f32>()[..(frames - 1) * n_mels].to_vec();

        if self.config.use_random_corruption && self.rng.gen_bool(0.5) {
            let sigma = self.rng.gen_range(0.1f32..2.0);
            values = gaussian_blur_3x3(&values, frames - 1, n_mels, sigma);
        }

        Ok(VocoderSample {
            segment: Array::from_slice(segment, &[segment.len() as i32]),
            mel: Array::from_slice(&values, &[(frames - 1) as i32, n_mels as i32]),
        })
    }
}

/// Tile `wave` with silence gaps until it has at least `min_len` samples.
fn extend_to_length(wave: &[f32], min_len: usize) -> Vec<f32> {
    let mut extended = wave.to_vec();
    while extended.len() < min_len {
        let mut next = Vec::with_capacity(extended.len() * 2 + SILENCE_GAP);
        next.extend_from_slice(&extended);
        next.extend(std::iter::repeat(0.0).take(SILENCE_GAP));
        next.extend_from_slice(&extended);
        extended = next;
    }
    extended
}

/// Separable 3x3 Gaussian blur of a row-major [rows, cols] image with
/// reflected borders.
fn gaussian_blur_3x3(image: &[f32], rows: usize, cols: usize, sigma: f32) -> Vec<f32> {
    let side = (-1.0 / (2.0 * sigma * sigma)).exp();
    let norm = 1.0 + 2.0 * side;
    let kernel = [side / norm, 1.0 / norm, side / norm];

    let reflect = |i: isize, n: usize| -> usize {
        if n == 1 {
            0
        } else if i < 0 {
            (-i) as usize
        } else if i as usize >= n {
            2 * (n - 1) - i as usize
        } else {
            i as usize
        }
    };

    let mut horizontal = vec![0.0f32; image.len()];
    for r in 0..rows {
        for c in 0..cols {
            horizontal[r * cols + c] = (0..3)
                .map(|k| kernel[k] * image[r * cols + reflect(c as isize + k as isize - 1, cols)])
                .sum();
        }
    }

    let mut out = vec![0.0f32; image.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[r * cols + c] = (0..3)
                .map(|k| kernel[k] * horizontal[reflect(r as isize + k as isize - 1, rows) * cols + c])
                .sum();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MelConfig;

    fn tone(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 * 0.05).sin() * 0.5).collect()
    }

    fn dataset(waves: Vec<Vec<f32>>, corrupt: bool) -> VocoderDataset {
        let config = VocoderDatasetConfig {
            use_random_corruption: corrupt,
            ..Default::default()
        };
        VocoderDataset::from_waves(waves, config, MelSpectrogram::new(MelConfig::default()).unwrap()).unwrap()
    }

    #[test]
    fn test_extend_to_length_tiles_with_silence() {
        let extended = extend_to_length(&[1.0, 2.0], 1500);
        assert_eq!(extended.len(), 2 + SILENCE_GAP + 2);
        assert_eq!(extended[..2], [1.0, 2.0]);
        assert!(extended[2..2 + SILENCE_GAP].iter().all(|&x| x == 0.0));
        assert_eq!(extended[extended.len() - 2..], [1.0, 2.0]);

        let long = vec![0.5; 2000];
        assert_eq!(extend_to_length(&long, 1500).len(), 2000);
    }

    #[test]
    fn test_sample_shapes() {
        let mut data = dataset(vec![tone(30000)], false);
        let sample = data.get(0).unwrap();

        assert_eq!(sample.segment.shape(), &[12288]);
        // 12288 samples at 24 kHz -> ~8192 at 16 kHz -> ~33 frames, minus the last
        assert!((30..=33).contains(&sample.mel.dim(0)));
        assert_eq!(sample.mel.dim(1), 128);
    }

    #[test]
    fn test_short_wave_is_extended() {
        let mut data = dataset(vec![tone(500)], true);
        let sample = data.get(0).unwrap();
        assert_eq!(sample.segment.shape(), &[12288]);
        assert_eq!(sample.mel.dim(1), 128);
    }

    #[test]
    fn test_empty_dataset_is_an_error() {
        let mut data = dataset(Vec::new(), false);
        assert!(data.is_empty());
        assert!(data.get(0).is_err());
    }

    #[test]
    fn test_unreadable_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.wav");
        crate::audio::save_wav(&tone(24000), 24000, &good).unwrap();
        let missing = dir.path().join("missing.wav");

        let data = VocoderDataset::from_paths(
            &[good, missing],
            VocoderDatasetConfig::default(),
            MelSpectrogram::new(MelConfig::default()).unwrap(),
        )
        .unwrap();
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn test_blur_preserves_constant_image() {
        let image = vec![2.0f32; 12];
        let blurred = gaussian_blur_3x3(&image, 3, 4, 0.8);
        assert!(blurred.iter().all(|&x| (x - 2.0).abs() < 1e-5));
    }

    #[test]
    fn test_blur_spreads_impulse() {
        let mut image = vec![0.0f32; 9];
        image[4] = 1.0;
        let blurred = gaussian_blur_3x3(&image, 3, 3, 1.0);
        assert!(blurred[4] < 1.0);
        assert!(blurred[0] > 0.0);
        assert!((blurred[0] - blurred[8]).abs() < 1e-6);
        assert!((blurred[1] - blurred[3]).abs() < 1e-6);
    }
}
