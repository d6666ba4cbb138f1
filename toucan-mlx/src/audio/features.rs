//! On-the-fly gold spectrogram extraction from codec indexes

use mlx_rs::{
    error::Exception,
    ops::{concatenate_axis, stack_axis},
    Array, Dtype,
};
use tracing::trace;

use super::codec::CodecDecoder;
use super::mel::MelSpectrogram;
use crate::error::{Error, Result};

/// Zero-pad arrays along axis 0 to the longest one and stack them.
///
/// All inputs must agree on every axis but the first. Returns
/// [batch, max_len, ...].
pub fn pad_sequence(items: &[Array]) -> std::result::Result<Array, Exception> {
    let max_len = items.iter().map(|a| a.shape()[0]).max().unwrap_or(0);

    let padded = items
        .iter()
        .map(|item| {
            let len = item.shape()[0];
            if len == max_len {
                return Ok(item.clone());
            }
            let mut shape = item.shape().to_vec();
            shape[0] = max_len - len;
            let zeros = Array::zeros::<f32>(&shape)?.as_dtype(item.dtype())?;
            concatenate_axis(&[item, &zeros], 0)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let refs: Vec<&Array> = padded.iter().collect();
    stack_axis(&refs, 0)
}

/// Codec decoder followed by the log-mel extractor.
///
/// Runs outside the differentiated closure, so no gradient reaches either.
pub struct FeatureExtractor<C: CodecDecoder> {
    codec: C,
    mel: MelSpectrogram,
}

impl<C: CodecDecoder> FeatureExtractor<C> {
    pub fn new(codec: C, mel: MelSpectrogram) -> Self {
        Self { codec, mel }
    }

    pub fn mel(&self) -> &MelSpectrogram {
        &self.mel
    }

    /// Spectrogram [frames, n_mels] of one utterance's codec indexes
    pub fn codes_to_mel(&mut self, codes: &Array) -> Result<Array> {
        let codes = codes.as_dtype(Dtype::Int32)?;
        let wave = self.codec.indexes_to_audio(&codes)?;
        let mel = self.mel.audio_to_mel(&wave, self.codec.sample_rate())?;
        trace!(frames = mel.dim(0), "Decoded gold spectrogram");
        Ok(mel)
    }

    /// Padded gold spectrograms [batch, max_frames, n_mels] of a batch
    pub fn gold_speech_batch(&mut self, codes: &[Array]) -> Result<Array> {
        if codes.is_empty() {
            return Err(Error::dataset("cannot extract features of an empty batch"));
        }
        let mels = codes
            .iter()
            .map(|c| self.codes_to_mel(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(pad_sequence(&mels)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MelConfig;

    /// Each code frame becomes `hop` samples of a sine tone
    struct ToneCodec {
        hop: usize,
    }

    impl CodecDecoder for ToneCodec {
        fn sample_rate(&self) -> u32 {
            16000
        }

        fn indexes_to_audio(&mut self, codes: &Array) -> std::result::Result<Array, Exception> {
            let frames = codes.dim(1) as usize;
            let n = frames * self.hop;
            let samples: Vec<f32> = (0..n).map(|i| (i as f32 * 0.2).sin() * 0.3).collect();
            Ok(Array::from_slice(&samples, &[n as i32]))
        }
    }

    #[test]
    fn test_pad_sequence() {
        let a = Array::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2]);
        let b = Array::from_slice(&[5.0f32, 6.0], &[1, 2]);
        let padded = pad_sequence(&[a, b]).unwrap();
        assert_eq!(padded.shape(), &[2, 2, 2]);
        assert_eq!(
            padded.as_slice::<f32>(),
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_pad_sequence_keeps_dtype() {
        let a = Array::from_slice(&[1i32, 2, 3], &[3]);
        let b = Array::from_slice(&[4i32], &[1]);
        let padded = pad_sequence(&[a, b]).unwrap();
        assert_eq!(padded.dtype(), Dtype::Int32);
        assert_eq!(padded.as_slice::<i32>(), &[1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn test_gold_speech_batch_pads_to_longest() {
        let mel = MelSpectrogram::new(MelConfig::default()).unwrap();
        let mut extractor = FeatureExtractor::new(ToneCodec { hop: 256 }, mel);

        let short = Array::zeros::<i32>(&[2, 10]).unwrap();
        let long = Array::zeros::<i32>(&[2, 20]).unwrap();
        let batch = extractor.gold_speech_batch(&[short, long]).unwrap();

        // 20 * 256 samples -> 21 frames with center padding
        assert_eq!(batch.shape(), &[2, 21, 128]);
    }

    #[test]
    fn test_empty_batch_is_an_error() {
        let mel = MelSpectrogram::new(MelConfig::default()).unwrap();
        let mut extractor = FeatureExtractor::new(ToneCodec { hop: 256 }, mel);
        assert!(extractor.gold_speech_batch(&[]).is_err());
    }
}
