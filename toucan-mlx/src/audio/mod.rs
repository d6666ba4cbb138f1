//! Audio processing: WAV I/O, resampling, log-mel spectrograms and codec decoding

mod codec;
mod features;
mod mel;
mod wav;

pub use codec::CodecDecoder;
pub use features::{pad_sequence, FeatureExtractor};
pub use mel::{mel_filterbank, stft_magnitude, MelConfig, MelSpectrogram};
pub use wav::{load_wav, resample, resample_linear, save_wav};
