//! Neural codec decoder contract

use mlx_rs::{error::Exception, Array};

/// Decoder turning discrete codec indexes back into a waveform.
///
/// The corpus stores speech as codec indexes [n_codebooks, frames]; the
/// trainer decodes them on the fly and computes spectrograms from the audio.
pub trait CodecDecoder {
    /// Native sampling rate of the decoded audio
    fn sample_rate(&self) -> u32;

    /// Decode indexes [n_codebooks, frames] (int32) to a 1D waveform
    fn indexes_to_audio(&mut self, codes: &Array) -> Result<Array, Exception>;
}
