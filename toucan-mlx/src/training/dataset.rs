//! Training samples, batch collation and batch sampling

use mlx_rs::{ops::stack_axis, Array};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::audio::pad_sequence;
use crate::error::{Error, Result};

/// One preprocessed utterance of the acoustic corpus
#[derive(Debug, Clone)]
pub struct TtsSample {
    /// Text features [text_len, feature_dim] (f32)
    pub text: Array,
    /// Number of valid text positions
    pub text_length: i32,
    /// Codec indexes [n_codebooks, code_frames] (i32)
    pub speech_codes: Array,
    /// Number of spectrogram frames of the utterance
    pub speech_length: i32,
    /// Frames per text position [text_len] (i32)
    pub durations: Array,
    /// Energy per text position [text_len]
    pub energy: Array,
    /// Pitch per text position [text_len]
    pub pitch: Array,
    pub lang_id: i32,
    /// Speaker embedding fragment [speaker_dim]
    pub speaker_embedding: Array,
}

/// Random-access corpus of training samples
pub trait TtsCorpus {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<TtsSample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Corpus held fully in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryCorpus {
    samples: Vec<TtsSample>,
}

impl InMemoryCorpus {
    pub fn new(samples: Vec<TtsSample>) -> Self {
        Self { samples }
    }
}

impl TtsCorpus for InMemoryCorpus {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<TtsSample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| Error::dataset(format!("index {} out of range ({} samples)", index, self.samples.len())))
    }
}

/// A padded training batch
///
/// Every text-aligned sequence is padded to the longest text of the batch;
/// lengths hold the true per-item values.
#[derive(Debug, Clone)]
pub struct TtsBatch {
    /// [batch, max_text_len, feature_dim]
    pub text: Array,
    /// [batch]
    pub text_lengths: Array,
    /// Unpadded codec indexes, one per item
    pub speech_codes: Vec<Array>,
    /// [batch]
    pub speech_lengths: Array,
    /// [batch, max_text_len]
    pub durations: Array,
    /// [batch, max_text_len]
    pub energy: Array,
    /// [batch, max_text_len]
    pub pitch: Array,
    /// [batch]
    pub lang_ids: Array,
    /// [batch, speaker_dim]
    pub speaker_embeddings: Array,
}

impl TtsBatch {
    pub fn len(&self) -> usize {
        self.speech_codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speech_codes.is_empty()
    }
}

/// Combine samples into a batch, zero-padding text-aligned sequences.
pub fn collate_and_pad(samples: &[TtsSample]) -> Result<TtsBatch> {
    if samples.is_empty() {
        return Err(Error::dataset("cannot collate an empty batch"));
    }
    let batch_size = samples.len() as i32;

    let text: Vec<Array> = samples.iter().map(|s| s.text.clone()).collect();
    let durations: Vec<Array> = samples.iter().map(|s| s.durations.clone()).collect();
    let energy: Vec<Array> = samples.iter().map(|s| s.energy.clone()).collect();
    let pitch: Vec<Array> = samples.iter().map(|s| s.pitch.clone()).collect();

    let text_lengths: Vec<i32> = samples.iter().map(|s| s.text_length).collect();
    let speech_lengths: Vec<i32> = samples.iter().map(|s| s.speech_length).collect();
    let lang_ids: Vec<i32> = samples.iter().map(|s| s.lang_id).collect();

    let speakers: Vec<&Array> = samples.iter().map(|s| &s.speaker_embedding).collect();
    let speaker_embeddings = stack_axis(&speakers, 0)?;

    Ok(TtsBatch {
        text: pad_sequence(&text)?,
        text_lengths: Array::from_slice(&text_lengths, &[batch_size]),
        speech_codes: samples.iter().map(|s| s.speech_codes.clone()).collect(),
        speech_lengths: Array::from_slice(&speech_lengths, &[batch_size]),
        durations: pad_sequence(&durations)?,
        energy: pad_sequence(&energy)?,
        pitch: pad_sequence(&pitch)?,
        lang_ids: Array::from_slice(&lang_ids, &[batch_size]),
        speaker_embeddings,
    })
}

/// Index batches for one process of a (possibly distributed) run.
///
/// Each epoch is shuffled with `seed + epoch`, split across ranks by
/// striding, and cut into full batches; the incomplete tail is dropped.
#[derive(Debug, Clone)]
pub struct BatchSampler {
    corpus_len: usize,
    batch_size: usize,
    rank: usize,
    world_size: usize,
    shuffle: bool,
    seed: u64,
}

impl BatchSampler {
    pub fn new(corpus_len: usize, batch_size: usize) -> Self {
        Self {
            corpus_len,
            batch_size: batch_size.max(1),
            rank: 0,
            world_size: 1,
            shuffle: true,
            seed: 42,
        }
    }

    /// Restrict the sampler to one shard of `world_size`
    pub fn with_shard(mut self, rank: usize, world_size: usize) -> Self {
        self.world_size = world_size.max(1);
        self.rank = rank.min(self.world_size - 1);
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Samples assigned to this rank per epoch
    pub fn shard_len(&self) -> usize {
        self.corpus_len.div_ceil(self.world_size)
    }

    /// Full batches per epoch
    pub fn num_batches(&self) -> usize {
        self.shard_len() / self.batch_size
    }

    /// Batches of corpus indices for `epoch`
    pub fn batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        if self.corpus_len == 0 {
            return Vec::new();
        }
        let mut indices: Vec<usize> = (0..self.corpus_len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }

        // Repeat the head so every rank gets the same number of samples
        let total = self.shard_len() * self.world_size;
        let mut i = 0;
        while indices.len() < total {
            indices.push(indices[i]);
            i += 1;
        }

        let shard: Vec<usize> = indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect();

        shard
            .chunks_exact(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(text_len: i32, lang_id: i32) -> TtsSample {
        let t = text_len as usize;
        TtsSample {
            text: Array::from_slice(&vec![1.0f32; t * 3], &[text_len, 3]),
            text_length: text_len,
            speech_codes: Array::from_slice(&vec![7i32; 2 * 5], &[2, 5]),
            speech_length: 4 * text_len,
            durations: Array::from_slice(&vec![4i32; t], &[text_len]),
            energy: Array::from_slice(&vec![0.5f32; t], &[text_len]),
            pitch: Array::from_slice(&vec![1.5f32; t], &[text_len]),
            lang_id,
            speaker_embedding: Array::from_slice(&[0.1f32, 0.2], &[2]),
        }
    }

    #[test]
    fn test_collate_pads_to_longest_text() {
        let batch = collate_and_pad(&[sample(2, 0), sample(4, 1), sample(3, 2)]).unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.text.shape(), &[3, 4, 3]);
        assert_eq!(batch.durations.shape(), &[3, 4]);
        assert_eq!(batch.energy.shape(), &[3, 4]);
        assert_eq!(batch.pitch.shape(), &[3, 4]);
        assert_eq!(batch.text_lengths.as_slice::<i32>(), &[2, 4, 3]);
        assert_eq!(batch.speech_lengths.as_slice::<i32>(), &[8, 16, 12]);
        assert_eq!(batch.lang_ids.as_slice::<i32>(), &[0, 1, 2]);
        assert_eq!(batch.speaker_embeddings.shape(), &[3, 2]);

        // Padding is zero, values are kept
        assert_eq!(batch.durations.as_slice::<i32>()[..4], [4, 4, 0, 0]);
        assert_eq!(batch.pitch.as_slice::<f32>()[4..8], [1.5, 1.5, 1.5, 1.5]);
    }

    #[test]
    fn test_collate_empty_is_an_error() {
        assert!(collate_and_pad(&[]).is_err());
    }

    #[test]
    fn test_corpus_get_out_of_range() {
        let corpus = InMemoryCorpus::new(vec![sample(2, 0)]);
        assert_eq!(corpus.len(), 1);
        assert!(corpus.get(0).is_ok());
        assert!(corpus.get(1).is_err());
    }

    #[test]
    fn test_sampler_drops_incomplete_batch() {
        let sampler = BatchSampler::new(10, 4).with_shuffle(false);
        let batches = sampler.batches(0);
        assert_eq!(batches, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);
        assert_eq!(sampler.num_batches(), 2);
    }

    #[test]
    fn test_sampler_shuffle_is_seeded_per_epoch() {
        let sampler = BatchSampler::new(32, 4).with_seed(7);
        assert_eq!(sampler.batches(0), sampler.batches(0));
        assert_ne!(sampler.batches(0), sampler.batches(1));

        let mut seen: Vec<usize> = sampler.batches(3).into_iter().flatten().collect();
        seen.sort();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_sampler_shards_are_disjoint() {
        let rank0 = BatchSampler::new(16, 2).with_shard(0, 2).with_seed(1);
        let rank1 = BatchSampler::new(16, 2).with_shard(1, 2).with_seed(1);

        let a: Vec<usize> = rank0.batches(0).into_iter().flatten().collect();
        let b: Vec<usize> = rank1.batches(0).into_iter().flatten().collect();
        assert_eq!(a.len(), 8);
        assert_eq!(b.len(), 8);
        assert!(a.iter().all(|i| !b.contains(i)));
    }

    #[test]
    fn test_sampler_pads_uneven_shards() {
        let rank1 = BatchSampler::new(5, 1).with_shard(1, 2).with_shuffle(false);
        // indices 0..5 + [0] -> rank 1 takes 1, 3, 0
        assert_eq!(rank1.batches(0), vec![vec![1], vec![3], vec![0]]);
    }
}
