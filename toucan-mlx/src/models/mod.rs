//! Contracts of the networks driven by the training loop
//!
//! The architectures themselves live outside this crate. The trainer only
//! relies on what is declared here:
//!
//! - **AcousticModel**: text + gold features in, five loss terms out, with a
//!   normalizing-flow sub-module (`post_flow`) that has its own optimizer
//! - **StyleEmbedding**: mel sequences in, one style vector per utterance out
//! - **TrainGraph**: both networks as one parameter tree, so a single
//!   `value_and_grad` reaches every trainable weight

use mlx_rs::{
    error::Exception,
    macros::ModuleParameters,
    module::ModuleParameters,
    Array,
};
use serde::{de::DeserializeOwned, Serialize};

/// Inputs of one acoustic model training forward pass.
#[derive(Debug, Clone, Copy)]
pub struct AcousticInput<'a> {
    /// Padded text features [batch, max_text_len, feature_dim]
    pub text: &'a Array,
    /// Text lengths [batch]
    pub text_lengths: &'a Array,
    /// Padded gold mel spectrograms [batch, max_frames, n_mels]
    pub gold_speech: &'a Array,
    /// Speech lengths in frames [batch]
    pub speech_lengths: &'a Array,
    /// Padded durations [batch, max_text_len]
    pub gold_durations: &'a Array,
    /// Padded pitch [batch, max_text_len]
    pub gold_pitch: &'a Array,
    /// Padded energy [batch, max_text_len]
    pub gold_energy: &'a Array,
    /// Style embedding concatenated with the speaker embedding [batch, dim]
    pub utterance_embedding: &'a Array,
    /// Language ids [batch]
    pub lang_ids: &'a Array,
    pub return_feats: bool,
    /// Whether the flow sub-module runs and reports its loss
    pub run_flow: bool,
}

/// Loss terms reported by the acoustic model; all are scalars.
#[derive(Debug, Clone)]
pub struct AcousticLosses {
    pub regression: Array,
    /// Present only when the flow ran
    pub flow: Option<Array>,
    pub duration: Array,
    pub pitch: Array,
    pub energy: Array,
}

/// Acoustic model trained by [`crate::training::ToucanTrainer`].
pub trait AcousticModel: ModuleParameters {
    /// Parameter key prefix of the flow sub-module
    const FLOW_MODULE: &'static str = "post_flow";

    /// Flow sub-module type
    type Flow: ModuleParameters;

    /// Architecture hyperparameters, stored in every checkpoint
    type Config: Serialize + DeserializeOwned + Clone;

    fn config(&self) -> &Self::Config;

    fn post_flow_mut(&mut self) -> &mut Self::Flow;

    /// Training forward pass
    fn forward_train(&mut self, input: &AcousticInput<'_>) -> Result<AcousticLosses, Exception>;

    fn training_mode(&mut self, mode: bool);
}

/// Style embedding function producing one vector per utterance.
pub trait StyleEmbedding: ModuleParameters {
    /// Embed a batch of feature sequences [batch, frames, n_mels] with lengths [batch]
    fn embed(&mut self, features: &Array, lengths: &Array) -> Result<Array, Exception>;

    /// Whether the encoder uses global style tokens
    fn use_gst(&self) -> bool;

    /// Style token regularization loss (spreads the token vectors apart).
    /// Expensive; the trainer calls it only on scheduled steps.
    fn regularization_loss(&mut self) -> Result<Array, Exception>;

    fn training_mode(&mut self, mode: bool);
}

/// Whether the style embedding function is optimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingPolicy {
    Trainable,
    Frozen,
}

impl EmbeddingPolicy {
    /// A freshly initialized embedding always trains; a pretrained one only on request.
    pub fn new(has_pretrained_weights: bool, train_embed: bool) -> Self {
        if !has_pretrained_weights || train_embed {
            EmbeddingPolicy::Trainable
        } else {
            EmbeddingPolicy::Frozen
        }
    }

    pub fn is_trainable(&self) -> bool {
        matches!(self, EmbeddingPolicy::Trainable)
    }
}

/// Acoustic model and style embedding function as one parameter tree.
///
/// Parameter keys are `net.*` and `style.*`; the flow lives under
/// `net.{FLOW_MODULE}.*`.
#[derive(ModuleParameters)]
pub struct TrainGraph<M: AcousticModel, S: StyleEmbedding> {
    #[param]
    pub net: M,
    #[param]
    pub style: S,
}

impl<M: AcousticModel, S: StyleEmbedding> TrainGraph<M, S> {
    pub fn new(net: M, style: S) -> Self {
        Self { net, style }
    }

    /// Key prefix of the flow parameters within the graph
    pub fn flow_prefix() -> String {
        format!("net.{}.", M::FLOW_MODULE)
    }

    /// Whether a flattened graph parameter key belongs to the flow
    pub fn is_flow_key(key: &str) -> bool {
        key.starts_with(&Self::flow_prefix())
    }

    /// Freeze everything except the flow.
    pub fn freeze_backbone(&mut self) {
        self.net.freeze_parameters(true);
        self.style.freeze_parameters(true);
        self.net.post_flow_mut().unfreeze_parameters(true);
    }

    /// Make the acoustic model trainable again; the style embedding follows its policy.
    pub fn unfreeze_backbone(&mut self, policy: EmbeddingPolicy) {
        self.net.unfreeze_parameters(true);
        if policy.is_trainable() {
            self.style.unfreeze_parameters(true);
        }
    }

    /// Switch both networks between training and evaluation behavior.
    /// A frozen embedding function stays in evaluation mode.
    pub fn training_mode(&mut self, mode: bool, policy: EmbeddingPolicy) {
        self.net.training_mode(mode);
        self.style.training_mode(mode && policy.is_trainable());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_policy() {
        assert_eq!(EmbeddingPolicy::new(false, false), EmbeddingPolicy::Trainable);
        assert_eq!(EmbeddingPolicy::new(false, true), EmbeddingPolicy::Trainable);
        assert_eq!(EmbeddingPolicy::new(true, true), EmbeddingPolicy::Trainable);
        assert_eq!(EmbeddingPolicy::new(true, false), EmbeddingPolicy::Frozen);
        assert!(!EmbeddingPolicy::Frozen.is_trainable());
    }
}
