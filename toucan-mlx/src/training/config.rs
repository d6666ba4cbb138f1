//! Training configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for ToucanTTS acoustic model training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToucanTrainingConfig {
    // === Optimization ===
    /// Peak learning rate of the main optimizer (default: 1e-3)
    pub learning_rate: f32,

    /// Peak learning rate multiplier for the `post_flow` optimizer (default: 8.0)
    pub flow_lr_factor: f32,

    /// Gradient clipping max norm, applied per parameter group (default: 1.0)
    pub max_grad_norm: f32,

    // === Schedule ===
    /// Warmup steps of the main scheduler; also drives the flow curriculum (default: 4000)
    pub warmup_steps: usize,

    /// Step budget; training stops after the first evaluation past it (default: 200000)
    pub steps: usize,

    /// Batch size (default: 32)
    pub batch_size: usize,

    // === Checkpointing ===
    /// Directory receiving checkpoints, plots and the best model
    pub save_directory: PathBuf,

    /// Save checkpoint every N steps (default: one epoch)
    pub steps_per_checkpoint: Option<usize>,

    /// Keep only last N checkpoints (default: 5)
    pub keep_last_n_checkpoints: usize,

    /// Number of recent checkpoints averaged into the best model (default: 1)
    pub checkpoints_to_average: usize,

    /// Checkpoint to restore before training
    pub path_to_checkpoint: Option<PathBuf>,

    /// Resume from the most recent checkpoint in `save_directory`
    pub resume: bool,

    /// Restore only the weights and restart the step counter
    pub fine_tune: bool,

    // === Style embedding ===
    /// Pretrained embedding function weights
    pub path_to_embed_model: Option<PathBuf>,

    /// Keep training the embedding function even when it was pretrained
    pub train_embed: bool,

    // === Data ===
    /// Language tag of the corpus, forwarded to the plotter
    pub lang: String,

    /// Shuffle training data (default: true)
    pub shuffle: bool,

    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for ToucanTrainingConfig {
    fn default() -> Self {
        Self {
            // Optimization
            learning_rate: 1e-3,
            flow_lr_factor: 8.0,
            max_grad_norm: 1.0,

            // Schedule
            warmup_steps: 4000,
            steps: 200_000,
            batch_size: 32,

            // Checkpointing
            save_directory: PathBuf::from("checkpoints"),
            steps_per_checkpoint: None,
            keep_last_n_checkpoints: 5,
            checkpoints_to_average: 1,
            path_to_checkpoint: None,
            resume: false,
            fine_tune: false,

            // Style embedding
            path_to_embed_model: None,
            train_embed: false,

            // Data
            lang: "eng".to_string(),
            shuffle: true,
            seed: 42,
        }
    }
}

impl ToucanTrainingConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set learning rate
    pub fn with_learning_rate(mut self, lr: f32) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set warmup steps
    pub fn with_warmup_steps(mut self, steps: usize) -> Self {
        self.warmup_steps = steps;
        self
    }

    /// Set the step budget
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    /// Set save directory
    pub fn with_save_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_directory = dir.into();
        self
    }

    /// Set checkpoint interval
    pub fn with_steps_per_checkpoint(mut self, steps: usize) -> Self {
        self.steps_per_checkpoint = Some(steps);
        self
    }

    /// Set checkpoint to restore
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.path_to_checkpoint = Some(path.into());
        self
    }

    /// Set pretrained embedding function
    pub fn with_embed_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.path_to_embed_model = Some(path.into());
        self
    }

    /// Enable fine-tuning
    pub fn with_fine_tune(mut self, fine_tune: bool) -> Self {
        self.fine_tune = fine_tune;
        self
    }

    /// Enable resuming from the latest checkpoint
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Train a pretrained embedding function too
    pub fn with_train_embed(mut self, train_embed: bool) -> Self {
        self.train_embed = train_embed;
        self
    }

    /// Set random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Peak learning rate of the flow optimizer
    pub fn flow_learning_rate(&self) -> f32 {
        self.learning_rate * self.flow_lr_factor
    }

    /// Warmup steps of the flow scheduler
    pub fn flow_warmup_steps(&self) -> usize {
        self.warmup_steps / 4
    }

    /// Checkpoint interval for a corpus of `corpus_len` samples
    pub fn checkpoint_interval(&self, corpus_len: usize) -> usize {
        self.steps_per_checkpoint
            .unwrap_or(corpus_len / self.batch_size.max(1))
            .max(1)
    }

    /// Whether the style embedding function receives gradient updates
    pub fn embedding_is_trainable(&self) -> bool {
        self.path_to_embed_model.is_none() || self.train_embed
    }

    /// Load config from YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to YAML file
    pub fn to_yaml(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 {
            return Err(Error::config("learning_rate must be positive"));
        }
        if self.flow_lr_factor <= 0.0 {
            return Err(Error::config("flow_lr_factor must be positive"));
        }
        if self.max_grad_norm <= 0.0 {
            return Err(Error::config("max_grad_norm must be positive"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        if self.steps == 0 {
            return Err(Error::config("steps must be at least 1"));
        }
        if self.steps_per_checkpoint == Some(0) {
            return Err(Error::config("steps_per_checkpoint must be at least 1"));
        }
        if self.keep_last_n_checkpoints == 0 {
            return Err(Error::config("keep_last_n_checkpoints must be at least 1"));
        }
        if self.checkpoints_to_average == 0 {
            return Err(Error::config("checkpoints_to_average must be at least 1"));
        }
        if self.resume && self.fine_tune {
            return Err(Error::config("resume and fine_tune are mutually exclusive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ToucanTrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.keep_last_n_checkpoints, 5);
        assert_eq!(config.checkpoints_to_average, 1);
        assert!(config.embedding_is_trainable());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ToucanTrainingConfig::new()
            .with_learning_rate(5e-4)
            .with_batch_size(8)
            .with_warmup_steps(100)
            .with_steps(5000);

        assert_eq!(config.learning_rate, 5e-4);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.steps, 5000);
        assert!((config.flow_learning_rate() - 4e-3).abs() < 1e-9);
        assert_eq!(config.flow_warmup_steps(), 25);
    }

    #[test]
    fn test_checkpoint_interval_defaults_to_epoch() {
        let config = ToucanTrainingConfig::new().with_batch_size(4);
        assert_eq!(config.checkpoint_interval(100), 25);
        assert_eq!(config.checkpoint_interval(2), 1);
        assert_eq!(config.with_steps_per_checkpoint(7).checkpoint_interval(100), 7);
    }

    #[test]
    fn test_embedding_policy() {
        let pretrained = ToucanTrainingConfig::new().with_embed_model("embed.safetensors");
        assert!(!pretrained.embedding_is_trainable());
        assert!(pretrained.with_train_embed(true).embedding_is_trainable());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ToucanTrainingConfig::new().with_batch_size(0).validate().is_err());
        assert!(ToucanTrainingConfig::new().with_learning_rate(0.0).validate().is_err());
        assert!(ToucanTrainingConfig::new()
            .with_resume(true)
            .with_fine_tune(true)
            .validate()
            .is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.yaml");

        let config = ToucanTrainingConfig::new()
            .with_warmup_steps(123)
            .with_embed_model("embed.safetensors");
        config.to_yaml(&path).unwrap();

        let loaded = ToucanTrainingConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: ToucanTrainingConfig =
            serde_yaml::from_str("learning_rate: 0.0005\nfine_tune: true\n").unwrap();
        assert_eq!(config.learning_rate, 5e-4);
        assert!(config.fine_tune);
        assert_eq!(config.warmup_steps, 4000);
    }
}
