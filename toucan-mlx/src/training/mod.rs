//! Training support for the ToucanTTS acoustic model and its vocoder
//!
//! # Overview
//!
//! One training step:
//! 1. Collate a batch and decode its codec indexes into gold spectrograms
//! 2. Embed the spectrograms with the style embedding function
//! 3. Run the acoustic model and sum the selected loss terms
//! 4. Clip and apply the backbone and flow gradient groups separately
//!
//! Every `steps_per_checkpoint` steps the coordinator writes a checkpoint,
//! prunes old ones, reports averaged losses, plots progress and refreshes
//! the averaged `best.safetensors`.
//!
//! # Example
//!
//! ```rust,ignore
//! use toucan_mlx::training::{ToucanTrainer, ToucanTrainingConfig, InMemoryCorpus};
//!
//! let config = ToucanTrainingConfig::from_yaml("train.yaml")?;
//! let mut trainer = ToucanTrainer::new(config, model, style, features)?;
//! trainer.train(&InMemoryCorpus::new(samples))?;
//! ```

mod checkpoint;
mod config;
mod curriculum;
mod dataset;
mod distributed;
mod losses;
mod lr_scheduler;
mod progress;
mod trainer;
mod vocoder_dataset;

pub use checkpoint::{
    average_checkpoints, checkpoint_path, checkpoint_step, config_to_json, delete_old_checkpoints,
    list_checkpoints, load_embedding_function, load_module_weights, module_weights,
    most_recent_checkpoint, n_recent_checkpoint_paths, save_embedding_function, save_model_for_use,
    AdamMoments, Checkpoint, ModelArtifact, BEST_MODEL_FILE, CHECKPOINT_EXTENSION,
    CHECKPOINT_PREFIX, EMBEDDING_FUNCTION_FILE,
};
pub use config::ToucanTrainingConfig;
pub use curriculum::{FlowCurriculum, FlowStage, StageTransition};
pub use dataset::{collate_and_pad, BatchSampler, InMemoryCorpus, TtsBatch, TtsCorpus, TtsSample};
pub use distributed::{Collective, DistributedContext, LocalCollective};
pub use losses::{composite_loss, select_terms, LossAggregator, LossTerm, LossValues};
pub use lr_scheduler::{LRScheduler, ToucanWarmupScheduler};
pub use progress::{ExperimentTracker, ProgressPlotter, TracingTracker};
pub use trainer::{StepReport, ToucanTrainer};
pub use vocoder_dataset::{VocoderDataset, VocoderDatasetConfig, VocoderSample};
