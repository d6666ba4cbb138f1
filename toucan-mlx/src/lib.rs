//! ToucanTTS training on MLX
//!
//! Pure Rust training pipeline for the ToucanTTS acoustic model with MLX
//! acceleration for Apple Silicon.
//!
//! # Features
//!
//! - **Two-optimizer schedule**: the normalizing flow gets its own Adam and
//!   warmup schedule and joins training after the backbone has converged
//! - **Style embedding**: trained jointly or loaded frozen from a pretrained file
//! - **On-the-fly features**: gold spectrograms are decoded from codec indexes
//! - **Checkpointing**: resume, fine-tune, retention and weight averaging
//! - **Vocoder data**: wave segments paired with 16 kHz spectrograms
//!
//! The network architectures are supplied by the caller through the traits in
//! [`models`] and [`audio::CodecDecoder`].

pub mod audio;
pub mod error;
pub mod models;
pub mod training;

// Re-export main types
pub use error::{Error, Result};
pub use models::{AcousticModel, EmbeddingPolicy, StyleEmbedding, TrainGraph};
pub use training::{ToucanTrainer, ToucanTrainingConfig};
