use mlx_rs::error::Exception;

/// Error types for toucan-mlx training
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =================== MLX Errors ===================
    /// MLX framework exception (computation errors, shape mismatches, etc.)
    #[error(transparent)]
    Exception(#[from] Exception),

    /// Weight loading/saving error from safetensors
    #[error(transparent)]
    Weights(#[from] mlx_rs::error::IoError),

    /// Malformed safetensors header or tensor data
    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),

    // =================== IO Errors ===================
    /// Standard IO error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error (checkpoint metadata, model config)
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error (training config files)
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    // =================== Training Errors ===================
    /// Invalid training configuration
    #[error("config error: {0}")]
    Config(String),

    /// Checkpoint file is missing a field or is malformed
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Required weight tensor not found in a checkpoint
    #[error("weight not found: {name}")]
    WeightNotFound { name: String },

    /// Dataset access error (empty corpus, bad index, ...)
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Collective communication failure between workers
    #[error("distributed error: {0}")]
    Distributed(String),

    // =================== Audio Errors ===================
    /// Audio processing error (WAV I/O, resampling, etc.)
    #[error("audio error: {0}")]
    Audio(String),

    /// WAV decoding/encoding error
    #[error(transparent)]
    Wav(#[from] hound::Error),

    // =================== Generic Errors ===================
    /// Simple message error (prefer more specific variants when possible)
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a weight not found error
    pub fn weight_not_found(name: impl Into<String>) -> Self {
        Self::WeightNotFound { name: name.into() }
    }

    /// Create a dataset error
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    /// Create a distributed error
    pub fn distributed(msg: impl Into<String>) -> Self {
        Self::Distributed(msg.into())
    }

    /// Create an audio error
    pub fn audio(msg: impl Into<String>) -> Self {
        Self::Audio(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
