use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No prompt provided")]
    EmptyPrompt,

    #[error("invalid `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("no LoRA weights found in {} (available: {})", dir.display(), available.join(", "))]
    AdapterNotFound { dir: PathBuf, available: Vec<String> },

    #[error("failed to load weights: {0}")]
    WeightLoading(String),

    #[error("translation service error: {0}")]
    Translation(String),

    #[error("image generation failed: {0}")]
    Inference(String),

    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("hub error: {0}")]
    Hub(#[from] hf_hub::api::tokio::ApiError),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub fn weights(msg: impl std::fmt::Display) -> Self {
        Self::WeightLoading(msg.to_string())
    }

    /// True when the failure was caused by the caller's input rather than the pipeline.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::EmptyPrompt | Self::InvalidParameter { .. })
    }
}
