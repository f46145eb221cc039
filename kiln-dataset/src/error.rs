use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("dataset download failed: {0}")]
    Download(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
