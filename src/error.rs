use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// One of the four MNIST idx files is not in the data directory.
    #[error("MNIST file not found: {}", path.display())]
    MissingDataset { path: PathBuf },

    /// An idx file whose header or length does not match MNIST.
    #[error("invalid MNIST file {}: {reason}", path.display())]
    InvalidDataset { path: PathBuf, reason: String },

    #[error("expected {expected} bytes (28x28 image), got {got} bytes")]
    InvalidImage { expected: usize, got: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("dataset split is empty")]
    EmptyDataset,
}
