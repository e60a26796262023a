use thiserror::Error;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Inconsistent profile: {records} forward records is not a multiple of {layers} instrumented layers")]
    RecordCountMismatch { records: usize, layers: usize },

    #[error("No backward record at position {index}")]
    MissingBackwardRecord { index: usize },

    #[error("Invalid tensor shape: {0}")]
    InvalidShape(String),

    #[error("Autograd error: {0}")]
    AutogradError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load checkpoint from {0}: {1}")]
    CheckpointError(PathBuf, String),
}
