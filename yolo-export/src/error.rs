//! Error types for yolo-export

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("weights file not found: {}", .0.display())]
    WeightsNotFound(PathBuf),

    #[error("incompatible weights file {}: {reason}", path.display())]
    IncompatibleWeights { path: PathBuf, reason: String },

    #[error("invalid export format '{format}', valid formats are: {valid}")]
    InvalidFormat { format: String, valid: String },

    #[error("export format '{format}' is not supported, supported formats are: {supported}")]
    UnsupportedFormat { format: String, supported: String },

    #[error("invalid image size {0}, must be a positive integer")]
    InvalidImageSize(usize),

    #[error("state dict error: {0}")]
    StateDict(String),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("invalid artifact {}: {reason}", path.display())]
    InvalidArtifact { path: PathBuf, reason: String },

    #[error("export verification failed: {0}")]
    VerificationFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("ndarray shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, Error>;
