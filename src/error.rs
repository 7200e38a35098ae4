//! Error types for Destilar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown architecture '{name}' (known: {})", known.join(", "))]
    UnknownArchitecture { name: String, known: Vec<String> },

    #[error("Teacher/student mismatch: {0}")]
    ArchitectureMismatch(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Loss is {value}, stopping training (epoch {epoch}, step {step})")]
    NonFiniteLoss { value: f32, epoch: usize, step: usize },

    #[error("Distributed error: {0}")]
    Distributed(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Plot error: {0}")]
    Plot(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Error::InvalidParameter(format!("array shape: {e}"))
    }
}
