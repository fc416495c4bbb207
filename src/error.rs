//! Error taxonomy for the training core.
//!
//! Configuration problems fail fast at construction, sampling before the
//! buffer is warm reports `InsufficientData`, and checkpoint/IO failures carry
//! the offending path. Contract violations inside a training step (mismatched
//! `Qt`/`Gt` shapes) are assertions, not variants of this enum.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, TraderError>;

#[derive(Debug, Error)]
pub enum TraderError {
    /// Invalid or inconsistent configuration (action space, asset count, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// Requested more samples than the replay buffer holds
    #[error("insufficient data: requested {requested} samples but buffer holds {available}")]
    InsufficientData { requested: usize, available: usize },

    /// Tensor or record shape does not match what the agent was built for
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Failure reported by the environment collaborator
    #[error("environment error: {0}")]
    Environment(String),

    /// Checkpoint could not be read, written or applied
    #[error("checkpoint error at {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TraderError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        TraderError::Config(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        TraderError::Shape(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TraderError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_data_message() {
        let err = TraderError::InsufficientData {
            requested: 8,
            available: 3,
        };
        assert_eq!(
            err.to_string(),
            "insufficient data: requested 8 samples but buffer holds 3"
        );
    }

    #[test]
    fn test_serde_error_converts() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: TraderError = parse.unwrap_err().into();
        assert!(matches!(err, TraderError::Serialization(_)));
    }
}
