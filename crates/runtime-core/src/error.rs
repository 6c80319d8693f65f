//! Error types for the fault-tolerant training runtime

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{Rank, Step};

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the fault-tolerant training runtime
#[derive(Error, Debug)]
pub enum Error {
    // Worker errors
    #[error("Worker rank {rank} failed ({status}): {stderr_tail}")]
    WorkerFailed {
        rank: Rank,
        status: String,
        stderr_tail: String,
    },

    #[error("Worker rank {rank} panicked: {message}")]
    WorkerPanicked { rank: Rank, message: String },

    #[error("Failed to spawn worker rank {rank}: {message}")]
    SpawnFailed { rank: Rank, message: String },

    // Checkpoint errors
    #[error("Checkpoint write failed at step {step}: {message}")]
    CheckpointWriteFailed { step: Step, message: String },

    #[error("Checkpoint corrupted: {} - {reason}", location.display())]
    CheckpointCorrupted { location: PathBuf, reason: String },

    #[error("No valid checkpoint found for recovery")]
    NoCheckpointForRecovery,

    // State codec errors
    #[error("State codec error: {0}")]
    Codec(String),

    // Coordination errors
    #[error("Barrier failed: {message}")]
    BarrierFailed { message: String },

    #[error("Job terminated by shutdown signal")]
    Terminated,

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    // Timeout errors
    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
}

impl Error {
    /// Shorthand for an [`Error::InvalidConfig`]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns true if this error is the graceful-termination outcome
    pub fn is_terminated(&self) -> bool {
        matches!(self, Error::Terminated)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
