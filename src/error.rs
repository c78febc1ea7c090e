//! Run-level error types.
//!
//! Per-attempt failures never surface here; they are recorded as
//! [`FailureArtifact`](crate::failure::FailureArtifact) values. These errors
//! abort the run itself (bad case file, unwritable output directory).

use std::path::PathBuf;

use thiserror::Error;

/// Result type for run-level operations
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Error types for run-level operations
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Invalid resolved configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Case file could not be read or has the wrong shape
    #[error("Case file error ({path}): {message}")]
    CaseFile { path: PathBuf, message: String },

    /// Allowlist selected nothing
    #[error("No cases selected: {0}")]
    EmptySelection(String),

    /// A (case, variant) result already exists on disk
    #[error("Result already written: {0}")]
    AlreadyRecorded(PathBuf),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// A worker task panicked or was cancelled
    #[error("Worker failed: {0}")]
    Worker(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
