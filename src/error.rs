//! Per-episode failure taxonomy. The `Display` text is what ends up in the
//! progress failure map, so it is written for people.

use std::path::PathBuf;

/// Result type for episode processing
pub type ProcessingResult<T> = std::result::Result<T, ProcessingError>;

#[derive(thiserror::Error, Debug)]
pub enum ProcessingError {
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Could not determine duration: {0}")]
    DurationProbe(String),

    #[error("Invalid duration ({0:.1}s)")]
    InvalidDuration(f64),

    #[error("{0}")]
    DetectionFailed(String),

    #[error("Failed to save marker: {0}")]
    Store(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl ProcessingError {
    /// True when `error` carries a [`ProcessingError::Cancelled`]
    pub fn is_cancellation(error: &anyhow::Error) -> bool {
        matches!(error.downcast_ref::<ProcessingError>(), Some(ProcessingError::Cancelled))
    }
}
