//! Error types shared across marketcrawl crates

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by file-backed state and shared helpers
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt state file {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },
}

impl CommonError {
    /// Create a corrupt-state error for the file at `path`
    pub fn corrupt_state(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptState {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_state_message_names_path() {
        let err = CommonError::corrupt_state("/tmp/cursor.json", "page index is zero");
        let msg = err.to_string();
        assert!(msg.contains("/tmp/cursor.json"));
        assert!(msg.contains("page index is zero"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CommonError = io.into();
        assert!(matches!(err, CommonError::Io(_)));
    }
}
