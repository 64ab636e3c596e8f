//! Error types for the filedrop engine.

use thiserror::Error;

/// Errors surfaced by the engine to its callers.
///
/// Admission failures arrive synchronously from the operation's reply;
/// anything that happens after an upload was admitted (stream failure,
/// rename failure, stall cancellation) arrives through the same future the
/// caller is awaiting, carried over the upload's completion channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Folder or item name is empty after cleaning.
    #[error("name must not be empty")]
    EmptyName,

    /// Folder, item or login is absent.
    #[error("{0} not found")]
    NotFound(String),

    /// Folder name is taken, or an item of this name exists or is in flight.
    #[error("{0:?} already exists or is being uploaded")]
    Duplicate(String),

    /// Declared size exceeds the folder's per-file cap.
    #[error("the file is too large, must not exceed {limit} bytes")]
    TooLarge { limit: u64 },

    /// The folder's file-count cap is reached.
    #[error("this folder cannot accept more files")]
    CountExceeded { limit: u64 },

    /// Declared size exceeds what is left of the folder's total-size cap.
    #[error("the file is too large, demands {needed} bytes, only {available} available")]
    TotalExceeded { needed: u64, available: u64 },

    /// Too many concurrent transfers for this folder.
    #[error("maximum active transfers exceeded, try again later")]
    ConcurrencyExceeded,

    /// The upload went quiet past the stall threshold and was dropped.
    #[error("cancelled because too slow")]
    Cancelled,

    /// Invalid caller input (zero declared size, malformed fields).
    #[error("validation error: {0}")]
    Validation(String),

    /// The engine task is no longer running.
    #[error("engine is not running")]
    Stopped,

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_display() {
        assert_eq!(EngineError::Cancelled.to_string(), "cancelled because too slow");
    }

    #[test]
    fn test_not_found_display() {
        let err = EngineError::NotFound("folder \"inbox\"".to_string());
        assert_eq!(err.to_string(), "folder \"inbox\" not found");
    }

    #[test]
    fn test_total_exceeded_display() {
        let err = EngineError::TotalExceeded {
            needed: 10,
            available: 0,
        };
        assert_eq!(
            err.to_string(),
            "the file is too large, demands 10 bytes, only 0 available"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(err.to_string().contains("no such file"));
    }
}
