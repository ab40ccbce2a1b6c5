/*!
Error types for the Waypoint checkpoint engine.
*/

use thiserror::Error;
use waypoint_retry::RetryableError;

/// Result type used throughout the Waypoint core.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint operations.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Missing checkpoint, key or latest pointer
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored bytes were read but could not be decoded
    #[error("Corrupted checkpoint data: {0}")]
    Corrupted(String),

    /// A deadline elapsed during compression or backend I/O
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled before it completed
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Reserved for incompatible on-disk format versions
    #[error("Unsupported checkpoint version {found} (supported up to {supported})")]
    VersionMismatch { found: u32, supported: u32 },

    /// Integrity check failures
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Storage backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The backend does not implement an optional capability
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The component has been shut down
    #[error("Closed: {0}")]
    Closed(String),
}

impl CheckpointError {
    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new corrupted-data error
    pub fn corrupted<S: Into<String>>(msg: S) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new unsupported-operation error
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for errors raised while decoding stored bytes
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupted(_) | Self::IntegrityCheckFailed { .. } | Self::VersionMismatch { .. }
        )
    }
}

impl RetryableError for CheckpointError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

/// Convert a task join failure into a storage error
impl From<tokio::task::JoinError> for CheckpointError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled(format!("background task cancelled: {err}"))
        } else {
            Self::Storage(format!("background task failed: {err}"))
        }
    }
}
