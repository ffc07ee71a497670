//! Unified error handling for ctxsync
//!
//! Invariant violations are never retried: they mean the caller or the
//! configuration is wrong, and nothing has been emitted for the operation
//! that reported them.

use thiserror::Error;

/// Main error type for ctxsync operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/Deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found errors
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Broken engine invariant with source location.
    /// Use the `sync_invariant!()` macro to create these.
    #[error("Invariant violated: {message} (at {file}:{line})")]
    Invariant {
        message: String,
        file: &'static str,
        line: u32,
    },
}

/// Create an invariant violation with automatic file/line capture.
///
/// ```rust,ignore
/// use ctxsync_core::sync_invariant;
/// return Err(sync_invariant!("credit mismatch on {}", port));
/// ```
#[macro_export]
macro_rules! sync_invariant {
    ($($arg:tt)*) => {
        $crate::error::SyncError::Invariant {
            message: format!($($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// Convenience type alias for Results using SyncError
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Short alias, equivalent to `SyncResult<T>`
pub type Result<T> = SyncResult<T>;

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::Serialization(format!("TOML serialization error: {}", err))
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(err: serde_yaml::Error) -> Self {
        SyncError::Config(format!("YAML parse error: {}", err))
    }
}

impl SyncError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        SyncError::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        SyncError::InvalidInput(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        SyncError::NotFound(msg.into())
    }

    /// Whether this error is an invariant violation
    pub fn is_invariant(&self) -> bool {
        matches!(self, SyncError::Invariant { .. })
    }
}
