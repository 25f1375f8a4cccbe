//! Error types for omnisync
//!
//! This module defines the error taxonomy shared by all backends and
//! engines. The retry coordinator classifies errors by kind, never by
//! message text, so every fallible operation surfaces one of these
//! variants.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for omnisync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error during a backend operation
    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Directory not found
    #[error("Directory not found: {0}")]
    DirNotFound(String),

    /// Directory not empty
    #[error("Directory not empty: {0}")]
    DirNotEmpty(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The store asked us to slow down
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        /// Server-supplied hint for when to try again
        retry_after: Option<Duration>,
    },

    /// Temporary failure worth retrying
    #[error("Temporary failure: {0}")]
    Transient(String),

    /// Failure that retrying will not fix
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Operation the backend does not implement
    #[error("'{backend}' does not support {operation}")]
    Unsupported {
        backend: String,
        operation: &'static str,
    },

    /// Post-transfer digest comparison failed
    #[error("Hash mismatch for '{path}': {algorithm} expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        algorithm: String,
        expected: String,
        actual: String,
    },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Command-line usage error
    #[error("Usage error: {0}")]
    Usage(String),
}

/// Process exit codes, from least to most specific.
pub mod exit_code {
    /// Complete success
    pub const SUCCESS: i32 = 0;
    /// Generic failure
    pub const FAILURE: i32 = 1;
    /// Bad command line
    pub const USAGE: i32 = 2;
    /// Starting directory missing
    pub const DIR_NOT_FOUND: i32 = 3;
    /// Named object missing
    pub const FILE_NOT_FOUND: i32 = 4;
    /// Temporary errors exhausted their retries
    pub const TEMPORARY: i32 = 5;
    /// Run finished but some operations failed
    pub const PARTIAL: i32 = 6;
}

impl SyncError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify a raw I/O error into the taxonomy, keeping path context.
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => {
                Self::PermissionDenied(path.display().to_string())
            }
            _ => Self::Io { path, source },
        }
    }

    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a fatal error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Create an unsupported-operation error
    pub fn unsupported(backend: impl Into<String>, operation: &'static str) -> Self {
        Self::Unsupported {
            backend: backend.into(),
            operation,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a rate-limit error with an optional retry-after hint
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// Check if the transfer pipeline may retry after this error.
    ///
    /// `HashMismatch` is retryable but the pipeline grants it a single
    /// retry; `Cancelled` is never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::RateLimited { .. }
                | Self::Transient(_)
                | Self::HashMismatch { .. }
        )
    }

    /// Server-supplied backoff hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Map this error to a process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) | Self::Config(_) => exit_code::USAGE,
            Self::DirNotFound(_) => exit_code::DIR_NOT_FOUND,
            Self::NotFound(_) => exit_code::FILE_NOT_FOUND,
            Self::RateLimited { .. } | Self::Transient(_) | Self::Io { .. } => exit_code::TEMPORARY,
            _ => exit_code::FAILURE,
        }
    }

    /// Get the path associated with this error, if any
    pub fn path(&self) -> Option<String> {
        match self {
            Self::Io { path, .. } => Some(path.display().to_string()),
            Self::NotFound(p)
            | Self::DirNotFound(p)
            | Self::DirNotEmpty(p)
            | Self::PermissionDenied(p) => Some(p.clone()),
            Self::HashMismatch { path, .. } => Some(path.clone()),
            _ => None,
        }
    }
}

/// Result type alias for omnisync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Classify an I/O error and attach path context
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| SyncError::from_io(path, e))
    }
}
