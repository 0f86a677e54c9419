//! Error types for vaultgate.
//!
//! Library crates use [`VaultgateError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! The variants follow the pipeline's propagation policy:
//! - `Conflict` is resolved at the boundary where it occurs (never escalated)
//! - `Ingestion` / `Transform` are recorded against their document or work unit
//! - `Store` / `WalWrite` / `Io` are escalated: the caller stops making
//!   progress on the affected item and leaves its operation in-doubt

use std::path::PathBuf;

/// Top-level error type for all vaultgate operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultgateError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A source document could not be read or is unusable.
    #[error("ingestion error for {path:?}: {message}")]
    Ingestion { path: PathBuf, message: String },

    /// The phase transformation failed or timed out.
    #[error("transform error for work unit {work_unit}: {message}")]
    Transform { work_unit: String, message: String },

    /// An illegal state transition was attempted.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// The state database or a blob store is unavailable or returned an error.
    #[error("store error: {0}")]
    Store(String),

    /// A durable log entry could not be written.
    #[error("WAL write error: {0}")]
    WalWrite(String),

    /// Computing or registering a vector index entry failed.
    #[error("index error: {0}")]
    Index(String),

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (corrupt record, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, VaultgateError>;

impl VaultgateError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an ingestion error for a source path.
    pub fn ingestion(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Ingestion {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a transform error for a work unit.
    pub fn transform(work_unit: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transform {
            work_unit: work_unit.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error from any displayable message.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Storage-level failures: the current operation must stop and stay in-doubt.
    pub fn is_escalated(&self) -> bool {
        matches!(self, Self::Store(_) | Self::WalWrite(_) | Self::Io { .. })
    }

    /// Conflicts are surfaced to the caller but never fail a whole run.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = VaultgateError::conflict("artifact a1 is not pending");
        assert_eq!(err.to_string(), "conflict: artifact a1 is not pending");

        let err = VaultgateError::transform("wu-1", "timed out after 5s");
        assert!(err.to_string().contains("wu-1"));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn escalation_classification() {
        assert!(VaultgateError::Store("db locked".into()).is_escalated());
        assert!(VaultgateError::WalWrite("disk full".into()).is_escalated());
        assert!(!VaultgateError::conflict("x").is_escalated());
        assert!(!VaultgateError::transform("wu", "bad").is_escalated());
        assert!(VaultgateError::conflict("x").is_conflict());
    }
}
