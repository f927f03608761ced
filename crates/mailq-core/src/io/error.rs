//! Error types for lock-guarded file operations

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while locking or atomically rewriting a file
#[derive(Error, Debug)]
pub enum LockError {
    /// Lock was not obtained within the allowed time or retry budget
    #[error("Failed to acquire lock on {path} after {attempts} attempts ({waited:?})")]
    Timeout {
        path: PathBuf,
        attempts: u32,
        waited: Duration,
    },

    /// File I/O error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl LockError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is a lock timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
