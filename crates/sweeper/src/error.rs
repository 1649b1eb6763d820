//! Error types for the sweeper daemon.
//!
//! Only configuration and dependency errors are fatal. Everything that can go
//! wrong while processing a single repository or issue is absorbed by the
//! orchestrator and recorded against the item instead.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors surfaced to the process entry point.
#[derive(Debug, Error)]
pub enum SweeperError {
    /// Configuration file missing, unreadable or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// The repository root does not exist or is not a directory
    #[error("Repository directory not found: {}", .0.display())]
    MissingRoot(PathBuf),

    /// A required external tool is not installed
    #[error("Required tool not found on PATH: {0}")]
    MissingDependency(String),

    /// The lock record could not be written or removed
    #[error("Lock file error at {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SweeperError {
    /// Process exit code for this error.
    ///
    /// `0` is reserved for normal completion, which includes "another
    /// instance is running".
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::MissingRoot(_) => 2,
            Self::MissingDependency(_) => 3,
            Self::Lock { .. } => 1,
        }
    }
}

/// Result alias for fatal sweeper operations.
pub type SweeperResult<T> = Result<T, SweeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(SweeperError::Config("bad".into()).exit_code(), 2);
        assert_eq!(
            SweeperError::MissingRoot(PathBuf::from("/nope")).exit_code(),
            2
        );
        assert_eq!(SweeperError::MissingDependency("gh".into()).exit_code(), 3);
    }

    #[test]
    fn test_missing_root_message() {
        let err = SweeperError::MissingRoot(PathBuf::from("/srv/repos"));
        assert_eq!(err.to_string(), "Repository directory not found: /srv/repos");
    }
}
