//! Error types for vcp core operations.

use std::fmt;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// A branch whose transaction failed to finalize.
#[derive(Debug, Clone)]
pub struct CommitFailure {
    /// `endpoint/user/repo/branch` of the failed handle.
    pub key: String,
    /// Backend error message.
    pub message: String,
}

impl fmt::Display for CommitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

/// Errors that can occur while planning, transferring or committing
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed request: bad glob, missing branch, write outside a transaction, ...
    #[error("Invalid operation: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{source_path} and {destination_path} are not the same type of entry")]
    KindMismatch {
        source_path: String,
        destination_path: String,
    },

    /// One or more transfer units failed; every unit was still attempted.
    #[error("{failed} of {total} transfers failed (first: {first})")]
    PartialTransfer {
        failed: usize,
        total: usize,
        first: String,
    },

    /// One or more branches failed to commit; every branch was still finalized.
    #[error("Failed to commit {}", format_failures(.failures))]
    Commit { failures: Vec<CommitFailure> },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a [`Error::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Whether this error means the addressed entry does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

fn format_failures(failures: &[CommitFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_error_lists_every_branch() {
        let err = Error::Commit {
            failures: vec![
                CommitFailure {
                    key: "local/alice/data/main".into(),
                    message: "boom".into(),
                },
                CommitFailure {
                    key: "local/alice/data/dev".into(),
                    message: "bang".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("local/alice/data/main: boom"));
        assert!(msg.contains("local/alice/data/dev: bang"));
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::NotFound("x".into()).is_not_found());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(Error::from(io).is_not_found());
        assert!(!Error::validation("bad").is_not_found());
    }
}
