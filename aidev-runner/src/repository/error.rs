use std::time::Duration;
use thiserror::Error;

/// Failure reported by an external collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// Worth retrying under the step's budget
    #[error("transient error: {0}")]
    Transient(String),

    #[error("{0}")]
    Persistent(String),

    /// The remote moved on; rebase onto it and push again
    #[error("push rejected, rebase required: {0}")]
    RebaseRequired(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Transient(_) | CollaboratorError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for CollaboratorError {
    fn from(err: std::io::Error) -> Self {
        CollaboratorError::Persistent(err.to_string())
    }
}

impl From<serde_json::Error> for CollaboratorError {
    fn from(err: serde_json::Error) -> Self {
        CollaboratorError::Persistent(format!("serialization failed: {}", err))
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            CollaboratorError::Transient(err.to_string())
        } else {
            CollaboratorError::Persistent(err.to_string())
        }
    }
}

pub type CollabResult<T> = std::result::Result<T, CollaboratorError>;
