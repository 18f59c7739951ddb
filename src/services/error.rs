//! Collaborator error types.

use thiserror::Error;

use crate::models::{codes, StageError};

#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection failures, timeouts and 5xx responses.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The service understood the request and refused it.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("client setup failed: {0}")]
    Setup(String),
}

impl CollaboratorError {
    /// Whether trying again later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::InvalidResponse(_))
    }
}

impl From<CollaboratorError> for StageError {
    fn from(err: CollaboratorError) -> Self {
        let message = err.to_string();
        match err {
            CollaboratorError::NotFound(_) => {
                StageError::permanent(codes::DOCUMENT_NOT_FOUND, message)
            }
            e if e.is_retryable() => {
                StageError::transient(codes::COLLABORATOR_UNAVAILABLE, message)
            }
            _ => StageError::permanent(codes::COLLABORATOR_REJECTED, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_mapping() {
        let err: StageError = CollaboratorError::Unavailable("503".into()).into();
        assert!(err.retryable);
        assert_eq!(err.code, codes::COLLABORATOR_UNAVAILABLE);

        let err: StageError = CollaboratorError::Rejected("422".into()).into();
        assert!(!err.retryable);
        assert_eq!(err.code, codes::COLLABORATOR_REJECTED);

        let err: StageError = CollaboratorError::NotFound("doc-1".into()).into();
        assert!(!err.retryable);
        assert_eq!(err.code, codes::DOCUMENT_NOT_FOUND);
    }
}
