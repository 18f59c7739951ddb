//! Queue store error types.

use thiserror::Error;

use crate::models::MessageFieldError;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[cfg(feature = "redis-backend")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt message {id}: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: MessageFieldError,
    },
    #[error("Message not found: {0}")]
    NotFound(String),
    #[error("Dead-letter entry {0} cannot be retried manually")]
    NotRetryable(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}
