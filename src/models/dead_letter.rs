//! Terminal records for messages the pipeline gave up on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::QueueMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Snapshot of the message as it was when it failed.
    pub message: QueueMessage,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    /// False when a human retry cannot change the outcome (e.g. the
    /// document no longer exists or the message was malformed).
    pub can_retry_manually: bool,
}

impl DeadLetterEntry {
    pub fn new(message: &QueueMessage, reason: impl Into<String>, can_retry_manually: bool) -> Self {
        Self {
            message: message.clone(),
            reason: reason.into(),
            failed_at: Utc::now(),
            retry_count: message.retry_count,
            can_retry_manually,
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }
}
