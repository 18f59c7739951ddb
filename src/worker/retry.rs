//! Retry and dead-letter decisions for failed stage runs.

use std::time::Duration;

use crate::models::{codes, ProcessingResult, QueueMessage};

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^retry_count, max)`, from the count before increment.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base.saturating_mul(factor));
        delay.min(self.max_delay)
    }
}

/// Backoff under the default policy.
pub fn backoff_delay(retry_count: u32) -> Duration {
    RetryPolicy::default().backoff_delay(retry_count)
}

#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// Re-enqueue `message` (already incremented) after `delay`.
    Retry {
        message: QueueMessage,
        delay: Duration,
    },
    DeadLetter {
        reason: String,
        can_retry_manually: bool,
    },
}

/// Failures a human retry cannot fix.
fn hopeless(code: &str) -> bool {
    matches!(
        code,
        codes::DOCUMENT_NOT_FOUND
            | codes::STAGE_MISMATCH
            | codes::VALIDATION_FAILED
            | codes::UNREGISTERED_STAGE
    )
}

pub fn decide(policy: &RetryPolicy, message: &QueueMessage, result: &ProcessingResult) -> RetryDecision {
    let reason = result.error_message();

    if result.is_retryable() && message.has_retries_left() {
        return RetryDecision::Retry {
            delay: policy.backoff_delay(message.retry_count),
            message: message.retried(reason),
        };
    }

    let can_retry_manually = result
        .error
        .as_ref()
        .map(|e| !hopeless(&e.code))
        .unwrap_or(true);
    let reason = if result.is_retryable() {
        format!("retries exhausted after {} attempts: {}", message.retry_count + 1, reason)
    } else {
        reason
    };

    RetryDecision::DeadLetter {
        reason,
        can_retry_manually,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentMetadata, Priority, ProcessingOptions, StageError};
    use chrono::Utc;

    fn message(retry_count: u32) -> QueueMessage {
        let metadata = DocumentMetadata::new("u", "k", 1, "application/pdf");
        let mut msg = QueueMessage::new("doc", metadata, Priority::High, ProcessingOptions::default());
        msg.retry_count = retry_count;
        msg
    }

    fn failure(msg: &QueueMessage, err: StageError) -> ProcessingResult {
        ProcessingResult::failed(msg, Utc::now(), err)
    }

    #[test]
    fn test_backoff_sequence() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(5), Duration::from_millis(32_000));
        assert_eq!(backoff_delay(6), Duration::from_millis(60_000));
        assert_eq!(backoff_delay(40), Duration::from_millis(60_000));
        assert_eq!(backoff_delay(200), Duration::from_millis(60_000));
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let msg = message(1);
        let result = failure(&msg, StageError::transient(codes::STAGE_TIMEOUT, "slow"));

        match decide(&RetryPolicy::default(), &msg, &result) {
            RetryDecision::Retry { message, delay } => {
                assert_eq!(message.retry_count, 2);
                assert_eq!(message.id, msg.id);
                assert!(message.last_error.unwrap().contains("slow"));
                assert_eq!(delay, Duration::from_millis(2000));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_exhausted_budget_dead_letters() {
        let msg = message(3);
        let result = failure(&msg, StageError::transient(codes::COLLABORATOR_UNAVAILABLE, "503"));

        match decide(&RetryPolicy::default(), &msg, &result) {
            RetryDecision::DeadLetter { reason, can_retry_manually } => {
                assert!(reason.contains("retries exhausted"));
                assert!(can_retry_manually);
            }
            other => panic!("expected dead letter, got {:?}", other),
        }
    }

    #[test]
    fn test_permanent_failure_skips_retries() {
        let msg = message(0);
        let result = failure(&msg, StageError::validation("no document id"));

        match decide(&RetryPolicy::default(), &msg, &result) {
            RetryDecision::DeadLetter { can_retry_manually, .. } => assert!(!can_retry_manually),
            other => panic!("expected dead letter, got {:?}", other),
        }
    }
}
