//! Outcome of running one stage against one message.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::message::QueueMessage;
use super::stage::Stage;

/// Error codes shared by the built-in stages.
pub mod codes {
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const DOCUMENT_NOT_FOUND: &str = "DOCUMENT_NOT_FOUND";
    pub const STAGE_MISMATCH: &str = "STAGE_MISMATCH";
    pub const UNREGISTERED_STAGE: &str = "UNREGISTERED_STAGE";
    pub const STAGE_TIMEOUT: &str = "STAGE_TIMEOUT";
    pub const HANDLER_PANIC: &str = "HANDLER_PANIC";
    pub const COLLABORATOR_UNAVAILABLE: &str = "COLLABORATOR_UNAVAILABLE";
    pub const COLLABORATOR_REJECTED: &str = "COLLABORATOR_REJECTED";
    pub const BLOB_MISSING: &str = "BLOB_MISSING";
    pub const BLOB_MISMATCH: &str = "BLOB_MISMATCH";
    pub const UNSUPPORTED_CONTENT: &str = "UNSUPPORTED_CONTENT";
    pub const DATA_MISMATCH: &str = "DATA_MISMATCH";
    pub const MISSING_EXTRACTION: &str = "MISSING_EXTRACTION";
    pub const AUTHENTICITY_REJECTED: &str = "AUTHENTICITY_REJECTED";
}

/// A stage failure as reported to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct StageError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl StageError {
    /// A failure worth retrying (network, storage, OCR hiccups).
    pub fn transient(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not go away on its own.
    pub fn permanent(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::permanent(codes::VALIDATION_FAILED, message)
    }

    pub fn timeout(stage: Stage, limit: Duration) -> Self {
        Self::transient(
            codes::STAGE_TIMEOUT,
            format!("{} exceeded {}s", stage, limit.as_secs_f64()),
        )
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::transient(codes::HANDLER_PANIC, message)
    }
}

/// Result of one stage execution, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub success: bool,
    pub stage: Stage,
    pub document_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    /// Derived from stage order on success; never set by handlers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<Stage>,
    pub requires_manual_review: bool,
}

impl ProcessingResult {
    pub fn succeeded(
        message: &QueueMessage,
        started_at: DateTime<Utc>,
        data: Option<serde_json::Value>,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            success: true,
            stage: message.stage,
            document_id: message.document_id.clone(),
            started_at,
            completed_at,
            duration_ms: elapsed_ms(started_at, completed_at),
            data,
            error: None,
            next_stage: message.stage.next(),
            requires_manual_review: false,
        }
    }

    pub fn failed(message: &QueueMessage, started_at: DateTime<Utc>, error: StageError) -> Self {
        let completed_at = Utc::now();
        Self {
            success: false,
            stage: message.stage,
            document_id: message.document_id.clone(),
            started_at,
            completed_at,
            duration_ms: elapsed_ms(started_at, completed_at),
            data: None,
            requires_manual_review: !error.retryable,
            error: Some(error),
            next_stage: None,
        }
    }

    /// Whether the failure itself permits a retry (budget not considered).
    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().map(|e| e.retryable).unwrap_or(true)
    }

    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown failure".to_string())
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentMetadata, Priority, ProcessingOptions};

    fn message(stage: Stage) -> QueueMessage {
        let metadata = DocumentMetadata::new("u", "k", 10, "image/jpeg");
        QueueMessage::new("doc-9", metadata, Priority::Low, ProcessingOptions::default())
            .for_stage(stage)
    }

    #[test]
    fn test_validation_success_leads_to_upload() {
        let result = ProcessingResult::succeeded(&message(Stage::DocumentValidation), Utc::now(), None);
        assert_eq!(result.next_stage, Some(Stage::S3Upload));
        assert!(!result.requires_manual_review);
    }

    #[test]
    fn test_last_stage_has_no_next() {
        let result = ProcessingResult::succeeded(&message(Stage::AiVerification), Utc::now(), None);
        assert!(result.success);
        assert_eq!(result.next_stage, None);
    }

    #[test]
    fn test_manual_review_only_for_permanent_failures() {
        let msg = message(Stage::OcrExtraction);
        let transient = ProcessingResult::failed(
            &msg,
            Utc::now(),
            StageError::transient(codes::COLLABORATOR_UNAVAILABLE, "503"),
        );
        assert!(!transient.requires_manual_review);
        assert!(transient.is_retryable());
        assert_eq!(transient.next_stage, None);

        let permanent =
            ProcessingResult::failed(&msg, Utc::now(), StageError::validation("no document id"));
        assert!(permanent.requires_manual_review);
        assert!(!permanent.is_retryable());
    }
}
