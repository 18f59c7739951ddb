//! Stage handlers and the registry that dispatches to them.
//!
//! A handler is stateless with respect to messages: everything it needs comes
//! from the message, the document record and its collaborators.

mod ai_verification;
mod comparison;
mod ocr;
mod registry;
mod upload;
mod validation;

pub use ai_verification::AiVerificationStage;
pub use comparison::DataComparisonStage;
pub use ocr::OcrExtractionStage;
pub use registry::{RegistryError, StageRegistry};
pub use upload::StorageConfirmationStage;
pub use validation::DocumentValidationStage;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::{DocumentRecord, QueueMessage, Stage, StageError};

/// One step of the verification pipeline.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    /// Upper bound on a single `execute` call.
    fn timeout(&self) -> Duration;

    /// Stage-specific checks run after the common ones. Failures are never
    /// retried.
    async fn validate(
        &self,
        _message: &QueueMessage,
        _document: &DocumentRecord,
    ) -> Result<(), StageError> {
        Ok(())
    }

    /// Do the work. Returned data is attached to the processing result.
    async fn execute(
        &self,
        message: &QueueMessage,
        document: &DocumentRecord,
    ) -> Result<Option<Value>, StageError>;
}

/// Per-stage execution limits.
#[derive(Debug, Clone)]
pub struct StageTimeouts {
    pub document_validation: Duration,
    pub s3_upload: Duration,
    pub ocr_extraction: Duration,
    pub data_comparison: Duration,
    pub ai_verification: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            document_validation: Duration::from_secs(10),
            s3_upload: Duration::from_secs(15),
            ocr_extraction: Duration::from_secs(60),
            data_comparison: Duration::from_secs(10),
            ai_verification: Duration::from_secs(45),
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::DocumentValidation => self.document_validation,
            Stage::S3Upload => self.s3_upload,
            Stage::OcrExtraction => self.ocr_extraction,
            Stage::DataComparison => self.data_comparison,
            Stage::AiVerification => self.ai_verification,
        }
    }
}

/// Business limits applied by the built-in handlers.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub timeouts: StageTimeouts,
    /// Largest accepted upload in bytes.
    pub max_file_size: u64,
    pub allowed_content_types: Vec<String>,
    /// Authenticity scores below this are rejected.
    pub min_authenticity_score: f64,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            timeouts: StageTimeouts::default(),
            max_file_size: 10 * 1024 * 1024,
            allowed_content_types: vec![
                "application/pdf".into(),
                "image/jpeg".into(),
                "image/png".into(),
                "image/webp".into(),
            ],
            min_authenticity_score: 0.7,
        }
    }
}

/// Media type without parameters, lowercased.
pub(crate) fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::models::{DocumentMetadata, Priority, ProcessingOptions, QueueMessage, Stage};
    use crate::services::{Collaborators, InMemoryCollaborators};
    use std::sync::Arc;

    pub const DOC: &str = "doc-1";
    pub const KEY: &str = "receipts/doc-1.pdf";

    /// Collaborators holding one document with a matching blob.
    pub async fn fixture() -> (Arc<InMemoryCollaborators>, Collaborators) {
        let backend = Arc::new(InMemoryCollaborators::new());
        backend.insert_document(DOC, "user-1", KEY).await;
        backend.put_blob(KEY, 2048, "application/pdf").await;
        let collab = Collaborators::from_backend(backend.clone());
        (backend, collab)
    }

    pub fn message(stage: Stage) -> QueueMessage {
        let metadata = DocumentMetadata::new("user-1", KEY, 2048, "application/pdf");
        QueueMessage::new(DOC, metadata, Priority::Medium, ProcessingOptions::default())
            .for_stage(stage)
    }
}
