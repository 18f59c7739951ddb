//! Document validation: the upload is well-formed and present.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use super::{essence, HandlerSettings, StageHandler};
use crate::models::{codes, DocumentRecord, DocumentStatus, QueueMessage, Stage, StageError};
use crate::services::Collaborators;

pub struct DocumentValidationStage {
    collab: Collaborators,
    timeout: Duration,
    max_file_size: u64,
    allowed_content_types: Vec<String>,
}

impl DocumentValidationStage {
    pub fn new(collab: Collaborators, settings: &HandlerSettings) -> Self {
        Self {
            collab,
            timeout: settings.timeouts.document_validation,
            max_file_size: settings.max_file_size,
            allowed_content_types: settings
                .allowed_content_types
                .iter()
                .map(|c| essence(c))
                .collect(),
        }
    }
}

#[async_trait]
impl StageHandler for DocumentValidationStage {
    fn stage(&self) -> Stage {
        Stage::DocumentValidation
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn validate(
        &self,
        message: &QueueMessage,
        document: &DocumentRecord,
    ) -> Result<(), StageError> {
        let meta = &message.metadata;
        if meta.storage_key.trim().is_empty() {
            return Err(StageError::validation("metadata has no storage key"));
        }
        if meta.storage_key != document.storage_key {
            return Err(StageError::validation(format!(
                "storage key {} does not belong to document {}",
                meta.storage_key, document.id
            )));
        }
        if meta.file_size == 0 {
            return Err(StageError::validation("file is empty"));
        }
        if meta.file_size > self.max_file_size {
            return Err(StageError::validation(format!(
                "file size {} exceeds limit {}",
                meta.file_size, self.max_file_size
            )));
        }
        let content_type = essence(&meta.content_type);
        if !self.allowed_content_types.contains(&content_type) {
            return Err(StageError::permanent(
                codes::UNSUPPORTED_CONTENT,
                format!("content type {} is not accepted", content_type),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        message: &QueueMessage,
        document: &DocumentRecord,
    ) -> Result<Option<Value>, StageError> {
        let blob = self
            .collab
            .blobs
            .document_info(&document.storage_key)
            .await?;
        if !blob.exists {
            return Err(StageError::permanent(
                codes::BLOB_MISSING,
                format!("no object at {}", document.storage_key),
            ));
        }

        self.collab
            .documents
            .update_status(
                &document.id,
                DocumentStatus::Processing,
                Some(Utc::now()),
                None,
            )
            .await?;

        Ok(Some(json!({
            "file_size": message.metadata.file_size,
            "content_type": essence(&message.metadata.content_type),
        })))
    }
}
