//! Storage confirmation: the stored object matches what was declared.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{essence, HandlerSettings, StageHandler};
use crate::models::{codes, DocumentRecord, QueueMessage, Stage, StageError};
use crate::services::Collaborators;

pub struct StorageConfirmationStage {
    collab: Collaborators,
    timeout: Duration,
}

impl StorageConfirmationStage {
    pub fn new(collab: Collaborators, settings: &HandlerSettings) -> Self {
        Self {
            collab,
            timeout: settings.timeouts.s3_upload,
        }
    }
}

#[async_trait]
impl StageHandler for StorageConfirmationStage {
    fn stage(&self) -> Stage {
        Stage::S3Upload
    }

    fn timeout(&self) -> Duration {
        self.timeout
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

        // Object listings can lag behind the write.
        if !blob.exists {
            return Err(StageError::transient(
                codes::BLOB_MISSING,
                format!("object {} not visible yet", document.storage_key),
            ));
        }

        let declared = &message.metadata;
        if blob.size != declared.file_size {
            return Err(StageError::permanent(
                codes::BLOB_MISMATCH,
                format!(
                    "stored size {} differs from declared {}",
                    blob.size, declared.file_size
                ),
            ));
        }
        if let Some(stored) = &blob.content_type {
            if essence(stored) != essence(&declared.content_type) {
                return Err(StageError::permanent(
                    codes::BLOB_MISMATCH,
                    format!(
                        "stored type {} differs from declared {}",
                        stored, declared.content_type
                    ),
                ));
            }
        }

        Ok(Some(json!({
            "storage_key": document.storage_key,
            "size": blob.size,
        })))
    }
}
