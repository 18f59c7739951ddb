//! OCR extraction: read payment fields off the document.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{HandlerSettings, StageHandler};
use crate::models::{codes, DocumentRecord, QueueMessage, Stage, StageError};
use crate::services::Collaborators;

pub struct OcrExtractionStage {
    collab: Collaborators,
    timeout: Duration,
}

impl OcrExtractionStage {
    pub fn new(collab: Collaborators, settings: &HandlerSettings) -> Self {
        Self {
            collab,
            timeout: settings.timeouts.ocr_extraction,
        }
    }
}

#[async_trait]
impl StageHandler for OcrExtractionStage {
    fn stage(&self) -> Stage {
        Stage::OcrExtraction
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(
        &self,
        message: &QueueMessage,
        document: &DocumentRecord,
    ) -> Result<Option<Value>, StageError> {
        let extracted = self
            .collab
            .ocr
            .extract(document, &message.config.language_hints)
            .await?;

        if extracted.raw_text.trim().is_empty() && extracted.amount_minor.is_none() {
            return Err(StageError::permanent(
                codes::MISSING_EXTRACTION,
                "no text could be read from the document",
            ));
        }
        debug!(
            document_id = %document.id,
            confidence = extracted.confidence,
            chars = extracted.raw_text.len(),
            "OCR extracted text"
        );

        self.collab
            .documents
            .update_extracted_data(&document.id, &extracted)
            .await?;

        serde_json::to_value(&extracted)
            .map(Some)
            .map_err(|e| StageError::permanent(codes::MISSING_EXTRACTION, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractedData;
    use crate::stages::testing::{fixture, message, DOC, KEY};
    use crate::stages::StageRegistry;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_extraction_is_stored() {
        let (backend, collab) = fixture().await;
        backend
            .set_extraction(
                KEY,
                ExtractedData {
                    raw_text: "TRANSFER 1,250.00 MXN REF123".into(),
                    amount_minor: Some(125_000),
                    currency: Some("MXN".into()),
                    confidence: 0.93,
                    ..Default::default()
                },
            )
            .await;
        let mut registry = StageRegistry::new(collab.documents.clone());
        registry.register(Arc::new(OcrExtractionStage::new(collab, &HandlerSettings::default())));

        let result = registry.execute(&message(Stage::OcrExtraction)).await;
        assert!(result.success);
        assert_eq!(result.next_stage, Some(Stage::DataComparison));
        let stored = backend.document(DOC).await.unwrap().extracted_data.unwrap();
        assert_eq!(stored.amount_minor, Some(125_000));
    }

    #[tokio::test]
    async fn test_blank_extraction_needs_review() {
        let (_, collab) = fixture().await;
        let mut registry = StageRegistry::new(collab.documents.clone());
        registry.register(Arc::new(OcrExtractionStage::new(collab, &HandlerSettings::default())));

        let result = registry.execute(&message(Stage::OcrExtraction)).await;
        assert!(result.requires_manual_review);
        assert_eq!(result.error.unwrap().code, codes::MISSING_EXTRACTION);
    }

    #[tokio::test]
    async fn test_engine_outage_is_retryable() {
        let (backend, collab) = fixture().await;
        backend.fail_ocr(DOC, 1).await;
        let mut registry = StageRegistry::new(collab.documents.clone());
        registry.register(Arc::new(OcrExtractionStage::new(collab, &HandlerSettings::default())));

        let result = registry.execute(&message(Stage::OcrExtraction)).await;
        assert!(result.is_retryable());
        assert_eq!(result.error.unwrap().code, codes::COLLABORATOR_UNAVAILABLE);
    }
}
