//! AI authenticity check, the last stage.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{HandlerSettings, StageHandler};
use crate::models::{codes, DocumentRecord, QueueMessage, Stage, StageError};
use crate::services::Collaborators;

pub struct AiVerificationStage {
    collab: Collaborators,
    timeout: Duration,
    min_score: f64,
}

impl AiVerificationStage {
    pub fn new(collab: Collaborators, settings: &HandlerSettings) -> Self {
        Self {
            collab,
            timeout: settings.timeouts.ai_verification,
            min_score: settings.min_authenticity_score,
        }
    }
}

#[async_trait]
impl StageHandler for AiVerificationStage {
    fn stage(&self) -> Stage {
        Stage::AiVerification
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(
        &self,
        _message: &QueueMessage,
        document: &DocumentRecord,
    ) -> Result<Option<Value>, StageError> {
        let extracted = document.extracted_data.clone().unwrap_or_default();
        let report = self.collab.verifier.verify(document, &extracted).await?;

        self.collab
            .documents
            .update_authenticity(&document.id, &report)
            .await?;

        if report.score < self.min_score {
            return Err(StageError::permanent(
                codes::AUTHENTICITY_REJECTED,
                format!(
                    "authenticity score {:.2} below {:.2}",
                    report.score, self.min_score
                ),
            ));
        }

        serde_json::to_value(&report)
            .map(Some)
            .map_err(|e| StageError::permanent(codes::AUTHENTICITY_REJECTED, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{fixture, message, DOC};
    use crate::stages::StageRegistry;
    use std::sync::Arc;

    async fn run(score: f64) -> (crate::models::ProcessingResult, Option<f64>) {
        let (backend, collab) = fixture().await;
        backend.set_authenticity_score(DOC, score).await;
        let mut registry = StageRegistry::new(collab.documents.clone());
        registry.register(Arc::new(AiVerificationStage::new(collab, &HandlerSettings::default())));

        let result = registry.execute(&message(Stage::AiVerification)).await;
        let stored = backend.authenticity(DOC).await.map(|r| r.score);
        (result, stored)
    }

    #[tokio::test]
    async fn test_authentic_document_completes_pipeline() {
        let (result, stored) = run(0.92).await;
        assert!(result.success);
        assert_eq!(result.next_stage, None);
        assert_eq!(stored, Some(0.92));
    }

    #[tokio::test]
    async fn test_low_score_needs_manual_review() {
        let (result, stored) = run(0.31).await;
        assert!(!result.success);
        assert!(result.requires_manual_review);
        assert_eq!(result.error.unwrap().code, codes::AUTHENTICITY_REJECTED);
        assert_eq!(stored, Some(0.31));
    }
}
