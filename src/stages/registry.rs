//! Stage lookup and guarded execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use super::{
    AiVerificationStage, DataComparisonStage, DocumentValidationStage, HandlerSettings,
    OcrExtractionStage, StageHandler, StorageConfirmationStage,
};
use crate::models::{codes, DocumentRecord, ProcessingResult, QueueMessage, Stage, StageError};
use crate::services::{Collaborators, DocumentStore};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no handler registered for stage {0}")]
    Unregistered(Stage),
    #[error("unknown stage '{0}'")]
    UnknownStage(String),
}

/// Static map from stage to handler.
#[derive(Clone)]
pub struct StageRegistry {
    documents: Arc<dyn DocumentStore>,
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
}

impl StageRegistry {
    /// An empty registry validating documents against `documents`.
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            documents,
            handlers: HashMap::new(),
        }
    }

    /// Registry with the built-in handler for every stage.
    pub fn with_default_handlers(collab: &Collaborators, settings: &HandlerSettings) -> Self {
        let mut registry = Self::new(collab.documents.clone());
        registry.register(Arc::new(DocumentValidationStage::new(collab.clone(), settings)));
        registry.register(Arc::new(StorageConfirmationStage::new(collab.clone(), settings)));
        registry.register(Arc::new(OcrExtractionStage::new(collab.clone(), settings)));
        registry.register(Arc::new(DataComparisonStage::new(collab.clone(), settings)));
        registry.register(Arc::new(AiVerificationStage::new(collab.clone(), settings)));
        registry
    }

    /// Add or replace the handler for its stage.
    pub fn register(&mut self, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(handler.stage(), handler);
    }

    pub fn get(&self, stage: Stage) -> Result<Arc<dyn StageHandler>, RegistryError> {
        self.handlers
            .get(&stage)
            .cloned()
            .ok_or(RegistryError::Unregistered(stage))
    }

    /// Resolve a stage identifier to its handler.
    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn StageHandler>, RegistryError> {
        let stage =
            Stage::from_str(name).ok_or_else(|| RegistryError::UnknownStage(name.to_string()))?;
        self.get(stage)
    }

    /// Fail unless every stage in `stages` has a handler.
    pub fn ensure_registered(&self, stages: &[Stage]) -> Result<(), RegistryError> {
        for stage in stages {
            self.get(*stage)?;
        }
        Ok(())
    }

    pub fn stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| self.handlers.contains_key(s))
            .collect()
    }

    /// Validate and execute `message` with its stage handler.
    ///
    /// Never returns an error: validation failures, handler errors, panics
    /// and timeouts all become a failed [`ProcessingResult`].
    pub async fn execute(&self, message: &QueueMessage) -> ProcessingResult {
        let started_at = Utc::now();

        let handler = match self.get(message.stage) {
            Ok(h) => h,
            Err(e) => {
                let err = StageError::permanent(codes::UNREGISTERED_STAGE, e.to_string());
                return ProcessingResult::failed(message, started_at, err);
            }
        };

        let document = match self.validate(handler.as_ref(), message).await {
            Ok(doc) => doc,
            Err(err) => {
                debug!(document_id = %message.document_id, stage = %message.stage, error = %err, "Validation failed");
                return ProcessingResult::failed(message, started_at, err);
            }
        };

        let limit = message
            .config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| handler.timeout());

        match run_guarded(handler, message.clone(), document, limit).await {
            Ok(data) => ProcessingResult::succeeded(message, started_at, data),
            Err(err) => ProcessingResult::failed(message, started_at, err),
        }
    }

    async fn validate(
        &self,
        handler: &dyn StageHandler,
        message: &QueueMessage,
    ) -> Result<DocumentRecord, StageError> {
        if message.document_id.trim().is_empty() {
            return Err(StageError::validation("message has no document id"));
        }
        if message.stage != handler.stage() {
            return Err(StageError::permanent(
                codes::STAGE_MISMATCH,
                format!(
                    "message for {} routed to {} handler",
                    message.stage,
                    handler.stage()
                ),
            ));
        }

        let document = self
            .documents
            .get_by_id(&message.document_id)
            .await
            .map_err(StageError::from)?
            .ok_or_else(|| {
                StageError::permanent(
                    codes::DOCUMENT_NOT_FOUND,
                    format!("document {} not found", message.document_id),
                )
            })?;

        handler.validate(message, &document).await?;
        Ok(document)
    }
}

/// Run `execute` on its own task so a panic or overrun is contained.
async fn run_guarded(
    handler: Arc<dyn StageHandler>,
    message: QueueMessage,
    document: DocumentRecord,
    limit: Duration,
) -> Result<Option<serde_json::Value>, StageError> {
    let stage = message.stage;
    let mut task = tokio::spawn(async move { handler.execute(&message, &document).await });

    match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_err)) if join_err.is_panic() => {
            let panic = join_err.into_panic();
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            warn!(stage = %stage, panic = %detail, "Stage handler panicked");
            Err(StageError::panicked(detail))
        }
        Ok(Err(join_err)) => Err(StageError::panicked(join_err.to_string())),
        Err(_) => {
            task.abort();
            warn!(stage = %stage, limit_secs = limit.as_secs_f64(), "Stage handler timed out");
            Err(StageError::timeout(stage, limit))
        }
    }
}
