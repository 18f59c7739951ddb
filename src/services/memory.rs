//! In-memory collaborators for tests and single-process runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    AuthenticityVerifier, BlobStorage, CollaboratorError, CollaboratorResult, DocumentStore,
    OcrEngine, ProcessingLogSink,
};
use crate::models::{
    AuthenticityReport, BlobInfo, ComparisonResult, DocumentRecord, DocumentStatus,
    ExtractedData, ProcessingLogEntry,
};

#[derive(Default)]
struct State {
    documents: HashMap<String, DocumentRecord>,
    blobs: HashMap<String, BlobInfo>,
    comparisons: HashMap<String, ComparisonResult>,
    authenticity: HashMap<String, AuthenticityReport>,
    logs: Vec<ProcessingLogEntry>,
    /// Extraction returned by OCR, keyed by storage key.
    extractions: HashMap<String, ExtractedData>,
    /// Score reported by the verifier, keyed by document id.
    scores: HashMap<String, f64>,
    /// Remaining injected OCR outages, keyed by document id.
    ocr_outages: HashMap<String, u32>,
}

/// Every collaborator backed by maps behind one lock.
#[derive(Clone, Default)]
pub struct InMemoryCollaborators {
    state: Arc<RwLock<State>>,
}

impl InMemoryCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queued document.
    pub async fn insert_document(&self, id: &str, user_id: &str, storage_key: &str) {
        let record = DocumentRecord {
            id: id.to_string(),
            user_id: user_id.to_string(),
            storage_key: storage_key.to_string(),
            status: DocumentStatus::Queued,
            processing_started_at: None,
            processing_completed_at: None,
            extracted_data: None,
        };
        self.state
            .write()
            .await
            .documents
            .insert(id.to_string(), record);
    }

    pub async fn put_blob(&self, key: &str, size: u64, content_type: &str) {
        self.state.write().await.blobs.insert(
            key.to_string(),
            BlobInfo {
                exists: true,
                size,
                content_type: Some(content_type.to_string()),
            },
        );
    }

    /// What OCR will read from the blob at `storage_key`.
    pub async fn set_extraction(&self, storage_key: &str, data: ExtractedData) {
        self.state
            .write()
            .await
            .extractions
            .insert(storage_key.to_string(), data);
    }

    pub async fn set_authenticity_score(&self, document_id: &str, score: f64) {
        self.state
            .write()
            .await
            .scores
            .insert(document_id.to_string(), score);
    }

    /// Make the next `count` OCR calls for the document fail as unavailable.
    pub async fn fail_ocr(&self, document_id: &str, count: u32) {
        self.state
            .write()
            .await
            .ocr_outages
            .insert(document_id.to_string(), count);
    }

    pub async fn document(&self, id: &str) -> Option<DocumentRecord> {
        self.state.read().await.documents.get(id).cloned()
    }

    pub async fn comparison(&self, id: &str) -> Option<ComparisonResult> {
        self.state.read().await.comparisons.get(id).cloned()
    }

    pub async fn authenticity(&self, id: &str) -> Option<AuthenticityReport> {
        self.state.read().await.authenticity.get(id).cloned()
    }

    pub async fn log_entries(&self, document_id: &str) -> Vec<ProcessingLogEntry> {
        self.state
            .read()
            .await
            .logs
            .iter()
            .filter(|e| e.document_id == document_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DocumentStore for InMemoryCollaborators {
    async fn get_by_id(&self, id: &str) -> CollaboratorResult<Option<DocumentRecord>> {
        Ok(self.state.read().await.documents.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        status: DocumentStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> CollaboratorResult<()> {
        let mut state = self.state.write().await;
        let doc = state
            .documents
            .get_mut(id)
            .ok_or_else(|| CollaboratorError::NotFound(id.to_string()))?;
        doc.status = status;
        if started_at.is_some() {
            doc.processing_started_at = started_at;
        }
        if completed_at.is_some() {
            doc.processing_completed_at = completed_at;
        }
        Ok(())
    }

    async fn update_extracted_data(
        &self,
        id: &str,
        data: &ExtractedData,
    ) -> CollaboratorResult<()> {
        let mut state = self.state.write().await;
        let doc = state
            .documents
            .get_mut(id)
            .ok_or_else(|| CollaboratorError::NotFound(id.to_string()))?;
        doc.extracted_data = Some(data.clone());
        Ok(())
    }

    async fn update_comparison_results(
        &self,
        id: &str,
        results: &ComparisonResult,
    ) -> CollaboratorResult<()> {
        let mut state = self.state.write().await;
        if !state.documents.contains_key(id) {
            return Err(CollaboratorError::NotFound(id.to_string()));
        }
        state.comparisons.insert(id.to_string(), results.clone());
        Ok(())
    }

    async fn update_authenticity(
        &self,
        id: &str,
        report: &AuthenticityReport,
    ) -> CollaboratorResult<()> {
        let mut state = self.state.write().await;
        if !state.documents.contains_key(id) {
            return Err(CollaboratorError::NotFound(id.to_string()));
        }
        state.authenticity.insert(id.to_string(), report.clone());
        Ok(())
    }
}

#[async_trait]
impl BlobStorage for InMemoryCollaborators {
    async fn document_info(&self, key: &str) -> CollaboratorResult<BlobInfo> {
        Ok(self
            .state
            .read()
            .await
            .blobs
            .get(key)
            .cloned()
            .unwrap_or_else(BlobInfo::missing))
    }
}

#[async_trait]
impl ProcessingLogSink for InMemoryCollaborators {
    async fn create(&self, entry: &ProcessingLogEntry) -> CollaboratorResult<()> {
        self.state.write().await.logs.push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl OcrEngine for InMemoryCollaborators {
    async fn extract(
        &self,
        document: &DocumentRecord,
        _language_hints: &[String],
    ) -> CollaboratorResult<ExtractedData> {
        let mut state = self.state.write().await;
        if let Some(remaining) = state.ocr_outages.get_mut(&document.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CollaboratorError::Unavailable("ocr engine busy".into()));
            }
        }
        Ok(state
            .extractions
            .get(&document.storage_key)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl AuthenticityVerifier for InMemoryCollaborators {
    async fn verify(
        &self,
        document: &DocumentRecord,
        extracted: &ExtractedData,
    ) -> CollaboratorResult<AuthenticityReport> {
        let state = self.state.read().await;
        let score = state
            .scores
            .get(&document.id)
            .copied()
            .unwrap_or(extracted.confidence);
        Ok(AuthenticityReport {
            score,
            flags: Vec::new(),
            model: Some("in-memory".into()),
        })
    }
}
