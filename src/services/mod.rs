//! Collaborators the pipeline talks to.
//!
//! Each collaborator has a narrow async trait. Backends:
//! - In-memory (tests and local runs)
//! - HTTP (a JSON service fronting the document database, blob storage,
//!   OCR and authenticity model)

mod error;
mod http;
mod log_sink;
mod memory;

pub use error::CollaboratorError;
pub use http::HttpCollaborators;
pub use log_sink::TracingLogSink;
pub use memory::InMemoryCollaborators;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    AuthenticityReport, BlobInfo, ComparisonResult, DocumentRecord, DocumentStatus,
    ExtractedData, ProcessingLogEntry,
};

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Document metadata persistence.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> CollaboratorResult<Option<DocumentRecord>>;

    async fn update_status(
        &self,
        id: &str,
        status: DocumentStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> CollaboratorResult<()>;

    async fn update_extracted_data(&self, id: &str, data: &ExtractedData)
        -> CollaboratorResult<()>;

    async fn update_comparison_results(
        &self,
        id: &str,
        results: &ComparisonResult,
    ) -> CollaboratorResult<()>;

    async fn update_authenticity(
        &self,
        id: &str,
        report: &AuthenticityReport,
    ) -> CollaboratorResult<()>;
}

/// Blob storage existence and metadata checks.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn document_info(&self, key: &str) -> CollaboratorResult<BlobInfo>;
}

/// Append-only processing trail. Callers ignore failures.
#[async_trait]
pub trait ProcessingLogSink: Send + Sync {
    async fn create(&self, entry: &ProcessingLogEntry) -> CollaboratorResult<()>;
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn extract(
        &self,
        document: &DocumentRecord,
        language_hints: &[String],
    ) -> CollaboratorResult<ExtractedData>;
}

#[async_trait]
pub trait AuthenticityVerifier: Send + Sync {
    async fn verify(
        &self,
        document: &DocumentRecord,
        extracted: &ExtractedData,
    ) -> CollaboratorResult<AuthenticityReport>;
}

/// The full set of collaborators handed to stages and workers.
#[derive(Clone)]
pub struct Collaborators {
    pub documents: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStorage>,
    pub logs: Arc<dyn ProcessingLogSink>,
    pub ocr: Arc<dyn OcrEngine>,
    pub verifier: Arc<dyn AuthenticityVerifier>,
}

impl Collaborators {
    /// Use one backend for every collaborator.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: DocumentStore + BlobStorage + ProcessingLogSink + OcrEngine + AuthenticityVerifier + 'static,
    {
        Self {
            documents: backend.clone(),
            blobs: backend.clone(),
            logs: backend.clone(),
            ocr: backend.clone(),
            verifier: backend,
        }
    }

    /// Replace the processing-log sink.
    pub fn with_log_sink(mut self, logs: Arc<dyn ProcessingLogSink>) -> Self {
        self.logs = logs;
        self
    }
}
