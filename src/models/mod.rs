//! Data models for the verification pipeline.

mod dead_letter;
mod document;
mod message;
mod result;
mod stage;
mod worker;

pub use dead_letter::DeadLetterEntry;
pub use document::{
    AuthenticityReport, BlobInfo, ComparisonResult, DocumentRecord, DocumentStatus,
    ExtractedData, FieldComparison, LogEvent, ProcessingLogEntry,
};
pub use message::{
    DocumentMetadata, ExpectedPayment, MessageFieldError, ProcessingOptions, QueueMessage,
    enqueued_at_from_score, score_for, DEFAULT_MAX_RETRIES, SCHEMA_VERSION,
};
pub use result::{codes, ProcessingResult, StageError};
pub use stage::{Priority, Stage};
pub use worker::{WorkerInfo, WorkerStatus};
