//! Processing-log sink that writes entries as tracing events.

use async_trait::async_trait;
use tracing::info;

use super::{CollaboratorResult, ProcessingLogSink};
use crate::models::ProcessingLogEntry;

#[derive(Debug, Clone, Default)]
pub struct TracingLogSink;

#[async_trait]
impl ProcessingLogSink for TracingLogSink {
    async fn create(&self, entry: &ProcessingLogEntry) -> CollaboratorResult<()> {
        info!(
            target: "docverify::processing_log",
            document_id = %entry.document_id,
            stage = %entry.stage,
            event = ?entry.event,
            worker_id = %entry.worker_id,
            attempt = entry.attempt,
            duration_ms = entry.duration_ms,
            detail = entry.message.as_deref().unwrap_or(""),
            "processing log"
        );
        Ok(())
    }
}
