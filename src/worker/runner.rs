//! A single worker loop bound to one stage.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::{decide, RetryDecision, RetryPolicy};
use super::scheduler::RetryScheduler;
use super::{WorkerError, WorkerTiming};
use crate::models::{
    DocumentStatus, LogEvent, ProcessingLogEntry, ProcessingResult, QueueMessage, Stage,
    WorkerInfo, WorkerStatus,
};
use crate::queue::QueueStore;
use crate::services::{CollaboratorError, Collaborators};
use crate::stages::StageRegistry;

/// Everything workers share.
pub struct WorkerContext {
    pub store: Arc<dyn QueueStore>,
    pub registry: Arc<StageRegistry>,
    pub collab: Collaborators,
    pub scheduler: Arc<RetryScheduler>,
    pub retry: RetryPolicy,
    pub timing: WorkerTiming,
}

pub struct Worker {
    info: Arc<RwLock<WorkerInfo>>,
    ctx: Arc<WorkerContext>,
    token: CancellationToken,
}

impl Worker {
    pub fn new(id: String, stage: Stage, ctx: Arc<WorkerContext>, token: CancellationToken) -> Self {
        Self {
            info: Arc::new(RwLock::new(WorkerInfo::new(id, stage))),
            ctx,
            token,
        }
    }

    /// Shared handle to this worker's observable state.
    pub fn info(&self) -> Arc<RwLock<WorkerInfo>> {
        self.info.clone()
    }

    /// Run until the token is cancelled. A message being processed is
    /// always finished first.
    pub async fn run(self) {
        let (id, stage) = {
            let info = self.info.read().await;
            (info.id.clone(), info.stage)
        };
        info!(worker_id = %id, stage = %stage, "Worker started");
        self.set_status(WorkerStatus::Idle).await;

        while !self.token.is_cancelled() {
            self.heartbeat().await;

            match self.ctx.store.dequeue(stage).await {
                Ok(None) => self.pause(self.ctx.timing.poll_interval).await,
                Ok(Some(message)) => {
                    {
                        let mut info = self.info.write().await;
                        info.status = WorkerStatus::Processing;
                        info.current_message_id = Some(message.id.clone());
                    }

                    let outcome = self.process(&id, message).await;

                    {
                        let mut info = self.info.write().await;
                        info.current_message_id = None;
                        info.status = WorkerStatus::Idle;
                    }
                    if let Err(e) = outcome {
                        self.cool_down(&id, e).await;
                    }
                }
                Err(e) => self.cool_down(&id, e.into()).await,
            }
        }

        self.set_status(WorkerStatus::Stopped).await;
        info!(worker_id = %id, stage = %stage, "Worker stopped");
    }

    async fn process(&self, worker_id: &str, message: QueueMessage) -> Result<(), WorkerError> {
        debug!(
            worker_id,
            message_id = %message.id,
            document_id = %message.document_id,
            stage = %message.stage,
            attempt = message.retry_count + 1,
            "Processing message"
        );
        self.log(worker_id, &message, LogEvent::Started, None, None).await;

        let result = self.ctx.registry.execute(&message).await;

        if result.success {
            self.info.write().await.record_processed(result.duration_ms);
            self.advance(worker_id, &message, &result).await
        } else {
            self.info.write().await.error_count += 1;
            self.handle_failure(worker_id, &message, &result).await
        }
    }

    async fn advance(
        &self,
        worker_id: &str,
        message: &QueueMessage,
        result: &ProcessingResult,
    ) -> Result<(), WorkerError> {
        match result.next_stage {
            Some(next_stage) => {
                let next = message.for_stage(next_stage);
                self.ctx.store.complete(message, Some(&next)).await?;
                info!(
                    worker_id,
                    document_id = %message.document_id,
                    stage = %message.stage,
                    next_stage = %next_stage,
                    duration_ms = result.duration_ms,
                    "Stage completed"
                );
            }
            None => {
                self.ctx.store.complete(message, None).await?;
                self.ctx
                    .collab
                    .documents
                    .update_status(
                        &message.document_id,
                        DocumentStatus::Completed,
                        None,
                        Some(Utc::now()),
                    )
                    .await?;
                info!(
                    worker_id,
                    document_id = %message.document_id,
                    duration_ms = result.duration_ms,
                    "Document verification completed"
                );
            }
        }

        self.log(
            worker_id,
            message,
            LogEvent::Completed,
            Some(result.duration_ms),
            None,
        )
        .await;
        Ok(())
    }

    async fn handle_failure(
        &self,
        worker_id: &str,
        message: &QueueMessage,
        result: &ProcessingResult,
    ) -> Result<(), WorkerError> {
        match decide(&self.ctx.retry, message, result) {
            RetryDecision::Retry {
                message: retried,
                delay,
            } => {
                // Stored under the lease so recovery redelivers the bumped count.
                self.ctx.store.update_message(&retried).await?;
                warn!(
                    worker_id,
                    document_id = %message.document_id,
                    stage = %message.stage,
                    retry_count = retried.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %result.error_message(),
                    "Stage failed, scheduling retry"
                );
                self.log(
                    worker_id,
                    message,
                    LogEvent::Retrying,
                    Some(result.duration_ms),
                    retried.last_error.clone(),
                )
                .await;
                self.ctx.scheduler.schedule(retried, delay);
            }
            RetryDecision::DeadLetter {
                reason,
                can_retry_manually,
            } => {
                self.ctx
                    .store
                    .move_to_dead_letter(message, &reason, can_retry_manually)
                    .await?;

                match self
                    .ctx
                    .collab
                    .documents
                    .update_status(
                        &message.document_id,
                        DocumentStatus::Failed,
                        None,
                        Some(Utc::now()),
                    )
                    .await
                {
                    Ok(()) | Err(CollaboratorError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }

                error!(
                    worker_id,
                    document_id = %message.document_id,
                    stage = %message.stage,
                    retry_count = message.retry_count,
                    manual_review = result.requires_manual_review,
                    reason = %reason,
                    "Document failed verification"
                );
                self.log(
                    worker_id,
                    message,
                    LogEvent::DeadLettered,
                    Some(result.duration_ms),
                    Some(reason),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Record a processing-log entry. Sink failures are logged and dropped.
    async fn log(
        &self,
        worker_id: &str,
        message: &QueueMessage,
        event: LogEvent,
        duration_ms: Option<u64>,
        detail: Option<String>,
    ) {
        let entry = ProcessingLogEntry {
            document_id: message.document_id.clone(),
            stage: message.stage,
            event,
            worker_id: worker_id.to_string(),
            attempt: message.retry_count + 1,
            duration_ms,
            message: detail,
            created_at: Utc::now(),
        };
        if let Err(e) = self.ctx.collab.logs.create(&entry).await {
            debug!(worker_id, error = %e, "Processing log write failed");
        }
    }

    async fn heartbeat(&self) {
        self.info.write().await.last_heartbeat = Utc::now();
    }

    async fn set_status(&self, status: WorkerStatus) {
        self.info.write().await.status = status;
    }

    async fn cool_down(&self, worker_id: &str, err: WorkerError) {
        {
            let mut info = self.info.write().await;
            info.error_count += 1;
            info.status = WorkerStatus::Error;
        }
        error!(worker_id, error = %err, "Worker error, cooling down");
        self.pause(self.ctx.timing.error_cooldown).await;
        self.set_status(WorkerStatus::Idle).await;
    }

    /// Sleep, waking early on cancellation.
    async fn pause(&self, duration: std::time::Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.token.cancelled() => {}
        }
    }
}
