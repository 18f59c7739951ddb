//! Pipeline orchestrator: the entry point for document processing.
//!
//! Owns the worker pool and a monitor task that scales workers by queue
//! depth and returns expired in-flight leases to their queues.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::HealthStatus;
use crate::models::{
    DeadLetterEntry, DocumentMetadata, Priority, ProcessingOptions, QueueMessage, Stage,
    WorkerInfo,
};
use crate::queue::{
    EnqueueReceipt, QueueError, QueueHealth, QueueHealthLimits, QueueStats, QueueStore,
};
use crate::stages::RegistryError;
use crate::worker::{PoolHealth, WorkerPool};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error("pipeline is not running")]
    NotRunning,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// How often the monitor scales workers and recovers leases.
    pub monitor_interval: Duration,
    /// In-flight messages older than this are redelivered.
    pub lease_timeout: Duration,
    pub max_retries: u32,
    pub queue_limits: QueueHealthLimits,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(15 * 60),
            max_retries: crate::models::DEFAULT_MAX_RETRIES,
            queue_limits: QueueHealthLimits::default(),
        }
    }
}

/// Combined health of the queue store and the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineHealth {
    pub status: HealthStatus,
    pub running: bool,
    pub queue: QueueHealth,
    pub workers: PoolHealth,
}

struct Running {
    token: CancellationToken,
    monitor: JoinHandle<()>,
}

pub struct Pipeline {
    store: Arc<dyn QueueStore>,
    pool: Arc<WorkerPool>,
    settings: PipelineSettings,
    running: Mutex<Option<Running>>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn QueueStore>, pool: Arc<WorkerPool>, settings: PipelineSettings) -> Self {
        Self {
            store,
            pool,
            settings,
            running: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start workers for every stage and the monitor.
    pub async fn start(&self) -> PipelineResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let started = self.pool.start_workers().await?;

        let token = CancellationToken::new();
        let monitor = tokio::spawn(monitor_loop(
            self.store.clone(),
            self.pool.clone(),
            self.settings.clone(),
            token.clone(),
        ));
        *running = Some(Running { token, monitor });

        info!(workers = started, "Pipeline started");
        Ok(())
    }

    /// Stop the monitor, then the workers. In-flight messages finish and
    /// pending retries are flushed back into their queues.
    pub async fn stop(&self) -> PipelineResult<()> {
        let Some(state) = self.running.lock().await.take() else {
            return Err(PipelineError::NotRunning);
        };

        state.token.cancel();
        match tokio::time::timeout(Duration::from_secs(30), state.monitor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Pipeline monitor task panicked"),
            Err(_) => warn!("Pipeline monitor did not stop within timeout"),
        }

        let stopped = self.pool.stop_all_workers().await;
        info!(workers = stopped, "Pipeline stopped");
        Ok(())
    }

    /// Queue a document at the first stage.
    pub async fn start_document_processing(
        &self,
        document_id: &str,
        metadata: DocumentMetadata,
        priority: Priority,
        options: ProcessingOptions,
    ) -> PipelineResult<EnqueueReceipt> {
        if document_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("document id is empty".into()));
        }

        let mut message = QueueMessage::new(document_id, metadata, priority, options);
        message.max_retries = self.settings.max_retries;

        let receipt = self.store.enqueue(&message).await?;
        info!(
            document_id,
            message_id = %receipt.message_id,
            priority = %priority,
            position = receipt.position,
            "Document queued for verification"
        );
        Ok(receipt)
    }

    pub async fn get_health_status(&self) -> PipelineHealth {
        let queue = self.store.health_check(&self.settings.queue_limits).await;
        let workers = self.pool.health_check().await;
        PipelineHealth {
            status: queue.status.combine(workers.status),
            running: self.is_running().await,
            queue,
            workers,
        }
    }

    pub async fn get_queue_stats(&self, stage: Option<Stage>) -> PipelineResult<QueueStats> {
        Ok(self.store.stats(stage).await?)
    }

    /// Delete all queue data. Destructive.
    pub async fn clear_all_queues(&self) -> PipelineResult<u64> {
        let deleted = self.store.clear_all().await?;
        warn!(deleted, "All queues cleared");
        Ok(deleted)
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        self.pool.workers().await
    }

    pub async fn dead_letters(&self, limit: usize) -> PipelineResult<Vec<DeadLetterEntry>> {
        Ok(self.store.dead_letters(limit).await?)
    }

    /// Give a dead-lettered message a fresh run at the stage it failed in.
    pub async fn retry_dead_letter(&self, id: &str) -> PipelineResult<EnqueueReceipt> {
        let entry = self
            .store
            .dead_letter(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        if !entry.can_retry_manually {
            return Err(QueueError::NotRetryable(format!(
                "{} cannot be retried: {}",
                id, entry.reason
            ))
            .into());
        }

        let replacement = entry.message.for_stage(entry.message.stage);
        let receipt = self
            .store
            .replace_dead_letter(id, &replacement)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        info!(
            dead_letter_id = id,
            message_id = %receipt.message_id,
            document_id = %entry.message.document_id,
            stage = %receipt.stage,
            "Dead letter re-queued"
        );
        Ok(receipt)
    }
}

async fn monitor_loop(
    store: Arc<dyn QueueStore>,
    pool: Arc<WorkerPool>,
    settings: PipelineSettings,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(settings.monitor_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for stage in Stage::ALL {
            match store.recover_stale(stage, settings.lease_timeout).await {
                Ok(0) => {}
                Ok(n) => info!(stage = %stage, recovered = n, "Recovered stale messages"),
                Err(e) => warn!(stage = %stage, error = %e, "Lease recovery failed"),
            }
        }

        match pool.scale_workers().await {
            Ok(added) if added.is_empty() => debug!("Worker counts unchanged"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Worker scaling failed"),
        }
    }

    debug!("Pipeline monitor stopped");
}
