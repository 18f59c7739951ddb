//! Worker pool: starts, stops, scales and grades stage workers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::runner::{Worker, WorkerContext};
use crate::health::HealthStatus;
use crate::models::{Stage, WorkerInfo, WorkerStatus};
use crate::queue::QueueResult;
use crate::stages::RegistryError;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub default_workers_per_stage: usize,
    pub min_workers_per_stage: usize,
    pub max_workers_per_stage: usize,
    /// Queue depth one worker is expected to absorb.
    pub messages_per_worker: u64,
    /// How long `stop_all_workers` waits for each worker to finish.
    pub shutdown_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            default_workers_per_stage: 2,
            min_workers_per_stage: 1,
            max_workers_per_stage: 5,
            messages_per_worker: 10,
            shutdown_timeout: Duration::from_secs(90),
        }
    }
}

impl PoolSettings {
    /// `clamp(ceil(depth / messages_per_worker), min, max)`.
    pub fn desired_workers(&self, depth: u64) -> usize {
        let per = self.messages_per_worker.max(1);
        let wanted = depth.div_ceil(per) as usize;
        wanted.clamp(self.min_workers_per_stage, self.max_workers_per_stage)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealth {
    pub status: HealthStatus,
    pub total_workers: usize,
    pub erroring_workers: usize,
    pub stages_covered: usize,
    pub stages_total: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl PoolHealth {
    /// Grade from worker statuses.
    pub fn evaluate(workers: &[WorkerInfo]) -> Self {
        let stages_total = Stage::ALL.len();
        let active: Vec<&WorkerInfo> = workers.iter().filter(|w| w.status.is_active()).collect();
        let total_workers = active.len();
        let erroring_workers = active
            .iter()
            .filter(|w| w.status == WorkerStatus::Error)
            .count();
        let stages_covered = active
            .iter()
            .map(|w| w.stage)
            .collect::<HashSet<_>>()
            .len();

        let error_ratio = if total_workers == 0 {
            0.0
        } else {
            erroring_workers as f64 / total_workers as f64
        };

        let mut issues = Vec::new();
        if erroring_workers > 0 {
            issues.push(format!(
                "{} of {} workers in error state",
                erroring_workers, total_workers
            ));
        }
        if stages_covered < stages_total {
            issues.push(format!(
                "{} of {} stages have workers",
                stages_covered, stages_total
            ));
        }

        let status = if error_ratio > 0.5 || stages_covered * 2 < stages_total {
            HealthStatus::Unhealthy
        } else if error_ratio > 0.2 || stages_covered < stages_total {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            total_workers,
            erroring_workers,
            stages_covered,
            stages_total,
            issues,
        }
    }
}

struct WorkerHandle {
    stage: Stage,
    info: Arc<RwLock<WorkerInfo>>,
    token: CancellationToken,
    join: JoinHandle<()>,
}

pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    settings: PoolSettings,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl WorkerPool {
    pub fn new(ctx: Arc<WorkerContext>, settings: PoolSettings) -> Self {
        Self {
            ctx,
            settings,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Start the default number of workers for every stage.
    ///
    /// Fails before spawning anything if a stage has no handler.
    pub async fn start_workers(&self) -> Result<usize, RegistryError> {
        self.ctx.registry.ensure_registered(&Stage::ALL)?;
        let mut started = 0;
        for stage in Stage::ALL {
            started += self
                .start_workers_for_stage(stage, self.settings.default_workers_per_stage)
                .await?
                .len();
        }
        Ok(started)
    }

    /// Spawn `count` more workers for `stage`. Returns their ids.
    pub async fn start_workers_for_stage(
        &self,
        stage: Stage,
        count: usize,
    ) -> Result<Vec<String>, RegistryError> {
        self.ctx.registry.get(stage)?;

        let mut workers = self.workers.lock().await;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = format!("{}-{}", stage, &uuid::Uuid::new_v4().simple().to_string()[..8]);
            let token = CancellationToken::new();
            let worker = Worker::new(id.clone(), stage, self.ctx.clone(), token.clone());
            let info = worker.info();
            let join = tokio::spawn(worker.run());

            workers.insert(
                id.clone(),
                WorkerHandle {
                    stage,
                    info,
                    token,
                    join,
                },
            );
            ids.push(id);
        }

        info!(stage = %stage, started = count, total = workers.len(), "Started workers");
        Ok(ids)
    }

    /// Signal every worker to stop, wait for in-flight messages to finish,
    /// then flush pending retries into their queues.
    pub async fn stop_all_workers(&self) -> usize {
        let handles: Vec<(String, WorkerHandle)> = self.workers.lock().await.drain().collect();
        let count = handles.len();

        for (_, handle) in &handles {
            handle.token.cancel();
        }
        let limit = self.settings.shutdown_timeout;
        let joins = handles.into_iter().map(|(id, handle)| async move {
            match tokio::time::timeout(limit, handle.join).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(worker_id = %id, error = %e, "Worker task failed"),
                Err(_) => warn!(worker_id = %id, "Worker did not stop within timeout"),
            }
        });
        futures::future::join_all(joins).await;

        let flushed = self.ctx.scheduler.flush().await;
        info!(stopped = count, flushed_retries = flushed, "All workers stopped");
        count
    }

    /// Grow each stage toward its depth-derived target. Never shrinks.
    ///
    /// Returns the stages that gained workers and how many.
    pub async fn scale_workers(&self) -> QueueResult<Vec<(Stage, usize)>> {
        let stats = self.ctx.store.stats(None).await?;
        let current = self.active_counts().await;

        let mut added = Vec::new();
        for stage_stats in &stats.stages {
            let stage = stage_stats.stage;
            if self.ctx.registry.get(stage).is_err() {
                continue;
            }
            let have = current.get(&stage).copied().unwrap_or(0);
            let want = self.settings.desired_workers(stage_stats.depth());
            if want > have {
                if let Ok(ids) = self.start_workers_for_stage(stage, want - have).await {
                    info!(
                        stage = %stage,
                        depth = stage_stats.depth(),
                        from = have,
                        to = want,
                        "Scaled up workers"
                    );
                    added.push((stage, ids.len()));
                }
            }
        }
        Ok(added)
    }

    async fn active_counts(&self) -> HashMap<Stage, usize> {
        let workers = self.workers.lock().await;
        let mut counts = HashMap::new();
        for handle in workers.values() {
            if !handle.join.is_finished() {
                *counts.entry(handle.stage).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Snapshot of every registered worker.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let infos: Vec<Arc<RwLock<WorkerInfo>>> = self
            .workers
            .lock()
            .await
            .values()
            .map(|h| h.info.clone())
            .collect();

        let mut snapshot = Vec::with_capacity(infos.len());
        for info in infos {
            snapshot.push(info.read().await.clone());
        }
        snapshot.sort_by(|a, b| a.stage.cmp(&b.stage).then_with(|| a.id.cmp(&b.id)));
        snapshot
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn health_check(&self) -> PoolHealth {
        PoolHealth::evaluate(&self.workers().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        codes, DeadLetterEntry, DocumentMetadata, DocumentRecord, DocumentStatus, Priority,
        ProcessingOptions, QueueMessage, StageError,
    };
    use crate::queue::{
        EnqueueReceipt, InMemoryQueueStore, QueueError, QueueStats, QueueStore,
    };
    use crate::services::{Collaborators, InMemoryCollaborators};
    use crate::stages::{StageHandler, StageRegistry};
    use crate::worker::{RetryPolicy, RetryScheduler, WorkerTiming};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        stage: Stage,
        failures: u32,
        calls: AtomicU32,
        last_retry_count: AtomicU32,
    }

    impl Flaky {
        fn new(stage: Stage, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                stage,
                failures,
                calls: AtomicU32::new(0),
                last_retry_count: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl StageHandler for Flaky {
        fn stage(&self) -> Stage {
            self.stage
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn execute(
            &self,
            message: &QueueMessage,
            _document: &DocumentRecord,
        ) -> Result<Option<Value>, StageError> {
            self.last_retry_count
                .store(message.retry_count, Ordering::SeqCst);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(StageError::transient(codes::COLLABORATOR_UNAVAILABLE, "flaky"))
            } else {
                Ok(None)
            }
        }
    }

    struct Harness {
        store: InMemoryQueueStore,
        backend: Arc<InMemoryCollaborators>,
        pool: WorkerPool,
    }

    /// In-memory store whose first `outages` dequeues fail.
    struct FailingDequeue {
        inner: InMemoryQueueStore,
        outages: AtomicU32,
    }

    #[async_trait]
    impl QueueStore for FailingDequeue {
        async fn enqueue(&self, message: &QueueMessage) -> QueueResult<EnqueueReceipt> {
            self.inner.enqueue(message).await
        }

        async fn dequeue(&self, stage: Stage) -> QueueResult<Option<QueueMessage>> {
            let left = self
                .outages
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if left.is_ok() {
                return Err(QueueError::Unavailable("connection reset".to_string()));
            }
            self.inner.dequeue(stage).await
        }

        async fn peek(
            &self,
            stage: Stage,
            priority: Option<Priority>,
            limit: usize,
        ) -> QueueResult<Vec<QueueMessage>> {
            self.inner.peek(stage, priority, limit).await
        }

        async fn stats(&self, stage: Option<Stage>) -> QueueResult<QueueStats> {
            self.inner.stats(stage).await
        }

        async fn remove_message(
            &self,
            id: &str,
            stage: Stage,
            priority: Priority,
        ) -> QueueResult<bool> {
            self.inner.remove_message(id, stage, priority).await
        }

        async fn complete(
            &self,
            message: &QueueMessage,
            next: Option<&QueueMessage>,
        ) -> QueueResult<Option<EnqueueReceipt>> {
            self.inner.complete(message, next).await
        }

        async fn requeue(&self, message: &QueueMessage) -> QueueResult<EnqueueReceipt> {
            self.inner.requeue(message).await
        }

        async fn update_message(&self, message: &QueueMessage) -> QueueResult<()> {
            self.inner.update_message(message).await
        }

        async fn move_to_dead_letter(
            &self,
            message: &QueueMessage,
            reason: &str,
            can_retry_manually: bool,
        ) -> QueueResult<DeadLetterEntry> {
            self.inner
                .move_to_dead_letter(message, reason, can_retry_manually)
                .await
        }

        async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
            self.inner.dead_letters(limit).await
        }

        async fn replace_dead_letter(
            &self,
            id: &str,
            replacement: &QueueMessage,
        ) -> QueueResult<Option<EnqueueReceipt>> {
            self.inner.replace_dead_letter(id, replacement).await
        }

        async fn dead_letter(&self, id: &str) -> QueueResult<Option<DeadLetterEntry>> {
            self.inner.dead_letter(id).await
        }

        async fn recover_stale(&self, stage: Stage, lease_timeout: Duration) -> QueueResult<usize> {
            self.inner.recover_stale(stage, lease_timeout).await
        }

        async fn ping(&self) -> QueueResult<()> {
            self.inner.ping().await
        }

        async fn clear_all(&self) -> QueueResult<u64> {
            self.inner.clear_all().await
        }
    }

    async fn harness(handlers: Vec<Arc<dyn StageHandler>>) -> Harness {
        let store = InMemoryQueueStore::new();
        let (backend, pool) = pool_over(Arc::new(store.clone()), handlers).await;
        Harness {
            store,
            backend,
            pool,
        }
    }

    async fn pool_over(
        shared: Arc<dyn QueueStore>,
        handlers: Vec<Arc<dyn StageHandler>>,
    ) -> (Arc<InMemoryCollaborators>, WorkerPool) {
        let backend = Arc::new(InMemoryCollaborators::new());
        backend.insert_document("doc-1", "u-1", "k/doc-1.pdf").await;
        let collab = Collaborators::from_backend(backend.clone());

        let mut registry = StageRegistry::new(collab.documents.clone());
        for handler in handlers {
            registry.register(handler);
        }

        let ctx = Arc::new(WorkerContext {
            store: shared.clone(),
            registry: Arc::new(registry),
            collab,
            scheduler: Arc::new(RetryScheduler::new(shared)),
            retry: RetryPolicy::default(),
            timing: WorkerTiming {
                poll_interval: Duration::from_millis(100),
                error_cooldown: Duration::from_millis(500),
            },
        });

        (backend, WorkerPool::new(ctx, PoolSettings::default()))
    }

    fn message(stage: Stage) -> QueueMessage {
        let metadata = DocumentMetadata::new("u-1", "k/doc-1.pdf", 10, "application/pdf");
        QueueMessage::new("doc-1", metadata, Priority::High, ProcessingOptions::default())
            .for_stage(stage)
    }

    /// Advance paused time until `check` holds.
    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..1200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_desired_workers() {
        let s = PoolSettings::default();
        assert_eq!(s.desired_workers(0), 1);
        assert_eq!(s.desired_workers(10), 1);
        assert_eq!(s.desired_workers(11), 2);
        assert_eq!(s.desired_workers(35), 4);
        assert_eq!(s.desired_workers(500), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let flaky = Flaky::new(Stage::DataComparison, 2);
        let h = harness(vec![flaky.clone() as Arc<dyn StageHandler>]).await;
        h.store.enqueue(&message(Stage::DataComparison)).await.unwrap();
        h.pool
            .start_workers_for_stage(Stage::DataComparison, 1)
            .await
            .unwrap();

        let store = h.store.clone();
        wait_until(|| {
            let store = store.clone();
            async move {
                !store
                    .peek(Stage::AiVerification, None, 1)
                    .await
                    .unwrap()
                    .is_empty()
            }
        })
        .await;

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(flaky.last_retry_count.load(Ordering::SeqCst), 2);
        let next = h.store.peek(Stage::AiVerification, None, 1).await.unwrap();
        assert_eq!(next[0].retry_count, 0);
        assert_eq!(next[0].priority, Priority::High);
        assert!(h.store.dead_letters(10).await.unwrap().is_empty());

        let trail = h.backend.log_entries("doc-1").await;
        assert_eq!(
            trail.iter().filter(|e| e.event == crate::models::LogEvent::Retrying).count(),
            2
        );
        h.pool.stop_all_workers().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_failure_dead_letters() {
        let flaky = Flaky::new(Stage::OcrExtraction, u32::MAX);
        let h = harness(vec![flaky.clone() as Arc<dyn StageHandler>]).await;
        h.store.enqueue(&message(Stage::OcrExtraction)).await.unwrap();
        h.pool
            .start_workers_for_stage(Stage::OcrExtraction, 1)
            .await
            .unwrap();

        let store = h.store.clone();
        wait_until(|| {
            let store = store.clone();
            async move { !store.dead_letters(1).await.unwrap().is_empty() }
        })
        .await;

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
        let entry = &h.store.dead_letters(1).await.unwrap()[0];
        assert_eq!(entry.retry_count, 3);
        assert!(entry.can_retry_manually);
        let doc = h.backend.document("doc-1").await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        h.pool.stop_all_workers().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_stage_marks_document_completed() {
        let h = harness(vec![Flaky::new(Stage::AiVerification, 0) as Arc<dyn StageHandler>]).await;
        h.store.enqueue(&message(Stage::AiVerification)).await.unwrap();
        h.pool
            .start_workers_for_stage(Stage::AiVerification, 1)
            .await
            .unwrap();

        let backend = h.backend.clone();
        wait_until(|| {
            let backend = backend.clone();
            async move {
                backend.document("doc-1").await.map(|d| d.status) == Some(DocumentStatus::Completed)
            }
        })
        .await;

        let stats = h.store.stats(None).await.unwrap();
        assert_eq!(stats.total_queued(), 0);
        assert_eq!(stats.stage(Stage::AiVerification).unwrap().in_flight, 0);
        h.pool.stop_all_workers().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_workers_requires_every_handler() {
        let h = harness(vec![Flaky::new(Stage::OcrExtraction, 0) as Arc<dyn StageHandler>]).await;
        let err = h.pool.start_workers().await.unwrap_err();
        assert!(matches!(err, RegistryError::Unregistered(Stage::DocumentValidation)));
        assert_eq!(h.pool.worker_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_health() {
        let handlers: Vec<Arc<dyn StageHandler>> = Stage::ALL
            .into_iter()
            .map(|s| Flaky::new(s, 0) as Arc<dyn StageHandler>)
            .collect();
        let h = harness(handlers).await;

        assert_eq!(h.pool.health_check().await.status, HealthStatus::Unhealthy);

        assert_eq!(h.pool.start_workers().await.unwrap(), 10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let health = h.pool.health_check().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.stages_covered, 5);
        assert!(h
            .pool
            .workers()
            .await
            .iter()
            .all(|w| w.status == WorkerStatus::Idle));

        assert_eq!(h.pool.stop_all_workers().await, 10);
        assert_eq!(h.pool.worker_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_only() {
        let h = harness(vec![Flaky::new(Stage::S3Upload, u32::MAX) as Arc<dyn StageHandler>]).await;
        for _ in 0..25 {
            h.store.enqueue(&message(Stage::S3Upload)).await.unwrap();
        }

        let added = h.pool.scale_workers().await.unwrap();
        assert_eq!(added, vec![(Stage::S3Upload, 3)]);

        h.store.clear_all().await.unwrap();
        assert!(h.pool.scale_workers().await.unwrap().is_empty());
        assert_eq!(h.pool.worker_count().await, 3);
        h.pool.stop_all_workers().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_outage_cools_down_then_recovers() {
        let inner = InMemoryQueueStore::new();
        let failing = Arc::new(FailingDequeue {
            inner: inner.clone(),
            outages: AtomicU32::new(2),
        });
        let (_backend, pool) = pool_over(
            failing,
            vec![Flaky::new(Stage::OcrExtraction, 0) as Arc<dyn StageHandler>],
        )
        .await;
        let pool = Arc::new(pool);
        pool.start_workers_for_stage(Stage::OcrExtraction, 1)
            .await
            .unwrap();

        // Cooldown is 500ms per failed dequeue.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let worker = pool.workers().await.remove(0);
        assert_eq!(worker.status, WorkerStatus::Error);
        assert_eq!(worker.error_count, 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let worker = pool.workers().await.remove(0);
        assert_eq!(worker.status, WorkerStatus::Error);
        assert_eq!(worker.error_count, 2);

        tokio::time::sleep(Duration::from_millis(550)).await;
        let worker = pool.workers().await.remove(0);
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert_eq!(worker.error_count, 2);
        assert_eq!(PoolHealth::evaluate(&pool.workers().await).erroring_workers, 0);

        inner.enqueue(&message(Stage::OcrExtraction)).await.unwrap();
        let watched = pool.clone();
        wait_until(|| {
            let pool = watched.clone();
            async move { pool.workers().await[0].processed_count == 1 }
        })
        .await;

        assert_eq!(inner.peek(Stage::DataComparison, None, 1).await.unwrap().len(), 1);
        assert_eq!(pool.workers().await[0].error_count, 2);
        pool.stop_all_workers().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_recovery_during_backoff_keeps_retry_count() {
        let flaky = Flaky::new(Stage::DataComparison, u32::MAX);
        let h = harness(vec![flaky.clone() as Arc<dyn StageHandler>]).await;
        h.store.enqueue(&message(Stage::DataComparison)).await.unwrap();
        h.pool
            .start_workers_for_stage(Stage::DataComparison, 1)
            .await
            .unwrap();

        // First attempt fails; the retry waits out a 1s backoff.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);

        // The process dies here; another instance recovers the lease.
        let recovered = h
            .store
            .recover_stale(Stage::DataComparison, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let queued = h.store.peek(Stage::DataComparison, None, 1).await.unwrap();
        assert_eq!(queued[0].retry_count, 1);
        assert!(queued[0].last_error.is_some());
        h.pool.stop_all_workers().await;
    }

    #[test]
    fn test_health_grades() {
        let mut workers: Vec<WorkerInfo> = Stage::ALL
            .iter()
            .map(|s| WorkerInfo::new(format!("{}-a", s), *s))
            .collect();
        for w in &mut workers {
            w.status = WorkerStatus::Idle;
        }
        assert_eq!(PoolHealth::evaluate(&workers).status, HealthStatus::Healthy);

        workers[0].status = WorkerStatus::Error;
        workers[1].status = WorkerStatus::Error;
        // 2 of 5 erroring: above 20%
        assert_eq!(PoolHealth::evaluate(&workers).status, HealthStatus::Degraded);

        workers[2].status = WorkerStatus::Error;
        assert_eq!(PoolHealth::evaluate(&workers).status, HealthStatus::Unhealthy);

        let two_stages = vec![
            WorkerInfo::new("a".into(), Stage::DocumentValidation),
            WorkerInfo::new("b".into(), Stage::S3Upload),
        ];
        assert_eq!(PoolHealth::evaluate(&two_stages).status, HealthStatus::Unhealthy);
    }
}
