//! Priority queue store for pipeline messages.
//!
//! One logical queue per (stage, priority). Dequeue drains high before
//! medium before low, FIFO within a tier. Backends:
//! - In-memory (single process, tests and local runs)
//! - Redis (shared across processes; atomic pops via Lua)
//!
//! Dequeued messages hold an in-flight lease until the worker acknowledges
//! them with `complete`, `requeue` or `move_to_dead_letter`. Leases that are
//! never acknowledged are returned to the live queue by `recover_stale`.

mod error;
mod health;
pub mod keys;
mod memory;

#[cfg(feature = "redis-backend")]
mod redis;

pub use error::{QueueError, QueueResult};
pub use health::{QueueHealth, QueueHealthLimits, DEGRADED_RATIO};
pub use memory::InMemoryQueueStore;

#[cfg(feature = "redis-backend")]
pub use self::redis::RedisQueueStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DeadLetterEntry, Priority, QueueMessage, Stage};

/// Extra processing time estimated per message ahead in the queue.
const ESTIMATE_PER_POSITION_MS: u64 = 10_000;

/// Retention for stored records.
#[derive(Debug, Clone)]
pub struct QueueStoreConfig {
    pub message_ttl: Duration,
    pub dead_letter_ttl: Duration,
    pub metrics_ttl: Duration,
}

impl Default for QueueStoreConfig {
    fn default() -> Self {
        Self {
            message_ttl: Duration::from_secs(7 * 24 * 3600),
            dead_letter_ttl: Duration::from_secs(30 * 24 * 3600),
            metrics_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Outcome of an enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub success: bool,
    pub message_id: String,
    pub stage: Stage,
    pub priority: Priority,
    /// Cardinality of the target queue after insertion.
    pub position: u64,
    pub estimated_processing_ms: u64,
}

impl EnqueueReceipt {
    pub fn new(message: &QueueMessage, position: u64) -> Self {
        Self {
            success: true,
            message_id: message.id.clone(),
            stage: message.stage,
            priority: message.priority,
            position,
            estimated_processing_ms: estimate_processing_ms(message.priority, position),
        }
    }
}

/// Priority constant plus ten seconds per queued message.
pub fn estimate_processing_ms(priority: Priority, position: u64) -> u64 {
    priority.base_estimate_ms() + ESTIMATE_PER_POSITION_MS * position
}

/// Counters and timings for one (stage, priority).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityStats {
    pub priority: Priority,
    pub depth: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest_enqueued_at: Option<DateTime<Utc>>,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    pub removed_total: u64,
    pub avg_wait_ms: u64,
    pub throughput_per_hour: u64,
}

impl PriorityStats {
    pub fn empty(priority: Priority) -> Self {
        Self {
            priority,
            depth: 0,
            oldest_enqueued_at: None,
            newest_enqueued_at: None,
            enqueued_total: 0,
            dequeued_total: 0,
            removed_total: 0,
            avg_wait_ms: 0,
            throughput_per_hour: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStats {
    pub stage: Stage,
    /// Messages dequeued but not yet acknowledged.
    pub in_flight: u64,
    pub priorities: Vec<PriorityStats>,
}

impl StageStats {
    /// Messages waiting in the live queues of this stage.
    pub fn depth(&self) -> u64 {
        self.priorities.iter().map(|p| p.depth).sum()
    }

    pub fn oldest_enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.priorities
            .iter()
            .filter_map(|p| p.oldest_enqueued_at)
            .min()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub stages: Vec<StageStats>,
    pub dead_letter_count: u64,
}

impl QueueStats {
    pub fn total_queued(&self) -> u64 {
        self.stages.iter().map(StageStats::depth).sum()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageStats> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn oldest_enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.stages.iter().filter_map(|s| s.oldest_enqueued_at()).min()
    }
}

/// Stages covered by a stats request.
pub(crate) fn stats_scope(stage: Option<Stage>) -> Vec<Stage> {
    match stage {
        Some(s) => vec![s],
        None => Stage::ALL.to_vec(),
    }
}

/// Durable, priority-ordered, at-least-once message storage.
///
/// Implementations must make `dequeue` a single indivisible operation: two
/// concurrent callers never receive the same message.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Store a message and queue it under its own stage and priority.
    async fn enqueue(&self, message: &QueueMessage) -> QueueResult<EnqueueReceipt>;

    /// Pop the lowest-score message of the stage (high, then medium, then
    /// low) and take an in-flight lease on it.
    async fn dequeue(&self, stage: Stage) -> QueueResult<Option<QueueMessage>>;

    /// Read up to `limit` waiting messages without removing them.
    async fn peek(
        &self,
        stage: Stage,
        priority: Option<Priority>,
        limit: usize,
    ) -> QueueResult<Vec<QueueMessage>>;

    async fn stats(&self, stage: Option<Stage>) -> QueueResult<QueueStats>;

    /// Drop a waiting message. Returns false if it was not queued.
    async fn remove_message(&self, id: &str, stage: Stage, priority: Priority)
        -> QueueResult<bool>;

    /// Release the lease on `message` and, in the same atomic step, queue
    /// `next` when the run continues.
    async fn complete(
        &self,
        message: &QueueMessage,
        next: Option<&QueueMessage>,
    ) -> QueueResult<Option<EnqueueReceipt>>;

    /// Release the lease and put the (updated) message back in its queue.
    async fn requeue(&self, message: &QueueMessage) -> QueueResult<EnqueueReceipt>;

    /// Overwrite the stored body of a leased message without queueing it.
    ///
    /// Lease recovery redelivers whatever body is stored, so retry state
    /// must be saved here before the backoff starts.
    async fn update_message(&self, message: &QueueMessage) -> QueueResult<()>;

    /// Remove the message from live and in-flight structures and record a
    /// dead-letter entry.
    async fn move_to_dead_letter(
        &self,
        message: &QueueMessage,
        reason: &str,
        can_retry_manually: bool,
    ) -> QueueResult<DeadLetterEntry>;

    /// Most recent dead-letter entries first.
    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>>;

    /// Atomically drop dead-letter entry `id` and queue `replacement`.
    ///
    /// Returns `None` when the entry no longer exists (already retried).
    async fn replace_dead_letter(
        &self,
        id: &str,
        replacement: &QueueMessage,
    ) -> QueueResult<Option<EnqueueReceipt>>;

    async fn dead_letter(&self, id: &str) -> QueueResult<Option<DeadLetterEntry>>;

    /// Return leases older than `lease_timeout` to their live queue.
    async fn recover_stale(&self, stage: Stage, lease_timeout: Duration) -> QueueResult<usize>;

    /// Round-trip to the backend.
    async fn ping(&self) -> QueueResult<()>;

    /// Delete every queue, message, lease, metric and dead letter.
    async fn clear_all(&self) -> QueueResult<u64>;

    async fn health_check(&self, limits: &QueueHealthLimits) -> QueueHealth {
        if let Err(e) = self.ping().await {
            return QueueHealth::unreachable(limits, e.to_string());
        }
        match self.stats(None).await {
            Ok(stats) => {
                let oldest_age = stats
                    .oldest_enqueued_at()
                    .map(|at| (Utc::now() - at).to_std().unwrap_or_default());
                QueueHealth::evaluate(limits, stats.total_queued(), oldest_age)
            }
            Err(e) => QueueHealth::unreachable(limits, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_grows_with_position() {
        assert_eq!(estimate_processing_ms(Priority::High, 0), 30_000);
        assert_eq!(estimate_processing_ms(Priority::High, 3), 60_000);
        assert_eq!(estimate_processing_ms(Priority::Low, 1), 130_000);
    }
}
