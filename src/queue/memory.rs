//! In-memory queue store for single-process operation.
//!
//! Every operation takes the single state lock, which makes each one atomic
//! the same way a Redis script is. State is not persisted across restarts.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    stats_scope, EnqueueReceipt, PriorityStats, QueueError, QueueResult, QueueStats, QueueStore,
    StageStats,
};
use crate::models::{
    enqueued_at_from_score, score_for, DeadLetterEntry, Priority, QueueMessage, Stage,
};

/// Sort key: score, then insertion order for identical scores.
type Slot = (i64, u64, String);

#[derive(Debug, Default)]
struct Counters {
    enqueued: u64,
    dequeued: u64,
    removed: u64,
    wait_ms_total: u64,
    recent_dequeues: VecDeque<DateTime<Utc>>,
}

impl Counters {
    fn record_dequeue(&mut self, wait_ms: u64, now: DateTime<Utc>) {
        self.dequeued += 1;
        self.wait_ms_total += wait_ms;
        self.recent_dequeues.push_back(now);
        let cutoff = now - chrono::Duration::hours(1);
        while self.recent_dequeues.front().is_some_and(|t| *t < cutoff) {
            self.recent_dequeues.pop_front();
        }
    }
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<(Stage, Priority), BTreeSet<Slot>>,
    messages: HashMap<String, QueueMessage>,
    /// stage -> (message id -> lease start)
    leases: HashMap<Stage, HashMap<String, DateTime<Utc>>>,
    dead_letters: HashMap<String, DeadLetterEntry>,
    counters: HashMap<(Stage, Priority), Counters>,
    seq: u64,
}

impl State {
    fn insert(&mut self, message: &QueueMessage) -> u64 {
        self.seq += 1;
        let slot = (
            score_for(message.enqueued_at, message.priority),
            self.seq,
            message.id.clone(),
        );
        self.messages.insert(message.id.clone(), message.clone());
        let queue = self
            .queues
            .entry((message.stage, message.priority))
            .or_default();
        queue.insert(slot);
        let position = queue.len() as u64;
        self.counters
            .entry((message.stage, message.priority))
            .or_default()
            .enqueued += 1;
        position
    }

    fn unqueue(&mut self, id: &str, stage: Stage, priority: Priority) -> bool {
        let Some(queue) = self.queues.get_mut(&(stage, priority)) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|(_, _, member)| member != id);
        before != queue.len()
    }

    fn release(&mut self, message: &QueueMessage) {
        if let Some(leases) = self.leases.get_mut(&message.stage) {
            leases.remove(&message.id);
        }
    }
}

/// In-memory queue store.
#[derive(Clone, Default)]
pub struct InMemoryQueueStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, message: &QueueMessage) -> QueueResult<EnqueueReceipt> {
        let mut state = self.state.lock().await;
        let position = state.insert(message);
        Ok(EnqueueReceipt::new(message, position))
    }

    async fn dequeue(&self, stage: Stage) -> QueueResult<Option<QueueMessage>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        for priority in Priority::ALL {
            let popped = state
                .queues
                .get_mut(&(stage, priority))
                .and_then(|q| q.pop_first());
            let Some((_, _, id)) = popped else {
                continue;
            };
            let Some(message) = state.messages.get(&id).cloned() else {
                tracing::warn!(message_id = %id, "Queued id without stored message, dropping");
                continue;
            };

            state.leases.entry(stage).or_default().insert(id, now);
            let wait_ms = (now - message.enqueued_at).num_milliseconds().max(0) as u64;
            state
                .counters
                .entry((stage, priority))
                .or_default()
                .record_dequeue(wait_ms, now);
            return Ok(Some(message));
        }

        Ok(None)
    }

    async fn peek(
        &self,
        stage: Stage,
        priority: Option<Priority>,
        limit: usize,
    ) -> QueueResult<Vec<QueueMessage>> {
        let state = self.state.lock().await;
        let priorities = match priority {
            Some(p) => vec![p],
            None => Priority::ALL.to_vec(),
        };

        let mut out = Vec::new();
        for p in priorities {
            if let Some(queue) = state.queues.get(&(stage, p)) {
                for (_, _, id) in queue.iter() {
                    if out.len() >= limit {
                        return Ok(out);
                    }
                    if let Some(msg) = state.messages.get(id) {
                        out.push(msg.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn stats(&self, stage: Option<Stage>) -> QueueResult<QueueStats> {
        let state = self.state.lock().await;
        let now = Utc::now();
        let cutoff = now - chrono::Duration::hours(1);

        let stages = stats_scope(stage)
            .into_iter()
            .map(|stage| {
                let priorities = Priority::ALL
                    .iter()
                    .map(|&priority| {
                        let mut stats = PriorityStats::empty(priority);
                        if let Some(queue) = state.queues.get(&(stage, priority)) {
                            stats.depth = queue.len() as u64;
                            stats.oldest_enqueued_at = queue
                                .first()
                                .and_then(|(score, _, _)| enqueued_at_from_score(*score as f64, priority));
                            stats.newest_enqueued_at = queue
                                .last()
                                .and_then(|(score, _, _)| enqueued_at_from_score(*score as f64, priority));
                        }
                        if let Some(c) = state.counters.get(&(stage, priority)) {
                            stats.enqueued_total = c.enqueued;
                            stats.dequeued_total = c.dequeued;
                            stats.removed_total = c.removed;
                            stats.avg_wait_ms = c.wait_ms_total.checked_div(c.dequeued).unwrap_or(0);
                            stats.throughput_per_hour =
                                c.recent_dequeues.iter().filter(|t| **t >= cutoff).count() as u64;
                        }
                        stats
                    })
                    .collect();

                StageStats {
                    stage,
                    in_flight: state.leases.get(&stage).map(|l| l.len() as u64).unwrap_or(0),
                    priorities,
                }
            })
            .collect();

        Ok(QueueStats {
            stages,
            dead_letter_count: state.dead_letters.len() as u64,
        })
    }

    async fn remove_message(
        &self,
        id: &str,
        stage: Stage,
        priority: Priority,
    ) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let removed = state.unqueue(id, stage, priority);
        if removed {
            state.messages.remove(id);
            state.counters.entry((stage, priority)).or_default().removed += 1;
        }
        Ok(removed)
    }

    async fn complete(
        &self,
        message: &QueueMessage,
        next: Option<&QueueMessage>,
    ) -> QueueResult<Option<EnqueueReceipt>> {
        let mut state = self.state.lock().await;
        state.release(message);
        state.messages.remove(&message.id);
        Ok(next.map(|next| {
            let position = state.insert(next);
            EnqueueReceipt::new(next, position)
        }))
    }

    async fn requeue(&self, message: &QueueMessage) -> QueueResult<EnqueueReceipt> {
        let mut state = self.state.lock().await;
        state.release(message);
        state.unqueue(&message.id, message.stage, message.priority);
        let position = state.insert(message);
        Ok(EnqueueReceipt::new(message, position))
    }

    async fn update_message(&self, message: &QueueMessage) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        message: &QueueMessage,
        reason: &str,
        can_retry_manually: bool,
    ) -> QueueResult<DeadLetterEntry> {
        let mut state = self.state.lock().await;
        state.release(message);
        state.unqueue(&message.id, message.stage, message.priority);
        state.messages.remove(&message.id);

        let entry = DeadLetterEntry::new(message, reason, can_retry_manually);
        state.dead_letters.insert(message.id.clone(), entry.clone());
        Ok(entry)
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state.dead_letters.values().cloned().collect();
        entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn replace_dead_letter(
        &self,
        id: &str,
        replacement: &QueueMessage,
    ) -> QueueResult<Option<EnqueueReceipt>> {
        let mut state = self.state.lock().await;
        if state.dead_letters.remove(id).is_none() {
            return Ok(None);
        }
        let position = state.insert(replacement);
        Ok(Some(EnqueueReceipt::new(replacement, position)))
    }

    async fn dead_letter(&self, id: &str) -> QueueResult<Option<DeadLetterEntry>> {
        Ok(self.state.lock().await.dead_letters.get(id).cloned())
    }

    async fn recover_stale(&self, stage: Stage, lease_timeout: Duration) -> QueueResult<usize> {
        let mut state = self.state.lock().await;
        let timeout = chrono::Duration::from_std(lease_timeout)
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let cutoff = Utc::now() - timeout;

        let stale: Vec<String> = state
            .leases
            .get(&stage)
            .map(|leases| {
                leases
                    .iter()
                    .filter(|(_, started)| **started <= cutoff)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut recovered = 0;
        for id in stale {
            if let Some(leases) = state.leases.get_mut(&stage) {
                leases.remove(&id);
            }
            let Some(message) = state.messages.get(&id).cloned() else {
                continue;
            };
            state.insert(&message);
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn clear_all(&self) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let cleared = state.messages.len() as u64 + state.dead_letters.len() as u64;
        *state = State::default();
        Ok(cleared)
    }
}
