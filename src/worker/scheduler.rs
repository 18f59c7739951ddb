//! Delayed re-enqueue of retried messages.
//!
//! A retried message stays leased (invisible to dequeue) until its backoff
//! elapses, then goes back to its live queue. `flush` cancels the timers and
//! re-enqueues whatever is still waiting so a shutdown never drops retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::models::QueueMessage;
use crate::queue::QueueStore;

pub struct RetryScheduler {
    store: Arc<dyn QueueStore>,
    token: Mutex<CancellationToken>,
    tracker: TaskTracker,
    pending: Arc<Mutex<HashMap<String, QueueMessage>>>,
}

impl RetryScheduler {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            token: Mutex::new(CancellationToken::new()),
            tracker: TaskTracker::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Messages whose backoff has not elapsed yet.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn current_token(&self) -> CancellationToken {
        match self.token.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Re-enqueue `message` after `delay`.
    pub fn schedule(&self, message: QueueMessage, delay: Duration) {
        let token = self.current_token();
        let id = message.id.clone();

        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.clone(), message);
        }
        debug!(message_id = %id, delay_ms = delay.as_millis() as u64, "Scheduled retry");

        let store = self.store.clone();
        let pending = self.pending.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return,
            }

            let due = pending.lock().ok().and_then(|mut p| p.remove(&id));
            if let Some(message) = due {
                requeue(store.as_ref(), message).await;
            }
        });
    }

    /// Cancel all timers and immediately re-enqueue pending messages.
    ///
    /// The scheduler stays usable afterwards.
    pub async fn flush(&self) -> usize {
        let old = match self.token.lock() {
            Ok(mut token) => std::mem::replace(&mut *token, CancellationToken::new()),
            Err(poisoned) => {
                let mut token = poisoned.into_inner();
                std::mem::replace(&mut *token, CancellationToken::new())
            }
        };
        old.cancel();

        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();

        let drained: Vec<QueueMessage> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, m)| m).collect(),
            Err(_) => Vec::new(),
        };

        let count = drained.len();
        for message in drained {
            requeue(self.store.as_ref(), message).await;
        }
        if count > 0 {
            info!(flushed = count, "Flushed pending retries into live queues");
        }
        count
    }
}

async fn requeue(store: &dyn QueueStore, mut message: QueueMessage) {
    message.enqueued_at = Utc::now();
    match store.requeue(&message).await {
        Ok(receipt) => debug!(
            message_id = %receipt.message_id,
            stage = %receipt.stage,
            retry_count = message.retry_count,
            "Retry re-enqueued"
        ),
        // The lease is still held; lease recovery redelivers it.
        Err(e) => warn!(message_id = %message.id, error = %e, "Failed to re-enqueue retry"),
    }
}
