//! Stage workers, retry scheduling and the pool that owns them.

mod pool;
mod retry;
mod runner;
mod scheduler;

pub use pool::{PoolHealth, PoolSettings, WorkerPool};
pub use retry::{backoff_delay, decide, RetryDecision, RetryPolicy};
pub use runner::{Worker, WorkerContext};
pub use scheduler::RetryScheduler;

use std::time::Duration;

use thiserror::Error;

use crate::queue::QueueError;
use crate::services::CollaboratorError;

/// Bookkeeping failures inside a worker iteration.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// Loop pacing for a single worker.
#[derive(Debug, Clone)]
pub struct WorkerTiming {
    /// Wait after finding every queue of the stage empty.
    pub poll_interval: Duration,
    /// Pause after a bookkeeping error.
    pub error_cooldown: Duration,
}

impl Default for WorkerTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_cooldown: Duration::from_secs(5),
        }
    }
}
