//! Store key layout.

use crate::models::{Priority, Stage};

/// Sorted set of dead-lettered ids scored by failure time.
pub const DEAD_LETTER_KEY: &str = "queue:dead_letter";

/// Sorted set of message ids for one (stage, priority).
pub fn queue_key(stage: Stage, priority: Priority) -> String {
    format!("queue:{}:{}", stage, priority)
}

/// Hash holding a message's fields.
pub fn message_key(id: &str) -> String {
    format!("message:{}", id)
}

/// JSON dead-letter entry.
pub fn dead_letter_entry_key(id: &str) -> String {
    format!("dlq:{}", id)
}

/// Counters for one (stage, priority).
pub fn metrics_key(stage: Stage, priority: Priority) -> String {
    format!("metrics:queue:{}:{}", stage, priority)
}

/// In-flight leases for a stage, scored by dequeue time.
pub fn processing_key(stage: Stage) -> String {
    format!("processing:{}", stage)
}

/// Hash field counting dequeues within one clock hour.
pub fn hourly_field(epoch_hour: i64) -> String {
    format!("dequeued_hour:{}", epoch_hour)
}
