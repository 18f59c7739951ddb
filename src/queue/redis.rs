//! Redis-backed queue store for multi-process workers.
//!
//! Each stage/priority pair is a sorted set of message ids; message bodies
//! live in hashes. Pops and other multi-key transitions run as Lua scripts
//! or MULTI/EXEC transactions so every operation is indivisible.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Pipeline, Script};

use super::keys::{
    dead_letter_entry_key, hourly_field, message_key, metrics_key, processing_key, queue_key,
    DEAD_LETTER_KEY,
};
use super::{
    stats_scope, EnqueueReceipt, PriorityStats, QueueError, QueueResult, QueueStats, QueueStore,
    QueueStoreConfig, StageStats,
};
use crate::models::{enqueued_at_from_score, DeadLetterEntry, Priority, QueueMessage, Stage};

/// Pops the best message of a stage and leases it.
///
/// KEYS: high, medium, low queues; processing set; high, medium, low metrics.
/// ARGV: now (µs), metrics ttl, current hour field, high/medium/low weights
/// (µs), expired hour field.
const DEQUEUE_LUA: &str = r#"
local now = tonumber(ARGV[1])
for i = 1, 3 do
    local popped = redis.call('ZPOPMIN', KEYS[i], 1)
    if popped[1] then
        local id = popped[1]
        local fields = redis.call('HGETALL', 'message:' .. id)
        if #fields > 0 then
            redis.call('ZADD', KEYS[4], ARGV[1], id)
            local enqueued = tonumber(popped[2]) + tonumber(ARGV[3 + i])
            local wait_ms = math.floor((now - enqueued) / 1000)
            if wait_ms < 0 then wait_ms = 0 end
            local metrics = KEYS[4 + i]
            redis.call('HINCRBY', metrics, 'dequeued', 1)
            redis.call('HINCRBY', metrics, 'wait_ms_total', wait_ms)
            redis.call('HINCRBY', metrics, ARGV[3], 1)
            redis.call('HDEL', metrics, ARGV[7])
            redis.call('EXPIRE', metrics, ARGV[2])
            return fields
        end
    end
end
return {}
"#;

/// Returns expired leases of a stage to their live queues.
///
/// KEYS: processing set. ARGV: cutoff (µs), now (µs), stage name,
/// high/medium/low weights (µs).
const RECOVER_LUA: &str = r#"
local weights = { high = tonumber(ARGV[4]), medium = tonumber(ARGV[5]), low = tonumber(ARGV[6]) }
local now = tonumber(ARGV[2])
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local recovered = 0
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    local priority = redis.call('HGET', 'message:' .. id, 'priority')
    if priority and weights[priority] then
        local score = string.format('%.0f', now - weights[priority])
        redis.call('HSET', 'message:' .. id, 'enqueued_at', ARGV[2])
        redis.call('ZADD', 'queue:' .. ARGV[3] .. ':' .. priority, score, id)
        recovered = recovered + 1
    end
end
return recovered
"#;

/// Removes a waiting message.
///
/// KEYS: queue, message hash, metrics. ARGV: id, metrics ttl.
const REMOVE_LUA: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if removed == 1 then
    redis.call('DEL', KEYS[2])
    redis.call('HINCRBY', KEYS[3], 'removed', 1)
    redis.call('EXPIRE', KEYS[3], ARGV[2])
end
return removed
"#;

/// Swaps a dead-letter entry for a freshly queued message, once.
///
/// KEYS: dlq entry, dead-letter set, new message hash, target queue, metrics.
/// ARGV: old id, message ttl, score, new id, metrics ttl, field/value pairs...
const REPLACE_DEAD_LETTER_LUA: &str = r#"
if redis.call('DEL', KEYS[1]) == 0 then
    return -1
end
redis.call('ZREM', KEYS[2], ARGV[1])
local fields = {}
for i = 6, #ARGV do
    fields[#fields + 1] = ARGV[i]
end
redis.call('DEL', KEYS[3])
redis.call('HSET', KEYS[3], unpack(fields))
redis.call('EXPIRE', KEYS[3], ARGV[2])
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[4])
redis.call('HINCRBY', KEYS[5], 'enqueued', 1)
redis.call('EXPIRE', KEYS[5], ARGV[5])
return redis.call('ZCARD', KEYS[4])
"#;

/// Key patterns owned by the queue store.
const OWNED_PATTERNS: [&str; 5] = [
    "queue:*",
    "message:*",
    "dlq:*",
    "metrics:queue:*",
    "processing:*",
];

/// Redis-backed queue store.
#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
    config: QueueStoreConfig,
    dequeue_script: Script,
    recover_script: Script,
    remove_script: Script,
    replace_dead_letter_script: Script,
}

impl RedisQueueStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `config` - retention for messages, dead letters and metrics
    pub async fn connect(redis_url: &str, config: QueueStoreConfig) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            config,
            dequeue_script: Script::new(DEQUEUE_LUA),
            recover_script: Script::new(RECOVER_LUA),
            remove_script: Script::new(REMOVE_LUA),
            replace_dead_letter_script: Script::new(REPLACE_DEAD_LETTER_LUA),
        })
    }

    fn message_ttl(&self) -> i64 {
        self.config.message_ttl.as_secs() as i64
    }

    fn metrics_ttl(&self) -> i64 {
        self.config.metrics_ttl.as_secs() as i64
    }

    fn encode(message: &QueueMessage) -> QueueResult<Vec<(&'static str, String)>> {
        message.to_fields().map_err(|source| QueueError::Corrupt {
            id: message.id.clone(),
            source,
        })
    }

    /// Append the commands that store and queue `message`, ending with the
    /// ZCARD of its queue (the only non-ignored reply).
    fn push_enqueue(
        &self,
        pipe: &mut Pipeline,
        message: &QueueMessage,
        fields: &[(&'static str, String)],
    ) {
        let msg_key = message_key(&message.id);
        let q_key = queue_key(message.stage, message.priority);
        let m_key = metrics_key(message.stage, message.priority);

        pipe.del(&msg_key)
            .ignore()
            .hset_multiple(&msg_key, fields)
            .ignore()
            .expire(&msg_key, self.message_ttl())
            .ignore()
            .zadd(&q_key, &message.id, message.score())
            .ignore()
            .hincr(&m_key, "enqueued", 1)
            .ignore()
            .expire(&m_key, self.metrics_ttl())
            .ignore()
            .zcard(&q_key);
    }

    async fn priority_stats(
        &self,
        stage: Stage,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> QueueResult<PriorityStats> {
        let mut conn = self.conn.clone();
        let q_key = queue_key(stage, priority);

        let (depth, oldest, newest, metrics): (
            u64,
            Vec<(String, f64)>,
            Vec<(String, f64)>,
            HashMap<String, String>,
        ) = redis::pipe()
            .zcard(&q_key)
            .zrange_withscores(&q_key, 0, 0)
            .zrange_withscores(&q_key, -1, -1)
            .hgetall(metrics_key(stage, priority))
            .query_async(&mut conn)
            .await?;

        let counter = |name: &str| -> u64 {
            metrics
                .get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };

        let hour = now.timestamp() / 3600;
        let current = counter(&hourly_field(hour)) as f64;
        let previous = counter(&hourly_field(hour - 1)) as f64;
        let into_hour = (now.minute() * 60 + now.second()) as f64 / 3600.0;

        let dequeued = counter("dequeued");
        Ok(PriorityStats {
            priority,
            depth,
            oldest_enqueued_at: oldest
                .first()
                .and_then(|(_, score)| enqueued_at_from_score(*score, priority)),
            newest_enqueued_at: newest
                .first()
                .and_then(|(_, score)| enqueued_at_from_score(*score, priority)),
            enqueued_total: counter("enqueued"),
            dequeued_total: dequeued,
            removed_total: counter("removed"),
            avg_wait_ms: counter("wait_ms_total").checked_div(dequeued).unwrap_or(0),
            throughput_per_hour: (current + previous * (1.0 - into_hour)).round() as u64,
        })
    }
}

fn pairs_to_map(flat: Vec<String>) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        map.insert(k, v);
    }
    map
}

fn weight_micros(priority: Priority) -> i64 {
    priority.weight_ms() * 1_000
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn enqueue(&self, message: &QueueMessage) -> QueueResult<EnqueueReceipt> {
        let mut conn = self.conn.clone();
        let fields = Self::encode(message)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        self.push_enqueue(&mut pipe, message, &fields);
        let (position,): (u64,) = pipe.query_async(&mut conn).await?;

        tracing::debug!(
            message_id = %message.id,
            stage = %message.stage,
            priority = %message.priority,
            position,
            "Enqueued message"
        );
        Ok(EnqueueReceipt::new(message, position))
    }

    async fn dequeue(&self, stage: Stage) -> QueueResult<Option<QueueMessage>> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let hour = now.timestamp() / 3600;

        let mut invocation = self.dequeue_script.prepare_invoke();
        for priority in Priority::ALL {
            invocation.key(queue_key(stage, priority));
        }
        invocation.key(processing_key(stage));
        for priority in Priority::ALL {
            invocation.key(metrics_key(stage, priority));
        }
        invocation
            .arg(now.timestamp_micros())
            .arg(self.metrics_ttl())
            .arg(hourly_field(hour));
        for priority in Priority::ALL {
            invocation.arg(weight_micros(priority));
        }
        invocation.arg(hourly_field(hour - 2));

        let flat: Vec<String> = invocation.invoke_async(&mut conn).await?;
        if flat.is_empty() {
            return Ok(None);
        }

        let fields = pairs_to_map(flat);
        let id = fields.get("id").cloned().unwrap_or_default();
        let message =
            QueueMessage::from_fields(&fields).map_err(|source| QueueError::Corrupt { id, source })?;
        Ok(Some(message))
    }

    async fn peek(
        &self,
        stage: Stage,
        priority: Option<Priority>,
        limit: usize,
    ) -> QueueResult<Vec<QueueMessage>> {
        let mut conn = self.conn.clone();
        let priorities = match priority {
            Some(p) => vec![p],
            None => Priority::ALL.to_vec(),
        };

        let mut out = Vec::new();
        for p in priorities {
            let remaining = limit.saturating_sub(out.len());
            if remaining == 0 {
                break;
            }
            let ids: Vec<String> = conn
                .zrange(queue_key(stage, p), 0, remaining as isize - 1)
                .await?;
            if ids.is_empty() {
                continue;
            }

            let mut pipe = redis::pipe();
            for id in &ids {
                pipe.hgetall(message_key(id));
            }
            let bodies: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;
            for (id, fields) in ids.into_iter().zip(bodies) {
                if fields.is_empty() {
                    continue;
                }
                let message = QueueMessage::from_fields(&fields)
                    .map_err(|source| QueueError::Corrupt { id, source })?;
                out.push(message);
            }
        }
        Ok(out)
    }

    async fn stats(&self, stage: Option<Stage>) -> QueueResult<QueueStats> {
        let mut conn = self.conn.clone();
        let now = Utc::now();

        let mut stages = Vec::new();
        for stage in stats_scope(stage) {
            let mut priorities = Vec::with_capacity(Priority::ALL.len());
            for priority in Priority::ALL {
                priorities.push(self.priority_stats(stage, priority, now).await?);
            }
            let in_flight: u64 = conn.zcard(processing_key(stage)).await?;
            stages.push(StageStats {
                stage,
                in_flight,
                priorities,
            });
        }

        let dead_letter_count: u64 = conn.zcard(DEAD_LETTER_KEY).await?;
        Ok(QueueStats {
            stages,
            dead_letter_count,
        })
    }

    async fn remove_message(
        &self,
        id: &str,
        stage: Stage,
        priority: Priority,
    ) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .remove_script
            .key(queue_key(stage, priority))
            .key(message_key(id))
            .key(metrics_key(stage, priority))
            .arg(id)
            .arg(self.metrics_ttl())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn complete(
        &self,
        message: &QueueMessage,
        next: Option<&QueueMessage>,
    ) -> QueueResult<Option<EnqueueReceipt>> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(processing_key(message.stage), &message.id)
            .ignore()
            .del(message_key(&message.id))
            .ignore();

        match next {
            Some(next) => {
                let fields = Self::encode(next)?;
                self.push_enqueue(&mut pipe, next, &fields);
                let (position,): (u64,) = pipe.query_async(&mut conn).await?;
                Ok(Some(EnqueueReceipt::new(next, position)))
            }
            None => {
                let () = pipe.query_async(&mut conn).await?;
                Ok(None)
            }
        }
    }

    async fn requeue(&self, message: &QueueMessage) -> QueueResult<EnqueueReceipt> {
        let mut conn = self.conn.clone();
        let fields = Self::encode(message)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(processing_key(message.stage), &message.id)
            .ignore();
        self.push_enqueue(&mut pipe, message, &fields);
        let (position,): (u64,) = pipe.query_async(&mut conn).await?;
        Ok(EnqueueReceipt::new(message, position))
    }

    async fn update_message(&self, message: &QueueMessage) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let fields = Self::encode(message)?;
        let msg_key = message_key(&message.id);

        let () = redis::pipe()
            .atomic()
            .hset_multiple(&msg_key, &fields)
            .ignore()
            .expire(&msg_key, self.message_ttl())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        message: &QueueMessage,
        reason: &str,
        can_retry_manually: bool,
    ) -> QueueResult<DeadLetterEntry> {
        let mut conn = self.conn.clone();
        let entry = DeadLetterEntry::new(message, reason, can_retry_manually);
        let json = serde_json::to_string(&entry)?;

        let () = redis::pipe()
            .atomic()
            .zrem(processing_key(message.stage), &message.id)
            .ignore()
            .zrem(queue_key(message.stage, message.priority), &message.id)
            .ignore()
            .del(message_key(&message.id))
            .ignore()
            .set_ex(
                dead_letter_entry_key(&message.id),
                json,
                self.config.dead_letter_ttl.as_secs(),
            )
            .ignore()
            .zadd(
                DEAD_LETTER_KEY,
                &message.id,
                entry.failed_at.timestamp_millis() as f64,
            )
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::warn!(
            message_id = %message.id,
            document_id = %message.document_id,
            stage = %message.stage,
            reason,
            "Moved message to dead-letter queue"
        );
        Ok(entry)
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrevrange(DEAD_LETTER_KEY, 0, limit as isize - 1)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| dead_letter_entry_key(id)).collect();
        let bodies: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::with_capacity(bodies.len());
        let mut expired = Vec::new();
        for (id, body) in ids.into_iter().zip(bodies) {
            match body {
                Some(json) => entries.push(serde_json::from_str(&json)?),
                None => expired.push(id),
            }
        }

        // Entry TTLs expire independently of the index set.
        if !expired.is_empty() {
            conn.zrem::<_, _, ()>(DEAD_LETTER_KEY, &expired).await?;
        }
        Ok(entries)
    }

    async fn replace_dead_letter(
        &self,
        id: &str,
        replacement: &QueueMessage,
    ) -> QueueResult<Option<EnqueueReceipt>> {
        let mut conn = self.conn.clone();
        let fields = Self::encode(replacement)?;

        let mut invocation = self.replace_dead_letter_script.prepare_invoke();
        invocation
            .key(dead_letter_entry_key(id))
            .key(DEAD_LETTER_KEY)
            .key(message_key(&replacement.id))
            .key(queue_key(replacement.stage, replacement.priority))
            .key(metrics_key(replacement.stage, replacement.priority))
            .arg(id)
            .arg(self.message_ttl())
            .arg(replacement.score())
            .arg(&replacement.id)
            .arg(self.metrics_ttl());
        for (field, value) in &fields {
            invocation.arg(*field).arg(value);
        }

        let position: i64 = invocation.invoke_async(&mut conn).await?;
        if position < 0 {
            return Ok(None);
        }
        Ok(Some(EnqueueReceipt::new(replacement, position as u64)))
    }

    async fn dead_letter(&self, id: &str) -> QueueResult<Option<DeadLetterEntry>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn.get(dead_letter_entry_key(id)).await?;
        Ok(body.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    async fn recover_stale(&self, stage: Stage, lease_timeout: Duration) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_micros();
        let cutoff = now - lease_timeout.as_micros() as i64;

        let mut invocation = self.recover_script.prepare_invoke();
        invocation
            .key(processing_key(stage))
            .arg(cutoff)
            .arg(now)
            .arg(stage.as_str());
        for priority in Priority::ALL {
            invocation.arg(weight_micros(priority));
        }

        let recovered: i64 = invocation.invoke_async(&mut conn).await?;
        if recovered > 0 {
            tracing::warn!(stage = %stage, recovered, "Recovered expired in-flight leases");
        }
        Ok(recovered.max(0) as usize)
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn clear_all(&self) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let mut deleted = 0u64;

        for pattern in OWNED_PATTERNS {
            let keys: Vec<String> = redis::cmd("KEYS")
                .arg(pattern)
                .query_async(&mut conn)
                .await?;
            for chunk in keys.chunks(500) {
                let removed: u64 = conn.del(chunk).await?;
                deleted += removed;
            }
        }

        tracing::warn!(deleted, "Cleared all queue data");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentMetadata, ProcessingOptions};

    #[test]
    fn test_pairs_to_map() {
        let map = pairs_to_map(vec![
            "id".into(),
            "m-1".into(),
            "stage".into(),
            "s3_upload".into(),
        ]);
        assert_eq!(map.get("id").map(String::as_str), Some("m-1"));
        assert_eq!(map.get("stage").map(String::as_str), Some("s3_upload"));
    }

    /// Needs a disposable Redis: `REDIS_URL=redis://127.0.0.1/15 cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_redis_priority_order_and_single_winner() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/15".into());
        let store = RedisQueueStore::connect(&url, QueueStoreConfig::default())
            .await
            .unwrap();
        store.clear_all().await.unwrap();

        let metadata = DocumentMetadata::new("u", "k", 1, "application/pdf");
        for (doc, priority) in [("low", Priority::Low), ("high", Priority::High), ("medium", Priority::Medium)] {
            let msg = QueueMessage::new(doc, metadata.clone(), priority, ProcessingOptions::default());
            store.enqueue(&msg).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(msg) = store.dequeue(Stage::DocumentValidation).await.unwrap() {
            store.complete(&msg, None).await.unwrap();
            order.push(msg.document_id);
        }
        assert_eq!(order, vec!["high", "medium", "low"]);

        let only = QueueMessage::new("only", metadata, Priority::High, ProcessingOptions::default());
        store.enqueue(&only).await.unwrap();
        let (a, b) = tokio::join!(
            store.dequeue(Stage::DocumentValidation),
            store.dequeue(Stage::DocumentValidation)
        );
        let winners = [a.unwrap(), b.unwrap()].iter().filter(|m| m.is_some()).count();
        assert_eq!(winners, 1);

        store.clear_all().await.unwrap();
    }
}
