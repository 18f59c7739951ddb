//! Queue message: the unit of work flowing between stages.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::stage::{Priority, Stage};

/// Default retry budget for a stage.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Current layout of [`DocumentMetadata`] and [`ProcessingOptions`].
pub const SCHEMA_VERSION: u32 = 1;

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Payment the uploader claims the document proves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedPayment {
    /// Amount in minor currency units (cents).
    pub amount_minor: i64,
    /// ISO 4217 code.
    pub currency: String,
    /// Bank or transfer reference printed on the receipt, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// Context supplied once when a run starts. Stages read it, never write it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Object key in blob storage.
    pub storage_key: String,
    pub file_size: u64,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_payment: Option<ExpectedPayment>,
}

impl DocumentMetadata {
    pub fn new(
        user_id: impl Into<String>,
        storage_key: impl Into<String>,
        file_size: u64,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            user_id: user_id.into(),
            transaction_id: None,
            storage_key: storage_key.into(),
            file_size,
            content_type: content_type.into(),
            original_filename: None,
            expected_payment: None,
        }
    }
}

/// Per-run options. Read-only once the run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingOptions {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    /// Overrides the stage's own timeout when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// OCR language hints, e.g. `["es", "en"]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub language_hints: Vec<String>,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            timeout_secs: None,
            language_hints: Vec::new(),
        }
    }
}

/// Errors decoding a message from its stored field map.
#[derive(Debug, Error)]
pub enum MessageFieldError {
    #[error("missing field '{0}'")]
    Missing(&'static str),
    #[error("invalid value for '{field}': {value}")]
    Invalid { field: &'static str, value: String },
    #[error("invalid JSON in '{field}': {source}")]
    Json {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A queued unit of work for one (document, stage) transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub document_id: String,
    pub stage: Stage,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub metadata: DocumentMetadata,
    #[serde(default)]
    pub config: ProcessingOptions,
}

impl QueueMessage {
    /// A fresh message for the first stage of a run.
    pub fn new(
        document_id: impl Into<String>,
        metadata: DocumentMetadata,
        priority: Priority,
        config: ProcessingOptions,
    ) -> Self {
        Self {
            id: new_message_id(),
            document_id: document_id.into(),
            stage: Stage::FIRST,
            priority,
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            metadata,
            config,
        }
    }

    /// A new message carrying this run into `stage`.
    ///
    /// Document id, metadata, options and priority carry over; retry state
    /// resets.
    pub fn for_stage(&self, stage: Stage) -> Self {
        Self {
            id: new_message_id(),
            document_id: self.document_id.clone(),
            stage,
            priority: self.priority,
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries: self.max_retries,
            last_error: None,
            metadata: self.metadata.clone(),
            config: self.config.clone(),
        }
    }

    /// The same message after a failed attempt, ready to be re-enqueued.
    pub fn retried(&self, error: impl Into<String>) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            last_error: Some(error.into()),
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Whether the retry budget still allows another attempt.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Sorted-set score in microseconds: earlier is smaller, higher
    /// priority is smaller. Stays below 2^53 so f64 scores are exact.
    pub fn score(&self) -> f64 {
        score_for(self.enqueued_at, self.priority) as f64
    }

    /// Flatten into the field map stored under `message:{id}`.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, MessageFieldError> {
        let metadata = serde_json::to_string(&self.metadata).map_err(|source| {
            MessageFieldError::Json {
                field: "metadata",
                source,
            }
        })?;
        let config = serde_json::to_string(&self.config).map_err(|source| {
            MessageFieldError::Json {
                field: "config",
                source,
            }
        })?;

        Ok(vec![
            ("id", self.id.clone()),
            ("document_id", self.document_id.clone()),
            ("stage", self.stage.as_str().to_string()),
            ("priority", self.priority.as_str().to_string()),
            ("enqueued_at", self.enqueued_at.timestamp_micros().to_string()),
            ("retry_count", self.retry_count.to_string()),
            ("max_retries", self.max_retries.to_string()),
            ("last_error", self.last_error.clone().unwrap_or_default()),
            ("metadata", metadata),
            ("config", config),
        ])
    }

    /// Rebuild from a stored field map.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, MessageFieldError> {
        fn get<'a>(
            fields: &'a HashMap<String, String>,
            key: &'static str,
        ) -> Result<&'a str, MessageFieldError> {
            fields
                .get(key)
                .map(String::as_str)
                .ok_or(MessageFieldError::Missing(key))
        }

        fn invalid(field: &'static str, value: &str) -> MessageFieldError {
            MessageFieldError::Invalid {
                field,
                value: value.to_string(),
            }
        }

        let stage_raw = get(fields, "stage")?;
        let stage = Stage::from_str(stage_raw).ok_or_else(|| invalid("stage", stage_raw))?;
        let priority_raw = get(fields, "priority")?;
        let priority =
            Priority::from_str(priority_raw).ok_or_else(|| invalid("priority", priority_raw))?;

        let enqueued_raw = get(fields, "enqueued_at")?;
        let enqueued_at = enqueued_raw
            .parse::<i64>()
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_micros)
            .ok_or_else(|| invalid("enqueued_at", enqueued_raw))?;

        let retry_raw = get(fields, "retry_count")?;
        let retry_count = retry_raw
            .parse()
            .map_err(|_| invalid("retry_count", retry_raw))?;
        let max_raw = get(fields, "max_retries")?;
        let max_retries = max_raw
            .parse()
            .map_err(|_| invalid("max_retries", max_raw))?;

        let metadata = serde_json::from_str(get(fields, "metadata")?).map_err(|source| {
            MessageFieldError::Json {
                field: "metadata",
                source,
            }
        })?;
        let config = match fields.get("config") {
            Some(raw) if !raw.is_empty() => {
                serde_json::from_str(raw).map_err(|source| MessageFieldError::Json {
                    field: "config",
                    source,
                })?
            }
            _ => ProcessingOptions::default(),
        };

        let last_error = fields
            .get("last_error")
            .filter(|s| !s.is_empty())
            .cloned();

        Ok(Self {
            id: get(fields, "id")?.to_string(),
            document_id: get(fields, "document_id")?.to_string(),
            stage,
            priority,
            enqueued_at,
            retry_count,
            max_retries,
            last_error,
            metadata,
            config,
        })
    }
}

/// Integer score for a message enqueued at `at` with `priority`.
pub fn score_for(at: DateTime<Utc>, priority: Priority) -> i64 {
    at.timestamp_micros() - priority.weight_ms() * 1_000
}

/// Enqueue time recovered from a score.
pub fn enqueued_at_from_score(score: f64, priority: Priority) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(score as i64 + priority.weight_ms() * 1_000)
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
