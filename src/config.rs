//! Configuration management.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! environment variables (a `.env` file is loaded by the binary first).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::{Pipeline, PipelineSettings};
use crate::queue::{InMemoryQueueStore, QueueHealthLimits, QueueResult, QueueStore, QueueStoreConfig};
use crate::services::{
    CollaboratorResult, Collaborators, HttpCollaborators, InMemoryCollaborators, TracingLogSink,
};
use crate::stages::{HandlerSettings, StageRegistry, StageTimeouts};
use crate::worker::{
    PoolSettings, RetryPolicy, RetryScheduler, WorkerContext, WorkerPool, WorkerTiming,
};

/// Config file looked up in the working directory when none is given.

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where queue state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Redis,
    Memory,
}

impl QueueBackend {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Some(Self::Redis),
            "memory" | "in-memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub backend: QueueBackend,
    pub redis_url: String,
    /// Soft ceiling on waiting messages, used by health checks.
    pub max_queue_size: u64,
    pub max_message_age_secs: u64,
    pub message_ttl_secs: u64,
    pub dead_letter_ttl_secs: u64,
    pub metrics_ttl_secs: u64,
    /// Dequeued messages not acknowledged within this are redelivered.
    pub lease_timeout_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".into(),
            max_queue_size: 10_000,
            max_message_age_secs: 30 * 60,
            message_ttl_secs: 7 * 24 * 3600,
            dead_letter_ttl_secs: 30 * 24 * 3600,
            metrics_ttl_secs: 24 * 3600,
            lease_timeout_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub default_per_stage: usize,
    pub min_per_stage: usize,
    pub max_per_stage: usize,
    pub messages_per_worker: u64,
    pub monitor_interval_secs: u64,
    pub poll_interval_ms: u64,
    pub error_cooldown_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            default_per_stage: 2,
            min_per_stage: 1,
            max_per_stage: 5,
            messages_per_worker: 10,
            monitor_interval_secs: 30,
            poll_interval_ms: 1000,
            error_cooldown_ms: 5000,
            shutdown_timeout_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            max_retries: crate::models::DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    pub validation_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    pub ocr_timeout_secs: u64,
    pub comparison_timeout_secs: u64,
    pub ai_timeout_secs: u64,
    pub max_file_size_bytes: u64,
    pub allowed_content_types: Vec<String>,
    pub min_authenticity_score: f64,
}

impl Default for StageSettings {
    fn default() -> Self {
        let handlers = HandlerSettings::default();
        let t = &handlers.timeouts;
        Self {
            validation_timeout_secs: t.document_validation.as_secs(),
            upload_timeout_secs: t.s3_upload.as_secs(),
            ocr_timeout_secs: t.ocr_extraction.as_secs(),
            comparison_timeout_secs: t.data_comparison.as_secs(),
            ai_timeout_secs: t.ai_verification.as_secs(),
            max_file_size_bytes: handlers.max_file_size,
            allowed_content_types: handlers.allowed_content_types.clone(),
            min_authenticity_score: handlers.min_authenticity_score,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Expose `DELETE /api/queues`.
    pub allow_destructive: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            allow_destructive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorSettings {
    /// Document service base URL. Unset means in-memory collaborators.
    pub base_url: Option<String>,
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for CollaboratorSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            request_timeout_secs: 30,
        }
    }
}

/// All runtime settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub queue: QueueSettings,
    pub workers: WorkerSettings,
    pub retry: RetrySettings,
    pub stages: StageSettings,
    pub server: ServerSettings,
    pub collaborators: CollaboratorSettings,
}

impl Settings {
    /// Load from `path`, else `$DOCVERIFY_CONFIG`, else a `docverify` config
    /// file discovered in the standard locations, then apply environment
    /// overrides.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path.map(Path::to_path_buf).or_else(|| {
            std::env::var("DOCVERIFY_CONFIG")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
        });
        let path = match explicit {
            Some(path) => Some(path),
            None => Self::discover().await,
        };

        let mut settings = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Find a config file with prefer's discovery rules.
    async fn discover() -> Option<PathBuf> {
        match prefer::load("docverify").await {
            Ok(found) => found.source_path().map(|p| p.to_path_buf()),
            Err(_) => {
                tracing::debug!("No docverify config file discovered, using defaults");
                None
            }
        }
    }

    /// Parse a TOML or JSON (by `.json` extension) settings file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str(&contents).map_err(|source| ConfigError::ParseJson {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            _ => toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
        };
        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok(settings)
    }

    /// Override fields from environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("REDIS_URL") {
            self.queue.redis_url = url;
        }
        if let Some(raw) = get("DOCVERIFY_QUEUE_BACKEND") {
            self.queue.backend = QueueBackend::from_str(&raw).ok_or(ConfigError::InvalidEnv {
                name: "DOCVERIFY_QUEUE_BACKEND",
                value: raw,
            })?;
        }
        if let Some(raw) = get("DOCVERIFY_MAX_QUEUE_SIZE") {
            self.queue.max_queue_size = parse_env("DOCVERIFY_MAX_QUEUE_SIZE", raw)?;
        }
        if let Some(raw) = get("DOCVERIFY_WORKERS_PER_STAGE") {
            self.workers.default_per_stage = parse_env("DOCVERIFY_WORKERS_PER_STAGE", raw)?;
        }
        if let Some(url) = get("DOCVERIFY_COLLABORATOR_URL") {
            self.collaborators.base_url = Some(url);
        }
        if let Some(token) = get("DOCVERIFY_COLLABORATOR_TOKEN") {
            self.collaborators.api_token = Some(token);
        }
        if let Some(host) = get("DOCVERIFY_HOST") {
            self.server.host = host;
        }
        if let Some(raw) = get("DOCVERIFY_PORT") {
            self.server.port = parse_env("DOCVERIFY_PORT", raw)?;
        }
        if let Some(raw) = get("DOCVERIFY_ALLOW_DESTRUCTIVE") {
            self.server.allow_destructive = matches!(
                raw.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            );
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.workers;
        if w.min_per_stage == 0 || w.min_per_stage > w.max_per_stage {
            return Err(ConfigError::Invalid(format!(
                "workers.min_per_stage ({}) must be between 1 and workers.max_per_stage ({})",
                w.min_per_stage, w.max_per_stage
            )));
        }
        if w.messages_per_worker == 0 {
            return Err(ConfigError::Invalid(
                "workers.messages_per_worker must be positive".into(),
            ));
        }
        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::Invalid("queue.max_queue_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.stages.min_authenticity_score) {
            return Err(ConfigError::Invalid(
                "stages.min_authenticity_score must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn queue_store_config(&self) -> QueueStoreConfig {
        QueueStoreConfig {
            message_ttl: Duration::from_secs(self.queue.message_ttl_secs),
            dead_letter_ttl: Duration::from_secs(self.queue.dead_letter_ttl_secs),
            metrics_ttl: Duration::from_secs(self.queue.metrics_ttl_secs),
        }
    }

    pub fn queue_limits(&self) -> QueueHealthLimits {
        QueueHealthLimits {
            max_queue_size: self.queue.max_queue_size,
            max_message_age: Duration::from_secs(self.queue.max_message_age_secs),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            default_workers_per_stage: self.workers.default_per_stage,
            min_workers_per_stage: self.workers.min_per_stage,
            max_workers_per_stage: self.workers.max_per_stage,
            messages_per_worker: self.workers.messages_per_worker,
            shutdown_timeout: Duration::from_secs(self.workers.shutdown_timeout_secs),
        }
    }

    pub fn worker_timing(&self) -> WorkerTiming {
        WorkerTiming {
            poll_interval: Duration::from_millis(self.workers.poll_interval_ms),
            error_cooldown: Duration::from_millis(self.workers.error_cooldown_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        let s = &self.stages;
        HandlerSettings {
            timeouts: StageTimeouts {
                document_validation: Duration::from_secs(s.validation_timeout_secs),
                s3_upload: Duration::from_secs(s.upload_timeout_secs),
                ocr_extraction: Duration::from_secs(s.ocr_timeout_secs),
                data_comparison: Duration::from_secs(s.comparison_timeout_secs),
                ai_verification: Duration::from_secs(s.ai_timeout_secs),
            },
            max_file_size: s.max_file_size_bytes,
            allowed_content_types: s.allowed_content_types.clone(),
            min_authenticity_score: s.min_authenticity_score,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            monitor_interval: Duration::from_secs(self.workers.monitor_interval_secs),
            lease_timeout: Duration::from_secs(self.queue.lease_timeout_secs),
            max_retries: self.retry.max_retries,
            queue_limits: self.queue_limits(),
        }
    }
}

impl Settings {
    /// Open the configured queue backend.
    pub async fn connect_queue(&self) -> QueueResult<Arc<dyn QueueStore>> {
        match self.queue.backend {
            QueueBackend::Memory => {
                tracing::warn!("Using in-memory queue store; queued work is lost on exit");
                Ok(Arc::new(InMemoryQueueStore::new()))
            }
            #[cfg(feature = "redis-backend")]
            QueueBackend::Redis => {
                let store = crate::queue::RedisQueueStore::connect(
                    &self.queue.redis_url,
                    self.queue_store_config(),
                )
                .await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "redis-backend"))]
            QueueBackend::Redis => Err(crate::queue::QueueError::Unavailable(
                "built without the redis-backend feature".into(),
            )),
        }
    }

    /// HTTP collaborators when a base URL is configured, in-memory ones
    /// otherwise.
    pub fn collaborators(&self) -> CollaboratorResult<Collaborators> {
        let c = &self.collaborators;
        match &c.base_url {
            Some(url) => {
                let client = HttpCollaborators::new(
                    url.clone(),
                    c.api_token.clone(),
                    Duration::from_secs(c.request_timeout_secs),
                )?;
                tracing::debug!(base_url = %url, "Using HTTP collaborators");
                Ok(Collaborators::from_backend(Arc::new(client)))
            }
            None => {
                tracing::warn!("No collaborator URL configured; using in-memory collaborators");
                Ok(Collaborators::from_backend(Arc::new(InMemoryCollaborators::new()))
                    .with_log_sink(Arc::new(TracingLogSink)))
            }
        }
    }

    /// Wire registry, workers and orchestrator around a store.
    pub fn assemble(&self, store: Arc<dyn QueueStore>, collab: Collaborators) -> Pipeline {
        let registry = StageRegistry::with_default_handlers(&collab, &self.handler_settings());
        let ctx = Arc::new(WorkerContext {
            scheduler: Arc::new(RetryScheduler::new(store.clone())),
            store: store.clone(),
            registry: Arc::new(registry),
            collab,
            retry: self.retry_policy(),
            timing: self.worker_timing(),
        });
        let pool = Arc::new(WorkerPool::new(ctx, self.pool_settings()));
        Pipeline::new(store, pool, self.pipeline_settings())
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value: raw })
}
