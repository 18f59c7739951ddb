//! Observable worker state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::Stage;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Processing,
    Error,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "idle" => Some(Self::Idle),
            "processing" => Some(Self::Processing),
            "error" => Some(Self::Error),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Whether a worker in this state still covers its stage.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

/// Snapshot of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub stage: Stage,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_message_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub processed_count: u64,
    pub error_count: u64,
    pub avg_processing_time_ms: u64,
}

impl WorkerInfo {
    pub fn new(id: String, stage: Stage) -> Self {
        let now = Utc::now();
        Self {
            id,
            stage,
            status: WorkerStatus::Starting,
            current_message_id: None,
            started_at: now,
            last_heartbeat: now,
            processed_count: 0,
            error_count: 0,
            avg_processing_time_ms: 0,
        }
    }

    /// Fold one processing duration into the running average.
    pub fn record_processed(&mut self, duration_ms: u64) {
        let prev = self.processed_count;
        self.avg_processing_time_ms = if prev == 0 {
            duration_ms
        } else {
            (self.avg_processing_time_ms * prev + duration_ms) / (prev + 1)
        };
        self.processed_count = prev + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average() {
        let mut info = WorkerInfo::new("w-1".into(), Stage::OcrExtraction);
        info.record_processed(100);
        info.record_processed(300);
        info.record_processed(200);
        assert_eq!(info.processed_count, 3);
        assert_eq!(info.avg_processing_time_ms, 200);
    }

    #[test]
    fn test_stopped_is_inactive() {
        assert!(WorkerStatus::Error.is_active());
        assert!(!WorkerStatus::Stopped.is_active());
    }
}
