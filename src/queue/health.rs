//! Queue store health evaluation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::health::HealthStatus;

/// Fraction of the soft ceiling at which the queue reports degraded.
pub const DEGRADED_RATIO: f64 = 0.8;

/// Thresholds the queue health check is measured against.
#[derive(Debug, Clone)]
pub struct QueueHealthLimits {
    /// Soft ceiling on messages waiting across all stages.
    pub max_queue_size: u64,
    /// Oldest waiting message may not be older than this.
    pub max_message_age: Duration,
}

impl Default for QueueHealthLimits {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_message_age: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    pub status: HealthStatus,
    pub reachable: bool,
    pub total_queued: u64,
    pub max_queue_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_message_age_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl QueueHealth {
    pub fn unreachable(limits: &QueueHealthLimits, error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            reachable: false,
            total_queued: 0,
            max_queue_size: limits.max_queue_size,
            oldest_message_age_secs: None,
            issues: vec![error.into()],
        }
    }

    /// Grade a reachable store from its depth and oldest message age.
    pub fn evaluate(
        limits: &QueueHealthLimits,
        total_queued: u64,
        oldest_age: Option<Duration>,
    ) -> Self {
        let mut status = HealthStatus::Healthy;
        let mut issues = Vec::new();

        if total_queued >= limits.max_queue_size {
            status = HealthStatus::Unhealthy;
            issues.push(format!(
                "queue size {} at or above limit {}",
                total_queued, limits.max_queue_size
            ));
        } else if total_queued as f64 >= limits.max_queue_size as f64 * DEGRADED_RATIO {
            status = HealthStatus::Degraded;
            issues.push(format!(
                "queue size {} above {:.0}% of limit {}",
                total_queued,
                DEGRADED_RATIO * 100.0,
                limits.max_queue_size
            ));
        }

        if let Some(age) = oldest_age {
            if age >= limits.max_message_age {
                status = HealthStatus::Unhealthy;
                issues.push(format!(
                    "oldest message waiting {}s (limit {}s)",
                    age.as_secs(),
                    limits.max_message_age.as_secs()
                ));
            }
        }

        Self {
            status,
            reachable: true,
            total_queued,
            max_queue_size: limits.max_queue_size,
            oldest_message_age_secs: oldest_age.map(|a| a.as_secs()),
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> QueueHealthLimits {
        QueueHealthLimits {
            max_queue_size: 100,
            max_message_age: Duration::from_secs(1800),
        }
    }

    #[test]
    fn test_healthy_below_threshold() {
        let health = QueueHealth::evaluate(&limits(), 79, Some(Duration::from_secs(60)));
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.issues.is_empty());
    }

    #[test]
    fn test_degraded_at_eighty_percent() {
        let health = QueueHealth::evaluate(&limits(), 80, None);
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_unhealthy_at_ceiling() {
        let health = QueueHealth::evaluate(&limits(), 100, None);
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_unhealthy_when_oldest_message_too_old() {
        let health = QueueHealth::evaluate(&limits(), 3, Some(Duration::from_secs(1801)));
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.oldest_message_age_secs, Some(1801));
    }

    #[test]
    fn test_unreachable_is_unhealthy() {
        let health = QueueHealth::unreachable(&limits(), "connection refused");
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(!health.reachable);
    }
}
