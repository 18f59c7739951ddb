//! Health levels shared by the queue store, worker pool and pipeline.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Healthy only if both are healthy; unhealthy if either is.
    pub fn combine(self, other: HealthStatus) -> HealthStatus {
        self.max(other)
    }
}

#[cfg(test)]
mod tests {
    use super::HealthStatus::*;

    #[test]
    fn test_combine() {
        assert_eq!(Healthy.combine(Healthy), Healthy);
        assert_eq!(Healthy.combine(Degraded), Degraded);
        assert_eq!(Degraded.combine(Degraded), Degraded);
        assert_eq!(Unhealthy.combine(Healthy), Unhealthy);
        assert_eq!(Degraded.combine(Unhealthy), Unhealthy);
    }
}
