//! Pipeline stages and scheduling priorities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step of the fixed verification sequence.
///
/// Declaration order is pipeline order: a successful stage hands the
/// document to the variant declared after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DocumentValidation,
    S3Upload,
    OcrExtraction,
    DataComparison,
    AiVerification,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::DocumentValidation,
        Stage::S3Upload,
        Stage::OcrExtraction,
        Stage::DataComparison,
        Stage::AiVerification,
    ];

    /// Entry point of every pipeline run.
    pub const FIRST: Stage = Stage::DocumentValidation;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentValidation => "document_validation",
            Self::S3Upload => "s3_upload",
            Self::OcrExtraction => "ocr_extraction",
            Self::DataComparison => "data_comparison",
            Self::AiVerification => "ai_verification",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "document_validation" => Some(Self::DocumentValidation),
            "s3_upload" => Some(Self::S3Upload),
            "ocr_extraction" => Some(Self::OcrExtraction),
            "data_comparison" => Some(Self::DataComparison),
            "ai_verification" => Some(Self::AiVerification),
            _ => None,
        }
    }

    /// The stage that follows this one, or `None` for the last stage.
    pub fn next(&self) -> Option<Stage> {
        let idx = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling tier within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Dequeue precedence: earlier entries are drained first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Weight subtracted from the enqueue timestamp when scoring.
    ///
    /// The gaps are larger than any realistic queue residency, so a
    /// higher tier always scores below a lower one.
    pub fn weight_ms(&self) -> i64 {
        match self {
            Self::High => 3_000_000_000,
            Self::Medium => 2_000_000_000,
            Self::Low => 1_000_000_000,
        }
    }

    /// Base processing estimate before queue position is taken into account.
    pub fn base_estimate_ms(&self) -> u64 {
        match self {
            Self::High => 30_000,
            Self::Medium => 60_000,
            Self::Low => 120_000,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::DocumentValidation.next(), Some(Stage::S3Upload));
        assert_eq!(Stage::S3Upload.next(), Some(Stage::OcrExtraction));
        assert_eq!(Stage::OcrExtraction.next(), Some(Stage::DataComparison));
        assert_eq!(Stage::DataComparison.next(), Some(Stage::AiVerification));
        assert_eq!(Stage::AiVerification.next(), None);
        assert!(Stage::AiVerification.is_last());
    }

    #[test]
    fn test_stage_string_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_str(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::from_str("fax_ingest"), None);
    }

    #[test]
    fn test_priority_weights_are_ordered() {
        assert!(Priority::High.weight_ms() > Priority::Medium.weight_ms());
        assert!(Priority::Medium.weight_ms() > Priority::Low.weight_ms());
        assert_eq!(Priority::from_str("urgent"), None);
    }
}
