//! Data comparison: extracted fields against the declared payment.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{HandlerSettings, StageHandler};
use crate::models::{
    codes, ComparisonResult, DocumentRecord, ExpectedPayment, ExtractedData, FieldComparison,
    QueueMessage, Stage, StageError,
};
use crate::services::Collaborators;

pub struct DataComparisonStage {
    collab: Collaborators,
    timeout: Duration,
}

impl DataComparisonStage {
    pub fn new(collab: Collaborators, settings: &HandlerSettings) -> Self {
        Self {
            collab,
            timeout: settings.timeouts.data_comparison,
        }
    }
}

/// Uppercase alphanumerics only, so "ref-123 " matches "REF123".
fn normalize_reference(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Compare every field the uploader declared.
pub fn compare(expected: &ExpectedPayment, extracted: &ExtractedData) -> ComparisonResult {
    let mut fields = vec![
        FieldComparison {
            field: "amount".into(),
            expected: Some(expected.amount_minor.to_string()),
            extracted: extracted.amount_minor.map(|a| a.to_string()),
            matches: extracted.amount_minor == Some(expected.amount_minor),
        },
        FieldComparison {
            field: "currency".into(),
            expected: Some(expected.currency.clone()),
            extracted: extracted.currency.clone(),
            matches: extracted
                .currency
                .as_deref()
                .is_some_and(|c| c.trim().eq_ignore_ascii_case(expected.currency.trim())),
        },
    ];

    if let Some(reference) = &expected.reference {
        let wanted = normalize_reference(reference);
        let found = extracted
            .reference
            .as_deref()
            .map(normalize_reference)
            .unwrap_or_default();
        let in_text = normalize_reference(&extracted.raw_text).contains(&wanted);
        fields.push(FieldComparison {
            field: "reference".into(),
            expected: Some(reference.clone()),
            extracted: extracted.reference.clone(),
            matches: !wanted.is_empty() && (found == wanted || in_text),
        });
    }

    ComparisonResult {
        matches: fields.iter().all(|f| f.matches),
        fields,
    }
}

#[async_trait]
impl StageHandler for DataComparisonStage {
    fn stage(&self) -> Stage {
        Stage::DataComparison
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn validate(
        &self,
        _message: &QueueMessage,
        document: &DocumentRecord,
    ) -> Result<(), StageError> {
        if document.extracted_data.is_none() {
            return Err(StageError::permanent(
                codes::MISSING_EXTRACTION,
                format!("document {} has no extracted data", document.id),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        message: &QueueMessage,
        document: &DocumentRecord,
    ) -> Result<Option<Value>, StageError> {
        let extracted = document.extracted_data.clone().unwrap_or_default();

        let result = match &message.metadata.expected_payment {
            Some(expected) => compare(expected, &extracted),
            None => ComparisonResult {
                matches: true,
                fields: Vec::new(),
            },
        };

        self.collab
            .documents
            .update_comparison_results(&document.id, &result)
            .await?;

        if !result.matches {
            return Err(StageError::permanent(
                codes::DATA_MISMATCH,
                format!(
                    "declared payment does not match document: {}",
                    result.mismatched_fields().join(", ")
                ),
            ));
        }

        serde_json::to_value(&result)
            .map(Some)
            .map_err(|e| StageError::permanent(codes::DATA_MISMATCH, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::DocumentStore;
    use crate::stages::testing::{fixture, message, DOC};
    use crate::stages::StageRegistry;
    use std::sync::Arc;

    fn expected() -> ExpectedPayment {
        ExpectedPayment {
            amount_minor: 125_000,
            currency: "MXN".into(),
            reference: Some("ref-123".into()),
        }
    }

    fn extracted() -> ExtractedData {
        ExtractedData {
            raw_text: "Transferencia SPEI 1,250.00 MXN".into(),
            amount_minor: Some(125_000),
            currency: Some("mxn".into()),
            reference: Some("REF123".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_all_fields_match() {
        let result = compare(&expected(), &extracted());
        assert!(result.matches);
        assert_eq!(result.fields.len(), 3);
    }

    #[test]
    fn test_amount_mismatch_reported() {
        let mut data = extracted();
        data.amount_minor = Some(12_500);
        let result = compare(&expected(), &data);
        assert!(!result.matches);
        assert_eq!(result.mismatched_fields(), vec!["amount"]);
    }

    #[test]
    fn test_reference_found_in_text() {
        let mut data = extracted();
        data.reference = None;
        data.raw_text.push_str(" Ref: REF-123");
        assert!(compare(&expected(), &data).matches);
    }

    #[tokio::test]
    async fn test_mismatch_is_stored_and_permanent() {
        let (backend, collab) = fixture().await;
        let mut data = extracted();
        data.currency = Some("USD".into());
        backend.update_extracted_data(DOC, &data).await.unwrap();

        let mut registry = StageRegistry::new(collab.documents.clone());
        registry.register(Arc::new(DataComparisonStage::new(collab, &HandlerSettings::default())));

        let mut msg = message(Stage::DataComparison);
        msg.metadata.expected_payment = Some(expected());
        let result = registry.execute(&msg).await;

        assert!(result.requires_manual_review);
        assert_eq!(result.error.unwrap().code, codes::DATA_MISMATCH);
        let stored = backend.comparison(DOC).await.unwrap();
        assert_eq!(stored.mismatched_fields(), vec!["currency"]);
    }

    #[tokio::test]
    async fn test_requires_prior_extraction() {
        let (_, collab) = fixture().await;
        let mut registry = StageRegistry::new(collab.documents.clone());
        registry.register(Arc::new(DataComparisonStage::new(collab, &HandlerSettings::default())));

        let result = registry.execute(&message(Stage::DataComparison)).await;
        assert_eq!(result.error.unwrap().code, codes::MISSING_EXTRACTION);
    }
}
