//! Queue a document from the command line.

use clap::Args;
use console::style;

use crate::cli::helpers::{build_pipeline, parse_amount_minor};
use crate::config::Settings;
use crate::models::{DocumentMetadata, ExpectedPayment, Priority, ProcessingOptions};

#[derive(Args)]
pub struct EnqueueArgs {
    /// Document ID known to the document service
    pub document_id: String,
    /// Uploading user
    #[arg(long)]
    pub user: String,
    /// Object key in blob storage
    #[arg(long)]
    pub storage_key: String,
    /// File size in bytes
    #[arg(long)]
    pub size: u64,
    #[arg(long, default_value = "application/pdf")]
    pub content_type: String,
    #[arg(long)]
    pub filename: Option<String>,
    #[arg(long)]
    pub transaction: Option<String>,
    /// high, medium or low
    #[arg(short, long, default_value = "medium")]
    pub priority: String,
    /// Expected payment amount, e.g. 1250.00
    #[arg(long, requires = "currency")]
    pub amount: Option<String>,
    /// ISO 4217 currency of the expected payment
    #[arg(long, requires = "amount")]
    pub currency: Option<String>,
    /// Expected transfer reference
    #[arg(long, requires = "amount")]
    pub reference: Option<String>,
    /// OCR language hints (repeatable)
    #[arg(long = "language")]
    pub languages: Vec<String>,
    /// Per-stage timeout override in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

impl EnqueueArgs {
    fn metadata(&self) -> anyhow::Result<DocumentMetadata> {
        let mut metadata = DocumentMetadata::new(
            self.user.clone(),
            self.storage_key.clone(),
            self.size,
            self.content_type.clone(),
        );
        metadata.original_filename = self.filename.clone();
        metadata.transaction_id = self.transaction.clone();

        if let (Some(amount), Some(currency)) = (&self.amount, &self.currency) {
            metadata.expected_payment = Some(ExpectedPayment {
                amount_minor: parse_amount_minor(amount)?,
                currency: currency.to_uppercase(),
                reference: self.reference.clone(),
            });
        }
        Ok(metadata)
    }

    fn options(&self) -> ProcessingOptions {
        ProcessingOptions {
            timeout_secs: self.timeout,
            language_hints: self.languages.clone(),
            ..Default::default()
        }
    }
}

pub async fn cmd_enqueue(settings: &Settings, args: EnqueueArgs) -> anyhow::Result<()> {
    let priority = Priority::from_str(&args.priority)
        .ok_or_else(|| anyhow::anyhow!("Unknown priority: {}", args.priority))?;
    let metadata = args.metadata()?;

    let pipeline = build_pipeline(settings).await?;
    let receipt = pipeline
        .start_document_processing(&args.document_id, metadata, priority, args.options())
        .await?;

    println!(
        "{} Queued {} at {} ({} priority)",
        style("✓").green(),
        style(&args.document_id).cyan(),
        receipt.stage,
        receipt.priority
    );
    println!("  Message:  {}", receipt.message_id);
    println!("  Position: {}", receipt.position);
    println!(
        "  Estimate: ~{}s",
        receipt.estimated_processing_ms / 1000
    );
    Ok(())
}
