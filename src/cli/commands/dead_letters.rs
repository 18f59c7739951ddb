//! Dead-letter commands.

use console::style;

use crate::cli::helpers::build_pipeline;
use crate::config::Settings;

pub async fn cmd_list(settings: &Settings, limit: usize, json: bool) -> anyhow::Result<()> {
    let pipeline = build_pipeline(settings).await?;
    let entries = pipeline.dead_letters(limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("{} No dead letters", style("✓").green());
        return Ok(());
    }

    for entry in &entries {
        let retry = if entry.can_retry_manually {
            style("retryable").green()
        } else {
            style("final").red()
        };
        println!(
            "{} {} {} [{}]",
            style(entry.id()).cyan(),
            entry.message.document_id,
            entry.message.stage,
            retry
        );
        println!(
            "    {} after {} retries: {}",
            entry.failed_at.format("%Y-%m-%d %H:%M:%S"),
            entry.retry_count,
            entry.reason
        );
    }
    println!("\n{} entries", entries.len());
    Ok(())
}

pub async fn cmd_retry(settings: &Settings, id: &str) -> anyhow::Result<()> {
    let pipeline = build_pipeline(settings).await?;
    let receipt = pipeline.retry_dead_letter(id).await?;

    println!(
        "{} Re-queued {} at {} as {}",
        style("✓").green(),
        id,
        receipt.stage,
        style(&receipt.message_id).cyan()
    );
    Ok(())
}
