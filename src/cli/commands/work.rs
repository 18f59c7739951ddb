//! Worker-only command.

use console::style;

use crate::cli::helpers::{build_pipeline, shutdown_signal};
use crate::config::Settings;

/// Run the pipeline workers until interrupted.
pub async fn cmd_work(settings: &Settings) -> anyhow::Result<()> {
    let pipeline = build_pipeline(settings).await?;
    pipeline.start().await?;

    println!(
        "{} Processing with {} workers",
        style("→").cyan(),
        pipeline.workers().await.len()
    );
    println!("  Press Ctrl+C to stop");

    shutdown_signal().await;

    println!("{} Stopping workers...", style("→").cyan());
    pipeline.stop().await?;

    let stats = pipeline.get_queue_stats(None).await?;
    println!(
        "{} Stopped ({} still queued, {} dead letters)",
        style("✓").green(),
        stats.total_queued(),
        stats.dead_letter_count
    );
    Ok(())
}
