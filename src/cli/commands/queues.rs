//! Queue inspection and maintenance commands.

use console::style;

use crate::cli::helpers::build_pipeline;
use crate::config::Settings;
use crate::models::Stage;

/// Print per-stage, per-priority queue statistics.
pub async fn cmd_stats(settings: &Settings, stage: Option<&str>, json: bool) -> anyhow::Result<()> {
    let stage = stage
        .map(|name| Stage::from_str(name).ok_or_else(|| anyhow::anyhow!("Unknown stage: {}", name)))
        .transpose()?;

    let pipeline = build_pipeline(settings).await?;
    let stats = pipeline.get_queue_stats(stage).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("\n{}", style("Queue Statistics").bold());
    println!("{}", "-".repeat(78));
    println!(
        "{:<22} {:<8} {:>7} {:>9} {:>9} {:>10} {:>9}",
        "Stage", "Priority", "Depth", "Enqueued", "Dequeued", "Avg wait", "Per hour"
    );
    println!("{}", "-".repeat(78));

    for stage_stats in &stats.stages {
        for p in &stage_stats.priorities {
            println!(
                "{:<22} {:<8} {:>7} {:>9} {:>9} {:>8}ms {:>9}",
                stage_stats.stage.as_str(),
                p.priority.as_str(),
                p.depth,
                p.enqueued_total,
                p.dequeued_total,
                p.avg_wait_ms,
                p.throughput_per_hour
            );
        }
        if stage_stats.in_flight > 0 {
            println!(
                "{:<22} {}",
                "",
                style(format!("{} in flight", stage_stats.in_flight)).dim()
            );
        }
    }

    println!("{}", "-".repeat(78));
    println!("{:<31} {:>7}", style("Total queued").bold(), stats.total_queued());
    println!("{:<31} {:>7}", "Dead letters", stats.dead_letter_count);
    if let Some(oldest) = stats.oldest_enqueued_at() {
        println!("{:<31} {}", "Oldest message", oldest.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    Ok(())
}

/// Delete all queue data. Requires `--yes`.
pub async fn cmd_clear(settings: &Settings, yes: bool) -> anyhow::Result<()> {
    if !yes {
        println!(
            "{} This deletes every queued message, lease, dead letter and metric.",
            style("!").yellow()
        );
        println!("  Re-run with --yes to confirm.");
        return Ok(());
    }

    let pipeline = build_pipeline(settings).await?;
    let deleted = pipeline.clear_all_queues().await?;
    println!("{} Cleared {} entries", style("✓").green(), deleted);
    Ok(())
}
