//! Web server command.

use console::style;

use crate::cli::helpers::{build_pipeline, parse_bind_address, shutdown_signal};
use crate::config::Settings;
use crate::server::AppState;

/// Start the workers and the HTTP API.
pub async fn cmd_serve(settings: &Settings, bind: Option<&str>, no_workers: bool) -> anyhow::Result<()> {
    let mut server = settings.server.clone();
    if let Some(bind) = bind {
        (server.host, server.port) = parse_bind_address(bind, &server.host, server.port);
    }

    let pipeline = build_pipeline(settings).await?;
    if !no_workers {
        pipeline.start().await?;
        println!(
            "{} Started {} workers",
            style("→").cyan(),
            pipeline.workers().await.len()
        );
    }

    println!(
        "{} Starting docverify API at http://{}:{}",
        style("→").cyan(),
        server.host,
        server.port
    );
    println!("  Press Ctrl+C to stop");

    let state = AppState::new(pipeline.clone(), &server);
    let served = crate::server::serve(state, &server, shutdown_signal()).await;

    if pipeline.is_running().await {
        println!("{} Stopping workers...", style("→").cyan());
        pipeline.stop().await?;
    }
    served
}
