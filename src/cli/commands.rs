//! CLI commands implementation.

mod dead_letters;
mod enqueue;
mod queues;
mod serve;
mod work;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Settings;

pub use enqueue::EnqueueArgs;

#[derive(Parser)]
#[command(name = "docverify")]
#[command(about = "Payment document verification pipeline")]
#[command(version)]
pub struct Cli {
    /// Config file (TOML)
    #[arg(short, long, global = true, env = "DOCVERIFY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run workers and the HTTP API
    Serve {
        /// Address to bind (port, host, or host:port)
        #[arg(short, long)]
        bind: Option<String>,
        /// Serve the API without starting workers
        #[arg(long)]
        no_workers: bool,
    },

    /// Run workers only, until Ctrl+C
    Work,

    /// Queue a document for verification
    Enqueue(EnqueueArgs),

    /// Show queue statistics
    Stats {
        /// Limit to one stage (e.g. ocr_extraction)
        #[arg(short, long)]
        stage: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Inspect or retry dead-lettered messages
    DeadLetters {
        #[command(subcommand)]
        command: DeadLetterCommands,
    },

    /// Delete every queue, lease, dead letter and metric
    ClearQueues {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum DeadLetterCommands {
    /// List the most recent entries
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Re-queue an entry at the stage it failed in
    Retry {
        /// Dead-letter (message) ID
        id: String,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Serve { bind, no_workers } => {
            serve::cmd_serve(&settings, bind.as_deref(), no_workers).await
        }
        Commands::Work => work::cmd_work(&settings).await,
        Commands::Enqueue(args) => enqueue::cmd_enqueue(&settings, args).await,
        Commands::Stats { stage, json } => {
            queues::cmd_stats(&settings, stage.as_deref(), json).await
        }
        Commands::DeadLetters { command } => match command {
            DeadLetterCommands::List { limit, json } => {
                dead_letters::cmd_list(&settings, limit, json).await
            }
            DeadLetterCommands::Retry { id } => dead_letters::cmd_retry(&settings, &id).await,
        },
        Commands::ClearQueues { yes } => queues::cmd_clear(&settings, yes).await,
    }
}
