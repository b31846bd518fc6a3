//! # kb-sync CLI (`kbsync`)
//!
//! ```bash
//! kbsync --config ./config/kbsync.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbsync init` | Create the SQLite database and run schema migrations |
//! | `kbsync sync <source\|all>` | Detect changes and process them until idle |
//! | `kbsync watch <source>` | Poll a source continuously |
//! | `kbsync query "<text>"` | Query the live index |
//! | `kbsync dead-letter list\|retry` | Inspect or retry permanently failed work |
//! | `kbsync generations` | Generation history |
//! | `kbsync rollback <gen>` | Make a retained generation live again |
//! | `kbsync alerts` | Quality regression alerts |
//! | `kbsync tombstones` | Delete audit trail |
//! | `kbsync stats` | Index overview |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use kb_sync::commands;
use kb_sync::config;
use kb_sync::models::GenerationId;
use kb_sync::progress::ProgressMode;

/// Incremental knowledge-base synchronization engine.
#[derive(Parser)]
#[command(
    name = "kbsync",
    about = "Keep a retrieval index in sync with its knowledge sources",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbsync.toml")]
    config: PathBuf,

    /// Progress output on stderr: auto, human, json or off.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Detect changes in a source (or `all`) and process them until idle.
    Sync {
        /// Source name from `[sources.filesystem.<name>]`, or `all`.
        source: String,

        /// Ignore recorded hashes and re-embed every document.
        #[arg(long)]
        full: bool,
    },

    /// Poll a source continuously until Ctrl-C.
    Watch {
        source: String,

        /// Seconds between scans.
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },

    /// Query the live index.
    Query {
        text: String,

        /// Only chunks from this source type (`file`, `database_row`, `api_feed`).
        #[arg(long)]
        source_type: Option<String>,

        #[arg(long)]
        category: Option<String>,

        /// Maximum number of results (default `[quality] top_k`).
        #[arg(long)]
        limit: Option<usize>,

        /// Query a retained generation instead of the live one.
        #[arg(long)]
        generation: Option<GenerationId>,
    },

    /// Inspect and retry permanently failed change events.
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterAction,
    },

    /// List committed and rolled-back generations, most recent first.
    Generations {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Make a retained generation live again.
    Rollback { generation: GenerationId },

    /// List quality regression alerts.
    Alerts,

    /// List delete audit records.
    Tombstones {
        #[arg(long)]
        document: Option<String>,
    },

    /// Show index statistics.
    Stats,
}

#[derive(Subcommand)]
enum DeadLetterAction {
    List,
    /// Re-enqueue a dead letter at high priority and process it.
    Retry { id: String },
}

fn progress_mode(value: &str) -> anyhow::Result<ProgressMode> {
    Ok(match value {
        "auto" => ProgressMode::default_for_tty(),
        "human" => ProgressMode::Human,
        "json" => ProgressMode::Json,
        "off" => ProgressMode::Off,
        other => anyhow::bail!(
            "Unknown progress mode: {}. Use auto, human, json, or off.",
            other
        ),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let progress = progress_mode(&cli.progress)?;
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Sync { source, full } => {
            commands::run_sync(&cfg, &source, full, progress).await?;
        }
        Commands::Watch { source, interval } => {
            commands::run_watch(&cfg, &source, interval, progress).await?;
        }
        Commands::Query {
            text,
            source_type,
            category,
            limit,
            generation,
        } => {
            commands::run_query(&cfg, &text, source_type, category, limit, generation).await?;
        }
        Commands::DeadLetter { action } => match action {
            DeadLetterAction::List => commands::run_dead_letter_list(&cfg).await?,
            DeadLetterAction::Retry { id } => {
                commands::run_dead_letter_retry(&cfg, &id, progress).await?;
            }
        },
        Commands::Generations { limit } => commands::run_generations(&cfg, limit).await?,
        Commands::Rollback { generation } => commands::run_rollback(&cfg, generation).await?,
        Commands::Alerts => commands::run_alerts(&cfg).await?,
        Commands::Tombstones { document } => commands::run_tombstones(&cfg, document).await?,
        Commands::Stats => commands::run_stats(&cfg).await?,
    }

    Ok(())
}
