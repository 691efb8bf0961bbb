//! # Repo Lens CLI (`lens`)
//!
//! The `lens` binary runs a map-reduce analysis over a local source tree and
//! prints a structured architecture report, or serves the same pipeline over
//! HTTP with streamed progress.
//!
//! ## Usage
//!
//! ```bash
//! lens --config ./config/lens.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lens analyze <path>` | Analyse a directory and print the report |
//! | `lens analyze <path> --chat` | Then answer follow-up questions from stdin |
//! | `lens analyze <path> --dry-run` | Show files, tokens and chunks without calling the model |
//! | `lens serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! export OPENROUTER_API_KEY=...
//! lens analyze ../my-service > report.md
//! lens analyze . --chat --progress json
//! lens serve --config ./config/lens.toml
//! ```
//!
//! Logging is controlled with `RUST_LOG` (default `info`) and goes to stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use repo_lens::analyze::{run_analyze, AnalyzeOptions};
use repo_lens::config;
use repo_lens::progress::ProgressMode;
use repo_lens::server;

/// Repo Lens: architecture reports for arbitrary source trees.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "lens",
    about = "Repo Lens: map-reduce architecture reports and follow-up Q&A for source trees",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lens.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyse a local repository and print the report to stdout.
    Analyze {
        /// Repository root directory.
        path: PathBuf,

        /// After the report, answer follow-up questions read from stdin.
        #[arg(long)]
        chat: bool,

        /// Scan and chunk only; no model calls and no API key needed.
        #[arg(long)]
        dry_run: bool,

        /// Progress output: `human`, `json` or `off`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<ProgressMode>,
    },

    /// Start the HTTP server.
    ///
    /// Binds to `server.bind` and exposes session, analysis (SSE) and
    /// question endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Analyze {
            path,
            chat,
            dry_run,
            progress,
        } => {
            let opts = AnalyzeOptions {
                chat,
                dry_run,
                progress: progress.unwrap_or_else(ProgressMode::default_for_tty),
            };
            run_analyze(&cfg, &path, opts).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
