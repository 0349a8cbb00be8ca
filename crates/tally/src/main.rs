//! Tally - per-user session time tracking
//!
//! Main entry point for the tally CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tally_config::{LoadedConfig, LoggingConfig};
use tracing_appender::non_blocking::WorkerGuard;

mod commands;

use commands::{report, run};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Tally - per-user session time tracking
#[derive(Parser)]
#[command(name = "tally")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file to use instead of discovery
    #[arg(long, global = true, env = "TALLY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Track sessions from start/end lines on stdin
    Run(run::RunArgs),

    /// Show a user's accumulated hours
    Hours(report::ReportArgs),

    /// Show when a user's last session ended
    Last(report::ReportArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

/// Console filter when `--verbose` is given.
const VERBOSE_FILTER: &str = "tally=debug,tally_session=debug,tally_store=debug,tally_config=debug,info";

/// Filter for the JSON log files.
const FILE_FILTER: &str = "tally=trace,tally_session=trace,tally_store=debug,tally_config=debug,info";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = load_config(cli.config.as_ref())?;
    let _guard = init_logging(cli.verbose, &loaded.config.logging());

    for warning in &loaded.warnings {
        eprintln!("warning: {}", warning);
    }
    if cli.verbose {
        let sources = loaded.loaded_from();
        if sources.is_empty() {
            eprintln!("No config files found, using defaults");
        } else {
            for source in sources {
                eprintln!("Loaded config: {}", source.display());
            }
        }
    }

    let ctx = commands::Context {
        config: loaded.config,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Hours(args) => report::hours(args, &ctx).await,
        Commands::Last(args) => report::last(args, &ctx).await,
    }
}

fn load_config(explicit: Option<&PathBuf>) -> Result<LoadedConfig> {
    let Some(path) = explicit else {
        return Ok(tally_config::load_config(None)?);
    };

    let config = tally_config::load_config_file(path)?;
    Ok(LoadedConfig {
        config,
        sources: vec![tally_config::ConfigSource {
            path: path.clone(),
            loaded: true,
        }],
        warnings: Vec::new(),
    })
}

/// Console (human-readable, stderr) plus, when a log directory is
/// configured, daily-rotated JSON files. The guard must outlive the program.
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let console_filter = if verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.console_filter))
    };

    let (file_writer, guard) = match &logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tally.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };
    let file_layer = file_writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(EnvFilter::new(FILE_FILTER))
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(file_layer)
        .init();

    guard
}
