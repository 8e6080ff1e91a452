use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cleanup;
mod commands;
mod config;
mod database;
mod descriptor;
mod error;
mod gateway;
mod health;
mod locks;
mod manager;
mod resources;
mod retry;
mod runtime;
mod templates;

#[derive(Parser)]
#[command(name = "sandboxd")]
#[command(
    author,
    version,
    about = "Sandbox lifecycle and resource-allocation orchestrator"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Write logs to daily files in this directory instead of stderr
    #[arg(long, global = true, env = "SANDBOXD_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter sandboxd.toml in the current directory
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Create the configured sandboxes and manage them until Ctrl-C
    Run {
        /// Configuration file
        #[arg(short, long, default_value = config::CONFIG_FILE)]
        config: PathBuf,
    },

    /// Show managed sandboxes and their containers
    Status {
        /// Configuration file
        #[arg(short, long, default_value = config::CONFIG_FILE)]
        config: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Tear down sandboxes left behind by a previous run
    Clean {
        /// Sandbox ids to clean
        ids: Vec<String>,

        /// Clean every managed sandbox
        #[arg(long)]
        all: bool,

        /// Configuration file
        #[arg(short, long, default_value = config::CONFIG_FILE)]
        config: PathBuf,
    },
}

/// Installs the global subscriber. Keep the returned guard alive so file
/// logs are flushed on exit.
fn init_logging(verbose: bool, format: LogFormat, log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("sandboxd=debug")
        } else {
            EnvFilter::new("sandboxd=info")
        }
    });

    let (writer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sandboxd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(writer).with_ansi(log_dir.is_none()))
            .init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(writer)).init(),
    }
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging(cli.verbose, cli.log_format, cli.log_dir.as_ref());

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
        }
        Commands::Run { config } => {
            commands::run::run(&config).await?;
        }
        Commands::Status { config, json } => {
            commands::status::run(&config, json).await?;
        }
        Commands::Clean { ids, all, config } => {
            commands::clean::run(&config, &ids, all).await?;
        }
    }

    Ok(())
}
