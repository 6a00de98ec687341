//! `botkube-agent`: runs the configured executor and source plugins.
//!
//! The agent resolves every enabled plugin against its repository index,
//! launches the plugin processes, supervises them with the configured restart
//! policy and forwards source events until it is interrupted.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use botkube_config::Config;
use clap::{Parser, Subcommand};

mod commands;
mod dispatch;

use commands::{check, index, run};

/// Botkube agent - plugin runtime
#[derive(Parser)]
#[command(name = "botkube-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, env = "BOTKUBE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the enabled plugins and supervise them until interrupted
    Run,

    /// Start every enabled plugin once, report its status and stop
    Check,

    /// Work with repository indexes
    Index {
        #[command(subcommand)]
        command: IndexCommands,
    },
}

#[derive(Subcommand)]
enum IndexCommands {
    /// Generate an index from a directory of released plugin binaries
    Build {
        /// Directory containing `{kind}_{name}_{os}_{arch}` binaries
        #[arg(long)]
        bin_dir: PathBuf,

        /// URL prefix the binaries will be served under
        #[arg(long)]
        url_base: String,

        /// Version recorded for every entry
        #[arg(long)]
        version: String,

        /// Write the index here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Index { command }) => {
            setup_logging(&Config::default(), cli.log_level.as_deref());
            match command {
                IndexCommands::Build {
                    bin_dir,
                    url_base,
                    version,
                    output,
                } => index::build_index(&bin_dir, &url_base, &version, output.as_deref()),
            }
        },
        command => {
            let config =
                Config::load(cli.config.as_deref()).context("loading configuration")?;
            setup_logging(&config, cli.log_level.as_deref());

            if matches!(command, Some(Commands::Check)) {
                check::check_plugins(&config).await
            } else {
                run::run_agent(&config).await
            }
        },
    }
}

fn setup_logging(config: &Config, level: Option<&str>) {
    let mut log_config = match botkube_telemetry::LogConfig::try_from(&config.log) {
        Ok(log_config) => log_config,
        Err(e) => {
            eprintln!("Invalid log configuration, using defaults: {e}");
            botkube_telemetry::LogConfig::default()
        },
    };
    if let Some(level) = level {
        level.clone_into(&mut log_config.level);
    }
    if let Err(e) = botkube_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }
}
