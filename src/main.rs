mod cloud;
mod commands;
mod config;
mod directory;
mod domain;
mod error;
mod logging;
mod notify;
mod retry;
mod sync;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::sync::SyncArgs;

#[derive(Parser)]
#[command(name = "jms-sync", version, about = "Sync cloud VM inventories into JumpServer assets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile every enabled cloud account into JumpServer
    Sync {
        /// Path to config file (default: ./config.yaml, then ~/.config/jms-sync/config.yaml)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Whole-run retries when every account aborts (overrides config)
        #[arg(long)]
        retries: Option<u32>,

        /// Seconds between whole-run retries (overrides config)
        #[arg(long)]
        interval: Option<u64>,

        /// Write the run summary as JSON to this file
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Log level (overrides config; RUST_LOG wins over both)
        #[arg(long)]
        log_level: Option<String>,

        /// Show what would change without touching JumpServer
        #[arg(long)]
        diff: bool,
    },

    /// Validate the config and test JumpServer connectivity
    Check {
        /// Path to config file
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Sync {
            config,
            retries,
            interval,
            output,
            log_level,
            diff,
        } => commands::sync::run(SyncArgs {
            config,
            retries,
            interval,
            output,
            log_level,
            diff,
        })?,
        Commands::Check { config } => commands::check::run(config.as_deref())?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
