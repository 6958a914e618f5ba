// src/cli/mod.rs — CLI definition (clap derive)

pub mod experiment;
pub mod migrate;
pub mod progress;
pub mod run;
pub mod serve;
pub mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::infra::config::{Config, StorageBackend};

#[derive(Parser)]
#[command(
    name = "promptloop",
    about = "Iterative prompt evaluation and refinement",
    version
)]
pub struct Cli {
    /// Config file path (defaults to ~/.promptloop/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register an experiment and drive it until the loop stops
    Run {
        /// Experiment document (TOML)
        experiment: PathBuf,
        /// Keep results in memory only
        #[arg(long)]
        ephemeral: bool,
        /// Suppress progress output (only emit the final prompt)
        #[arg(long)]
        quiet: bool,
    },
    /// Run worker pools and the HTTP trigger API
    Serve {
        /// Override `[api].port`
        #[arg(short, long)]
        port: Option<u16>,
        /// Register these experiments at startup if they are not stored yet
        #[arg(short, long = "experiment")]
        experiments: Vec<PathBuf>,
    },
    /// Show the stored status of an iteration
    Status {
        iteration_id: String,
        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Show or manage database schema migrations
    Migrate {
        #[arg(long)]
        status: bool,
        /// Revert the most recent migration
        #[arg(long)]
        rollback: bool,
    },
}

/// Load the config the command line points at, or the default location.
pub fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Config::load_from(p),
        None => Config::load(),
    }
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::Run {
            experiment,
            ephemeral,
            quiet,
        } => {
            if ephemeral {
                config.storage.backend = StorageBackend::Memory;
            }
            run::run_experiment(config, &experiment, quiet).await
        }
        Commands::Serve { port, experiments } => {
            if let Some(port) = port {
                config.api.port = port;
            }
            serve::run_serve(config, &experiments).await
        }
        Commands::Status { iteration_id, json } => {
            status::show_iteration(&config, &iteration_id, json)
        }
        Commands::Migrate { status, rollback } => {
            migrate::run_migrate(&config, status, rollback)
        }
    }
}
