//! # Sync Harness CLI (`sx`)
//!
//! The `sx` binary runs configured synchronizations between JSON/HTTP
//! systems and inspects their state.
//!
//! ## Usage
//!
//! ```bash
//! sx --config ./config/sx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sx init` | Create the SQLite database and run schema migrations |
//! | `sx list` | List configured synchronizations |
//! | `sx run <id>` | Run one synchronization and its follow-ups |
//! | `sx contracts <id>` | Show the contract ledger of a synchronization |
//! | `sx logs` | Show recent run logs |
//! | `sx logs purge` | Delete run logs past their retention |
//! | `sx mapping test <name> <file>` | Apply a mapping to a JSON file |
//!
//! ## Examples
//!
//! ```bash
//! # Dry run: count what would change without writing anything
//! sx run customers --test
//!
//! # Rewrite every object even if unchanged, print the result as JSON
//! sx run customers --force --json
//!
//! # Try a mapping against a sample payload
//! sx mapping test customer ./samples/customer.json
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use sync_harness::{config, inspect, logging, migrate, run};
use sync_harness_core::models::{LogLevel, RunOptions};

/// Sync Harness: contract-based synchronization between JSON APIs.
#[derive(Parser)]
#[command(name = "sx", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// List configured synchronizations.
    List,

    /// Run one synchronization.
    ///
    /// Objects synced before the last edit of this synchronization's
    /// configuration (or a mapping it uses) are rewritten.
    /// Exits non-zero when the run ends with level ERROR.
    Run {
        /// Synchronization id or slug.
        synchronization: String,

        /// Evaluate and count every action without writing to the target
        /// or persisting contracts.
        #[arg(long)]
        test: bool,

        /// Update objects even when their fingerprint is unchanged.
        #[arg(long)]
        force: bool,

        /// Print the run result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the contracts of a synchronization.
    Contracts {
        /// Synchronization id or slug.
        synchronization: String,
    },

    /// Show recent run logs.
    Logs {
        #[command(subcommand)]
        action: Option<LogsAction>,

        /// Only logs of this synchronization id.
        #[arg(long)]
        synchronization: Option<String>,

        /// Maximum number of logs to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Work with mappings.
    Mapping {
        #[command(subcommand)]
        action: MappingAction,
    },
}

#[derive(Subcommand)]
enum LogsAction {
    /// Delete run logs whose retention has expired.
    Purge,
}

#[derive(Subcommand)]
enum MappingAction {
    /// Apply a configured mapping to a JSON file and print the result.
    Test {
        /// Mapping name.
        name: String,
        /// Path to the input JSON document.
        input: PathBuf,
        /// Treat the input as a list and map every entry.
        #[arg(long)]
        list: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::List => {
            inspect::list_synchronizations(&cfg)?;
        }
        Commands::Run {
            synchronization,
            test,
            force,
            json,
        } => {
            let options = RunOptions { test, force };
            let result = run::run_synchronization(&cfg, &synchronization, options, json).await?;
            if result.level == LogLevel::Error {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Contracts { synchronization } => {
            inspect::list_contracts(&cfg, &synchronization).await?;
        }
        Commands::Logs {
            action,
            synchronization,
            limit,
        } => match action {
            Some(LogsAction::Purge) => inspect::purge_logs(&cfg).await?,
            None => inspect::list_logs(&cfg, synchronization.as_deref(), limit).await?,
        },
        Commands::Mapping { action } => match action {
            MappingAction::Test { name, input, list } => {
                inspect::test_mapping(&cfg, &name, &input, list)?;
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}
