use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ecat_core::{RunState, RunSummary};
use ecat_storage::RunArchive;
use ecat_sync::{DatasetRegistry, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_FAILED: u8 = 1;
const EXIT_INTERVENTION: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "ecat-cli")]
#[command(about = "Ecosystem catalog harvester")]
struct Cli {
    /// Debug logging unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, merge and publish one dataset.
    Sync {
        #[arg(long)]
        dataset: String,
    },
    /// Print the effective configuration and dataset registry.
    ShowConfig,
    /// Remove the halt marker left by a fatal inconsistency.
    ClearHalt {
        #[arg(long)]
        dataset: String,
    },
    /// Markdown digest of recent archived runs.
    History {
        #[arg(long)]
        dataset: String,
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match real_main(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:?}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn real_main(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Sync { dataset } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling before publish");
                    on_signal.cancel();
                }
            });

            let summary = ecat_sync::run_dataset_from_env(&dataset, cancel).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing run summary")?
            );
            Ok(exit_code(&summary))
        }
        Commands::ShowConfig => {
            let config = SyncConfig::from_env()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            match DatasetRegistry::load(&config.datasets_file).await {
                Ok(registry) => {
                    println!("{}", serde_json::to_string_pretty(&registry.datasets)?);
                }
                Err(err) => warn!("{err:#}"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::ClearHalt { dataset } => {
            let config = SyncConfig::from_env()?;
            let archive = RunArchive::new(config.reports_dir);
            if archive.clear_halt_marker(&dataset).await? {
                info!(dataset = %dataset, "halt marker cleared");
            } else {
                info!(dataset = %dataset, "dataset was not halted");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::History { dataset, runs } => {
            let config = SyncConfig::from_env()?;
            let markdown = ecat_sync::report::history_markdown(&config.reports_dir, &dataset, runs).await?;
            println!("{markdown}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(summary: &RunSummary) -> ExitCode {
    if summary.requires_intervention {
        return ExitCode::from(EXIT_INTERVENTION);
    }
    match summary.final_state {
        RunState::Succeeded => ExitCode::SUCCESS,
        _ => ExitCode::from(EXIT_FAILED),
    }
}
