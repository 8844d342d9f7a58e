//! Bridge Transfer - cross-chain NFT transfers with a durable audit trail
//!
//! Sends an asset from a source chain to a destination chain through the
//! source chain's bridge contract, tracking every transfer as a persisted
//! record that only moves forward.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use uuid::Uuid;

mod audit;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod state;
mod tx;

use audit::AuditLog;
use chain::{Chain, EvmLedgerClient};
use config::Settings;
use coordination::{TransferOrchestrator, TransferRequest, TransferStatus};
use state::TransferStore;

#[derive(Parser, Debug)]
#[command(name = "bridge-transfer", version, about = "Cross-chain NFT transfer tool")]
struct Cli {
    /// Configuration file (defaults to $BRIDGE_TRANSFER_CONFIG, then config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send an asset across chains and wait for the outcome
    Transfer {
        /// Token id of the asset to send
        #[arg(long, alias = "token-id")]
        asset_id: String,

        /// Source chain
        #[arg(long, value_enum)]
        from: Chain,

        /// Destination chain
        #[arg(long, value_enum)]
        to: Chain,

        /// Receiver address on the destination chain
        #[arg(long)]
        receiver: String,
    },

    /// Show one transfer
    Status { transfer_id: Uuid },

    /// List transfers, oldest first
    List {
        #[arg(long, value_enum)]
        status: Option<TransferStatus>,
    },

    /// Count transfers per status
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::load(cli.config.as_deref())?;

    let store = Arc::new(
        TransferStore::connect(&settings.store)
            .await
            .with_context(|| format!("Failed to open transfer store {:?}", settings.store.path))?,
    );
    store.run_migrations().await?;

    match cli.command {
        Command::Transfer {
            asset_id,
            from,
            to,
            receiver,
        } => {
            let audit = AuditLog::open(&settings.audit.log_path)
                .await
                .with_context(|| format!("Failed to open audit log {:?}", settings.audit.log_path))?;
            let ledger = Arc::new(EvmLedgerClient::new(&settings));
            let orchestrator = TransferOrchestrator::new(
                store.clone(),
                ledger,
                Arc::new(audit),
                settings.transfer.confirmation_timeout(),
            );

            info!("Starting transfer of asset {} from {} to {}", asset_id, from, to);
            let request = TransferRequest {
                asset_id,
                source_chain: from,
                destination_chain: to,
                receiver,
            };

            match orchestrator.execute_until(request, shutdown_signal()).await {
                Ok(record) => {
                    print_json(&record)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    error!("{}", e);
                    if let Some(transfer_id) = e.transfer_id() {
                        match store.get(transfer_id).await {
                            Ok(record) => print_json(&record)?,
                            Err(load_err) => warn!("Could not load transfer {}: {}", transfer_id, load_err),
                        }
                    }
                    Ok(ExitCode::from(e.exit_code()))
                }
            }
        }

        Command::Status { transfer_id } => {
            let record = store.get(transfer_id).await?;
            print_json(&record)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::List { status } => {
            let records = store.list(status).await?;
            print_json(&records)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Stats => {
            let stats = store.stats().await?;
            print_json(&stats)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_transfer=debug,sqlx=warn"));

    // stdout carries JSON output
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, cancelling transfer");
}
