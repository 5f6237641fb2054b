use std::sync::Arc;

use anyhow::{Context, Result};
use ciphermed_client::{
    record::{load_record, sample_record},
    telemetry::setup_logging,
};
use ciphermed_exchange::{config::Builder, ExchangeConfig, ProtocolContext, RecordExchange};
use ciphermed_ledger::Address;
use ciphermed_localnet::{LocalNetwork, DEFAULT_PROGRAM_LABEL};
use clap::Parser;
use tracing::{error, info};

/// The directory where the logs are stored.
const LOGS: &str = "./logs";

/// Command line arguments for the record exchange client
#[derive(Parser)]
struct Args {
    /// Path to the configuration file. Without one, defaults are used for
    /// the local network's program.
    #[arg(short, long)]
    config_path: Option<String>,

    /// JSON file holding the patient record to exchange
    #[arg(short, long)]
    record_path: Option<String>,

    /// Label the paying account's address is derived from
    #[arg(short, long, default_value = "ciphermed-sender")]
    payer: String,

    /// Number of MXE account reads before the local cluster publishes its key
    #[arg(long, default_value_t = 0)]
    mxe_publish_after: u32,
}

fn load_config(args: &Args) -> Result<ExchangeConfig> {
    match &args.config_path {
        Some(path) => ExchangeConfig::from_file_path(path)
            .with_context(|| format!("Failed to load configuration from {path}")),
        None => Builder::new()
            .program_id(Address::from_label(DEFAULT_PROGRAM_LABEL))
            .build()
            .context("Failed to build default configuration"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = setup_logging(LOGS).context("Failed to setup logging")?;
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = load_config(&args)?;
    let record = match &args.record_path {
        Some(path) => load_record(path)?,
        None => sample_record(),
    };
    let cluster_offset = config
        .resolve_cluster_offset()
        .context("No cluster offset configured")?;

    info!(
        target = "ciphermed-client",
        event = "localnet_start",
        program_id = %config.program_id(),
        cluster_offset = cluster_offset,
        "Starting local network"
    );
    let network = LocalNetwork::builder()
        .program_id(config.program_id())
        .cluster_offset(cluster_offset)
        .publish_mxe_key_after(args.mxe_publish_after)
        .build()
        .context("Failed to start local network")?;

    let context = ProtocolContext::new(Arc::new(network.clone()), Arc::new(network), config)
        .context("Failed to build protocol context")?;
    let exchange = RecordExchange::new(context);
    let payer = Address::from_label(&args.payer);
    info!(
        target = "ciphermed-client",
        event = "exchange_ready",
        payer = %payer,
        cluster_offset = exchange.context().cluster_offset(),
        key_resolution_attempts = exchange.context().public_key_resolver().policy().max_attempts(),
        "Record exchange ready"
    );

    if exchange.ensure_definition(payer).await? {
        info!(
            target = "ciphermed-client",
            event = "computation_definition_registered",
            "Registered private record lookup definition"
        );
    }

    let outcome = match exchange.exchange(payer, &record).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                target = "ciphermed-client",
                event = "exchange_failed",
                phase = %e.phase(),
                error = %e,
                "Record exchange failed"
            );
            return Err(e.into());
        }
    };

    if outcome.record != record {
        anyhow::bail!(
            "Received record does not match the one sent (patient {} vs {})",
            outcome.record.patient_id,
            record.patient_id
        );
    }
    info!(
        target = "ciphermed-client",
        event = "exchange_complete",
        offset = %outcome.offset,
        store_signature = %outcome.store_signature,
        queue_signature = %outcome.queue_signature,
        polls = outcome.finalization.polls,
        patient_id = outcome.record.patient_id,
        "Record exchanged and verified"
    );
    Ok(())
}
