// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # TOSS Device Node
//!
//! Entry point for the `toss-node` binary. Hosts one offline device: its key,
//! its intent store, background housekeeping and reconciliation, and a small
//! HTTP API.
//!
//! - `init`          — create the data directory and a device key
//! - `run`           — run the engine and serve the API until interrupted
//! - `create-intent` — sign and store an intent, print it as JSON
//! - `verify-intent` — check a stored or exported intent
//! - `list-intents`  — show stored intents
//! - `version`       — print build version information

mod api;
mod cli;
mod home;
mod logging;
mod maintenance;
mod metrics;
mod offline;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

use toss_protocol::clock::system_clock;
use toss_protocol::crypto::PublicKey;
use toss_protocol::intent::{Intent, IntentCodec, IntentExtras};

use cli::{Commands, NodeArgs, TossNodeCli};
use home::DataDir;
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TossNodeCli::parse();

    match cli.command {
        Commands::Init(args) => {
            init_logging(&args.node);
            init_node(args)
        }
        Commands::Run(args) => {
            init_logging(&args.node);
            run_node(args).await
        }
        Commands::CreateIntent(args) => {
            init_logging(&args.node);
            create_intent(args).await
        }
        Commands::VerifyIntent(args) => {
            init_logging(&args.node);
            verify_intent(args)
        }
        Commands::ListIntents(args) => {
            init_logging(&args.node);
            list_intents(args)
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn init_logging(node: &NodeArgs) {
    logging::init_logging(
        logging::DEFAULT_FILTER,
        LogFormat::from_str_lossy(&node.log_format),
    );
}

fn init_node(args: cli::InitArgs) -> Result<()> {
    let home = DataDir::new(&args.node.data_dir);
    let keypair = home.init(args.force)?;

    println!("Initialized device in {}", args.node.data_dir.display());
    println!("  key:       {}", home.key_path().display());
    println!("  config:    {}", home.config_path().display());
    println!("  device id: {}", keypair.public_key().to_base58());
    Ok(())
}

/// Runs the device engine, the maintenance loop and the HTTP API until
/// SIGINT or SIGTERM.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    let home = DataDir::new(&args.node.data_dir);
    let config = home.load_config(args.node.config.as_deref())?;
    let sweep_every = config.housekeeping_interval();
    let (device, store) = home.open_device(config)?;
    let device = Arc::new(device);

    tracing::info!(
        device_id = %device.id(),
        data_dir = %args.node.data_dir.display(),
        api_port = args.api_port,
        "starting toss-node"
    );

    let metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let maintenance = tokio::spawn(maintenance::maintenance_loop(
        device.clone(),
        metrics.clone(),
        sweep_every,
        Duration::from_secs(args.reconcile_interval),
        shutdown_rx,
    ));

    let state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        device: device.clone(),
        metrics,
    };
    let router = api::create_router(state);

    let addr = format!("{}:{}", args.api_host, args.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", addr))?;
    tracing::info!(addr = %addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    maintenance
        .await
        .context("maintenance task panicked")?;
    store.flush().context("failed to flush intent store")?;
    Ok(())
}

async fn create_intent(args: cli::CreateIntentArgs) -> Result<()> {
    let home = DataDir::new(&args.node.data_dir);
    let config = home.load_config(args.node.config.as_deref())?;
    let (device, store) = home.open_device(config)?;

    let recipient = PublicKey::from_base58(&args.recipient)
        .with_context(|| format!("invalid recipient {}", args.recipient))?;
    let nonce_account_ref = args
        .nonce_account
        .as_deref()
        .map(PublicKey::from_base58)
        .transpose()
        .context("invalid nonce account")?;
    let expiry = device.codec().now().saturating_add(args.expires_in);

    let intent = device
        .create_intent(
            recipient,
            args.amount,
            expiry,
            IntentExtras {
                nonce_account_ref,
                ..Default::default()
            },
        )
        .await
        .context("failed to create intent")?;
    store.flush().context("failed to flush intent store")?;

    if intent.replay_unverified {
        eprintln!("warning: ledger unreachable, nonce {} is unverified", intent.nonce);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&intent).context("failed to encode intent")?
    );
    Ok(())
}

fn verify_intent(args: cli::VerifyIntentArgs) -> Result<()> {
    let (intent, codec) = match (&args.id, &args.file) {
        (Some(id), _) => {
            let home = DataDir::new(&args.node.data_dir);
            let config = home.load_config(args.node.config.as_deref())?;
            let (device, _store) = home.open_device(config)?;
            let intent = device
                .store()
                .get_intent(id)
                .context("failed to read intent store")?
                .with_context(|| format!("no stored intent with id {}", id))?;
            (intent, device.codec().clone())
        }
        (None, Some(path)) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let intent: Intent = serde_json::from_str(&raw)
                .with_context(|| format!("{} does not hold an intent", path.display()))?;
            (intent, IntentCodec::new(system_clock()))
        }
        (None, None) => bail!("pass --id or --file"),
    };

    let verdict = codec.verify(&intent);
    match verdict.reason {
        None => {
            println!("intent {} is valid", intent.id);
            Ok(())
        }
        Some(reason) => bail!("intent {} is invalid: {}", intent.id, reason),
    }
}

fn list_intents(args: cli::ListIntentsArgs) -> Result<()> {
    let filter = match args.status.as_deref() {
        None => None,
        Some(name) => Some(
            api::parse_status(name).with_context(|| format!("unknown status {}", name))?,
        ),
    };

    let home = DataDir::new(&args.node.data_dir);
    let config = home.load_config(args.node.config.as_deref())?;
    let (device, _store) = home.open_device(config)?;
    let views: Vec<api::IntentView> = device
        .store()
        .list_intents()
        .context("failed to read intent store")?
        .iter()
        .filter(|i| filter.map_or(true, |s| i.status == s))
        .map(api::IntentView::from)
        .collect();

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&views).context("failed to encode intents")?
        );
        return Ok(());
    }

    println!(
        "{:<36}  {:<9}  {:>12}  {:>6}  {:<20}  {}",
        "ID", "STATUS", "AMOUNT", "NONCE", "EXPIRES", "RECIPIENT"
    );
    for view in &views {
        let expires = chrono::DateTime::from_timestamp(view.expiry as i64, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| view.expiry.to_string());
        println!(
            "{:<36}  {:<9}  {:>12}  {:>6}  {:<20}  {}",
            view.id, view.status, view.amount, view.nonce, expires, view.recipient
        );
    }
    Ok(())
}

fn print_version() {
    println!("toss-node {}", env!("CARGO_PKG_VERSION"));
    println!(
        "intent schema v{}",
        toss_protocol::config::INTENT_SCHEMA_VERSION
    );
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
