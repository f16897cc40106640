// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Solvend Node
//!
//! Entry point for the `solvend-node` binary. Parses CLI arguments,
//! initializes logging and metrics, starts the payment watcher, and serves
//! the REST API.
//!
//! - `run`          — serve the API, metrics, and watcher
//! - `merkle build` — claims JSON to tree artifact
//! - `merkle publish` — artifact to ledger
//! - `keygen`       — generate an admin keypair
//! - `sign-admin`   — produce auth headers for an admin request
//! - `version`      — print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

use solvend_protocol::auth::{sign_request, AdminAuthGate};
use solvend_protocol::chain::SimulatedChain;
use solvend_protocol::clock::{Clock, SystemClock};
use solvend_protocol::crypto::address::Address;
use solvend_protocol::crypto::keys::AdminKeypair;
use solvend_protocol::distribution::BatchService;
use solvend_protocol::merkle::{Claim, ClaimProofService};
use solvend_protocol::purchase::{LogNotifier, PurchaseService, PurchaseSettings};
use solvend_protocol::storage::SolvendDB;
use solvend_protocol::watcher::{PaymentWatcher, WatcherConfig};

use cli::{Commands, MerkleCommand, SolvendCli};
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = SolvendCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Merkle(MerkleCommand::Build(args)) => merkle_build(args),
        Commands::Merkle(MerkleCommand::Publish(args)) => merkle_publish(args),
        Commands::Keygen(args) => keygen(args),
        Commands::SignAdmin(args) => sign_admin(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn parse_address(what: &str, value: &str) -> Result<Address> {
    value
        .trim()
        .parse::<Address>()
        .with_context(|| format!("invalid {what} address: {value}"))
}

fn open_db(data_dir: &Path) -> Result<Arc<SolvendDB>> {
    let db_path = data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = SolvendDB::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");
    Ok(Arc::new(db))
}

/// Serves the API, the metrics endpoint, and the payment watcher until a
/// shutdown signal arrives.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_DIRECTIVE, args.log_format.into());

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        "starting solvend-node"
    );

    let admin = parse_address("admin", &args.admin_pubkey)?;
    let treasury = parse_address("treasury", &args.treasury)?;
    let program_id = parse_address("program id", &args.program_id)?;

    // --- Persistent storage ---
    let db = open_db(&args.data_dir)?;

    // --- Chain ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let chain = Arc::new(SimulatedChain::new(clock.clone()));
    tracing::warn!("no chain RPC backend configured, using the in-process simulated ledger");

    // --- Services ---
    let mut settings = PurchaseSettings::new(program_id, treasury);
    settings.otp_ttl = Duration::from_secs(args.otp_ttl_secs);
    settings.otp_digits = args.otp_digits;
    let purchases = PurchaseService::new(
        db.clone(),
        chain.clone(),
        clock.clone(),
        Arc::new(LogNotifier),
        settings,
    )
    .context("invalid purchase settings")?;
    let batches = BatchService::new(db.clone(), chain.clone(), clock.clone(), program_id, treasury);
    let claims = ClaimProofService::new(db.clone());

    if args.merkle_json.exists() {
        let artifact = claims.import_file(&args.merkle_json).with_context(|| {
            format!("failed to import merkle tree from {}", args.merkle_json.display())
        })?;
        tracing::info!(root = %artifact.root, leaves = artifact.leaves.len(), "merkle tree imported");
    } else {
        match claims.published_root()? {
            Some(root) => tracing::info!(root = %root, "serving previously published merkle tree"),
            None => tracing::info!("no merkle tree published yet, claim proofs unavailable"),
        }
    }

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new());

    // --- Payment watcher ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher_task = if args.no_watcher {
        tracing::info!("payment watcher disabled");
        None
    } else {
        let watcher = PaymentWatcher::new(
            chain.clone(),
            purchases.clone(),
            batches.clone(),
            db.clone(),
            clock.clone(),
            WatcherConfig {
                interval: Duration::from_millis(args.watch_interval_ms),
                ..WatcherConfig::default()
            },
        );
        let metrics_ref = Arc::clone(&node_metrics);
        Some(tokio::spawn(async move {
            watcher
                .run(shutdown_rx, |result| metrics_ref.record_tick(result))
                .await;
        }))
    };

    // --- Application state ---
    let app_state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            solvend_protocol::config::PROTOCOL_VERSION,
        ),
        purchases,
        batches,
        claims,
        gate: AdminAuthGate::new(admin, clock.clone()),
        metrics: Arc::clone(&node_metrics),
    };
    tracing::info!(admin = %admin, treasury = %treasury, "admin gate configured");

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(task) = watcher_task {
        if let Err(e) = task.await {
            tracing::error!("watcher task failed: {}", e);
        }
    }
    db.flush().context("failed to flush database")?;
    tracing::info!("solvend-node stopped");
    Ok(())
}

/// Builds a tree artifact from a JSON array of `{claimant, amount}`.
fn merkle_build(args: cli::MerkleBuildArgs) -> Result<()> {
    logging::init_logging("solvend_node=info", LogFormat::Pretty);

    let raw = std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let claims: Vec<Claim> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse claims from {}", args.input.display()))?;
    let count = claims.len();

    let artifact = ClaimProofService::build(claims).context("failed to build merkle tree")?;
    artifact
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    println!("Merkle tree built.");
    println!("  Claims : {}", count);
    println!("  Root   : {}", artifact.root);
    println!("  Output : {}", args.output.display());
    Ok(())
}

/// Validates an artifact and makes it the published tree.
fn merkle_publish(args: cli::MerklePublishArgs) -> Result<()> {
    logging::init_logging("solvend_node=info,solvend_protocol=info", LogFormat::Pretty);

    let db = open_db(&args.data_dir)?;
    let artifact = ClaimProofService::new(db.clone())
        .import_file(&args.input)
        .with_context(|| format!("failed to publish {}", args.input.display()))?;
    db.flush().context("failed to flush database")?;

    println!("Merkle tree published.");
    println!("  Root   : {}", artifact.root);
    println!("  Leaves : {}", artifact.leaves.len());
    Ok(())
}

/// Generates an admin keypair.
fn keygen(args: cli::KeygenArgs) -> Result<()> {
    let keypair = AdminKeypair::generate();
    let public_key = keypair.address();

    match args.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(&path, keypair.secret_key_hex())
                .with_context(|| format!("failed to write admin key to {}", path.display()))?;

            // Restrict permissions on Unix.
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            }

            println!("Admin key written to {}", path.display());
            println!("  Public key : {}", public_key);
        }
        None => {
            println!("Public key : {}", public_key);
            println!("Secret key : {}", keypair.secret_key_hex());
        }
    }
    Ok(())
}

/// Prints the three admin auth headers for a request body.
fn sign_admin(args: cli::SignAdminArgs) -> Result<()> {
    let keypair = AdminKeypair::from_hex(args.secret_key.trim()).context("invalid admin secret key")?;
    let body: serde_json::Value =
        serde_json::from_str(&args.body).context("request body is not valid JSON")?;
    let timestamp = args
        .timestamp
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    let headers =
        sign_request(&keypair, timestamp, &body).context("failed to sign request body")?;
    println!("{}: {}", solvend_protocol::config::HEADER_PUBLIC_KEY, headers.public_key);
    println!("{}: {}", solvend_protocol::config::HEADER_TIMESTAMP, headers.timestamp);
    println!("{}: {}", solvend_protocol::config::HEADER_SIGNATURE, headers.signature);
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("solvend-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", solvend_protocol::config::PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
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
