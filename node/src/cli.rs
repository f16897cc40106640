//! # CLI Interface
//!
//! Command-line structure for `solvend-node`, built with `clap` derive.
//! Every `run` flag can also come from a `SOLVEND_*` environment variable.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use solvend_protocol::config;

/// Solvend purchase, redemption and distribution service.
#[derive(Parser, Debug)]
#[command(
    name = "solvend-node",
    about = "Solvend purchase, redemption and distribution service",
    version,
    propagate_version = true
)]
pub struct SolvendCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the REST API, the metrics endpoint and the payment watcher.
    Run(RunArgs),
    /// Offline distribution tree jobs.
    #[command(subcommand)]
    Merkle(MerkleCommand),
    /// Generate an admin keypair.
    Keygen(KeygenArgs),
    /// Produce admin auth headers for a request body.
    SignAdmin(SignAdminArgs),
    /// Print version information and exit.
    Version,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Directory holding the ledger database. Created if missing.
    #[arg(long, short = 'd', env = "SOLVEND_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Port for the REST API.
    #[arg(long, env = "SOLVEND_API_PORT", default_value_t = config::DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "SOLVEND_METRICS_PORT", default_value_t = config::DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Base58 public key allowed to call the admin endpoints.
    #[arg(long, env = "SOLVEND_ADMIN_PUBKEY")]
    pub admin_pubkey: String,

    /// Base58 token account buyers pay into.
    #[arg(long, env = "SOLVEND_TREASURY")]
    pub treasury: String,

    /// Base58 id of the voucher program.
    #[arg(long, env = "SOLVEND_PROGRAM_ID", default_value = config::DEFAULT_PROGRAM_ID)]
    pub program_id: String,

    /// Lifetime of a redemption code, in seconds.
    #[arg(long, env = "SOLVEND_OTP_TTL_SECS", default_value_t = config::OTP_TTL.as_secs())]
    pub otp_ttl_secs: u64,

    /// Number of digits in a redemption code.
    #[arg(long, env = "SOLVEND_OTP_DIGITS", default_value_t = config::DEFAULT_OTP_DIGITS)]
    pub otp_digits: u32,

    /// Disable the treasury payment watcher.
    #[arg(long, env = "SOLVEND_NO_WATCHER")]
    pub no_watcher: bool,

    /// Watcher poll interval, in milliseconds.
    #[arg(
        long,
        env = "SOLVEND_WATCH_INTERVAL_MS",
        default_value_t = config::WATCH_POLL_INTERVAL.as_millis() as u64
    )]
    pub watch_interval_ms: u64,

    /// Distribution tree artifact to publish at startup, if the file exists.
    #[arg(long, env = "SOLVEND_MERKLE_JSON", default_value = config::DEFAULT_MERKLE_JSON_PATH)]
    pub merkle_json: PathBuf,

    /// Log output format.
    #[arg(long, env = "SOLVEND_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,
}

/// `merkle` subcommands.
#[derive(Subcommand, Debug)]
pub enum MerkleCommand {
    /// Build a tree artifact from a JSON list of `{claimant, amount}`.
    Build(MerkleBuildArgs),
    /// Validate an artifact and make it the published tree.
    Publish(MerklePublishArgs),
}

#[derive(Args, Debug)]
pub struct MerkleBuildArgs {
    /// Claims JSON file.
    #[arg(long, short = 'i')]
    pub input: PathBuf,

    /// Where to write the artifact.
    #[arg(long, short = 'o', default_value = config::DEFAULT_MERKLE_JSON_PATH)]
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct MerklePublishArgs {
    /// Artifact JSON file.
    #[arg(long, short = 'i', default_value = config::DEFAULT_MERKLE_JSON_PATH)]
    pub input: PathBuf,

    #[arg(long, short = 'd', env = "SOLVEND_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Write the secret key (hex) to this file instead of stdout.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SignAdminArgs {
    /// Hex-encoded admin secret key.
    #[arg(long, env = "SOLVEND_ADMIN_SECRET")]
    pub secret_key: String,

    /// JSON body that will be sent.
    #[arg(long)]
    pub body: String,

    /// Unix milliseconds to sign with. Defaults to now.
    #[arg(long)]
    pub timestamp: Option<i64>,
}
