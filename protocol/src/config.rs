//! # Protocol Configuration & Constants
//!
//! Every magic number in Solvend lives here. If you're hardcoding a TTL or
//! a price somewhere else, move it here and owe the team coffee.
//!
//! Some of these values are shared with the on-chain program (account seeds,
//! the leaf layout, report prices). Changing those is a migration, not a
//! refactor.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Service protocol version, reported by `/health` and `version`.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Program & Accounts
// ---------------------------------------------------------------------------

/// Default address of the on-chain voucher program (base58).
pub const DEFAULT_PROGRAM_ID: &str = "FGWgre3gcnWmAod7vDuL7ziMV28bgSrG7ng69g1kZfUW";

/// Seed prefix of voucher accounts: `["voucher", wallet, nonce_le8]`.
pub const VOUCHER_SEED: &[u8] = b"voucher";

/// Seed prefix of report accounts: `["report", buyer, report_id_le8]`.
pub const REPORT_SEED: &[u8] = b"report";

/// Seed of the singleton machine configuration account.
pub const MACHINE_SEED: &[u8] = b"machine";

/// Marker appended when hashing program-derived address candidates.
pub const PDA_MARKER: &[u8] = b"ProgramDerivedAddress";

/// Maximum number of seeds in a derivation, bump excluded.
pub const MAX_SEEDS: usize = 16;

/// Maximum length of a single seed in bytes.
pub const MAX_SEED_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Redemption Codes
// ---------------------------------------------------------------------------

/// How long a freshly issued code stays redeemable.
pub const OTP_TTL: Duration = Duration::from_secs(60 * 60);

/// Default number of decimal digits in a redemption code. Short enough to
/// type on a vending machine keypad, wide enough that codes held for
/// [`CODE_RETENTION`] leave most of the space free.
pub const DEFAULT_OTP_DIGITS: u32 = 6;

/// Smallest allowed code length.
pub const MIN_OTP_DIGITS: u32 = 4;

/// Largest allowed code length. Keeps `10^digits` inside a u32.
pub const MAX_OTP_DIGITS: u32 = 9;

/// How many candidates to draw before giving up on finding a code whose hash
/// is not already held by another purchase.
pub const OTP_ISSUE_ATTEMPTS: usize = 32;

/// How long a code stays bound to its purchase after it expired. Until then
/// the code cannot be issued again, and presenting it still reaches its own
/// (redeemed or expired) purchase.
pub const CODE_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// How long one caller holds the right to issue a purchase's code before
/// another may assume it died and take over.
pub const ISSUANCE_CLAIM_LEASE: Duration = Duration::from_secs(30);

/// How long a redeem claim is held before another till may take it over.
/// Only matters when a redeem call died without writing back.
pub const REDEEM_CLAIM_LEASE: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Chain Calls
// ---------------------------------------------------------------------------

/// Upper bound on a single chain call, confirmation included.
pub const CHAIN_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Admin Authentication
// ---------------------------------------------------------------------------

/// Maximum age (and maximum future skew) of a signed admin request.
pub const ADMIN_AUTH_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Header carrying the base58 admin public key.
pub const HEADER_PUBLIC_KEY: &str = "x-public-key";

/// Header carrying the request timestamp in unix milliseconds.
pub const HEADER_TIMESTAMP: &str = "x-timestamp";

/// Header carrying the hex Ed25519 signature.
pub const HEADER_SIGNATURE: &str = "x-signature";

// ---------------------------------------------------------------------------
// Distribution Reports
// ---------------------------------------------------------------------------

/// Price of a daily report, in the token's smallest unit.
pub const REPORT_PRICE_DAILY: u64 = 1_000_000;

/// Price of a weekly report.
pub const REPORT_PRICE_WEEKLY: u64 = 5_000_000;

/// Price of a monthly report.
pub const REPORT_PRICE_MONTHLY: u64 = 20_000_000;

/// Shortest report window in days.
pub const MIN_TIMEFRAME_DAYS: u32 = 1;

/// Longest report window in days.
pub const MAX_TIMEFRAME_DAYS: u32 = 365;

// ---------------------------------------------------------------------------
// Payment Watcher
// ---------------------------------------------------------------------------

/// Poll interval of the treasury watcher.
pub const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(4_000);

/// Number of recent treasury signatures fetched per poll.
pub const WATCH_SIGNATURE_LIMIT: usize = 20;

/// How long a processed signature is remembered. Anything older than this
/// has long since fallen out of the polled window.
pub const SEEN_SIGNATURE_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Service Defaults
// ---------------------------------------------------------------------------

/// Default REST API port.
pub const DEFAULT_API_PORT: u16 = 3000;

/// Default Prometheus metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 9464;

/// Default location of the published Merkle artifact.
pub const DEFAULT_MERKLE_JSON_PATH: &str = "./data/merkle_tree.json";

/// Converts a `Duration` to whole milliseconds as i64, saturating.
pub fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
