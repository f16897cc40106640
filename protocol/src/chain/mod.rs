//! # Chain Client
//!
//! The on-chain program is opaque to us. We know four instructions and the
//! accounts they touch; everything else is the program's business:
//!
//! | Call                        | Account                                   |
//! |-----------------------------|-------------------------------------------|
//! | `create_voucher`            | voucher PDA `["voucher", wallet, nonce]`  |
//! | `redeem_voucher`            | same voucher PDA                          |
//! | `attach_report_data`        | report PDA `["report", buyer, id]`        |
//! | `submit_distribution_root`  | same report PDA                           |
//!
//! Every call is awaited to completion (or timeout) and never retried
//! automatically. Retries come from the caller, later, and carry the same
//! [`IdempotencyKey`] so the client can recognise a resend and return the
//! original receipt instead of doing the work twice.

pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::crypto::address::Address;
use crate::crypto::hash::Hash32;
use crate::error::{Classify, ErrorClass};

pub use simulated::SimulatedChain;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of a chain call.
///
/// The retryable/terminal split is decided here, where the failure is best
/// understood, and threaded up unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("chain unavailable: {0}")]
    Unavailable(String),

    #[error("chain call timed out after {0:?}")]
    Timeout(Duration),

    #[error("chain rejected the call: {0}")]
    Rejected(String),

    #[error("voucher already redeemed")]
    AlreadyRedeemed,

    #[error("voucher expired")]
    VoucherExpired,

    #[error("expiry must be in the future")]
    InvalidExpiry,

    #[error("account {0} not found")]
    AccountNotFound(String),

    #[error("insufficient funds")]
    InsufficientFunds,
}

impl ChainError {
    /// True for transient failures worth retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Unavailable(_) | ChainError::Timeout(_))
    }
}

impl Classify for ChainError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Upstream {
            retryable: self.is_retryable(),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Which instruction a key is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainOp {
    CreateVoucher,
    RedeemVoucher,
    SubmitRoot,
    AttachReportData,
}

impl ChainOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainOp::CreateVoucher => "create_voucher",
            ChainOp::RedeemVoucher => "redeem_voucher",
            ChainOp::SubmitRoot => "submit_root",
            ChainOp::AttachReportData => "attach_report_data",
        }
    }
}

/// `"<reference_id>:<op>"`. Same intent, same key, however many times it
/// is sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(reference_id: &str, op: ChainOp) -> Self {
        Self(format!("{}:{}", reference_id, op.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVoucherRequest {
    pub key: IdempotencyKey,
    pub user: Address,
    pub voucher: Address,
    pub otp_hash: Hash32,
    /// Unix seconds.
    pub expiry_ts: i64,
    pub nonce: u64,
    pub is_free: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemVoucherRequest {
    pub key: IdempotencyKey,
    pub voucher: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRootRequest {
    pub key: IdempotencyKey,
    pub report: Address,
    pub buyer: Address,
    pub report_id: u64,
    pub merkle_root: Hash32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachReportDataRequest {
    pub key: IdempotencyKey,
    pub report: Address,
    pub buyer: Address,
    pub report_id: u64,
    pub ipfs_cid: String,
}

/// Proof a call landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReceipt {
    /// Transaction signature (base58).
    pub signature: String,
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// The program's instruction surface.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn create_voucher(&self, req: CreateVoucherRequest) -> Result<ChainReceipt, ChainError>;

    async fn redeem_voucher(&self, req: RedeemVoucherRequest) -> Result<ChainReceipt, ChainError>;

    async fn submit_distribution_root(
        &self,
        req: SubmitRootRequest,
    ) -> Result<ChainReceipt, ChainError>;

    async fn attach_report_data(
        &self,
        req: AttachReportDataRequest,
    ) -> Result<ChainReceipt, ChainError>;
}

/// Await `call`, giving up with [`ChainError::Timeout`] after `limit`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, ChainError>
where
    F: Future<Output = Result<T, ChainError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ChainError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ChainError::Unavailable("rpc down".into()).is_retryable());
        assert!(ChainError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ChainError::InsufficientFunds.is_retryable());
        assert!(!ChainError::AlreadyRedeemed.is_retryable());
        assert_eq!(
            ChainError::VoucherExpired.class(),
            ErrorClass::Upstream { retryable: false }
        );
    }

    #[test]
    fn idempotency_key_format() {
        let key = IdempotencyKey::new("R1", ChainOp::CreateVoucher);
        assert_eq!(key.as_str(), "R1:create_voucher");
        assert_ne!(key, IdempotencyKey::new("R1", ChainOp::RedeemVoucher));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, ChainError>(1)
        };
        let out = with_timeout(Duration::from_secs(5), slow).await;
        assert_eq!(out, Err(ChainError::Timeout(Duration::from_secs(5))));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let out = with_timeout(Duration::from_secs(5), async { Ok::<_, ChainError>(7) }).await;
        assert_eq!(out, Ok(7));
    }
}
