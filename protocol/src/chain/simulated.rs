//! In-process stand-in for the voucher program.
//!
//! Enforces the rules the real program enforces, as far as this service can
//! observe them:
//!
//! - a voucher's expiry must be in the future when it is created;
//! - a voucher account can be created once;
//! - a voucher can be redeemed once, and not after its expiry;
//! - a root can only be submitted for a report that has data attached.
//!
//! It also remembers every idempotency key and replays the original
//! outcome for a resend, records treasury payments for the watcher, and can
//! be told to fail upcoming calls. The node runs on it when no RPC endpoint
//! is configured, and the tests run on it always.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{
    AttachReportDataRequest, ChainClient, ChainError, ChainOp, ChainReceipt,
    CreateVoucherRequest, IdempotencyKey, RedeemVoucherRequest, SubmitRootRequest,
};
use crate::clock::Clock;
use crate::crypto::address::Address;
use crate::crypto::hash::{sha256_concat, Hash32};
use crate::watcher::{ObservedPayment, PaymentSource};

/// A voucher account as the program stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoucherAccount {
    pub user: Address,
    pub otp_hash: Hash32,
    pub expiry_ts: i64,
    pub nonce: u64,
    pub redeemed: bool,
    pub is_free: bool,
}

/// A report account as the program stores it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportAccount {
    pub buyer: Option<Address>,
    pub report_id: u64,
    pub ipfs_cid: Option<String>,
    pub merkle_root: Option<Hash32>,
}

#[derive(Default)]
struct Ledger {
    vouchers: HashMap<Address, VoucherAccount>,
    reports: HashMap<Address, ReportAccount>,
    receipts: HashMap<IdempotencyKey, ChainReceipt>,
    calls: HashMap<ChainOp, usize>,
    injected: VecDeque<(ChainOp, ChainError)>,
    payments: Vec<ObservedPayment>,
    fetch_failures: VecDeque<ChainError>,
    sequence: u64,
}

impl Ledger {
    fn take_injected(&mut self, op: ChainOp) -> Option<ChainError> {
        let pos = self.injected.iter().position(|(o, _)| *o == op)?;
        self.injected.remove(pos).map(|(_, e)| e)
    }

    fn receipt_for(&mut self, key: &IdempotencyKey) -> ChainReceipt {
        self.sequence += 1;
        let digest = sha256_concat(&[key.as_str().as_bytes(), &self.sequence.to_le_bytes()]);
        ChainReceipt {
            signature: bs58::encode(digest).into_string(),
        }
    }

    /// Common prologue: count the call, honour injected failures, replay a
    /// known key.
    fn begin(
        &mut self,
        op: ChainOp,
        key: &IdempotencyKey,
    ) -> Result<Option<ChainReceipt>, ChainError> {
        *self.calls.entry(op).or_insert(0) += 1;
        if let Some(err) = self.take_injected(op) {
            return Err(err);
        }
        Ok(self.receipts.get(key).cloned())
    }

    fn commit(&mut self, key: IdempotencyKey) -> ChainReceipt {
        let receipt = self.receipt_for(&key);
        self.receipts.insert(key, receipt.clone());
        receipt
    }
}

/// Simulated program plus treasury.
pub struct SimulatedChain {
    clock: Arc<dyn Clock>,
    state: Mutex<Ledger>,
}

impl SimulatedChain {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(Ledger::default()),
        }
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: ChainOp, error: ChainError) {
        self.state.lock().injected.push_back((op, error));
    }

    /// How many times `op` has been invoked, replays and failures included.
    pub fn calls(&self, op: ChainOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn voucher(&self, address: &Address) -> Option<VoucherAccount> {
        self.state.lock().vouchers.get(address).cloned()
    }

    pub fn report(&self, address: &Address) -> Option<ReportAccount> {
        self.state.lock().reports.get(address).cloned()
    }

    /// Make the next payment fetch fail with `error`.
    pub fn fail_next_fetch(&self, error: ChainError) {
        self.state.lock().fetch_failures.push_back(error);
    }

    /// Record a transfer into the treasury, as the watcher would see it.
    pub fn record_payment(&self, payment: ObservedPayment) {
        self.state.lock().payments.push(payment);
    }

    fn now_secs(&self) -> i64 {
        self.clock.now().timestamp()
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    async fn create_voucher(&self, req: CreateVoucherRequest) -> Result<ChainReceipt, ChainError> {
        let now = self.now_secs();
        let mut state = self.state.lock();
        if let Some(receipt) = state.begin(ChainOp::CreateVoucher, &req.key)? {
            return Ok(receipt);
        }
        if req.expiry_ts <= now {
            return Err(ChainError::InvalidExpiry);
        }
        if state.vouchers.contains_key(&req.voucher) {
            return Err(ChainError::Rejected(format!(
                "account {} already in use",
                req.voucher
            )));
        }
        state.vouchers.insert(
            req.voucher,
            VoucherAccount {
                user: req.user,
                otp_hash: req.otp_hash,
                expiry_ts: req.expiry_ts,
                nonce: req.nonce,
                redeemed: false,
                is_free: req.is_free,
            },
        );
        Ok(state.commit(req.key))
    }

    async fn redeem_voucher(&self, req: RedeemVoucherRequest) -> Result<ChainReceipt, ChainError> {
        let now = self.now_secs();
        let mut state = self.state.lock();
        if let Some(receipt) = state.begin(ChainOp::RedeemVoucher, &req.key)? {
            return Ok(receipt);
        }
        let voucher = state
            .vouchers
            .get_mut(&req.voucher)
            .ok_or_else(|| ChainError::AccountNotFound(req.voucher.to_string()))?;
        if voucher.redeemed {
            return Err(ChainError::AlreadyRedeemed);
        }
        if now > voucher.expiry_ts {
            return Err(ChainError::VoucherExpired);
        }
        voucher.redeemed = true;
        Ok(state.commit(req.key))
    }

    async fn submit_distribution_root(
        &self,
        req: SubmitRootRequest,
    ) -> Result<ChainReceipt, ChainError> {
        let mut state = self.state.lock();
        if let Some(receipt) = state.begin(ChainOp::SubmitRoot, &req.key)? {
            return Ok(receipt);
        }
        let report = state
            .reports
            .get_mut(&req.report)
            .filter(|r| r.ipfs_cid.is_some())
            .ok_or_else(|| ChainError::AccountNotFound(req.report.to_string()))?;
        report.merkle_root = Some(req.merkle_root);
        Ok(state.commit(req.key))
    }

    async fn attach_report_data(
        &self,
        req: AttachReportDataRequest,
    ) -> Result<ChainReceipt, ChainError> {
        let mut state = self.state.lock();
        if let Some(receipt) = state.begin(ChainOp::AttachReportData, &req.key)? {
            return Ok(receipt);
        }
        let report = state.reports.entry(req.report).or_default();
        report.buyer = Some(req.buyer);
        report.report_id = req.report_id;
        report.ipfs_cid = Some(req.ipfs_cid);
        Ok(state.commit(req.key))
    }
}

#[async_trait]
impl PaymentSource for SimulatedChain {
    async fn recent_payments(&self, limit: usize) -> Result<Vec<ObservedPayment>, ChainError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fetch_failures.pop_front() {
            return Err(err);
        }
        Ok(state.payments.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn chain() -> (Arc<ManualClock>, SimulatedChain) {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let chain = SimulatedChain::new(clock.clone());
        (clock, chain)
    }

    fn create_req(reference: &str, voucher: Address, expiry_ts: i64) -> CreateVoucherRequest {
        CreateVoucherRequest {
            key: IdempotencyKey::new(reference, ChainOp::CreateVoucher),
            user: Address::new([1; 32]),
            voucher,
            otp_hash: [9; 32],
            expiry_ts,
            nonce: 1,
            is_free: false,
        }
    }

    fn redeem_req(reference: &str, voucher: Address) -> RedeemVoucherRequest {
        RedeemVoucherRequest {
            key: IdempotencyKey::new(reference, ChainOp::RedeemVoucher),
            voucher,
        }
    }

    #[tokio::test]
    async fn create_then_redeem() {
        let (_, chain) = chain();
        let voucher = Address::new([2; 32]);
        chain
            .create_voucher(create_req("R1", voucher, 1_700_003_600))
            .await
            .unwrap();
        assert!(!chain.voucher(&voucher).unwrap().redeemed);

        chain.redeem_voucher(redeem_req("R1", voucher)).await.unwrap();
        assert!(chain.voucher(&voucher).unwrap().redeemed);
    }

    #[tokio::test]
    async fn resend_replays_receipt() {
        let (_, chain) = chain();
        let voucher = Address::new([2; 32]);
        let first = chain
            .create_voucher(create_req("R1", voucher, 1_700_003_600))
            .await
            .unwrap();
        let again = chain
            .create_voucher(create_req("R1", voucher, 1_700_003_600))
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(chain.calls(ChainOp::CreateVoucher), 2);
    }

    #[tokio::test]
    async fn account_reuse_is_rejected() {
        let (_, chain) = chain();
        let voucher = Address::new([2; 32]);
        chain
            .create_voucher(create_req("R1", voucher, 1_700_003_600))
            .await
            .unwrap();
        let err = chain
            .create_voucher(create_req("R2", voucher, 1_700_003_600))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Rejected(_)));
    }

    #[tokio::test]
    async fn past_expiry_rejected() {
        let (_, chain) = chain();
        let err = chain
            .create_voucher(create_req("R1", Address::new([2; 32]), 1_700_000_000))
            .await
            .unwrap_err();
        assert_eq!(err, ChainError::InvalidExpiry);
    }

    #[tokio::test]
    async fn redeem_rules() {
        let (clock, chain) = chain();
        let voucher = Address::new([2; 32]);

        let err = chain.redeem_voucher(redeem_req("R0", voucher)).await.unwrap_err();
        assert!(matches!(err, ChainError::AccountNotFound(_)));

        chain
            .create_voucher(create_req("R1", voucher, 1_700_000_060))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(61));
        let err = chain.redeem_voucher(redeem_req("R1", voucher)).await.unwrap_err();
        assert_eq!(err, ChainError::VoucherExpired);
    }

    #[tokio::test]
    async fn double_redeem_under_new_key() {
        let (_, chain) = chain();
        let voucher = Address::new([2; 32]);
        chain
            .create_voucher(create_req("R1", voucher, 1_700_003_600))
            .await
            .unwrap();
        chain.redeem_voucher(redeem_req("R1", voucher)).await.unwrap();
        let err = chain.redeem_voucher(redeem_req("other", voucher)).await.unwrap_err();
        assert_eq!(err, ChainError::AlreadyRedeemed);
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let (_, chain) = chain();
        chain.fail_next(ChainOp::CreateVoucher, ChainError::InsufficientFunds);
        let voucher = Address::new([2; 32]);
        let err = chain
            .create_voucher(create_req("R1", voucher, 1_700_003_600))
            .await
            .unwrap_err();
        assert_eq!(err, ChainError::InsufficientFunds);
        assert!(chain.voucher(&voucher).is_none());
        chain
            .create_voucher(create_req("R1", voucher, 1_700_003_600))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn root_needs_attached_report() {
        let (_, chain) = chain();
        let report = Address::new([3; 32]);
        let buyer = Address::new([4; 32]);
        let submit = SubmitRootRequest {
            key: IdempotencyKey::new("B1", ChainOp::SubmitRoot),
            report,
            buyer,
            report_id: 7,
            merkle_root: [5; 32],
        };
        let err = chain.submit_distribution_root(submit.clone()).await.unwrap_err();
        assert!(matches!(err, ChainError::AccountNotFound(_)));

        chain
            .attach_report_data(AttachReportDataRequest {
                key: IdempotencyKey::new("B1", ChainOp::AttachReportData),
                report,
                buyer,
                report_id: 7,
                ipfs_cid: "bafy".into(),
            })
            .await
            .unwrap();
        chain.submit_distribution_root(submit).await.unwrap();
        assert_eq!(chain.report(&report).unwrap().merkle_root, Some([5; 32]));
    }

    #[tokio::test]
    async fn payments_come_back_newest_first() {
        let (_, chain) = chain();
        for sig in ["a", "b", "c"] {
            chain.record_payment(ObservedPayment {
                signature: sig.into(),
                memo: None,
                payer: None,
                failed: false,
                amount: None,
            });
        }
        let got: Vec<_> = chain
            .recent_payments(2)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.signature)
            .collect();
        assert_eq!(got, vec!["c", "b"]);

        chain.fail_next_fetch(ChainError::Unavailable("rpc down".into()));
        assert!(chain.recent_payments(2).await.is_err());
    }
}
