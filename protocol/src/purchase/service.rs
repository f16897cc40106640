//! # Purchase Service
//!
//! Drives purchases through [`transition`] against the ledger and the chain.
//!
//! Two sources can report the same payment: the buyer's own confirm call and
//! the treasury watcher. Both end up in [`PurchaseService::payment_observed`].
//! A short-lived issuance claim in the ledger lets one of them draw the nonce
//! and the code, and the compare-and-swap on the purchase record lets exactly
//! one move the record out of `AwaitingPayment`. Only that one talks to the
//! chain. The other gets [`PaymentOutcome::AlreadyHandled`].
//!
//! A code's hash stays bound to its purchase until
//! [`config::CODE_RETENTION`] after the code expired, so a used or expired
//! code keeps answering for its own purchase and is never issued to another.
//!
//! The plaintext code exists in memory for the duration of one call and in
//! the value handed back to the caller. It is never written anywhere.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::notify::Notifier;
use super::state::{
    transition, Effect, Guards, Phase, Purchase, PurchaseEvent, PurchaseState, PurchaseStatus,
    VoucherCommitment,
};
use crate::chain::{
    with_timeout, ChainClient, ChainError, ChainOp, CreateVoucherRequest, IdempotencyKey,
    RedeemVoucherRequest,
};
use crate::clock::Clock;
use crate::config;
use crate::crypto::address::{voucher_address, Address, AddressError};
use crate::crypto::hash::{code_commitment, Hash32};
use crate::error::{Classify, ErrorClass};
use crate::storage::{DbError, SolvendDB, Update};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures of purchase creation, payment handling and status lookups.
#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("amount must be positive")]
    InvalidAmount,

    #[error("purchase {0} not found")]
    NotFound(String),

    #[error("purchase {0} has no wallet to bind the voucher to")]
    MissingWallet(String),

    #[error("code length must be between {min} and {max} digits, got {0}", min = config::MIN_OTP_DIGITS, max = config::MAX_OTP_DIGITS)]
    InvalidDigits(u32),

    #[error("could not find a free code after {0} attempts")]
    CodeSpaceExhausted(usize),

    #[error("address derivation failed: {0}")]
    Address(#[from] AddressError),

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl Classify for PurchaseError {
    fn class(&self) -> ErrorClass {
        match self {
            PurchaseError::InvalidAmount
            | PurchaseError::MissingWallet(_)
            | PurchaseError::InvalidDigits(_) => ErrorClass::Validation,
            PurchaseError::NotFound(_) => ErrorClass::NotFound,
            PurchaseError::CodeSpaceExhausted(_) | PurchaseError::Address(_) => {
                ErrorClass::Internal
            }
            PurchaseError::Storage(e) => e.class(),
        }
    }
}

/// Failures of a redemption attempt. None of them changes the purchase,
/// except `Upstream`, which leaves it redeemable.
#[derive(Debug, Error)]
pub enum RedeemError {
    #[error("invalid code")]
    InvalidCode,

    #[error("code expired")]
    ExpiredCode,

    #[error("voucher already redeemed")]
    AlreadyRedeemed,

    #[error("redemption already in progress")]
    InProgress,

    #[error("chain call failed: {0}")]
    Upstream(#[from] ChainError),

    #[error("address derivation failed: {0}")]
    Address(#[from] AddressError),

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl Classify for RedeemError {
    fn class(&self) -> ErrorClass {
        match self {
            RedeemError::InvalidCode => ErrorClass::NotFound,
            RedeemError::ExpiredCode => ErrorClass::Validation,
            RedeemError::AlreadyRedeemed | RedeemError::InProgress => ErrorClass::Conflict,
            RedeemError::Upstream(e) => e.class(),
            RedeemError::Address(_) => ErrorClass::Internal,
            RedeemError::Storage(e) => e.class(),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings & results
// ---------------------------------------------------------------------------

/// Knobs of the purchase flow.
#[derive(Debug, Clone)]
pub struct PurchaseSettings {
    /// The voucher program.
    pub program_id: Address,
    /// Where buyers send their payment.
    pub treasury: Address,
    pub otp_ttl: Duration,
    pub otp_digits: u32,
    pub chain_timeout: Duration,
    pub redeem_lease: Duration,
}

impl PurchaseSettings {
    pub fn new(program_id: Address, treasury: Address) -> Self {
        Self {
            program_id,
            treasury,
            otp_ttl: config::OTP_TTL,
            otp_digits: config::DEFAULT_OTP_DIGITS,
            chain_timeout: config::CHAIN_CALL_TIMEOUT,
            redeem_lease: config::REDEEM_CLAIM_LEASE,
        }
    }
}

/// Which path reported the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    /// The buyer's client submitted its own transaction signature.
    Direct,
    /// The treasury watcher saw the transfer.
    Watcher,
}

impl Confirmation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confirmation::Direct => "direct",
            Confirmation::Watcher => "watcher",
        }
    }
}

/// What a buyer needs to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseIntent {
    pub reference_id: String,
    pub payment_target: Address,
    pub amount: u64,
    /// Memo to attach to the transfer so the watcher can match it.
    pub memo: String,
}

/// Result of reporting a payment.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    /// This call won, and the voucher is on chain.
    Issued {
        code: String,
        voucher_address: Address,
        create_tx: String,
        expires_at: DateTime<Utc>,
    },
    /// This call won, but the chain call failed. The commitment is stored
    /// and the code is valid; creation is retried on redemption.
    IssuedPendingChain {
        code: String,
        voucher_address: Address,
        expires_at: DateTime<Utc>,
        error: ChainError,
    },
    /// Another call got there first. No code.
    AlreadyHandled { status: PurchaseStatus },
}

impl PaymentOutcome {
    pub fn code(&self) -> Option<&str> {
        match self {
            PaymentOutcome::Issued { code, .. } | PaymentOutcome::IssuedPendingChain { code, .. } => {
                Some(code)
            }
            PaymentOutcome::AlreadyHandled { .. } => None,
        }
    }

    /// Status of the purchase right after this call.
    pub fn status(&self) -> PurchaseStatus {
        match self {
            PaymentOutcome::Issued { .. } => PurchaseStatus::VoucherCreated,
            PaymentOutcome::IssuedPendingChain { .. } => PurchaseStatus::Pending,
            PaymentOutcome::AlreadyHandled { status } => *status,
        }
    }
}

/// A successful redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redemption {
    pub reference_id: String,
    pub redeem_tx: String,
}

/// Client-facing status. Never carries the code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseView {
    pub reference_id: String,
    pub status: PurchaseStatus,
    pub amount: u64,
    pub user_wallet: Option<Address>,
    pub transaction_signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&Purchase> for PurchaseView {
    fn from(p: &Purchase) -> Self {
        Self {
            reference_id: p.reference_id.clone(),
            status: p.status(),
            amount: p.amount,
            user_wallet: p.user_wallet,
            transaction_signature: p.transaction_signature.clone(),
            created_at: p.created_at,
            expires_at: p.otp_expiry(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// The purchase flow. Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct PurchaseService {
    db: Arc<SolvendDB>,
    chain: Arc<dyn ChainClient>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    settings: PurchaseSettings,
}

impl PurchaseService {
    pub fn new(
        db: Arc<SolvendDB>,
        chain: Arc<dyn ChainClient>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        settings: PurchaseSettings,
    ) -> Result<Self, PurchaseError> {
        if !(config::MIN_OTP_DIGITS..=config::MAX_OTP_DIGITS).contains(&settings.otp_digits) {
            return Err(PurchaseError::InvalidDigits(settings.otp_digits));
        }
        Ok(Self {
            db,
            chain,
            clock,
            notifier,
            settings,
        })
    }

    pub fn settings(&self) -> &PurchaseSettings {
        &self.settings
    }

    /// Open a payment intent.
    pub fn create_purchase(
        &self,
        user_wallet: Option<Address>,
        amount: u64,
    ) -> Result<PurchaseIntent, PurchaseError> {
        if amount == 0 {
            return Err(PurchaseError::InvalidAmount);
        }
        let reference_id = Uuid::new_v4().to_string();
        let purchase = Purchase::new(reference_id.clone(), user_wallet, amount, self.clock.now());
        self.db.insert_purchase(&purchase)?;

        tracing::info!(reference_id = %reference_id, amount, "purchase created");
        Ok(PurchaseIntent {
            memo: reference_id.clone(),
            reference_id,
            payment_target: self.settings.treasury,
            amount,
        })
    }

    /// Current view of a purchase.
    pub fn status(&self, reference_id: &str) -> Result<PurchaseView, PurchaseError> {
        self.db
            .get_purchase(reference_id)?
            .map(|p| PurchaseView::from(&p))
            .ok_or_else(|| PurchaseError::NotFound(reference_id.to_string()))
    }

    /// A payment for `reference_id` landed. Safe to call any number of times
    /// from any number of places; only the first call issues a code.
    pub async fn payment_observed(
        &self,
        reference_id: &str,
        signature: &str,
        payer: Option<Address>,
        source: Confirmation,
    ) -> Result<PaymentOutcome, PurchaseError> {
        let purchase = self
            .db
            .get_purchase(reference_id)?
            .ok_or_else(|| PurchaseError::NotFound(reference_id.to_string()))?;

        if purchase.state.phase() != Phase::AwaitingPayment {
            tracing::debug!(reference_id, source = source.as_str(), "payment already handled");
            return Ok(PaymentOutcome::AlreadyHandled {
                status: purchase.status(),
            });
        }

        let wallet = match (purchase.user_wallet, payer) {
            (Some(bound), Some(payer)) if bound != payer => {
                tracing::warn!(
                    reference_id,
                    bound = %bound,
                    payer = %payer,
                    "payer differs from purchase wallet, binding to purchase wallet"
                );
                bound
            }
            (Some(bound), _) => bound,
            (None, Some(payer)) => payer,
            (None, None) => return Err(PurchaseError::MissingWallet(reference_id.to_string())),
        };

        // Only the holder of the issuance claim draws a nonce and a code.
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let stale_before = now_ms - config::duration_ms(config::ISSUANCE_CLAIM_LEASE);
        if !self.db.claim_issuance(reference_id, now_ms, stale_before)? {
            tracing::debug!(reference_id, source = source.as_str(), "issuance claimed elsewhere");
            return Ok(PaymentOutcome::AlreadyHandled {
                status: purchase.status(),
            });
        }
        let committed = self.commit_payment(reference_id, signature, wallet, now);
        self.db.release_issuance(reference_id)?;

        let (code, commitment) = match committed? {
            Ok(issued) => issued,
            Err(status) => {
                tracing::debug!(reference_id, source = source.as_str(), "lost payment race");
                return Ok(PaymentOutcome::AlreadyHandled { status });
            }
        };
        let nonce = commitment.nonce;
        let voucher = commitment.voucher_address;
        let expires_at = commitment.otp_expiry;

        tracing::info!(
            reference_id,
            source = source.as_str(),
            nonce,
            voucher = %voucher,
            "payment accepted"
        );

        let outcome = match self.create_on_chain(reference_id, &commitment).await? {
            Ok(create_tx) => PaymentOutcome::Issued {
                code,
                voucher_address: voucher,
                create_tx,
                expires_at,
            },
            Err(error) => PaymentOutcome::IssuedPendingChain {
                code,
                voucher_address: voucher,
                expires_at,
                error,
            },
        };

        if source == Confirmation::Watcher {
            if let Some(code) = outcome.code() {
                self.notifier.deliver_code(reference_id, &wallet, code).await;
            }
        }
        Ok(outcome)
    }

    /// Redeem `code`. With `reference_id` the purchase is looked up directly,
    /// otherwise through the code index.
    pub async fn redeem(
        &self,
        code: &str,
        reference_id: Option<&str>,
    ) -> Result<Redemption, RedeemError> {
        let code = code.trim();
        if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RedeemError::InvalidCode);
        }
        let candidate = code_commitment(code);

        let reference_id = match reference_id {
            Some(r) => r.to_string(),
            None => self
                .db
                .lookup_code(&candidate)?
                .ok_or(RedeemError::InvalidCode)?,
        };
        let mut purchase = self
            .db
            .get_purchase(&reference_id)?
            .ok_or(RedeemError::InvalidCode)?;

        let commitment = self.check_redeemable(&purchase, &candidate)?.clone();

        if purchase.state.phase() == Phase::Committed {
            purchase = self.retry_create(&reference_id, &commitment).await?;
        }

        let (update, _) = self.apply(&reference_id, PurchaseEvent::RedeemClaimed, |_| {})?;
        match update {
            Update::Applied(_) => {}
            Update::Mismatch(current) => {
                return Err(match current.state.phase() {
                    Phase::Redeemed => RedeemError::AlreadyRedeemed,
                    Phase::Expired => RedeemError::ExpiredCode,
                    _ => RedeemError::InProgress,
                });
            }
            Update::Missing => return Err(RedeemError::InvalidCode),
        }
        tracing::debug!(reference_id = %purchase.reference_id, "redeem claim taken");

        let request = RedeemVoucherRequest {
            key: IdempotencyKey::new(&reference_id, ChainOp::RedeemVoucher),
            voucher: commitment.voucher_address,
        };
        let result = with_timeout(
            self.settings.chain_timeout,
            self.chain.redeem_voucher(request),
        )
        .await;

        match result {
            Ok(receipt) => {
                let tx = receipt.signature.clone();
                self.apply(&reference_id, PurchaseEvent::Redeemed { tx }, |_| {})?;
                tracing::info!(reference_id = %reference_id, tx = %receipt.signature, "voucher redeemed");
                Ok(Redemption {
                    reference_id,
                    redeem_tx: receipt.signature,
                })
            }
            Err(err) => {
                self.apply(&reference_id, PurchaseEvent::RedeemFailed, |_| {})?;
                tracing::warn!(reference_id = %reference_id, error = %err, "redeem call failed");
                Err(RedeemError::Upstream(err))
            }
        }
    }

    // -- internals ----------------------------------------------------------

    /// Re-check the record, draw nonce and code, and write the commitment.
    /// Runs under the issuance claim. The inner error is the status of a
    /// record that was already handled.
    fn commit_payment(
        &self,
        reference_id: &str,
        signature: &str,
        wallet: Address,
        now: DateTime<Utc>,
    ) -> Result<Result<(String, VoucherCommitment), PurchaseStatus>, PurchaseError> {
        let current = self
            .db
            .get_purchase(reference_id)?
            .ok_or_else(|| PurchaseError::NotFound(reference_id.to_string()))?;
        if current.state.phase() != Phase::AwaitingPayment {
            return Ok(Err(current.status()));
        }

        let nonce = self.db.next_nonce(&wallet, now.timestamp_millis())?;
        let voucher = voucher_address(&self.settings.program_id, &wallet, nonce)?;
        let (code, otp_hash) = self.issue_code(reference_id, now)?;

        let commitment = VoucherCommitment {
            otp_hash,
            otp_expiry: now + to_chrono(self.settings.otp_ttl),
            nonce,
            wallet,
            voucher_address: voucher,
        };
        let event = PurchaseEvent::PaymentObserved {
            commitment: commitment.clone(),
        };
        let (update, effect) = self.apply(reference_id, event, |p| {
            p.transaction_signature = Some(signature.to_string());
            p.user_wallet = Some(wallet);
        })?;

        match update {
            Update::Applied(_) => {
                debug_assert_eq!(effect, Effect::CreateVoucher);
                Ok(Ok((code, commitment)))
            }
            Update::Mismatch(current) => {
                self.db.release_code(&otp_hash, reference_id)?;
                Ok(Err(current.status()))
            }
            Update::Missing => {
                self.db.release_code(&otp_hash, reference_id)?;
                Err(PurchaseError::NotFound(reference_id.to_string()))
            }
        }
    }

    /// Every rejection that needs no write and no chain call.
    fn check_redeemable<'a>(
        &self,
        purchase: &'a Purchase,
        candidate: &Hash32,
    ) -> Result<&'a VoucherCommitment, RedeemError> {
        let commitment = match &purchase.state {
            PurchaseState::Redeemed { .. } => return Err(RedeemError::AlreadyRedeemed),
            PurchaseState::Expired { .. } => return Err(RedeemError::ExpiredCode),
            PurchaseState::AwaitingPayment => return Err(RedeemError::InvalidCode),
            PurchaseState::Committed { commitment, .. }
            | PurchaseState::VoucherCreated { commitment, .. }
            | PurchaseState::Redeeming { commitment, .. } => commitment,
        };

        if commitment.otp_hash != *candidate {
            return Err(RedeemError::InvalidCode);
        }
        let now = self.clock.now();
        if commitment.is_expired_at(now) {
            return Err(RedeemError::ExpiredCode);
        }
        if let PurchaseState::Redeeming { claimed_at, .. } = &purchase.state {
            if *claimed_at + to_chrono(self.settings.redeem_lease) > now {
                return Err(RedeemError::InProgress);
            }
        }
        Ok(commitment)
    }

    /// Lazy creation for a purchase whose voucher never made it on chain.
    async fn retry_create(
        &self,
        reference_id: &str,
        commitment: &VoucherCommitment,
    ) -> Result<Purchase, RedeemError> {
        let (update, effect) = self.apply(reference_id, PurchaseEvent::RetryCreate, |_| {})?;
        let current = match update {
            Update::Applied(p) => p,
            // Someone else moved it on in the meantime; carry on from there.
            Update::Mismatch(p) => return Ok(p),
            Update::Missing => return Err(RedeemError::InvalidCode),
        };
        if effect != Effect::CreateVoucher {
            return Ok(current);
        }

        tracing::info!(reference_id, "retrying voucher creation before redeem");
        match self.create_on_chain(reference_id, commitment).await? {
            Ok(_) => self
                .db
                .get_purchase(reference_id)?
                .ok_or(RedeemError::InvalidCode),
            Err(err) => Err(RedeemError::Upstream(err)),
        }
    }

    /// Send `create_voucher` and record the result on the purchase. The
    /// outer error is storage; the inner one is the chain's verdict.
    async fn create_on_chain(
        &self,
        reference_id: &str,
        commitment: &VoucherCommitment,
    ) -> Result<Result<String, ChainError>, DbError> {
        let request = CreateVoucherRequest {
            key: IdempotencyKey::new(reference_id, ChainOp::CreateVoucher),
            user: commitment.wallet,
            voucher: commitment.voucher_address,
            otp_hash: commitment.otp_hash,
            expiry_ts: commitment.otp_expiry.timestamp(),
            nonce: commitment.nonce,
            is_free: false,
        };
        let result = with_timeout(
            self.settings.chain_timeout,
            self.chain.create_voucher(request),
        )
        .await;

        match result {
            Ok(receipt) => {
                let event = PurchaseEvent::VoucherCreated {
                    tx: receipt.signature.clone(),
                };
                if let (Update::Mismatch(p), _) = self.apply(reference_id, event, |_| {})? {
                    tracing::debug!(reference_id, phase = %p.state.phase(), "voucher already recorded");
                }
                tracing::info!(reference_id, tx = %receipt.signature, "voucher created");
                Ok(Ok(receipt.signature))
            }
            Err(err) => {
                let event = PurchaseEvent::VoucherCreateFailed {
                    error: err.to_string(),
                };
                self.apply(reference_id, event, |_| {})?;
                tracing::warn!(
                    reference_id,
                    error = %err,
                    retryable = err.is_retryable(),
                    "voucher creation failed, purchase stays pending"
                );
                Ok(Err(err))
            }
        }
    }

    /// Draw codes until one's hash can be reserved for `reference_id`.
    fn issue_code(
        &self,
        reference_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(String, Hash32), PurchaseError> {
        let digits = self.settings.otp_digits;
        let low = 10u32.pow(digits - 1);
        let high = 10u32.pow(digits);

        for _ in 0..config::OTP_ISSUE_ATTEMPTS {
            let code = OsRng.gen_range(low..high).to_string();
            if let Some(hash) = self.reserve_code(&code, reference_id, now)? {
                return Ok((code, hash));
            }
        }
        Err(PurchaseError::CodeSpaceExhausted(config::OTP_ISSUE_ATTEMPTS))
    }

    /// Point `code`'s hash at `reference_id` unless another purchase still
    /// owns it.
    fn reserve_code(
        &self,
        code: &str,
        reference_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Hash32>, DbError> {
        let hash = code_commitment(code);
        let claimed = match self.db.lookup_code(&hash)? {
            None => self.db.claim_code(&hash, None, reference_id)?,
            Some(holder) if self.slot_is_released(&holder, now)? => {
                self.db.claim_code(&hash, Some(&holder), reference_id)?
            }
            Some(_) => false,
        };
        Ok(claimed.then_some(hash))
    }

    /// A holder keeps its slot, redeemed or not, until [`config::CODE_RETENTION`]
    /// after its code expired.
    fn slot_is_released(&self, holder: &str, now: DateTime<Utc>) -> Result<bool, DbError> {
        let retention = to_chrono(config::CODE_RETENTION);
        Ok(match self.db.get_purchase(holder)? {
            None => true,
            Some(p) => p
                .state
                .commitment()
                .map_or(true, |c| c.otp_expiry + retention < now),
        })
    }

    /// Feed `event` to the state machine under a ledger CAS. The guard is the
    /// transition itself, so a record that has moved on comes back as
    /// `Mismatch` untouched.
    fn apply<P>(
        &self,
        reference_id: &str,
        event: PurchaseEvent,
        patch: P,
    ) -> Result<(Update<Purchase>, Effect), DbError>
    where
        P: Fn(&mut Purchase),
    {
        let now = self.clock.now();
        let guards = Guards {
            now,
            redeem_lease: to_chrono(self.settings.redeem_lease),
        };
        let mut effect = Effect::None;

        let update = self.db.update_purchase(
            reference_id,
            |p| transition(&p.state, event.clone(), &guards).is_ok(),
            |p| match transition(&p.state, event.clone(), &guards) {
                Ok(t) => {
                    effect = t.effect;
                    let mut next = p.with_state(t.next, now);
                    patch(&mut next);
                    next
                }
                Err(_) => p.clone(),
            },
        )?;
        Ok((update, effect))
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(config::duration_ms(d))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SimulatedChain;
    use crate::clock::ManualClock;
    use crate::purchase::notify::LogNotifier;
    use chrono::TimeZone;

    struct Fixture {
        clock: Arc<ManualClock>,
        chain: Arc<SimulatedChain>,
        db: Arc<SolvendDB>,
        service: PurchaseService,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        let chain = Arc::new(SimulatedChain::new(clock.clone()));
        let db = Arc::new(SolvendDB::open_temporary().unwrap());
        let program: Address = config::DEFAULT_PROGRAM_ID.parse().unwrap();
        let service = PurchaseService::new(
            db.clone(),
            chain.clone(),
            clock.clone(),
            Arc::new(LogNotifier),
            PurchaseSettings::new(program, Address::new([7; 32])),
        )
        .unwrap();
        Fixture {
            clock,
            chain,
            db,
            service,
        }
    }

    fn wallet() -> Address {
        Address::new([1; 32])
    }

    async fn paid(f: &Fixture) -> (String, String) {
        let intent = f.service.create_purchase(Some(wallet()), 1_000_000).unwrap();
        let outcome = f
            .service
            .payment_observed(&intent.reference_id, "sig1", None, Confirmation::Direct)
            .await
            .unwrap();
        let code = outcome.code().unwrap().to_string();
        (intent.reference_id, code)
    }

    #[test]
    fn rejects_bad_settings_and_amounts() {
        let f = fixture();
        let mut settings = f.service.settings().clone();
        settings.otp_digits = 3;
        let err = PurchaseService::new(
            f.db.clone(),
            f.chain.clone(),
            f.clock.clone(),
            Arc::new(LogNotifier),
            settings,
        )
        .err()
        .unwrap();
        assert!(matches!(err, PurchaseError::InvalidDigits(3)));

        let err = f.service.create_purchase(Some(wallet()), 0).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[test]
    fn intent_uses_reference_as_memo() {
        let f = fixture();
        let intent = f.service.create_purchase(None, 5).unwrap();
        assert_eq!(intent.memo, intent.reference_id);
        assert_eq!(intent.payment_target, Address::new([7; 32]));
        assert_eq!(
            f.service.status(&intent.reference_id).unwrap().status,
            PurchaseStatus::Pending
        );
    }

    #[tokio::test]
    async fn payment_issues_a_code_of_configured_width() {
        let f = fixture();
        let (reference_id, code) = paid(&f).await;
        assert_eq!(code.len(), config::DEFAULT_OTP_DIGITS as usize);
        assert!(code.bytes().all(|b| b.is_ascii_digit()));

        let stored = f.db.get_purchase(&reference_id).unwrap().unwrap();
        assert_eq!(stored.status(), PurchaseStatus::VoucherCreated);
        let commitment = stored.state.commitment().unwrap();
        assert_eq!(commitment.otp_hash, code_commitment(&code));
        assert_eq!(
            commitment.otp_expiry,
            f.clock.now() + ChronoDuration::hours(1)
        );
        assert_eq!(stored.transaction_signature.as_deref(), Some("sig1"));
        assert_eq!(f.db.lookup_code(&commitment.otp_hash).unwrap(), Some(reference_id));
    }

    #[tokio::test]
    async fn second_report_is_already_handled() {
        let f = fixture();
        let (reference_id, _) = paid(&f).await;
        let again = f
            .service
            .payment_observed(&reference_id, "sig1", None, Confirmation::Watcher)
            .await
            .unwrap();
        assert_eq!(
            again,
            PaymentOutcome::AlreadyHandled {
                status: PurchaseStatus::VoucherCreated
            }
        );
        assert_eq!(f.chain.calls(ChainOp::CreateVoucher), 1);
    }

    #[tokio::test]
    async fn unknown_reference_and_missing_wallet() {
        let f = fixture();
        let err = f
            .service
            .payment_observed("nope", "sig", None, Confirmation::Direct)
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);

        let intent = f.service.create_purchase(None, 5).unwrap();
        let err = f
            .service
            .payment_observed(&intent.reference_id, "sig", None, Confirmation::Direct)
            .await
            .unwrap_err();
        assert!(matches!(err, PurchaseError::MissingWallet(_)));
    }

    #[tokio::test]
    async fn payer_binds_an_unbound_purchase() {
        let f = fixture();
        let intent = f.service.create_purchase(None, 5).unwrap();
        f.service
            .payment_observed(&intent.reference_id, "sig", Some(wallet()), Confirmation::Watcher)
            .await
            .unwrap();
        let view = f.service.status(&intent.reference_id).unwrap();
        assert_eq!(view.user_wallet, Some(wallet()));
    }

    #[tokio::test]
    async fn redeem_once() {
        let f = fixture();
        let (reference_id, code) = paid(&f).await;

        let redemption = f.service.redeem(&code, None).await.unwrap();
        assert_eq!(redemption.reference_id, reference_id);
        assert_eq!(
            f.service.status(&reference_id).unwrap().status,
            PurchaseStatus::Redeemed
        );

        let err = f.service.redeem(&code, None).await.unwrap_err();
        assert!(matches!(err, RedeemError::AlreadyRedeemed));
        assert_eq!(f.chain.calls(ChainOp::RedeemVoucher), 1);
    }

    #[tokio::test]
    async fn redeemed_code_is_never_handed_to_another_purchase() {
        let f = fixture();
        let (first, code) = paid(&f).await;
        f.service.redeem(&code, None).await.unwrap();

        // A later purchase that happens to draw the same code.
        let later = f.service.create_purchase(Some(wallet()), 5).unwrap();
        let now = f.clock.now();
        assert_eq!(f.service.reserve_code(&code, &later.reference_id, now).unwrap(), None);
        f.clock.advance(ChronoDuration::hours(2));
        let now = f.clock.now();
        assert_eq!(f.service.reserve_code(&code, &later.reference_id, now).unwrap(), None);

        assert!(matches!(
            f.service.redeem(&code, None).await,
            Err(RedeemError::AlreadyRedeemed)
        ));
        assert_eq!(f.db.lookup_code(&code_commitment(&code)).unwrap(), Some(first));
        assert_eq!(f.chain.calls(ChainOp::RedeemVoucher), 1);
    }

    #[tokio::test]
    async fn expired_code_keeps_its_slot_until_retention_ends() {
        let f = fixture();
        let (first, code) = paid(&f).await;
        f.clock.advance(ChronoDuration::hours(3));

        let later = f.service.create_purchase(Some(wallet()), 5).unwrap();
        let now = f.clock.now();
        assert_eq!(f.service.reserve_code(&code, &later.reference_id, now).unwrap(), None);
        assert!(matches!(
            f.service.redeem(&code, None).await,
            Err(RedeemError::ExpiredCode)
        ));
        assert_eq!(f.db.lookup_code(&code_commitment(&code)).unwrap(), Some(first));

        f.clock.advance(to_chrono(config::CODE_RETENTION));
        let now = f.clock.now();
        assert_eq!(
            f.service.reserve_code(&code, &later.reference_id, now).unwrap(),
            Some(code_commitment(&code))
        );
        assert_eq!(
            f.db.lookup_code(&code_commitment(&code)).unwrap(),
            Some(later.reference_id)
        );
    }

    #[tokio::test]
    async fn held_issuance_claim_turns_payment_away() {
        let f = fixture();
        let intent = f.service.create_purchase(Some(wallet()), 5).unwrap();
        let now_ms = f.clock.now_ms();
        assert!(f.db.claim_issuance(&intent.reference_id, now_ms, 0).unwrap());

        let outcome = f
            .service
            .payment_observed(&intent.reference_id, "sig", None, Confirmation::Watcher)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PaymentOutcome::AlreadyHandled {
                status: PurchaseStatus::Pending
            }
        );
        assert_eq!(f.chain.calls(ChainOp::CreateVoucher), 0);
        // Nothing was drawn: the next nonce is still the first one.
        assert_eq!(f.db.next_nonce(&wallet(), now_ms).unwrap(), now_ms as u64);

        // An abandoned claim does not block the purchase forever.
        f.clock.advance(ChronoDuration::seconds(31));
        let outcome = f
            .service
            .payment_observed(&intent.reference_id, "sig", None, Confirmation::Watcher)
            .await
            .unwrap();
        assert!(outcome.code().is_some());
    }

    #[tokio::test]
    async fn wrong_code_changes_nothing() {
        let f = fixture();
        let (reference_id, code) = paid(&f).await;
        let wrong = if code == "1000" { "1001" } else { "1000" };

        let before = f.db.get_purchase(&reference_id).unwrap();
        let err = f
            .service
            .redeem(wrong, Some(&reference_id))
            .await
            .unwrap_err();
        assert!(matches!(err, RedeemError::InvalidCode));
        assert_eq!(f.db.get_purchase(&reference_id).unwrap(), before);

        assert!(matches!(
            f.service.redeem("12ab", None).await,
            Err(RedeemError::InvalidCode)
        ));
        assert_eq!(f.chain.calls(ChainOp::RedeemVoucher), 0);
    }

    #[tokio::test]
    async fn expired_code_changes_nothing() {
        let f = fixture();
        let (reference_id, code) = paid(&f).await;
        f.clock.advance(ChronoDuration::hours(1) + ChronoDuration::seconds(1));

        let before = f.db.get_purchase(&reference_id).unwrap();
        let err = f.service.redeem(&code, None).await.unwrap_err();
        assert!(matches!(err, RedeemError::ExpiredCode));
        assert_eq!(f.db.get_purchase(&reference_id).unwrap(), before);
    }

    #[tokio::test]
    async fn failed_creation_is_retried_lazily() {
        let f = fixture();
        f.chain.fail_next(
            ChainOp::CreateVoucher,
            ChainError::Unavailable("rpc down".into()),
        );
        let intent = f.service.create_purchase(Some(wallet()), 10).unwrap();
        let outcome = f
            .service
            .payment_observed(&intent.reference_id, "sig", None, Confirmation::Direct)
            .await
            .unwrap();

        let PaymentOutcome::IssuedPendingChain { code, error, .. } = outcome else {
            panic!("expected pending outcome");
        };
        assert!(error.is_retryable());
        let stored = f.db.get_purchase(&intent.reference_id).unwrap().unwrap();
        assert_eq!(stored.status(), PurchaseStatus::Pending);
        let nonce = stored.state.commitment().unwrap().nonce;

        f.service.redeem(&code, None).await.unwrap();
        let stored = f.db.get_purchase(&intent.reference_id).unwrap().unwrap();
        assert_eq!(stored.status(), PurchaseStatus::Redeemed);
        assert_eq!(stored.state.commitment().unwrap().nonce, nonce);
        assert_eq!(f.chain.calls(ChainOp::CreateVoucher), 2);
    }

    #[tokio::test]
    async fn lazy_creation_failure_surfaces() {
        let f = fixture();
        f.chain.fail_next(ChainOp::CreateVoucher, ChainError::InsufficientFunds);
        f.chain.fail_next(ChainOp::CreateVoucher, ChainError::InsufficientFunds);
        let intent = f.service.create_purchase(Some(wallet()), 10).unwrap();
        let outcome = f
            .service
            .payment_observed(&intent.reference_id, "sig", None, Confirmation::Direct)
            .await
            .unwrap();
        let code = outcome.code().unwrap().to_string();

        let err = f.service.redeem(&code, None).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Upstream { retryable: false });
        let stored = f.db.get_purchase(&intent.reference_id).unwrap().unwrap();
        assert!(matches!(
            stored.state,
            PurchaseState::Committed { last_error: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn failed_redeem_stays_redeemable() {
        let f = fixture();
        let (reference_id, code) = paid(&f).await;
        f.chain.fail_next(
            ChainOp::RedeemVoucher,
            ChainError::Timeout(Duration::from_secs(30)),
        );

        let err = f.service.redeem(&code, None).await.unwrap_err();
        assert!(matches!(err, RedeemError::Upstream(_)));
        assert_eq!(
            f.db.get_purchase(&reference_id).unwrap().unwrap().state.phase(),
            Phase::VoucherCreated
        );

        f.service.redeem(&code, None).await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_claim_can_be_taken_over() {
        let f = fixture();
        let (reference_id, code) = paid(&f).await;
        f.db.update_purchase(
            &reference_id,
            |_| true,
            |p| {
                let PurchaseState::VoucherCreated {
                    commitment,
                    create_tx,
                } = p.state.clone()
                else {
                    return p.clone();
                };
                p.with_state(
                    PurchaseState::Redeeming {
                        commitment,
                        create_tx,
                        claimed_at: f.clock.now(),
                    },
                    f.clock.now(),
                )
            },
        )
        .unwrap();

        assert!(matches!(
            f.service.redeem(&code, None).await,
            Err(RedeemError::InProgress)
        ));

        f.clock.advance(ChronoDuration::seconds(61));
        f.service.redeem(&code, None).await.unwrap();
    }

    #[tokio::test]
    async fn nonces_increase_per_wallet() {
        let f = fixture();
        let mut nonces = Vec::new();
        for _ in 0..3 {
            let (reference_id, _) = paid(&f).await;
            let p = f.db.get_purchase(&reference_id).unwrap().unwrap();
            nonces.push(p.state.commitment().unwrap().nonce);
        }
        assert!(nonces.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn status_never_shows_the_code() {
        let f = fixture();
        let (reference_id, code) = paid(&f).await;
        let view = f.service.status(&reference_id).unwrap();
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains(&format!("\"{code}\"")));
        assert_eq!(view.status, PurchaseStatus::VoucherCreated);
        assert!(view.expires_at.is_some());
    }
}
