//! # Purchase State Machine
//!
//! A purchase is one payment intent for one physical item. Its lifecycle:
//!
//! ```text
//!  AwaitingPayment ──payment──▶ Committed ──created──▶ VoucherCreated ──claim──▶ Redeeming ──ok──▶ Redeemed
//!                                 │  ▲                      ▲                       │
//!                                 └──┘ create failed        └────── redeem failed ──┘
//! ```
//!
//! `Committed` is the compensating state: the code hash, expiry and nonce
//! are fixed and persisted, but the chain has not confirmed the voucher.
//! Redemption retries the creation from there without re-issuing a code.
//! `Redeeming` is an internal claim held while the redeem call is in flight
//! so two tills can't both dispense. Externally both look like
//! `VOUCHER_CREATED`.
//!
//! All guards live in [`transition`]. Callers never poke at the state enum
//! directly; they feed events in and persist what comes out.

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::crypto::address::Address;
use crate::crypto::hash::Hash32;
use crate::error::{Classify, ErrorClass};

// ---------------------------------------------------------------------------
// Status (external view)
// ---------------------------------------------------------------------------

/// The status string clients see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseStatus {
    Pending,
    VoucherCreated,
    Redeemed,
    Expired,
}

impl fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PurchaseStatus::Pending => "PENDING",
            PurchaseStatus::VoucherCreated => "VOUCHER_CREATED",
            PurchaseStatus::Redeemed => "REDEEMED",
            PurchaseStatus::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Commitment
// ---------------------------------------------------------------------------

/// Everything fixed at the moment a payment is accepted. Never changes
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherCommitment {
    /// `keccak256(code)`. The code itself is never stored.
    pub otp_hash: Hash32,
    #[serde(with = "ts_milliseconds")]
    pub otp_expiry: DateTime<Utc>,
    pub nonce: u64,
    /// Wallet the voucher is bound to.
    pub wallet: Address,
    /// Derived from `(wallet, nonce)`.
    pub voucher_address: Address,
}

impl VoucherCommitment {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.otp_expiry
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Internal state. Each variant carries exactly the data valid in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseState {
    AwaitingPayment,
    Committed {
        commitment: VoucherCommitment,
        last_error: Option<String>,
    },
    VoucherCreated {
        commitment: VoucherCommitment,
        create_tx: String,
    },
    Redeeming {
        commitment: VoucherCommitment,
        create_tx: String,
        #[serde(with = "ts_milliseconds")]
        claimed_at: DateTime<Utc>,
    },
    Redeemed {
        commitment: VoucherCommitment,
        create_tx: String,
        redeem_tx: String,
    },
    Expired {
        commitment: Option<VoucherCommitment>,
    },
}

/// Data-free discriminant, for guards and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingPayment,
    Committed,
    VoucherCreated,
    Redeeming,
    Redeemed,
    Expired,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl PurchaseState {
    pub fn phase(&self) -> Phase {
        match self {
            PurchaseState::AwaitingPayment => Phase::AwaitingPayment,
            PurchaseState::Committed { .. } => Phase::Committed,
            PurchaseState::VoucherCreated { .. } => Phase::VoucherCreated,
            PurchaseState::Redeeming { .. } => Phase::Redeeming,
            PurchaseState::Redeemed { .. } => Phase::Redeemed,
            PurchaseState::Expired { .. } => Phase::Expired,
        }
    }

    pub fn status(&self) -> PurchaseStatus {
        match self.phase() {
            Phase::AwaitingPayment | Phase::Committed => PurchaseStatus::Pending,
            Phase::VoucherCreated | Phase::Redeeming => PurchaseStatus::VoucherCreated,
            Phase::Redeemed => PurchaseStatus::Redeemed,
            Phase::Expired => PurchaseStatus::Expired,
        }
    }

    pub fn commitment(&self) -> Option<&VoucherCommitment> {
        match self {
            PurchaseState::AwaitingPayment => None,
            PurchaseState::Committed { commitment, .. }
            | PurchaseState::VoucherCreated { commitment, .. }
            | PurchaseState::Redeeming { commitment, .. }
            | PurchaseState::Redeemed { commitment, .. } => Some(commitment),
            PurchaseState::Expired { commitment } => commitment.as_ref(),
        }
    }

    /// Chain transaction that created the voucher, once known.
    pub fn create_tx(&self) -> Option<&str> {
        match self {
            PurchaseState::VoucherCreated { create_tx, .. }
            | PurchaseState::Redeeming { create_tx, .. }
            | PurchaseState::Redeemed { create_tx, .. } => Some(create_tx),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Events & Transition
// ---------------------------------------------------------------------------

/// Something that happened to a purchase.
#[derive(Debug, Clone)]
pub enum PurchaseEvent {
    /// A payment was accepted and a commitment computed for it.
    PaymentObserved { commitment: VoucherCommitment },
    /// Redemption found the voucher not yet on chain; try again.
    RetryCreate,
    VoucherCreated { tx: String },
    VoucherCreateFailed { error: String },
    /// A till wants to redeem; take the claim.
    RedeemClaimed,
    Redeemed { tx: String },
    RedeemFailed,
    /// Explicit expiry. Nothing sweeps purchases into this today.
    Expire,
}

impl PurchaseEvent {
    fn name(&self) -> &'static str {
        match self {
            PurchaseEvent::PaymentObserved { .. } => "payment_observed",
            PurchaseEvent::RetryCreate => "retry_create",
            PurchaseEvent::VoucherCreated { .. } => "voucher_created",
            PurchaseEvent::VoucherCreateFailed { .. } => "voucher_create_failed",
            PurchaseEvent::RedeemClaimed => "redeem_claimed",
            PurchaseEvent::Redeemed { .. } => "redeemed",
            PurchaseEvent::RedeemFailed => "redeem_failed",
            PurchaseEvent::Expire => "expire",
        }
    }
}

/// Side effect the caller must perform after persisting the new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    CreateVoucher,
    RedeemVoucher,
}

/// Output of [`transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: PurchaseState,
    pub effect: Effect,
}

/// Context the guards need.
#[derive(Debug, Clone, Copy)]
pub struct Guards {
    pub now: DateTime<Utc>,
    /// After this long a `Redeeming` claim is considered abandoned.
    pub redeem_lease: ChronoDuration,
}

/// The event is not valid in the current phase.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot apply {event} in phase {from}")]
pub struct TransitionError {
    pub from: Phase,
    pub event: &'static str,
}

impl Classify for TransitionError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Conflict
    }
}

/// The one place purchase guards live.
pub fn transition(
    state: &PurchaseState,
    event: PurchaseEvent,
    guards: &Guards,
) -> Result<Transition, TransitionError> {
    let reject = |event: &PurchaseEvent| TransitionError {
        from: state.phase(),
        event: event.name(),
    };

    let (next, effect) = match (state, event) {
        (PurchaseState::AwaitingPayment, PurchaseEvent::PaymentObserved { commitment }) => (
            PurchaseState::Committed {
                commitment,
                last_error: None,
            },
            Effect::CreateVoucher,
        ),

        (PurchaseState::Committed { .. }, PurchaseEvent::RetryCreate) => {
            (state.clone(), Effect::CreateVoucher)
        }

        (PurchaseState::Committed { commitment, .. }, PurchaseEvent::VoucherCreated { tx }) => (
            PurchaseState::VoucherCreated {
                commitment: commitment.clone(),
                create_tx: tx,
            },
            Effect::None,
        ),

        (
            PurchaseState::Committed { commitment, .. },
            PurchaseEvent::VoucherCreateFailed { error },
        ) => (
            PurchaseState::Committed {
                commitment: commitment.clone(),
                last_error: Some(error),
            },
            Effect::None,
        ),

        (
            PurchaseState::VoucherCreated {
                commitment,
                create_tx,
            },
            PurchaseEvent::RedeemClaimed,
        ) => (
            PurchaseState::Redeeming {
                commitment: commitment.clone(),
                create_tx: create_tx.clone(),
                claimed_at: guards.now,
            },
            Effect::RedeemVoucher,
        ),

        (
            PurchaseState::Redeeming {
                commitment,
                create_tx,
                claimed_at,
            },
            PurchaseEvent::RedeemClaimed,
        ) if *claimed_at + guards.redeem_lease <= guards.now => (
            PurchaseState::Redeeming {
                commitment: commitment.clone(),
                create_tx: create_tx.clone(),
                claimed_at: guards.now,
            },
            Effect::RedeemVoucher,
        ),

        (
            PurchaseState::Redeeming {
                commitment,
                create_tx,
                ..
            },
            PurchaseEvent::Redeemed { tx },
        ) => (
            PurchaseState::Redeemed {
                commitment: commitment.clone(),
                create_tx: create_tx.clone(),
                redeem_tx: tx,
            },
            Effect::None,
        ),

        (
            PurchaseState::Redeeming {
                commitment,
                create_tx,
                ..
            },
            PurchaseEvent::RedeemFailed,
        ) => (
            PurchaseState::VoucherCreated {
                commitment: commitment.clone(),
                create_tx: create_tx.clone(),
            },
            Effect::None,
        ),

        (
            PurchaseState::AwaitingPayment
            | PurchaseState::Committed { .. }
            | PurchaseState::VoucherCreated { .. },
            PurchaseEvent::Expire,
        ) => (
            PurchaseState::Expired {
                commitment: state.commitment().cloned(),
            },
            Effect::None,
        ),

        (_, event) => return Err(reject(&event)),
    };

    Ok(Transition { next, effect })
}

// ---------------------------------------------------------------------------
// Purchase record
// ---------------------------------------------------------------------------

/// One payment intent, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    /// Correlation token, also the payment memo.
    pub reference_id: String,
    /// Payer wallet. May be unknown until the payment is seen.
    pub user_wallet: Option<Address>,
    /// Price in the token's smallest unit.
    pub amount: u64,
    pub transaction_signature: Option<String>,
    pub state: PurchaseState,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Purchase {
    pub fn new(
        reference_id: String,
        user_wallet: Option<Address>,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            reference_id,
            user_wallet,
            amount,
            transaction_signature: None,
            state: PurchaseState::AwaitingPayment,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> PurchaseStatus {
        self.state.status()
    }

    pub fn otp_expiry(&self) -> Option<DateTime<Utc>> {
        self.state.commitment().map(|c| c.otp_expiry)
    }

    /// Copy of `self` moved into `state`.
    pub fn with_state(&self, state: PurchaseState, now: DateTime<Utc>) -> Self {
        Self {
            state,
            updated_at: now,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
