//! # Purchases & Vouchers
//!
//! A buyer pays, gets a short numeric code bound to an on-chain voucher, and
//! types the code at the machine to get their item.
//!
//! - **state** — the tagged state enum and the one transition function.
//! - **service** — the flow itself: intents, payment handling, redemption.
//! - **notify** — where a watcher-issued code leaves the building.

pub mod notify;
pub mod service;
pub mod state;

pub use notify::{LogNotifier, Notifier};
pub use service::{
    Confirmation, PaymentOutcome, PurchaseError, PurchaseIntent, PurchaseService,
    PurchaseSettings, PurchaseView, RedeemError, Redemption,
};
pub use state::{Purchase, PurchaseState, PurchaseStatus, VoucherCommitment};
