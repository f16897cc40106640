//! Code delivery seam.
//!
//! When the watcher (not the buyer's own confirm call) accepts a payment,
//! nobody is waiting on the response to receive the code. It has to be
//! pushed to the buyer's device instead. Delivery itself is someone else's
//! problem; this trait is where it plugs in.

use async_trait::async_trait;

use crate::crypto::address::Address;

/// Pushes a freshly issued code to the buyer.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver_code(&self, reference_id: &str, wallet: &Address, code: &str);
}

/// Notifier that only records that a delivery would have happened. Never
/// logs the code.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver_code(&self, reference_id: &str, wallet: &Address, _code: &str) {
        tracing::info!(reference_id, wallet = %wallet, "redemption code ready for delivery");
    }
}
