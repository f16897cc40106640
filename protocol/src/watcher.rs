//! # Payment Watcher
//!
//! Polls the treasury for recent transfers and feeds the ones it hasn't
//! handled yet into the purchase and batch services. It is the second of
//! the two payment sources; the other is the buyer's own confirm call, and
//! the ledger sorts out which one wins.
//!
//! Each tick:
//!
//! 1. Fetch the newest [`config::WATCH_SIGNATURE_LIMIT`] payments.
//! 2. Walk them oldest first.
//! 3. Skip failed transactions and signatures already in the durable seen
//!    set.
//! 4. Route by memo: purchase reference, batch reference, or nothing.
//! 5. Mark the signature seen once handled.
//! 6. Forget seen signatures older than the retention window.
//!
//! A payment whose handling failed for an internal reason (storage) is left
//! unmarked and picked up again next tick. Anything else is marked and
//! logged; retrying would give the same answer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::chain::ChainError;
use crate::clock::Clock;
use crate::config;
use crate::crypto::address::Address;
use crate::distribution::BatchService;
use crate::error::{Classify, ErrorClass};
use crate::purchase::{Confirmation, PaymentOutcome, PurchaseService};
use crate::storage::{DbError, SolvendDB};

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// One transfer into the treasury, as seen on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedPayment {
    pub signature: String,
    /// Memo attached to the transfer; the reference id if the client did
    /// its job.
    pub memo: Option<String>,
    /// First signer of the transaction.
    pub payer: Option<Address>,
    /// The transaction landed but errored.
    pub failed: bool,
    /// Amount transferred, when the source reports it.
    pub amount: Option<u64>,
}

/// Where payments come from.
#[async_trait]
pub trait PaymentSource: Send + Sync {
    /// Up to `limit` most recent treasury payments, newest first.
    async fn recent_payments(&self, limit: usize) -> Result<Vec<ObservedPayment>, ChainError>;
}

// ---------------------------------------------------------------------------
// Errors & reports
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("failed to fetch payments: {0}")]
    Fetch(#[from] ChainError),

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl Classify for WatcherError {
    fn class(&self) -> ErrorClass {
        match self {
            WatcherError::Fetch(e) => e.class(),
            WatcherError::Storage(e) => e.class(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub fetched: usize,
    pub skipped_seen: usize,
    pub skipped_failed: usize,
    /// Purchases moved out of awaiting-payment by this tick.
    pub purchases: usize,
    /// Purchases the direct path had already handled.
    pub already_handled: usize,
    pub batches: usize,
    pub unmatched: usize,
    /// Payments whose amount did not match the price. Accepted anyway.
    pub amount_mismatches: usize,
    pub errors: usize,
    pub pruned: usize,
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub interval: Duration,
    pub limit: usize,
    pub retention: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval: config::WATCH_POLL_INTERVAL,
            limit: config::WATCH_SIGNATURE_LIMIT,
            retention: config::SEEN_SIGNATURE_RETENTION,
        }
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

enum Handled {
    Purchase,
    AlreadyHandled,
    Batch,
    Unmatched,
}

pub struct PaymentWatcher {
    source: Arc<dyn PaymentSource>,
    purchases: PurchaseService,
    batches: BatchService,
    db: Arc<SolvendDB>,
    clock: Arc<dyn Clock>,
    config: WatcherConfig,
}

impl PaymentWatcher {
    pub fn new(
        source: Arc<dyn PaymentSource>,
        purchases: PurchaseService,
        batches: BatchService,
        db: Arc<SolvendDB>,
        clock: Arc<dyn Clock>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            source,
            purchases,
            batches,
            db,
            clock,
            config,
        }
    }

    /// Poll until `shutdown` flips to true or its sender goes away.
    /// `on_tick` sees every tick's result.
    pub async fn run<F>(&self, mut shutdown: watch::Receiver<bool>, mut on_tick: F)
    where
        F: FnMut(&Result<TickReport, WatcherError>),
    {
        info!(interval_ms = self.config.interval.as_millis() as u64, "payment watcher starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let result = self.tick().await;
            match &result {
                Ok(report) if report.fetched > report.skipped_seen => {
                    debug!(?report, "watcher tick");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "watcher tick failed"),
            }
            on_tick(&result);

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("payment watcher stopped");
    }

    /// One polling pass.
    pub async fn tick(&self) -> Result<TickReport, WatcherError> {
        let mut payments = self.source.recent_payments(self.config.limit).await?;
        payments.reverse();

        let mut report = TickReport {
            fetched: payments.len(),
            ..TickReport::default()
        };

        for payment in &payments {
            if self.db.is_signature_seen(&payment.signature)? {
                report.skipped_seen += 1;
                continue;
            }
            if payment.failed {
                report.skipped_failed += 1;
                self.db
                    .mark_signature_seen(&payment.signature, self.clock.now_ms())?;
                continue;
            }

            match self.handle(payment, &mut report).await {
                Ok(handled) => {
                    match handled {
                        Handled::Purchase => report.purchases += 1,
                        Handled::AlreadyHandled => report.already_handled += 1,
                        Handled::Batch => report.batches += 1,
                        Handled::Unmatched => report.unmatched += 1,
                    }
                    self.db
                        .mark_signature_seen(&payment.signature, self.clock.now_ms())?;
                }
                Err(class) => {
                    report.errors += 1;
                    if class != ErrorClass::Internal {
                        self.db
                            .mark_signature_seen(&payment.signature, self.clock.now_ms())?;
                    }
                }
            }
        }

        let cutoff = self.clock.now_ms() - config::duration_ms(self.config.retention);
        report.pruned = self.db.prune_seen_signatures(cutoff)?;
        Ok(report)
    }

    /// A transfer whose amount is known and differs from the price is still
    /// accepted; it is logged for reconciliation.
    fn amount_differs(&self, payment: &ObservedPayment, reference_id: &str, expected: u64) -> bool {
        match payment.amount {
            Some(paid) if paid != expected => {
                warn!(
                    reference_id,
                    signature = %payment.signature,
                    paid,
                    expected,
                    "payment amount differs from price"
                );
                true
            }
            _ => false,
        }
    }

    async fn handle(
        &self,
        payment: &ObservedPayment,
        report: &mut TickReport,
    ) -> Result<Handled, ErrorClass> {
        let Some(memo) = payment.memo.as_deref().map(str::trim).filter(|m| !m.is_empty()) else {
            return Ok(Handled::Unmatched);
        };

        let purchase_amount = match self.purchases.status(memo) {
            Ok(view) => Some(view.amount),
            Err(e) if e.class() == ErrorClass::NotFound => None,
            Err(e) => return Err(e.class()),
        };

        if let Some(expected) = purchase_amount {
            if self.amount_differs(payment, memo, expected) {
                report.amount_mismatches += 1;
            }
            return match self
                .purchases
                .payment_observed(memo, &payment.signature, payment.payer, Confirmation::Watcher)
                .await
            {
                Ok(PaymentOutcome::AlreadyHandled { .. }) => Ok(Handled::AlreadyHandled),
                Ok(_) => Ok(Handled::Purchase),
                Err(e) => {
                    warn!(reference_id = memo, signature = %payment.signature, error = %e, "purchase payment not applied");
                    Err(e.class())
                }
            };
        }

        let batch_amount = match self.batches.get(memo) {
            Ok(batch) => Some(batch.amount),
            Err(e) if e.class() == ErrorClass::NotFound => None,
            Err(e) => return Err(e.class()),
        };

        if let Some(expected) = batch_amount {
            if self.amount_differs(payment, memo, expected) {
                report.amount_mismatches += 1;
            }
            return match self
                .batches
                .batch_payment_observed(memo, &payment.signature, payment.payer)
            {
                Ok(_) => Ok(Handled::Batch),
                Err(e) => {
                    warn!(reference_id = memo, signature = %payment.signature, error = %e, "batch payment not applied");
                    Err(e.class())
                }
            };
        }

        debug!(memo, signature = %payment.signature, "payment memo matches nothing");
        Ok(Handled::Unmatched)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainOp, SimulatedChain};
    use crate::clock::ManualClock;
    use crate::distribution::{BatchStatus, ReportType};
    use crate::purchase::{LogNotifier, PurchaseSettings, PurchaseStatus};
    use chrono::{TimeZone, Utc};

    struct Fixture {
        clock: Arc<ManualClock>,
        chain: Arc<SimulatedChain>,
        db: Arc<SolvendDB>,
        purchases: PurchaseService,
        batches: BatchService,
        watcher: PaymentWatcher,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        let chain = Arc::new(SimulatedChain::new(clock.clone()));
        let db = Arc::new(SolvendDB::open_temporary().unwrap());
        let program: Address = config::DEFAULT_PROGRAM_ID.parse().unwrap();
        let treasury = Address::new([7; 32]);
        let purchases = PurchaseService::new(
            db.clone(),
            chain.clone(),
            clock.clone(),
            Arc::new(LogNotifier),
            PurchaseSettings::new(program, treasury),
        )
        .unwrap();
        let batches = BatchService::new(db.clone(), chain.clone(), clock.clone(), program, treasury);
        let watcher = PaymentWatcher::new(
            chain.clone(),
            purchases.clone(),
            batches.clone(),
            db.clone(),
            clock.clone(),
            WatcherConfig::default(),
        );
        Fixture {
            clock,
            chain,
            db,
            purchases,
            batches,
            watcher,
        }
    }

    fn payment(signature: &str, memo: Option<&str>) -> ObservedPayment {
        ObservedPayment {
            signature: signature.into(),
            memo: memo.map(String::from),
            payer: Some(Address::new([1; 32])),
            failed: false,
            amount: Some(1_000_000),
        }
    }

    #[tokio::test]
    async fn routes_purchase_and_batch_payments() {
        let f = fixture();
        let intent = f.purchases.create_purchase(None, 1_000_000).unwrap();
        let batch = f
            .batches
            .create_batch(Address::new([1; 32]), ReportType::Daily, 1)
            .unwrap();

        f.chain.record_payment(payment("s1", Some(&intent.reference_id)));
        f.chain.record_payment(payment("s2", Some(&batch.reference_id)));
        f.chain.record_payment(payment("s3", Some("someone else's memo")));
        f.chain.record_payment(payment("s4", None));

        let report = f.watcher.tick().await.unwrap();
        assert_eq!(report.fetched, 4);
        assert_eq!(report.purchases, 1);
        assert_eq!(report.batches, 1);
        assert_eq!(report.unmatched, 2);

        assert_eq!(
            f.purchases.status(&intent.reference_id).unwrap().status,
            PurchaseStatus::VoucherCreated
        );
        assert_eq!(
            f.batches.get(&batch.reference_id).unwrap().status,
            BatchStatus::Paid
        );
        assert_eq!(f.db.seen_signature_count(), 4);
    }

    #[tokio::test]
    async fn wrong_amount_is_accepted_and_counted() {
        let f = fixture();
        let intent = f.purchases.create_purchase(None, 1_000_000).unwrap();
        let batch = f
            .batches
            .create_batch(Address::new([1; 32]), ReportType::Weekly, 7)
            .unwrap();

        let mut short = payment("s1", Some(&intent.reference_id));
        short.amount = Some(999_999);
        f.chain.record_payment(short);
        // The fixture pays the daily price, not the weekly one.
        f.chain.record_payment(payment("s2", Some(&batch.reference_id)));
        let mut unknown = payment("s3", Some(&intent.reference_id));
        unknown.amount = None;
        f.chain.record_payment(unknown);

        let report = f.watcher.tick().await.unwrap();
        assert_eq!(report.amount_mismatches, 2);
        assert_eq!(report.purchases, 1);
        assert_eq!(report.batches, 1);
        assert_eq!(report.already_handled, 1);
    }

    #[tokio::test]
    async fn seen_signatures_are_skipped() {
        let f = fixture();
        let intent = f.purchases.create_purchase(None, 1_000_000).unwrap();
        f.chain.record_payment(payment("s1", Some(&intent.reference_id)));

        f.watcher.tick().await.unwrap();
        let second = f.watcher.tick().await.unwrap();
        assert_eq!(second.skipped_seen, 1);
        assert_eq!(second.purchases, 0);
        assert_eq!(f.chain.calls(ChainOp::CreateVoucher), 1);
    }

    #[tokio::test]
    async fn failed_transactions_are_ignored() {
        let f = fixture();
        let intent = f.purchases.create_purchase(None, 1_000_000).unwrap();
        let mut p = payment("s1", Some(&intent.reference_id));
        p.failed = true;
        f.chain.record_payment(p);

        let report = f.watcher.tick().await.unwrap();
        assert_eq!(report.skipped_failed, 1);
        assert_eq!(
            f.purchases.status(&intent.reference_id).unwrap().status,
            PurchaseStatus::Pending
        );
    }

    #[tokio::test]
    async fn direct_confirmation_wins_then_watcher_is_a_no_op() {
        let f = fixture();
        let intent = f
            .purchases
            .create_purchase(Some(Address::new([1; 32])), 1_000_000)
            .unwrap();
        f.purchases
            .payment_observed(&intent.reference_id, "s1", None, Confirmation::Direct)
            .await
            .unwrap();
        f.chain.record_payment(payment("s1", Some(&intent.reference_id)));

        let report = f.watcher.tick().await.unwrap();
        assert_eq!(report.already_handled, 1);
        assert_eq!(f.chain.calls(ChainOp::CreateVoucher), 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_an_error() {
        let f = fixture();
        f.chain
            .fail_next_fetch(ChainError::Unavailable("rpc down".into()));
        let err = f.watcher.tick().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Upstream { retryable: true });
    }

    #[tokio::test]
    async fn old_signatures_are_pruned() {
        let f = fixture();
        f.chain.record_payment(payment("s1", None));
        f.watcher.tick().await.unwrap();
        assert_eq!(f.db.seen_signature_count(), 1);

        f.clock.advance(chrono::Duration::days(8));
        let report = f.watcher.tick().await.unwrap();
        assert_eq!(report.skipped_seen, 1);
        assert_eq!(report.pruned, 1);
        assert_eq!(f.db.seen_signature_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let mut ticks = 0;

        let run = f.watcher.run(rx, |result| {
            assert!(result.is_ok());
            ticks += 1;
        });
        let stop = async {
            tokio::time::sleep(config::WATCH_POLL_INTERVAL * 3).await;
            let _ = tx.send(true);
        };
        tokio::join!(run, stop);
        assert!(ticks >= 3);
    }
}
