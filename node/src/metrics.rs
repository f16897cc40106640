//! # Prometheus Metrics
//!
//! Counters for the purchase, redemption and admin flows, kept in a
//! dedicated registry under the `solvend` prefix and served at `/metrics`
//! on the metrics port.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

use solvend_protocol::watcher::{TickReport, WatcherError};

/// Every metric handle the node records into. Handles are cheap clones of
/// shared counters.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Purchase intents opened.
    pub purchases_created_total: IntCounter,
    /// Codes issued, whether or not the voucher reached the chain.
    pub vouchers_issued_total: IntCounter,
    /// Voucher creations that failed on chain and were left for retry.
    pub voucher_creation_failures_total: IntCounter,
    /// Successful redemptions.
    pub redemptions_total: IntCounter,
    /// Rejected or failed redemptions, by error class.
    pub redemption_failures_total: IntCounterVec,
    /// Payments accepted, by source (`direct`, `watcher`, `batch`).
    pub payments_observed_total: IntCounterVec,
    /// Admin requests turned away, by reason.
    pub auth_rejections_total: IntCounterVec,
    /// Watcher ticks that failed outright.
    pub watcher_errors_total: IntCounter,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("solvend".into()), None)
            .expect("failed to create prometheus registry");

        let purchases_created_total =
            IntCounter::new("purchases_created_total", "Purchase intents opened")
                .expect("metric creation");
        registry
            .register(Box::new(purchases_created_total.clone()))
            .expect("metric registration");

        let vouchers_issued_total =
            IntCounter::new("vouchers_issued_total", "Redemption codes issued")
                .expect("metric creation");
        registry
            .register(Box::new(vouchers_issued_total.clone()))
            .expect("metric registration");

        let voucher_creation_failures_total = IntCounter::new(
            "voucher_creation_failures_total",
            "Voucher creations that failed on chain and were left pending",
        )
        .expect("metric creation");
        registry
            .register(Box::new(voucher_creation_failures_total.clone()))
            .expect("metric registration");

        let redemptions_total = IntCounter::new("redemptions_total", "Vouchers redeemed")
            .expect("metric creation");
        registry
            .register(Box::new(redemptions_total.clone()))
            .expect("metric registration");

        let redemption_failures_total = IntCounterVec::new(
            Opts::new(
                "redemption_failures_total",
                "Redemption attempts that did not redeem, by error class",
            ),
            &["class"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(redemption_failures_total.clone()))
            .expect("metric registration");

        let payments_observed_total = IntCounterVec::new(
            Opts::new("payments_observed_total", "Payments accepted, by source"),
            &["source"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(payments_observed_total.clone()))
            .expect("metric registration");

        let auth_rejections_total = IntCounterVec::new(
            Opts::new("auth_rejections_total", "Admin requests rejected, by reason"),
            &["reason"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(auth_rejections_total.clone()))
            .expect("metric registration");

        let watcher_errors_total =
            IntCounter::new("watcher_errors_total", "Watcher ticks that failed")
                .expect("metric creation");
        registry
            .register(Box::new(watcher_errors_total.clone()))
            .expect("metric registration");

        Self {
            registry,
            purchases_created_total,
            vouchers_issued_total,
            voucher_creation_failures_total,
            redemptions_total,
            redemption_failures_total,
            payments_observed_total,
            auth_rejections_total,
            watcher_errors_total,
        }
    }

    /// Fold one watcher tick into the counters.
    pub fn record_tick(&self, result: &Result<TickReport, WatcherError>) {
        match result {
            Ok(report) => {
                self.vouchers_issued_total.inc_by(report.purchases as u64);
                self.payments_observed_total
                    .with_label_values(&["watcher"])
                    .inc_by(report.purchases as u64);
                self.payments_observed_total
                    .with_label_values(&["batch"])
                    .inc_by(report.batches as u64);
            }
            Err(_) => self.watcher_errors_total.inc(),
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_uses_prefix() {
        let m = NodeMetrics::new();
        m.purchases_created_total.inc();
        m.payments_observed_total.with_label_values(&["direct"]).inc();
        let text = m.encode().unwrap();
        assert!(text.contains("solvend_purchases_created_total 1"));
        assert!(text.contains("solvend_payments_observed_total{source=\"direct\"} 1"));
    }

    #[test]
    fn tick_results_are_counted() {
        let m = NodeMetrics::new();
        let report = TickReport {
            purchases: 2,
            batches: 1,
            ..TickReport::default()
        };
        m.record_tick(&Ok(report));
        m.record_tick(&Err(WatcherError::Fetch(
            solvend_protocol::chain::ChainError::Unavailable("rpc down".into()),
        )));

        assert_eq!(m.payments_observed_total.with_label_values(&["watcher"]).get(), 2);
        assert_eq!(m.payments_observed_total.with_label_values(&["batch"]).get(), 1);
        assert_eq!(m.watcher_errors_total.get(), 1);
    }
}
