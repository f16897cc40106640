//! Distribution batch records.
//!
//! A batch is a purchased report: someone pays for a report over a time
//! window, the report gets attached on chain, and later a Merkle root for
//! the revenue it covers is committed against the same account.
//!
//! ```text
//!  PENDING ──payment──▶ PAID ──attach data──▶ READY ──submit root──▶ DISTRIBUTION_READY
//! ```

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config;
use crate::crypto::address::Address;

/// Kind of report being bought. Sets the price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportType {
    Daily,
    Weekly,
    Monthly,
}

impl ReportType {
    pub fn price(&self) -> u64 {
        match self {
            ReportType::Daily => config::REPORT_PRICE_DAILY,
            ReportType::Weekly => config::REPORT_PRICE_WEEKLY,
            ReportType::Monthly => config::REPORT_PRICE_MONTHLY,
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for ReportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Daily" => Ok(ReportType::Daily),
            "Weekly" => Ok(ReportType::Weekly),
            "Monthly" => Ok(ReportType::Monthly),
            other => Err(format!(
                "unknown report type {other:?}, expected Daily, Weekly or Monthly"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Paid,
    Ready,
    DistributionReady,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Paid => "PAID",
            BatchStatus::Ready => "READY",
            BatchStatus::DistributionReady => "DISTRIBUTION_READY",
        };
        f.write_str(s)
    }
}

/// One report purchase, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionBatch {
    /// Correlation token, also the payment memo.
    pub reference_id: String,
    /// On-chain report id.
    pub batch_id: u64,
    pub buyer_wallet: Address,
    pub report_type: ReportType,
    pub timeframe_days: u32,
    pub amount: u64,
    pub status: BatchStatus,
    pub transaction_signature: Option<String>,
    pub ipfs_cid: Option<String>,
    /// Hex, as submitted.
    pub merkle_root: Option<String>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl DistributionBatch {
    pub fn new(
        reference_id: String,
        batch_id: u64,
        buyer_wallet: Address,
        report_type: ReportType,
        timeframe_days: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            reference_id,
            batch_id,
            buyer_wallet,
            report_type,
            timeframe_days,
            amount: report_type.price(),
            status: BatchStatus::Pending,
            transaction_signature: None,
            ipfs_cid: None,
            merkle_root: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn report_type_parses_and_prices() {
        assert_eq!("Weekly".parse::<ReportType>(), Ok(ReportType::Weekly));
        assert!("weekly".parse::<ReportType>().is_err());
        assert_eq!(ReportType::Monthly.price(), config::REPORT_PRICE_MONTHLY);
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_string(&BatchStatus::DistributionReady).unwrap(),
            "\"DISTRIBUTION_READY\""
        );
        assert_eq!(BatchStatus::Paid.to_string(), "PAID");
    }

    #[test]
    fn new_batch_is_pending_and_priced() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let b = DistributionBatch::new("R".into(), 3, Address::new([1; 32]), ReportType::Daily, 7, now);
        assert_eq!(b.status, BatchStatus::Pending);
        assert_eq!(b.amount, config::REPORT_PRICE_DAILY);
    }

    #[test]
    fn timestamps_persist_as_unix_millis() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let b = DistributionBatch::new("R".into(), 3, Address::new([1; 32]), ReportType::Daily, 7, now);
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["created_at"], 1_700_000_000_123i64);
        assert_eq!(json["updated_at"], 1_700_000_000_123i64);
    }
}
