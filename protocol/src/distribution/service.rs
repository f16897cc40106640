//! Batch lifecycle.
//!
//! Creation and payment are public; attaching report data and committing a
//! root are admin operations and arrive here only after the auth gate.
//! For those two the chain goes first: if the call fails nothing is
//! written, so the admin can simply send the same request again.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::batch::{BatchStatus, DistributionBatch, ReportType};
use crate::chain::{
    with_timeout, AttachReportDataRequest, ChainClient, ChainError, ChainOp, IdempotencyKey,
    SubmitRootRequest,
};
use crate::clock::Clock;
use crate::config;
use crate::crypto::address::{report_address, Address, AddressError};
use crate::crypto::hash::{parse_hex32, to_hex};
use crate::error::{Classify, ErrorClass};
use crate::storage::{DbError, SolvendDB, Update};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("timeframe must be between {min} and {max} days, got {0}", min = config::MIN_TIMEFRAME_DAYS, max = config::MAX_TIMEFRAME_DAYS)]
    InvalidTimeframe(u32),

    #[error("invalid merkle root: {0}")]
    InvalidRoot(String),

    #[error("ipfs cid must not be empty")]
    EmptyCid,

    #[error("batch {0} not found")]
    NotFound(String),

    #[error("batch {reference_id} is {actual}, expected {expected}")]
    WrongStatus {
        reference_id: String,
        expected: BatchStatus,
        actual: BatchStatus,
    },

    #[error("chain call failed: {0}")]
    Upstream(#[from] ChainError),

    #[error("address derivation failed: {0}")]
    Address(#[from] AddressError),

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl Classify for BatchError {
    fn class(&self) -> ErrorClass {
        match self {
            BatchError::InvalidTimeframe(_) | BatchError::InvalidRoot(_) | BatchError::EmptyCid => {
                ErrorClass::Validation
            }
            BatchError::NotFound(_) => ErrorClass::NotFound,
            BatchError::WrongStatus { .. } => ErrorClass::Conflict,
            BatchError::Upstream(e) => e.class(),
            BatchError::Address(_) => ErrorClass::Internal,
            BatchError::Storage(e) => e.class(),
        }
    }
}

/// What a report buyer needs to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchIntent {
    pub reference_id: String,
    pub batch_id: u64,
    pub payment_target: Address,
    pub report_type: ReportType,
    pub timeframe_days: u32,
    pub amount: u64,
    pub memo: String,
}

/// Result of an admin chain operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReceipt {
    pub batch_id: u64,
    pub status: BatchStatus,
    pub transaction_signature: String,
}

#[derive(Clone)]
pub struct BatchService {
    db: Arc<SolvendDB>,
    chain: Arc<dyn ChainClient>,
    clock: Arc<dyn Clock>,
    program_id: Address,
    treasury: Address,
    chain_timeout: Duration,
}

impl BatchService {
    pub fn new(
        db: Arc<SolvendDB>,
        chain: Arc<dyn ChainClient>,
        clock: Arc<dyn Clock>,
        program_id: Address,
        treasury: Address,
    ) -> Self {
        Self {
            db,
            chain,
            clock,
            program_id,
            treasury,
            chain_timeout: config::CHAIN_CALL_TIMEOUT,
        }
    }

    pub fn with_chain_timeout(mut self, limit: Duration) -> Self {
        self.chain_timeout = limit;
        self
    }

    pub fn create_batch(
        &self,
        buyer: Address,
        report_type: ReportType,
        timeframe_days: u32,
    ) -> Result<BatchIntent, BatchError> {
        if !(config::MIN_TIMEFRAME_DAYS..=config::MAX_TIMEFRAME_DAYS).contains(&timeframe_days) {
            return Err(BatchError::InvalidTimeframe(timeframe_days));
        }
        let reference_id = Uuid::new_v4().to_string();
        let batch_id = self.db.generate_batch_id()?;
        let batch = DistributionBatch::new(
            reference_id.clone(),
            batch_id,
            buyer,
            report_type,
            timeframe_days,
            self.clock.now(),
        );
        self.db.insert_batch(&batch)?;

        tracing::info!(reference_id = %reference_id, batch_id, report_type = %report_type, "report batch created");
        Ok(BatchIntent {
            memo: reference_id.clone(),
            reference_id,
            batch_id,
            payment_target: self.treasury,
            report_type,
            timeframe_days,
            amount: batch.amount,
        })
    }

    pub fn get(&self, reference_id: &str) -> Result<DistributionBatch, BatchError> {
        self.db
            .get_batch(reference_id)?
            .ok_or_else(|| BatchError::NotFound(reference_id.to_string()))
    }

    /// PENDING → PAID. Returns false if the batch had already left PENDING.
    pub fn batch_payment_observed(
        &self,
        reference_id: &str,
        signature: &str,
        payer: Option<Address>,
    ) -> Result<bool, BatchError> {
        let now = self.clock.now();
        let update = self.db.update_batch(
            reference_id,
            |b| b.status == BatchStatus::Pending,
            |b| DistributionBatch {
                status: BatchStatus::Paid,
                transaction_signature: Some(signature.to_string()),
                updated_at: now,
                ..b.clone()
            },
        )?;

        match update {
            Update::Applied(batch) => {
                if let Some(payer) = payer.filter(|p| *p != batch.buyer_wallet) {
                    tracing::warn!(
                        reference_id,
                        payer = %payer,
                        buyer = %batch.buyer_wallet,
                        "payer does not match buyer, marking paid anyway"
                    );
                }
                tracing::info!(reference_id, batch_id = batch.batch_id, "report batch paid");
                Ok(true)
            }
            Update::Mismatch(_) => Ok(false),
            Update::Missing => Err(BatchError::NotFound(reference_id.to_string())),
        }
    }

    /// PAID → READY, after `attach_report_data` lands on chain.
    pub async fn attach_report_data(
        &self,
        batch_id: u64,
        buyer: Address,
        ipfs_cid: &str,
    ) -> Result<BatchReceipt, BatchError> {
        let ipfs_cid = ipfs_cid.trim();
        if ipfs_cid.is_empty() {
            return Err(BatchError::EmptyCid);
        }
        let batch = self.batch_in(batch_id, buyer, BatchStatus::Paid)?;
        let report = report_address(&self.program_id, &buyer, batch_id)?;

        let request = AttachReportDataRequest {
            key: IdempotencyKey::new(&batch.reference_id, ChainOp::AttachReportData),
            report,
            buyer,
            report_id: batch_id,
            ipfs_cid: ipfs_cid.to_string(),
        };
        let receipt = with_timeout(self.chain_timeout, self.chain.attach_report_data(request))
            .await
            .map_err(|e| {
                tracing::warn!(batch_id, error = %e, "attach report data failed");
                e
            })?;

        let now = self.clock.now();
        self.advance(&batch.reference_id, BatchStatus::Paid, |b| DistributionBatch {
            status: BatchStatus::Ready,
            ipfs_cid: Some(ipfs_cid.to_string()),
            updated_at: now,
            ..b.clone()
        })?;

        tracing::info!(batch_id, tx = %receipt.signature, "report data attached");
        Ok(BatchReceipt {
            batch_id,
            status: BatchStatus::Ready,
            transaction_signature: receipt.signature,
        })
    }

    /// READY → DISTRIBUTION_READY, after the root lands on chain.
    pub async fn submit_root(
        &self,
        batch_id: u64,
        buyer: Address,
        root_hex: &str,
    ) -> Result<BatchReceipt, BatchError> {
        let root = parse_hex32(root_hex).map_err(|e| BatchError::InvalidRoot(e.to_string()))?;
        let batch = self.batch_in(batch_id, buyer, BatchStatus::Ready)?;
        let report = report_address(&self.program_id, &buyer, batch_id)?;

        let request = SubmitRootRequest {
            key: IdempotencyKey::new(&batch.reference_id, ChainOp::SubmitRoot),
            report,
            buyer,
            report_id: batch_id,
            merkle_root: root,
        };
        let receipt = with_timeout(self.chain_timeout, self.chain.submit_distribution_root(request))
            .await
            .map_err(|e| {
                tracing::warn!(batch_id, error = %e, "submit root failed");
                e
            })?;

        let now = self.clock.now();
        self.advance(&batch.reference_id, BatchStatus::Ready, |b| DistributionBatch {
            status: BatchStatus::DistributionReady,
            merkle_root: Some(to_hex(&root)),
            updated_at: now,
            ..b.clone()
        })?;

        tracing::info!(batch_id, root = %to_hex(&root), tx = %receipt.signature, "distribution root submitted");
        Ok(BatchReceipt {
            batch_id,
            status: BatchStatus::DistributionReady,
            transaction_signature: receipt.signature,
        })
    }

    /// The batch with this id and buyer, if it is in `expected`.
    fn batch_in(
        &self,
        batch_id: u64,
        buyer: Address,
        expected: BatchStatus,
    ) -> Result<DistributionBatch, BatchError> {
        let not_found = || BatchError::NotFound(batch_id.to_string());
        let reference_id = self.db.batch_reference(batch_id)?.ok_or_else(not_found)?;
        let batch = self.db.get_batch(&reference_id)?.ok_or_else(not_found)?;
        if batch.buyer_wallet != buyer {
            return Err(not_found());
        }
        if batch.status != expected {
            return Err(BatchError::WrongStatus {
                reference_id,
                expected,
                actual: batch.status,
            });
        }
        Ok(batch)
    }

    fn advance<M>(&self, reference_id: &str, from: BatchStatus, mutate: M) -> Result<(), BatchError>
    where
        M: FnMut(&DistributionBatch) -> DistributionBatch,
    {
        match self.db.update_batch(reference_id, |b| b.status == from, mutate)? {
            Update::Applied(_) => Ok(()),
            Update::Mismatch(current) => Err(BatchError::WrongStatus {
                reference_id: reference_id.to_string(),
                expected: from,
                actual: current.status,
            }),
            Update::Missing => Err(BatchError::NotFound(reference_id.to_string())),
        }
    }
}
