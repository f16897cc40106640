//! # Distribution Batches
//!
//! Report purchases and the revenue roots committed against them.

pub mod batch;
pub mod service;

pub use batch::{BatchStatus, DistributionBatch, ReportType};
pub use service::{BatchError, BatchIntent, BatchReceipt, BatchService};
