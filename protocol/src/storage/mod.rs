//! # Storage Module
//!
//! Durable state for the service, on sled. One database, several named
//! trees, bincode records, single-record compare-and-swap for every state
//! transition. JSON is for the API and the Merkle artifact; bincode is for
//! disk.

pub mod db;

pub use db::{DbError, DbResult, SolvendDB, Update};
