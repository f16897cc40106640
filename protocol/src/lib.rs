// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Solvend — Core Library
//!
//! Solvend sells physical goods for on-chain payments. A buyer pays, gets a
//! short numeric code bound to a voucher account on chain, and types the code
//! at the machine. Later, the revenue those machines pulled in is split
//! among many payers and committed on chain as a single Merkle root, so each
//! of them can prove their share without anyone trusting us.
//!
//! Two things here have real invariants. Everything else is plumbing:
//!
//! 1. **One payment, one voucher.** Payments are reported by two racing
//!    sources (the buyer's confirm call and the treasury watcher). Exactly
//!    one of them issues the code and creates the voucher.
//! 2. **Byte-exact Merkle commitments.** The on-chain verifier recomputes
//!    leaves and parents itself. If our layout differs by one byte, every
//!    claim fails.
//!
//! ## Architecture
//!
//! - **crypto** — Keccak commitments, addresses, admin keys. Don't roll your own.
//! - **merkle** — Distribution tree, persisted artifact, claim proofs.
//! - **purchase** — Purchase state machine and the flow that drives it.
//! - **distribution** — Report batches and root submission.
//! - **chain** — The on-chain program as an async trait, plus a simulator.
//! - **watcher** — Treasury polling loop.
//! - **auth** — Signed admin requests.
//! - **storage** — sled-backed ledger. Compare-and-swap or nothing.
//! - **clock** — Injectable time, because expiry tests shouldn't sleep.
//! - **error** — The shared error taxonomy.
//! - **config** — Protocol constants.
//!
//! ## Design Philosophy
//!
//! 1. State changes are single-record compare-and-swaps. No locks, no
//!    multi-record transactions.
//! 2. The plaintext code is never stored and never logged.
//! 3. Chain calls are never retried behind anyone's back. Retries are
//!    explicit and carry an idempotency key.
//! 4. If it touches money, it has tests. Plural.

pub mod auth;
pub mod chain;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod distribution;
pub mod error;
pub mod merkle;
pub mod purchase;
pub mod storage;
pub mod watcher;
