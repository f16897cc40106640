//! # Cryptographic Primitives
//!
//! Everything hash- or key-shaped lives here:
//!
//! - **hash** — Keccak-256 commitments (codes, Merkle leaves) and SHA-256.
//! - **address** — base58 account addresses and program-derived accounts.
//! - **keys** — the admin Ed25519 keypair.
//! - **signatures** — raw Ed25519 verification for admin requests.
//!
//! We don't roll our own. Everything here is a thin, typed wrapper around
//! audited crates.

pub mod address;
pub mod hash;
pub mod keys;
pub mod signatures;

pub use address::{find_program_address, report_address, voucher_address, Address, AddressError};
pub use hash::{code_commitment, hash_pair, keccak256, leaf_hash, Hash32};
pub use keys::AdminKeypair;
pub use signatures::{verify_raw, SignatureError};
