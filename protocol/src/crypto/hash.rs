//! # Hashing Utilities
//!
//! Two hash functions, two jobs:
//!
//! - **Keccak-256** — the commitment hash. Redemption codes are stored as
//!   `keccak256(code)`, Merkle leaves are `keccak256(claimant || amount_le)`
//!   and parents are `keccak256(left || right)`. The on-chain program
//!   recomputes the exact same bytes, so the layout here is contractual:
//!   32 raw claimant bytes, then the amount as 8 little-endian bytes.
//!   Note this is the original Keccak padding, not NIST SHA3-256.
//!
//! - **SHA-256** — only used to derive program addresses, because that's
//!   what the chain uses.

use sha2::{Digest, Sha256};
use sha3::Keccak256;
use thiserror::Error;

/// A 32-byte digest.
pub type Hash32 = [u8; 32];

/// Errors when decoding a hex digest.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("invalid hex digest: {0}")]
    InvalidHex(String),

    #[error("digest must be 32 bytes, got {0}")]
    WrongLength(usize),
}

/// Keccak-256 of `data`.
///
/// ```
/// use solvend_protocol::crypto::hash::keccak256;
///
/// let digest = keccak256(b"");
/// assert_eq!(
///     hex::encode(digest),
///     "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
/// );
/// ```
pub fn keccak256(data: &[u8]) -> Hash32 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Keccak-256 over the concatenation of several slices, without allocating
/// the concatenation.
pub fn keccak256_concat(parts: &[&[u8]]) -> Hash32 {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// SHA-256 over the concatenation of several slices.
pub fn sha256_concat(parts: &[&[u8]]) -> Hash32 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Merkle leaf for a claimant and amount: `keccak256(claimant || amount_le8)`.
pub fn leaf_hash(claimant: &[u8], amount: u64) -> Hash32 {
    keccak256_concat(&[claimant, &amount.to_le_bytes()])
}

/// Interior Merkle node: `keccak256(left || right)`. Order matters.
pub fn hash_pair(left: &Hash32, right: &Hash32) -> Hash32 {
    keccak256_concat(&[left, right])
}

/// Commitment to a redemption code: `keccak256(code as UTF-8)`.
pub fn code_commitment(code: &str) -> Hash32 {
    keccak256(code.as_bytes())
}

/// Lowercase hex, no prefix.
pub fn to_hex(digest: &Hash32) -> String {
    hex::encode(digest)
}

/// Parse a 32-byte hex digest. A leading `0x` is tolerated.
pub fn parse_hex32(s: &str) -> Result<Hash32, DigestError> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(trimmed).map_err(|e| DigestError::InvalidHex(e.to_string()))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| DigestError::WrongLength(len))
}
