//! # Account Addresses
//!
//! Accounts on the settlement chain are 32-byte values rendered as base58.
//! Wallets are plain Ed25519 public keys; program-owned accounts (vouchers,
//! reports, the machine config) are *program-derived*: a SHA-256 over the
//! seeds, a bump byte, the program id and a fixed marker, chosen so the
//! result is **not** a valid curve point and therefore has no private key.
//!
//! The derivation has to match the chain bit for bit, or we would be asking
//! the program to touch an account it will never agree is the voucher.

use curve25519_dalek::edwards::CompressedEdwardsY;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::hash::sha256_concat;
use crate::config;

/// Errors from address parsing and derivation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid base58 address: {0}")]
    InvalidBase58(String),

    #[error("address must decode to 32 bytes, got {0}")]
    WrongLength(usize),

    #[error("too many seeds or a seed is longer than 32 bytes")]
    SeedTooLong,

    #[error("derived address lies on the curve")]
    OnCurve,

    #[error("no viable bump seed found")]
    NoViableBump,
}

/// A 32-byte account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 32]);

impl Address {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    /// True if the bytes decompress to an Ed25519 point, i.e. a key could
    /// exist for this address.
    pub fn is_on_curve(&self) -> bool {
        CompressedEdwardsY(self.0).decompress().is_some()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s.trim())
            .into_vec()
            .map_err(|e| AddressError::InvalidBase58(e.to_string()))?;
        let len = bytes.len();
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AddressError::WrongLength(len))?;
        Ok(Self(arr))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Program-derived addresses
// ---------------------------------------------------------------------------

/// Derive an address from seeds and an explicit bump. Fails if the result
/// lands on the curve.
pub fn create_program_address(
    seeds: &[&[u8]],
    bump: u8,
    program_id: &Address,
) -> Result<Address, AddressError> {
    if seeds.len() >= config::MAX_SEEDS || seeds.iter().any(|s| s.len() > config::MAX_SEED_LEN) {
        return Err(AddressError::SeedTooLong);
    }

    let bump_seed = [bump];
    let mut parts: Vec<&[u8]> = Vec::with_capacity(seeds.len() + 3);
    parts.extend_from_slice(seeds);
    parts.push(&bump_seed);
    parts.push(program_id.as_bytes());
    parts.push(config::PDA_MARKER);

    let candidate = Address(sha256_concat(&parts));
    if candidate.is_on_curve() {
        return Err(AddressError::OnCurve);
    }
    Ok(candidate)
}

/// Find the canonical program address: the first off-curve candidate
/// counting the bump down from 255.
pub fn find_program_address(
    seeds: &[&[u8]],
    program_id: &Address,
) -> Result<(Address, u8), AddressError> {
    for bump in (0..=u8::MAX).rev() {
        match create_program_address(seeds, bump, program_id) {
            Ok(address) => return Ok((address, bump)),
            Err(AddressError::OnCurve) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(AddressError::NoViableBump)
}

/// Voucher account for `(wallet, nonce)`.
pub fn voucher_address(
    program_id: &Address,
    wallet: &Address,
    nonce: u64,
) -> Result<Address, AddressError> {
    let nonce_le = nonce.to_le_bytes();
    find_program_address(
        &[config::VOUCHER_SEED, wallet.as_bytes(), &nonce_le],
        program_id,
    )
    .map(|(address, _)| address)
}

/// Report account for `(buyer, report_id)`.
pub fn report_address(
    program_id: &Address,
    buyer: &Address,
    report_id: u64,
) -> Result<Address, AddressError> {
    let id_le = report_id.to_le_bytes();
    find_program_address(&[config::REPORT_SEED, buyer.as_bytes(), &id_le], program_id)
        .map(|(address, _)| address)
}

/// The singleton machine configuration account.
pub fn machine_address(program_id: &Address) -> Result<Address, AddressError> {
    find_program_address(&[config::MACHINE_SEED], program_id).map(|(address, _)| address)
}
