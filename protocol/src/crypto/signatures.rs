//! # Digital Signatures
//!
//! Ed25519 verification over raw bytes, the shape in which admin requests
//! arrive: a base58 public key, a hex signature and a message we rebuild
//! ourselves. Verification is strict; we don't need to be lenient with
//! anyone.

use ed25519_dalek::{Signature, VerifyingKey};
use thiserror::Error;

use super::address::Address;

/// Errors during signature operations.
///
/// Intentionally vague. We don't tell callers why verification failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature verification failed")]
    VerificationFailed,

    #[error("invalid signature bytes: expected 64 bytes")]
    InvalidSignatureBytes,

    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Decode a hex signature into its 64 raw bytes.
pub fn parse_signature_hex(s: &str) -> Result<[u8; 64], SignatureError> {
    let trimmed = s.trim();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(trimmed).map_err(|_| SignatureError::InvalidSignatureBytes)?;
    bytes
        .try_into()
        .map_err(|_| SignatureError::InvalidSignatureBytes)
}

/// Verify `signature` over `message` under the key at `public_key`.
pub fn verify_raw(
    public_key: &Address,
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), SignatureError> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key.as_bytes()).map_err(|_| SignatureError::InvalidPublicKey)?;
    let signature = Signature::from_bytes(signature);
    verifying_key
        .verify_strict(message, &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}
