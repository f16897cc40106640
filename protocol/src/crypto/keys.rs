//! # Key Management
//!
//! Ed25519 keypairs for operators. The service itself never holds a user's
//! key; the only keypair it cares about is the admin's, which signs root
//! submissions and report attachments. The node's `keygen` and `sign-admin`
//! commands are the only places a secret key is ever loaded.
//!
//! Key bytes are never logged. If you add logging to this module, you will
//! be asked to leave.

use ed25519_dalek::{Signer, SigningKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use std::fmt;
use thiserror::Error;

use super::address::Address;

/// Errors that can occur during key operations.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes: wrong length or not hex")]
    InvalidSecretKey,
}

/// An Ed25519 signing keypair whose public half is an account [`Address`].
///
/// Deliberately not `Serialize`: exporting a secret should be a conscious
/// call to [`secret_key_hex`](Self::secret_key_hex).
pub struct AdminKeypair {
    signing_key: SigningKey,
}

impl AdminKeypair {
    /// Fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Tests use this a lot.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load from a hex-encoded 32-byte secret.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; SECRET_KEY_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// The public key as an account address.
    pub fn address(&self) -> Address {
        Address::new(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign `message`, returning the 64 raw signature bytes.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Export the secret as hex. Handle with care.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

impl fmt::Debug for AdminKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminKeypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_preserves_identity() {
        let kp = AdminKeypair::generate();
        let restored = AdminKeypair::from_hex(&kp.secret_key_hex()).unwrap();
        assert_eq!(kp.address(), restored.address());
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(AdminKeypair::from_hex("abcd").is_err());
        assert!(AdminKeypair::from_hex("not hex").is_err());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let kp = AdminKeypair::from_seed(&[1u8; 32]);
        let dbg = format!("{:?}", kp);
        assert!(!dbg.contains(&kp.secret_key_hex()));
    }

    #[test]
    fn signatures_are_deterministic() {
        let kp = AdminKeypair::from_seed(&[2u8; 32]);
        assert_eq!(kp.sign(b"root"), kp.sign(b"root"));
    }
}
