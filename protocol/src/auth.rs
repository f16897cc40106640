//! # Admin Authentication
//!
//! Admin endpoints carry three headers:
//!
//! | Header         | Content                                  |
//! |----------------|------------------------------------------|
//! | `x-public-key` | admin public key, base58                 |
//! | `x-timestamp`  | unix milliseconds at signing time        |
//! | `x-signature`  | hex Ed25519 signature                    |
//!
//! The signed message is the decimal timestamp immediately followed by the
//! RFC 8785 canonical JSON of the body: compact, object keys sorted at
//! every depth.
//! A request is accepted only if the key is the configured admin key, the
//! timestamp is within [`config::ADMIN_AUTH_WINDOW`] of now (either side),
//! and the signature checks out.
//!
//! The gate is stateless. A captured request can be replayed inside the
//! window.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::clock::Clock;
use crate::config;
use crate::crypto::address::Address;
use crate::crypto::keys::AdminKeypair;
use crate::crypto::signatures::{parse_signature_hex, verify_raw};
use crate::error::{Classify, ErrorClass};

/// Why a request was turned away. Callers only ever see 401; the variant is
/// for logs and metrics.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("malformed header {0}")]
    MalformedHeader(&'static str),

    #[error("public key is not the admin key")]
    UnknownKey,

    #[error("timestamp outside the accepted window")]
    StaleTimestamp,

    #[error("signature verification failed")]
    BadSignature,

    #[error("body cannot be canonicalized: {0}")]
    Canonicalization(String),
}

impl AuthError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingHeader(_) => "missing_header",
            AuthError::MalformedHeader(_) => "malformed_header",
            AuthError::UnknownKey => "unknown_key",
            AuthError::StaleTimestamp => "stale_timestamp",
            AuthError::BadSignature => "bad_signature",
            AuthError::Canonicalization(_) => "bad_body",
        }
    }
}

impl Classify for AuthError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Auth
    }
}

/// The three auth headers as received. Any may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminHeaders {
    pub public_key: Option<String>,
    pub timestamp: Option<String>,
    pub signature: Option<String>,
}

/// Header values for a request signed with [`sign_request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedHeaders {
    pub public_key: String,
    pub timestamp: String,
    pub signature: String,
}

/// RFC 8785 canonical form of `value`: compact, object keys sorted at every
/// depth.
pub fn canonical_json(value: &Value) -> Result<String, AuthError> {
    serde_jcs::to_string(value).map_err(|e| AuthError::Canonicalization(e.to_string()))
}

/// Bytes the admin signs for a request sent at `timestamp_ms`.
pub fn signing_message(timestamp_ms: i64, body: &Value) -> Result<Vec<u8>, AuthError> {
    Ok(format!("{}{}", timestamp_ms, canonical_json(body)?).into_bytes())
}

/// Produce the auth headers for `body`.
pub fn sign_request(
    keypair: &AdminKeypair,
    timestamp_ms: i64,
    body: &Value,
) -> Result<SignedHeaders, AuthError> {
    let signature = keypair.sign(&signing_message(timestamp_ms, body)?);
    Ok(SignedHeaders {
        public_key: keypair.address().to_string(),
        timestamp: timestamp_ms.to_string(),
        signature: hex::encode(signature),
    })
}

/// Checks admin requests against one configured key.
#[derive(Clone)]
pub struct AdminAuthGate {
    admin: Address,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl AdminAuthGate {
    pub fn new(admin: Address, clock: Arc<dyn Clock>) -> Self {
        Self {
            admin,
            clock,
            window: config::ADMIN_AUTH_WINDOW,
        }
    }

    pub fn admin(&self) -> &Address {
        &self.admin
    }

    /// Accept or reject a request. Cheapest checks first; the signature is
    /// only verified once everything else holds.
    pub fn verify(&self, headers: &AdminHeaders, body: &Value) -> Result<Address, AuthError> {
        let public_key = headers
            .public_key
            .as_deref()
            .ok_or(AuthError::MissingHeader(config::HEADER_PUBLIC_KEY))?;
        let timestamp = headers
            .timestamp
            .as_deref()
            .ok_or(AuthError::MissingHeader(config::HEADER_TIMESTAMP))?;
        let signature = headers
            .signature
            .as_deref()
            .ok_or(AuthError::MissingHeader(config::HEADER_SIGNATURE))?;

        let key: Address = public_key
            .trim()
            .parse()
            .map_err(|_| AuthError::MalformedHeader(config::HEADER_PUBLIC_KEY))?;
        if key != self.admin {
            return Err(AuthError::UnknownKey);
        }

        let timestamp_ms: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| AuthError::MalformedHeader(config::HEADER_TIMESTAMP))?;
        let skew = self.clock.now_ms().saturating_sub(timestamp_ms).unsigned_abs();
        if skew > self.window.as_millis() as u64 {
            return Err(AuthError::StaleTimestamp);
        }

        let signature = parse_signature_hex(signature)
            .map_err(|_| AuthError::MalformedHeader(config::HEADER_SIGNATURE))?;
        verify_raw(&key, &signing_message(timestamp_ms, body)?, &signature)
            .map_err(|_| AuthError::BadSignature)?;

        Ok(key)
    }
}
