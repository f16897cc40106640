//! # Merkle Distribution
//!
//! Pooled revenue is split off-chain into `(claimant, amount)` entitlements,
//! committed to a single root on chain, and claimed one proof at a time.
//!
//! - **tree** — construction, proofs, verification.
//! - **artifact** — the JSON document a built tree is persisted as.
//! - **service** — publishing and serving proofs.

pub mod artifact;
pub mod service;
pub mod tree;

pub use artifact::{ArtifactError, MerkleArtifact};
pub use service::{ClaimError, ClaimProof, ClaimProofService};
pub use tree::{verify_proof, Claim, MerkleError, MerkleTree};
