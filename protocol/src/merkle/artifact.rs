//! # Merkle Artifact
//!
//! The JSON document the offline job writes and the claim service serves:
//!
//! ```json
//! {
//!   "root": "<hex>",
//!   "layers": [["<hex>", ...], ...],
//!   "leaves": [{ "claimant": "<base58>", "amount": "100", "leaf": "<hex>" }],
//!   "proofs": { "<base58>": { "amount": "100", "proof": ["<hex>", ...] } }
//! }
//! ```
//!
//! Amounts are strings so nothing downstream has to think about 53-bit
//! floats. Digests are lowercase hex without a prefix.
//!
//! An artifact coming from disk is untrusted until [`MerkleArtifact::to_tree`]
//! has rebuilt the tree from its leaves and checked every recorded digest.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use super::tree::{Claim, MerkleError, MerkleTree};
use crate::crypto::address::Address;
use crate::crypto::hash::to_hex;
use crate::error::{Classify, ErrorClass};

/// Errors reading, writing or validating an artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("artifact is inconsistent: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Merkle(#[from] MerkleError),
}

impl Classify for ArtifactError {
    fn class(&self) -> ErrorClass {
        match self {
            ArtifactError::Io(_) => ErrorClass::Internal,
            ArtifactError::Json(_) | ArtifactError::Inconsistent(_) => ErrorClass::Validation,
            ArtifactError::Merkle(e) => e.class(),
        }
    }
}

/// One leaf as recorded in the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub claimant: String,
    pub amount: String,
    pub leaf: String,
}

/// A claimant's proof as recorded in the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofEntry {
    pub amount: String,
    pub proof: Vec<String>,
}

/// The persisted tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleArtifact {
    pub root: String,
    pub layers: Vec<Vec<String>>,
    pub leaves: Vec<LeafEntry>,
    pub proofs: BTreeMap<String, ProofEntry>,
}

impl MerkleArtifact {
    /// Render a built tree.
    pub fn from_tree(tree: &MerkleTree) -> Result<Self, MerkleError> {
        let layers = tree
            .layers()
            .iter()
            .map(|layer| layer.iter().map(to_hex).collect())
            .collect();

        let leaves = tree
            .claims()
            .iter()
            .zip(tree.leaves())
            .map(|(claim, leaf)| LeafEntry {
                claimant: claim.claimant.to_string(),
                amount: claim.amount.to_string(),
                leaf: to_hex(leaf),
            })
            .collect();

        let mut proofs = BTreeMap::new();
        for (index, claim) in tree.claims().iter().enumerate() {
            let proof = tree.proof(index)?;
            proofs.insert(
                claim.claimant.to_string(),
                ProofEntry {
                    amount: claim.amount.to_string(),
                    proof: proof.iter().map(to_hex).collect(),
                },
            );
        }

        Ok(Self {
            root: to_hex(&tree.root()),
            layers,
            leaves,
            proofs,
        })
    }

    /// Rebuild the tree from `leaves` and check that every other field
    /// agrees with it.
    pub fn to_tree(&self) -> Result<MerkleTree, ArtifactError> {
        let claims = self
            .leaves
            .iter()
            .map(|entry| {
                let claimant: Address = entry.claimant.parse().map_err(|e| {
                    ArtifactError::Inconsistent(format!("claimant {}: {e}", entry.claimant))
                })?;
                let amount: u64 = entry.amount.parse().map_err(|_| {
                    ArtifactError::Inconsistent(format!("amount {:?} is not a u64", entry.amount))
                })?;
                Ok(Claim::new(claimant, amount))
            })
            .collect::<Result<Vec<_>, ArtifactError>>()?;

        let tree = MerkleTree::build(claims)?;
        let rebuilt = Self::from_tree(&tree)?;
        if !rebuilt.matches(self) {
            return Err(ArtifactError::Inconsistent(format!(
                "recorded root {} does not match recomputed {}",
                self.root, rebuilt.root
            )));
        }
        Ok(tree)
    }

    /// Case-insensitive comparison of every digest and amount.
    fn matches(&self, other: &Self) -> bool {
        fn same(ours: &str, theirs: &str) -> bool {
            ours.eq_ignore_ascii_case(theirs.strip_prefix("0x").unwrap_or(theirs))
        }

        same(&self.root, &other.root)
            && self.layers.len() == other.layers.len()
            && self.layers.iter().zip(&other.layers).all(|(x, y)| {
                x.len() == y.len() && x.iter().zip(y).all(|(a, b)| same(a, b))
            })
            && self.leaves.len() == other.leaves.len()
            && self.leaves.iter().zip(&other.leaves).all(|(a, b)| {
                a.claimant == b.claimant && a.amount == b.amount && same(&a.leaf, &b.leaf)
            })
            && self.proofs.len() == other.proofs.len()
            && self.proofs.iter().all(|(claimant, entry)| {
                other.proofs.get(claimant).is_some_and(|o| {
                    o.amount == entry.amount
                        && o.proof.len() == entry.proof.len()
                        && entry.proof.iter().zip(&o.proof).all(|(a, b)| same(a, b))
                })
            })
    }

    /// Index of `claimant` in the leaf list.
    pub fn index_of(&self, claimant: &str) -> Option<usize> {
        self.leaves.iter().position(|leaf| leaf.claimant == claimant)
    }

    pub fn to_json_pretty(&self) -> Result<String, ArtifactError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ArtifactError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read an artifact from disk. Does not validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Write to disk, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ArtifactError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }
}
