//! # Distribution Merkle Tree
//!
//! A plain binary Keccak tree over `(claimant, amount)` leaves. The shape
//! rules are fixed by the verifier that checks claims on chain:
//!
//! - Layer 0 is the leaf digests in input order. No sorting.
//! - Parents hash `left || right`, positionally. No sorted pairs.
//! - An odd node at the end of a layer is carried up unchanged. It is not
//!   duplicated and not hashed with itself.
//!
//! ```text
//!            root = H(H(a‖b) ‖ c)
//!             /            \
//!        H(a‖b)              c      <- carried
//!        /    \              |
//!       a      b             c
//! ```
//!
//! Because carried nodes contribute no sibling, a proof can be shorter than
//! the tree height. Verification therefore needs the leaf count to know at
//! which levels the node was carried; see [`verify_proof`].

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::crypto::address::Address;
use crate::crypto::hash::{hash_pair, leaf_hash, Hash32};
use crate::error::{Classify, ErrorClass};

/// Errors from tree construction and proof lookup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("cannot build a Merkle tree with no leaves")]
    EmptyTree,

    #[error("leaf index {index} out of range for {len} leaves")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("claimant {0} appears more than once")]
    DuplicateClaimant(String),
}

impl Classify for MerkleError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

/// One entitlement: who gets paid and how much.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claimant: Address,
    #[serde(deserialize_with = "deserialize_amount")]
    pub amount: u64,
}

impl Claim {
    pub fn new(claimant: Address, amount: u64) -> Self {
        Self { claimant, amount }
    }

    /// This claim's leaf digest.
    pub fn leaf(&self) -> Hash32 {
        leaf_hash(self.claimant.as_bytes(), self.amount)
    }
}

/// Amounts show up as JSON numbers from hand-written inputs and as strings
/// from anything that went through a bigint.
fn deserialize_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Number(n) => Ok(n),
        Repr::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// A built tree with every layer retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    claims: Vec<Claim>,
    layers: Vec<Vec<Hash32>>,
}

impl MerkleTree {
    /// Build from an ordered, non-empty list of claims.
    pub fn build(claims: Vec<Claim>) -> Result<Self, MerkleError> {
        if claims.is_empty() {
            return Err(MerkleError::EmptyTree);
        }

        let mut seen = HashSet::with_capacity(claims.len());
        for claim in &claims {
            if !seen.insert(claim.claimant) {
                return Err(MerkleError::DuplicateClaimant(claim.claimant.to_string()));
            }
        }

        let mut layers = vec![claims.iter().map(Claim::leaf).collect::<Vec<_>>()];
        while let Some(current) = layers.last().filter(|layer| layer.len() > 1) {
            let next: Vec<Hash32> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_pair(left, right),
                    [carried] => *carried,
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            layers.push(next);
        }

        Ok(Self { claims, layers })
    }

    /// The committed root.
    pub fn root(&self) -> Hash32 {
        // build() guarantees at least one layer holding at least one node.
        self.layers[self.layers.len() - 1][0]
    }

    /// All layers, leaves first, root last.
    pub fn layers(&self) -> &[Vec<Hash32>] {
        &self.layers
    }

    /// Leaf digests in input order.
    pub fn leaves(&self) -> &[Hash32] {
        &self.layers[0]
    }

    /// The claims the tree was built from.
    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Sibling path for the leaf at `index`, bottom-up. Levels where the
    /// node was carried contribute nothing.
    pub fn proof(&self, index: usize) -> Result<Vec<Hash32>, MerkleError> {
        if index >= self.len() {
            return Err(MerkleError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }

        let mut proof = Vec::with_capacity(self.layers.len());
        let mut i = index;
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling = if i % 2 == 0 { i + 1 } else { i - 1 };
            if let Some(node) = layer.get(sibling) {
                proof.push(*node);
            }
            i /= 2;
        }
        Ok(proof)
    }
}

/// Recompute the root from `leaf` at `index` in a tree of `leaf_count`
/// leaves and compare with `root`.
///
/// At each level: if the node is the unpaired last node it is carried and
/// no proof element is consumed; otherwise an even index hashes
/// `acc || sibling` and an odd one `sibling || acc`. Any leftover or
/// missing proof elements fail the check.
pub fn verify_proof(
    leaf: &Hash32,
    index: usize,
    leaf_count: usize,
    proof: &[Hash32],
    root: &Hash32,
) -> bool {
    if index >= leaf_count {
        return false;
    }

    let mut acc = *leaf;
    let mut i = index;
    let mut width = leaf_count;
    let mut siblings = proof.iter();

    while width > 1 {
        let carried = i % 2 == 0 && i + 1 == width;
        if !carried {
            let Some(sibling) = siblings.next() else {
                return false;
            };
            acc = if i % 2 == 0 {
                hash_pair(&acc, sibling)
            } else {
                hash_pair(sibling, &acc)
            };
        }
        i /= 2;
        width = width.div_ceil(2);
    }

    siblings.next().is_none() && acc == *root
}
