//! Claim proof service.
//!
//! Read-only view of the published distribution tree. Publishing goes
//! through here too so that nothing unvalidated ever reaches the ledger.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::artifact::{ArtifactError, MerkleArtifact};
use super::tree::{Claim, MerkleError, MerkleTree};
use crate::crypto::address::Address;
use crate::error::{Classify, ErrorClass};
use crate::storage::{DbError, SolvendDB};

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("invalid claimant address: {0}")]
    InvalidClaimant(String),

    #[error("claimant {0} is not in the published tree")]
    NotFound(String),

    #[error("no distribution tree has been published")]
    TreeUnavailable,

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl Classify for ClaimError {
    fn class(&self) -> ErrorClass {
        match self {
            ClaimError::InvalidClaimant(_) => ErrorClass::Validation,
            ClaimError::NotFound(_) | ClaimError::TreeUnavailable => ErrorClass::NotFound,
            ClaimError::Artifact(e) => e.class(),
            ClaimError::Storage(e) => e.class(),
        }
    }
}

/// What a claimant needs to claim on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimProof {
    pub root: String,
    pub claimant: String,
    pub amount: String,
    pub index: usize,
    pub leaf_count: usize,
    pub proof: Vec<String>,
}

#[derive(Clone)]
pub struct ClaimProofService {
    db: Arc<SolvendDB>,
}

impl ClaimProofService {
    pub fn new(db: Arc<SolvendDB>) -> Self {
        Self { db }
    }

    /// Build an artifact from a claim list.
    pub fn build(claims: Vec<Claim>) -> Result<MerkleArtifact, MerkleError> {
        let tree = MerkleTree::build(claims)?;
        MerkleArtifact::from_tree(&tree)
    }

    /// Validate `artifact` and make it the published tree.
    pub fn publish(&self, artifact: &MerkleArtifact) -> Result<(), ClaimError> {
        let tree = artifact.to_tree()?;
        self.db.publish_merkle(artifact)?;
        tracing::info!(root = %artifact.root, leaves = tree.len(), "distribution tree published");
        Ok(())
    }

    /// Load an artifact file, validate it and publish it.
    pub fn import_file(&self, path: impl AsRef<Path>) -> Result<MerkleArtifact, ClaimError> {
        let artifact = MerkleArtifact::load(path)?;
        self.publish(&artifact)?;
        Ok(artifact)
    }

    /// Root of the published tree, if any.
    pub fn published_root(&self) -> Result<Option<String>, ClaimError> {
        Ok(self.db.published_merkle()?.map(|a| a.root))
    }

    pub fn get_proof(&self, claimant: &str) -> Result<ClaimProof, ClaimError> {
        let address: Address = claimant
            .parse()
            .map_err(|_| ClaimError::InvalidClaimant(claimant.to_string()))?;
        let key = address.to_string();

        let artifact = self
            .db
            .published_merkle()?
            .ok_or(ClaimError::TreeUnavailable)?;
        let entry = artifact
            .proofs
            .get(&key)
            .ok_or_else(|| ClaimError::NotFound(key.clone()))?;
        let index = artifact
            .index_of(&key)
            .ok_or_else(|| ClaimError::NotFound(key.clone()))?;

        Ok(ClaimProof {
            root: artifact.root.clone(),
            amount: entry.amount.clone(),
            proof: entry.proof.clone(),
            index,
            leaf_count: artifact.leaves.len(),
            claimant: key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::{leaf_hash, parse_hex32};
    use crate::merkle::tree::verify_proof;

    fn service() -> ClaimProofService {
        ClaimProofService::new(Arc::new(SolvendDB::open_temporary().unwrap()))
    }

    fn claims() -> Vec<Claim> {
        (1..=3u8)
            .map(|b| Claim::new(Address::new([b; 32]), u64::from(b) * 1_000))
            .collect()
    }

    #[test]
    fn nothing_published_yet() {
        let svc = service();
        let who = Address::new([1; 32]).to_string();
        assert!(matches!(svc.get_proof(&who), Err(ClaimError::TreeUnavailable)));
        assert_eq!(svc.published_root().unwrap(), None);
    }

    #[test]
    fn served_proofs_verify() {
        let svc = service();
        let artifact = ClaimProofService::build(claims()).unwrap();
        svc.publish(&artifact).unwrap();

        for claim in claims() {
            let p = svc.get_proof(&claim.claimant.to_string()).unwrap();
            let proof: Vec<_> = p.proof.iter().map(|h| parse_hex32(h).unwrap()).collect();
            let leaf = leaf_hash(claim.claimant.as_bytes(), p.amount.parse().unwrap());
            let root = parse_hex32(&p.root).unwrap();
            assert!(verify_proof(&leaf, p.index, p.leaf_count, &proof, &root));
        }
    }

    #[test]
    fn unknown_and_malformed_claimants() {
        let svc = service();
        svc.publish(&ClaimProofService::build(claims()).unwrap())
            .unwrap();

        let stranger = Address::new([9; 32]).to_string();
        let err = svc.get_proof(&stranger).unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);

        let err = svc.get_proof("not-an-address").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[test]
    fn tampered_artifact_is_not_published() {
        let svc = service();
        let mut artifact = ClaimProofService::build(claims()).unwrap();
        artifact.leaves[0].amount = "999999".into();
        assert!(matches!(svc.publish(&artifact), Err(ClaimError::Artifact(_))));
        assert_eq!(svc.published_root().unwrap(), None);
    }

    #[test]
    fn import_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.json");
        let artifact = ClaimProofService::build(claims()).unwrap();
        artifact.save(&path).unwrap();

        let svc = service();
        let imported = svc.import_file(&path).unwrap();
        assert_eq!(imported.root, artifact.root);
        assert_eq!(svc.published_root().unwrap(), Some(artifact.root));
    }
}
