//! # SolvendDB — Durable Ledger
//!
//! Every purchase, report batch, processed payment signature and published
//! Merkle tree lives here, on sled's embedded key-value store.
//!
//! ## Tree Layout
//!
//! | Tree              | Key                       | Value                         |
//! |-------------------|---------------------------|-------------------------------|
//! | `purchases`       | `reference_id` (UTF-8)    | `bincode(Purchase)`           |
//! | `otp_index`       | `keccak(code)` (32B)      | `reference_id` (UTF-8)        |
//! | `batches`         | `reference_id` (UTF-8)    | `bincode(DistributionBatch)`  |
//! | `batch_ids`       | `batch_id` (8B BE)        | `reference_id` (UTF-8)        |
//! | `issuance_claims` | `reference_id` (UTF-8)    | claimed at, unix ms (8B BE)   |
//! | `wallet_nonces`   | wallet (32B)              | last nonce (8B BE)            |
//! | `seen_signatures` | signature (UTF-8)         | first seen, unix ms (8B BE)   |
//! | `merkle_trees`    | root (hex, UTF-8)         | artifact JSON                 |
//! | `metadata`        | key (UTF-8)               | value (bytes)                 |
//!
//! ## Concurrency
//!
//! There are no multi-record transactions. Every state change is a single
//! record compare-and-swap against the exact bytes that were read
//! ([`SolvendDB::update_purchase`]). Two writers racing on the same record
//! cannot both win: the loser re-reads, sees the record has left the phase
//! it expected, and gets [`Update::Mismatch`] back.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, IVec, Tree};
use std::path::Path;

use crate::crypto::address::Address;
use crate::crypto::hash::Hash32;
use crate::distribution::batch::DistributionBatch;
use crate::error::{Classify, ErrorClass};
use crate::merkle::artifact::MerkleArtifact;
use crate::purchase::state::Purchase;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key already exists: {0}")]
    AlreadyExists(String),
}

impl Classify for DbError {
    fn class(&self) -> ErrorClass {
        match self {
            DbError::AlreadyExists(_) => ErrorClass::Conflict,
            DbError::Sled(_) | DbError::Serialization(_) => ErrorClass::Internal,
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Result of a conditional single-record update.
#[derive(Debug, Clone, PartialEq)]
pub enum Update<T> {
    /// The guard held and the new value was written.
    Applied(T),
    /// The record exists but the guard rejected it. Carries what was read.
    Mismatch(T),
    /// No such record.
    Missing,
}

/// Well-known key in `metadata` pointing at the currently published root.
const META_PUBLISHED_ROOT: &[u8] = b"published_merkle_root";

fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

fn read_u64(bytes: &[u8]) -> DbResult<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DbError::Serialization("expected 8-byte integer".to_string()))?;
    Ok(u64::from_be_bytes(arr))
}

// ---------------------------------------------------------------------------
// SolvendDB
// ---------------------------------------------------------------------------

/// Persistent storage for the service.
///
/// sled trees support lock-free concurrent reads and atomic per-key CAS, so
/// `SolvendDB` is shared as `Arc<SolvendDB>` with no extra locking.
#[derive(Debug, Clone)]
pub struct SolvendDB {
    db: Db,
    purchases: Tree,
    otp_index: Tree,
    issuance_claims: Tree,
    batches: Tree,
    batch_ids: Tree,
    wallet_nonces: Tree,
    seen_signatures: Tree,
    merkle_trees: Tree,
    metadata: Tree,
}

impl SolvendDB {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Temporary database, removed on drop. For tests.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            purchases: db.open_tree("purchases")?,
            otp_index: db.open_tree("otp_index")?,
            issuance_claims: db.open_tree("issuance_claims")?,
            batches: db.open_tree("batches")?,
            batch_ids: db.open_tree("batch_ids")?,
            wallet_nonces: db.open_tree("wallet_nonces")?,
            seen_signatures: db.open_tree("seen_signatures")?,
            merkle_trees: db.open_tree("merkle_trees")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    // -- Generic helpers ----------------------------------------------------

    fn insert_new<T: Serialize>(tree: &Tree, key: &[u8], value: &T) -> DbResult<()> {
        let bytes = encode(value)?;
        match tree.compare_and_swap(key, None as Option<&[u8]>, Some(bytes))? {
            Ok(()) => Ok(()),
            Err(_) => Err(DbError::AlreadyExists(
                String::from_utf8_lossy(key).into_owned(),
            )),
        }
    }

    fn get_decoded<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> DbResult<Option<T>> {
        tree.get(key)?.map(|bytes| decode(&bytes)).transpose()
    }

    /// Read, check `guard`, write `mutate(current)` only if the stored bytes
    /// are still exactly what was read. Loops on interference.
    fn cas_update<T, G, M>(tree: &Tree, key: &[u8], guard: G, mut mutate: M) -> DbResult<Update<T>>
    where
        T: Serialize + DeserializeOwned,
        G: Fn(&T) -> bool,
        M: FnMut(&T) -> T,
    {
        loop {
            let Some(current_bytes) = tree.get(key)? else {
                return Ok(Update::Missing);
            };
            let current: T = decode(&current_bytes)?;
            if !guard(&current) {
                return Ok(Update::Mismatch(current));
            }

            let next = mutate(&current);
            let next_bytes = encode(&next)?;
            match tree.compare_and_swap(key, Some(current_bytes), Some(next_bytes))? {
                Ok(()) => return Ok(Update::Applied(next)),
                Err(_) => {
                    tracing::trace!(key = %String::from_utf8_lossy(key), "cas lost, retrying");
                    continue;
                }
            }
        }
    }

    // -- Purchases ----------------------------------------------------------

    /// Store a brand-new purchase. Fails if the reference already exists.
    pub fn insert_purchase(&self, purchase: &Purchase) -> DbResult<()> {
        Self::insert_new(&self.purchases, purchase.reference_id.as_bytes(), purchase)
    }

    pub fn get_purchase(&self, reference_id: &str) -> DbResult<Option<Purchase>> {
        Self::get_decoded(&self.purchases, reference_id.as_bytes())
    }

    /// Conditional update of one purchase. See the module docs.
    pub fn update_purchase<G, M>(
        &self,
        reference_id: &str,
        guard: G,
        mutate: M,
    ) -> DbResult<Update<Purchase>>
    where
        G: Fn(&Purchase) -> bool,
        M: FnMut(&Purchase) -> Purchase,
    {
        Self::cas_update(&self.purchases, reference_id.as_bytes(), guard, mutate)
    }

    pub fn purchase_count(&self) -> usize {
        self.purchases.len()
    }

    // -- Code index ---------------------------------------------------------

    /// Which purchase a code hash belongs to.
    pub fn lookup_code(&self, otp_hash: &Hash32) -> DbResult<Option<String>> {
        Ok(self
            .otp_index
            .get(otp_hash)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Point `otp_hash` at `reference_id`, but only if the slot currently
    /// holds `expected` (`None` = empty). Returns false if someone else got
    /// there first.
    pub fn claim_code(
        &self,
        otp_hash: &Hash32,
        expected: Option<&str>,
        reference_id: &str,
    ) -> DbResult<bool> {
        let outcome = self.otp_index.compare_and_swap(
            otp_hash,
            expected.map(str::as_bytes),
            Some(reference_id.as_bytes()),
        )?;
        Ok(outcome.is_ok())
    }

    /// Drop a code slot, but only if it still points at `reference_id`.
    pub fn release_code(&self, otp_hash: &Hash32, reference_id: &str) -> DbResult<()> {
        let _ = self.otp_index.compare_and_swap(
            otp_hash,
            Some(reference_id.as_bytes()),
            None as Option<&[u8]>,
        )?;
        Ok(())
    }

    // -- Issuance claims ----------------------------------------------------

    /// Take the exclusive right to issue the code for `reference_id`. A claim
    /// taken before `stale_before_ms` counts as abandoned and is taken over.
    /// Returns false while someone else holds a live claim.
    pub fn claim_issuance(
        &self,
        reference_id: &str,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> DbResult<bool> {
        let key = reference_id.as_bytes();
        loop {
            let current = self.issuance_claims.get(key)?;
            if let Some(bytes) = &current {
                if read_u64(bytes)? as i64 >= stale_before_ms {
                    return Ok(false);
                }
            }
            let stamp = (now_ms as u64).to_be_bytes().to_vec();
            match self
                .issuance_claims
                .compare_and_swap(key, current, Some(stamp))?
            {
                Ok(()) => return Ok(true),
                Err(_) => continue,
            }
        }
    }

    pub fn release_issuance(&self, reference_id: &str) -> DbResult<()> {
        self.issuance_claims.remove(reference_id.as_bytes())?;
        Ok(())
    }

    // -- Nonces -------------------------------------------------------------

    /// Hand out the next voucher nonce for `wallet`.
    ///
    /// Nonces are timestamps in unix ms, forced strictly increasing per
    /// wallet: `max(previous + 1, now_ms)`. Concurrent callers each get a
    /// distinct value and a nonce is never handed out twice, across
    /// restarts.
    pub fn next_nonce(&self, wallet: &Address, now_ms: i64) -> DbResult<u64> {
        let floor = u64::try_from(now_ms).unwrap_or(0);
        let updated = self.wallet_nonces.update_and_fetch(wallet.as_bytes(), |old| {
            let previous = old
                .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
                .map(u64::from_be_bytes);
            let next = match previous {
                Some(p) => floor.max(p.saturating_add(1)),
                None => floor,
            };
            Some(next.to_be_bytes().to_vec())
        })?;

        match updated {
            Some(bytes) => read_u64(&bytes),
            None => Err(DbError::Serialization("nonce update produced nothing".into())),
        }
    }

    // -- Distribution batches -----------------------------------------------

    /// Allocate a fresh, never-reused batch id.
    pub fn generate_batch_id(&self) -> DbResult<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Store a new batch and its id index entry.
    pub fn insert_batch(&self, batch: &DistributionBatch) -> DbResult<()> {
        Self::insert_new(&self.batches, batch.reference_id.as_bytes(), batch)?;
        self.batch_ids
            .insert(batch.batch_id.to_be_bytes(), batch.reference_id.as_bytes())?;
        Ok(())
    }

    pub fn get_batch(&self, reference_id: &str) -> DbResult<Option<DistributionBatch>> {
        Self::get_decoded(&self.batches, reference_id.as_bytes())
    }

    /// Reference id of the batch with this on-chain id.
    pub fn batch_reference(&self, batch_id: u64) -> DbResult<Option<String>> {
        Ok(self
            .batch_ids
            .get(batch_id.to_be_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Conditional update of one batch.
    pub fn update_batch<G, M>(
        &self,
        reference_id: &str,
        guard: G,
        mutate: M,
    ) -> DbResult<Update<DistributionBatch>>
    where
        G: Fn(&DistributionBatch) -> bool,
        M: FnMut(&DistributionBatch) -> DistributionBatch,
    {
        Self::cas_update(&self.batches, reference_id.as_bytes(), guard, mutate)
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    // -- Seen payment signatures --------------------------------------------

    pub fn is_signature_seen(&self, signature: &str) -> DbResult<bool> {
        Ok(self.seen_signatures.contains_key(signature.as_bytes())?)
    }

    /// Record a processed signature. Returns false if it was already there.
    pub fn mark_signature_seen(&self, signature: &str, now_ms: i64) -> DbResult<bool> {
        let stamp = now_ms.to_be_bytes();
        let outcome = self.seen_signatures.compare_and_swap(
            signature.as_bytes(),
            None as Option<&[u8]>,
            Some(&stamp[..]),
        )?;
        Ok(outcome.is_ok())
    }

    /// Forget signatures first seen before `cutoff_ms`. Returns how many.
    pub fn prune_seen_signatures(&self, cutoff_ms: i64) -> DbResult<usize> {
        let mut stale: Vec<IVec> = Vec::new();
        for entry in self.seen_signatures.iter() {
            let (key, value) = entry?;
            let seen_at = i64::from_be_bytes(
                value
                    .as_ref()
                    .try_into()
                    .map_err(|_| DbError::Serialization("invalid seen timestamp".into()))?,
            );
            if seen_at < cutoff_ms {
                stale.push(key);
            }
        }
        for key in &stale {
            self.seen_signatures.remove(key)?;
        }
        Ok(stale.len())
    }

    pub fn seen_signature_count(&self) -> usize {
        self.seen_signatures.len()
    }

    // -- Merkle trees -------------------------------------------------------

    /// Persist an artifact and make it the published tree.
    ///
    /// Trees are keyed by root and never overwritten: publishing the same
    /// root twice is a no-op, publishing a different root just moves the
    /// pointer.
    pub fn publish_merkle(&self, artifact: &MerkleArtifact) -> DbResult<()> {
        let root = artifact.root.to_ascii_lowercase();
        let json =
            serde_json::to_vec(artifact).map_err(|e| DbError::Serialization(e.to_string()))?;
        let _ = self
            .merkle_trees
            .compare_and_swap(root.as_bytes(), None as Option<&[u8]>, Some(json))?;
        self.metadata.insert(META_PUBLISHED_ROOT, root.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// The currently published artifact, if any.
    pub fn published_merkle(&self) -> DbResult<Option<MerkleArtifact>> {
        let Some(root) = self.metadata.get(META_PUBLISHED_ROOT)? else {
            return Ok(None);
        };
        self.merkle_by_root(&String::from_utf8_lossy(&root))
    }

    pub fn merkle_by_root(&self, root_hex: &str) -> DbResult<Option<MerkleArtifact>> {
        match self.merkle_trees.get(root_hex.to_ascii_lowercase().as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| DbError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    // -- Utility ------------------------------------------------------------

    /// Block until all pending writes are durable.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
