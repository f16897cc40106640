//! End-to-end integration tests for Solvend.
//!
//! These tests drive the purchase flow, the watcher, the distribution batch
//! lifecycle and the Merkle claim service together against one ledger and
//! one simulated chain, the way the node wires them. They prove the parts
//! compose: codes are issued once, redeemed once, and every published proof
//! verifies.
//!
//! Each test stands alone with its own temporary database. No shared state,
//! no test ordering dependencies, no flaky failures.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};

use solvend_protocol::auth::{sign_request, AdminAuthGate, AdminHeaders};
use solvend_protocol::chain::{ChainError, ChainOp, SimulatedChain};
use solvend_protocol::clock::{Clock, ManualClock};
use solvend_protocol::config;
use solvend_protocol::crypto::address::{report_address, voucher_address, Address};
use solvend_protocol::crypto::hash::{code_commitment, keccak256, leaf_hash, parse_hex32};
use solvend_protocol::crypto::keys::AdminKeypair;
use solvend_protocol::distribution::{BatchService, BatchStatus, ReportType};
use solvend_protocol::merkle::{verify_proof, Claim, ClaimProofService, MerkleArtifact, MerkleTree};
use solvend_protocol::purchase::{
    Confirmation, LogNotifier, PaymentOutcome, PurchaseService, PurchaseSettings, PurchaseStatus,
    RedeemError,
};
use solvend_protocol::storage::SolvendDB;
use solvend_protocol::watcher::{ObservedPayment, PaymentWatcher, WatcherConfig};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

struct Stack {
    clock: Arc<ManualClock>,
    chain: Arc<SimulatedChain>,
    db: Arc<SolvendDB>,
    purchases: PurchaseService,
    batches: BatchService,
    claims: ClaimProofService,
    watcher: PaymentWatcher,
}

fn program() -> Address {
    config::DEFAULT_PROGRAM_ID.parse().expect("program id")
}

/// Everything the node wires, over a temporary ledger.
fn stack() -> Stack {
    let clock = Arc::new(ManualClock::new(
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    ));
    let chain = Arc::new(SimulatedChain::new(clock.clone()));
    let db = Arc::new(SolvendDB::open_temporary().expect("temp db"));
    let treasury = Address::new([0xEE; 32]);

    let purchases = PurchaseService::new(
        db.clone(),
        chain.clone(),
        clock.clone(),
        Arc::new(LogNotifier),
        PurchaseSettings::new(program(), treasury),
    )
    .expect("purchase service");
    let batches = BatchService::new(db.clone(), chain.clone(), clock.clone(), program(), treasury);
    let claims = ClaimProofService::new(db.clone());
    let watcher = PaymentWatcher::new(
        chain.clone(),
        purchases.clone(),
        batches.clone(),
        db.clone(),
        clock.clone(),
        WatcherConfig::default(),
    );

    Stack {
        clock,
        chain,
        db,
        purchases,
        batches,
        claims,
        watcher,
    }
}

fn wallet(b: u8) -> Address {
    Address::new([b; 32])
}

fn treasury_payment(signature: &str, memo: &str, payer: Address) -> ObservedPayment {
    ObservedPayment {
        signature: signature.to_string(),
        memo: Some(memo.to_string()),
        payer: Some(payer),
        failed: false,
        amount: Some(1_000_000),
    }
}

// ---------------------------------------------------------------------------
// Purchase Flow
// ---------------------------------------------------------------------------

/// Create, confirm, redeem, redeem again.
#[tokio::test]
async fn test_purchase_confirm_redeem() {
    let s = stack();
    let buyer = wallet(1);

    let intent = s.purchases.create_purchase(Some(buyer), 1_000_000).unwrap();
    assert_eq!(intent.memo, intent.reference_id);

    let outcome = s
        .purchases
        .payment_observed(&intent.reference_id, "sig1", None, Confirmation::Direct)
        .await
        .unwrap();
    assert_eq!(outcome.status(), PurchaseStatus::VoucherCreated);
    let code = outcome.code().expect("winner gets the code").to_string();

    // The voucher the chain holds is bound to the committed hash.
    let stored = s.db.get_purchase(&intent.reference_id).unwrap().unwrap();
    let commitment = stored.state.commitment().unwrap().clone();
    assert_eq!(commitment.otp_hash, keccak256(code.as_bytes()));
    assert_eq!(
        commitment.voucher_address,
        voucher_address(&program(), &buyer, commitment.nonce).unwrap()
    );
    let account = s.chain.voucher(&commitment.voucher_address).unwrap();
    assert_eq!(account.otp_hash, commitment.otp_hash);
    assert_eq!(account.expiry_ts, commitment.otp_expiry.timestamp());

    let redemption = s.purchases.redeem(&code, None).await.unwrap();
    assert_eq!(redemption.reference_id, intent.reference_id);
    assert_eq!(
        s.purchases.status(&intent.reference_id).unwrap().status,
        PurchaseStatus::Redeemed
    );
    assert!(s.chain.voucher(&commitment.voucher_address).unwrap().redeemed);

    let again = s.purchases.redeem(&code, None).await.unwrap_err();
    assert!(matches!(again, RedeemError::AlreadyRedeemed));
    assert_eq!(s.chain.calls(ChainOp::RedeemVoucher), 1);
}

/// The watcher picks up a payment nobody confirmed directly.
#[tokio::test]
async fn test_watcher_only_payment() {
    let s = stack();
    let buyer = wallet(2);
    let intent = s.purchases.create_purchase(None, 1_000_000).unwrap();

    s.chain
        .record_payment(treasury_payment("sig-w", &intent.reference_id, buyer));
    let report = s.watcher.tick().await.unwrap();
    assert_eq!(report.purchases, 1);

    let view = s.purchases.status(&intent.reference_id).unwrap();
    assert_eq!(view.status, PurchaseStatus::VoucherCreated);
    assert_eq!(view.user_wallet, Some(buyer));
    assert_eq!(view.transaction_signature.as_deref(), Some("sig-w"));

    // A late direct confirmation gets no code.
    let late = s
        .purchases
        .payment_observed(&intent.reference_id, "sig-w", None, Confirmation::Direct)
        .await
        .unwrap();
    assert_eq!(late.code(), None);
}

/// Both payment sources race on many threads; exactly one wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_racing_confirmations_issue_once() {
    let s = stack();
    let buyer = wallet(3);
    let intent = s.purchases.create_purchase(Some(buyer), 1_000_000).unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let purchases = s.purchases.clone();
        let reference_id = intent.reference_id.clone();
        let source = if i % 2 == 0 {
            Confirmation::Direct
        } else {
            Confirmation::Watcher
        };
        handles.push(tokio::spawn(async move {
            purchases
                .payment_observed(&reference_id, "sig-race", Some(buyer), source)
                .await
        }));
    }

    let codes: Vec<String> = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter_map(|joined| joined.unwrap().unwrap().code().map(str::to_string))
        .collect();

    assert_eq!(codes.len(), 1, "exactly one caller issues a code");
    assert_eq!(s.chain.calls(ChainOp::CreateVoucher), 1);

    let stored = s.db.get_purchase(&intent.reference_id).unwrap().unwrap();
    assert_eq!(stored.status(), PurchaseStatus::VoucherCreated);
    assert_eq!(
        stored.state.commitment().unwrap().otp_hash,
        code_commitment(&codes[0])
    );
    assert_eq!(s.db.lookup_code(&code_commitment(&codes[0])).unwrap(), Some(intent.reference_id));

    // Losers never drew a nonce (or a code): the wallet's counter sits one
    // past the winner's.
    let nonce = stored.state.commitment().unwrap().nonce;
    assert_eq!(s.db.next_nonce(&buyer, 0).unwrap(), nonce + 1);
}

/// Many concurrent redeemers of one code; exactly one dispenses.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_racing_redemptions_redeem_once() {
    let s = stack();
    let intent = s.purchases.create_purchase(Some(wallet(4)), 1_000_000).unwrap();
    let code = s
        .purchases
        .payment_observed(&intent.reference_id, "sig", None, Confirmation::Direct)
        .await
        .unwrap()
        .code()
        .unwrap()
        .to_string();

    let mut handles = Vec::new();
    for _ in 0..12 {
        let purchases = s.purchases.clone();
        let code = code.clone();
        handles.push(tokio::spawn(async move { purchases.redeem(&code, None).await }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(RedeemError::AlreadyRedeemed) | Err(RedeemError::InProgress) => {}
            Err(other) => panic!("unexpected redeem error: {other}"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(s.chain.calls(ChainOp::RedeemVoucher), 1);
}

/// Chain down at payment time: the buyer still gets a code, and the voucher
/// is created when they redeem.
#[tokio::test]
async fn test_chain_outage_recovers_on_redeem() {
    let s = stack();
    s.chain.fail_next(
        ChainOp::CreateVoucher,
        ChainError::Timeout(std::time::Duration::from_secs(30)),
    );
    let intent = s.purchases.create_purchase(Some(wallet(5)), 1_000_000).unwrap();
    let outcome = s
        .purchases
        .payment_observed(&intent.reference_id, "sig", None, Confirmation::Direct)
        .await
        .unwrap();
    assert!(matches!(outcome, PaymentOutcome::IssuedPendingChain { .. }));
    assert_eq!(outcome.status(), PurchaseStatus::Pending);

    s.purchases.redeem(outcome.code().unwrap(), None).await.unwrap();
    assert_eq!(
        s.purchases.status(&intent.reference_id).unwrap().status,
        PurchaseStatus::Redeemed
    );
}

/// Wrong and expired codes don't move anything.
#[tokio::test]
async fn test_bad_codes_leave_purchase_untouched() {
    let s = stack();
    let intent = s.purchases.create_purchase(Some(wallet(6)), 1_000_000).unwrap();
    let code = s
        .purchases
        .payment_observed(&intent.reference_id, "sig", None, Confirmation::Direct)
        .await
        .unwrap()
        .code()
        .unwrap()
        .to_string();
    let before = s.db.get_purchase(&intent.reference_id).unwrap();

    let wrong = if code == "9999" { "9998" } else { "9999" };
    assert!(matches!(
        s.purchases.redeem(wrong, Some(&intent.reference_id)).await,
        Err(RedeemError::InvalidCode)
    ));

    s.clock.advance(ChronoDuration::seconds(3_601));
    assert!(matches!(
        s.purchases.redeem(&code, None).await,
        Err(RedeemError::ExpiredCode)
    ));

    assert_eq!(s.db.get_purchase(&intent.reference_id).unwrap(), before);
    assert_eq!(s.chain.calls(ChainOp::RedeemVoucher), 0);
}

// ---------------------------------------------------------------------------
// Merkle Distribution
// ---------------------------------------------------------------------------

/// Two claimants: root is the hash of both leaves, each proof is the other
/// leaf.
#[test]
fn test_two_leaf_tree() {
    let a = Claim::new(wallet(0xA1), 100);
    let b = Claim::new(wallet(0xB2), 250);
    let tree = MerkleTree::build(vec![a, b]).unwrap();

    let la = leaf_hash(a.claimant.as_bytes(), 100);
    let lb = leaf_hash(b.claimant.as_bytes(), 250);
    let mut joined = la.to_vec();
    joined.extend_from_slice(&lb);
    assert_eq!(tree.root(), keccak256(&joined));
    assert_eq!(tree.proof(0).unwrap(), vec![lb]);
    assert_eq!(tree.proof(1).unwrap(), vec![la]);
}

/// Odd leaf counts carry the last node up; every proof still verifies.
#[test]
fn test_every_proof_verifies_for_many_sizes() {
    for n in 1..=17usize {
        let claims: Vec<Claim> = (0..n)
            .map(|i| Claim::new(wallet(i as u8 + 1), 1_000 + i as u64))
            .collect();
        let tree = MerkleTree::build(claims.clone()).unwrap();
        for (i, claim) in claims.iter().enumerate() {
            let proof = tree.proof(i).unwrap();
            assert!(
                verify_proof(&claim.leaf(), i, n, &proof, &tree.root()),
                "leaf {i} of {n}"
            );
        }
    }
}

/// Same claims, same bytes.
#[test]
fn test_artifact_is_deterministic() {
    let claims: Vec<Claim> = (1..=5u8).map(|b| Claim::new(wallet(b), u64::from(b))).collect();
    let first = ClaimProofService::build(claims.clone()).unwrap();
    let second = ClaimProofService::build(claims).unwrap();
    assert_eq!(
        first.to_json_pretty().unwrap(),
        second.to_json_pretty().unwrap()
    );
}

/// Build, write, import, serve, verify; then commit the root on chain
/// through the admin path.
#[tokio::test]
async fn test_distribution_end_to_end() {
    let s = stack();
    let admin = AdminKeypair::from_seed(&[9; 32]);
    let gate = AdminAuthGate::new(admin.address(), s.clock.clone());
    let buyer = wallet(0x42);

    // Report purchase, paid through the watcher.
    let batch = s.batches.create_batch(buyer, ReportType::Monthly, 30).unwrap();
    assert_eq!(batch.amount, config::REPORT_PRICE_MONTHLY);
    s.chain
        .record_payment(treasury_payment("sig-r", &batch.reference_id, buyer));
    assert_eq!(s.watcher.tick().await.unwrap().batches, 1);
    assert_eq!(s.batches.get(&batch.reference_id).unwrap().status, BatchStatus::Paid);

    // Offline job.
    let claims: Vec<Claim> = (1..=3u8)
        .map(|b| Claim::new(wallet(b), u64::from(b) * 1_000_000))
        .collect();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("merkle_tree.json");
    ClaimProofService::build(claims.clone())
        .unwrap()
        .save(&path)
        .unwrap();
    let artifact = s.claims.import_file(&path).unwrap();
    assert_eq!(MerkleArtifact::load(&path).unwrap(), artifact);

    for claim in &claims {
        let p = s.claims.get_proof(&claim.claimant.to_string()).unwrap();
        let proof: Vec<_> = p.proof.iter().map(|h| parse_hex32(h).unwrap()).collect();
        assert!(verify_proof(
            &claim.leaf(),
            p.index,
            p.leaf_count,
            &proof,
            &parse_hex32(&p.root).unwrap()
        ));
    }

    // Admin attaches data and submits the root, each request signed.
    let now = s.clock.now_ms();
    let attach = serde_json::json!({
        "reportId": batch.batch_id, "buyerWallet": buyer.to_string(), "ipfsCid": "bafyreport"
    });
    let signed = sign_request(&admin, now, &attach).unwrap();
    let headers = AdminHeaders {
        public_key: Some(signed.public_key),
        timestamp: Some(signed.timestamp),
        signature: Some(signed.signature),
    };
    gate.verify(&headers, &attach).unwrap();
    s.batches
        .attach_report_data(batch.batch_id, buyer, "bafyreport")
        .await
        .unwrap();

    let receipt = s
        .batches
        .submit_root(batch.batch_id, buyer, &artifact.root)
        .await
        .unwrap();
    assert_eq!(receipt.status, BatchStatus::DistributionReady);

    let report = s
        .chain
        .report(&report_address(&program(), &buyer, batch.batch_id).unwrap())
        .unwrap();
    assert_eq!(report.merkle_root, Some(parse_hex32(&artifact.root).unwrap()));
}
