// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Drives sessions through the claim and proof windows of a session ending at
//! height 110 (claim window [112, 120), proof window [121, 130)).
mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{MockChain, RecordingSubmitter, StaticParams};
use relaymint_kernel::hash::proof_path;
use relaymint_kernel::session::SessionState;
use relaymint_kernel::tree::proof::ClosestProof;
use relaymint_kernel::tree::RootDigest;
use relaymint_kernel::window::SubmissionWindow;
use relaymint_node::accumulator::AccumulatorManager;
use relaymint_node::dedup::{DedupConfig, Deduplicator};
use relaymint_node::ingest::{RelayOutcome, RelayProcessor};
use relaymint_node::lifecycle::{LifecycleConfig, SessionLifecycleManager};
use relaymint_node::metrics::{names, InMemoryMetrics};
use relaymint_node::session_store::{SessionStore, SessionStoreConfig};
use relaymint_node::settlement::{SettlementCallback, SettlementConfig};
use relaymint_node::snapshot::SnapshotManager;
use relaymint_node::store::{MemoryStore, SharedStore};
use relaymint_node::timing::{SubmissionTimingCalculator, TimingConfig};
use relaymint_node::wal::{Wal, WalConfig};

const TENANT: &str = "tenant-a";

struct Harness {
    tenant: String,
    chain: Arc<MockChain>,
    submitter: Arc<RecordingSubmitter>,
    metrics: Arc<InMemoryMetrics>,
    wal: Arc<Wal>,
    sessions: Arc<SessionStore>,
    dedup: Arc<Deduplicator>,
    accumulator: Arc<AccumulatorManager>,
    lifecycle: Arc<SessionLifecycleManager>,
    processor: RelayProcessor,
}

fn harness(start_height: u64) -> Harness {
    harness_for(start_height, TENANT, LifecycleConfig::default().max_concurrent_transitions)
}

fn harness_for(start_height: u64, tenant: &str, max_concurrent_transitions: usize) -> Harness {
    common::init_tracing();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let chain = MockChain::at(start_height);
    let params = StaticParams::default_params();
    let submitter = RecordingSubmitter::new();

    let wal = Arc::new(Wal::new(
        WalConfig {
            tenant_id: tenant.into(),
            ..WalConfig::default()
        },
        store.clone(),
        metrics.clone(),
    ));
    let sessions = Arc::new(SessionStore::new(
        SessionStoreConfig {
            tenant_id: tenant.into(),
            ..SessionStoreConfig::default()
        },
        store.clone(),
        metrics.clone(),
    ));
    let dedup = Arc::new(Deduplicator::new(
        DedupConfig {
            tenant_id: tenant.into(),
            ..DedupConfig::default()
        },
        store,
        metrics.clone(),
    ));
    let accumulator = Arc::new(AccumulatorManager::new(tenant, metrics.clone()));
    let snapshots = Arc::new(SnapshotManager::new(
        tenant,
        sessions.clone(),
        wal.clone(),
        accumulator.clone(),
        metrics.clone(),
    ));
    let timing = Arc::new(SubmissionTimingCalculator::new(
        TimingConfig::default(),
        chain.clone(),
        params.clone(),
    ));
    let callback = SettlementCallback::new(
        SettlementConfig {
            tenant_id: tenant.into(),
            ..SettlementConfig::default()
        },
        snapshots.clone(),
        dedup.clone(),
        timing,
        submitter.clone(),
        metrics.clone(),
    );
    let lifecycle = Arc::new(SessionLifecycleManager::new(
        LifecycleConfig {
            tenant_id: tenant.into(),
            max_concurrent_transitions,
            ..LifecycleConfig::default()
        },
        sessions.clone(),
        chain.clone(),
        params,
        Arc::new(callback),
        metrics.clone(),
    ));
    let processor = RelayProcessor::new(
        tenant,
        snapshots,
        dedup.clone(),
        lifecycle.clone(),
        metrics.clone(),
    );
    Harness {
        tenant: tenant.to_string(),
        chain,
        submitter,
        metrics,
        wal,
        sessions,
        dedup,
        accumulator,
        lifecycle,
        processor,
    }
}

impl Harness {
    async fn ingest(&self, session_id: &str, relays: u64) {
        for n in 0..relays {
            let outcome = self
                .processor
                .process(&common::relay(&self.tenant, session_id, n, 110))
                .await
                .unwrap();
            assert!(matches!(outcome, RelayOutcome::Applied(_)));
        }
    }

    /// Advance the chain one block at a time, giving in-flight transitions
    /// two seconds of (paused) time per block.
    async fn run_heights(&self, heights: std::ops::RangeInclusive<u64>) {
        for height in heights {
            self.chain.set_height(height);
            self.lifecycle.check_sessions(height).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn state(&self, session_id: &str) -> SessionState {
        self.sessions.get(session_id).await.unwrap().unwrap().state
    }
}

#[tokio::test(start_paused = true)]
async fn test_session_claims_proves_and_settles() {
    let h = harness(100);
    h.ingest("s1", 25).await;
    assert_eq!(h.lifecycle.pending_session_count(), 1);
    let expected_weight: u64 = (0..25).map(|n| 1 + n % 5).sum();

    h.run_heights(100..=111).await;
    assert_eq!(h.state("s1").await, SessionState::Active);
    assert_eq!(h.submitter.claim_calls.load(Ordering::SeqCst), 0);

    h.run_heights(112..=120).await;
    let claimed = h.sessions.get("s1").await.unwrap().unwrap();
    assert_eq!(claimed.state, SessionState::Claimed);
    assert_eq!(claimed.relay_count, 25);
    assert_eq!(claimed.total_weight, expected_weight);

    let (claim_timeout, claim) = h.submitter.claims.lock().unwrap()[0].clone();
    assert_eq!(claim_timeout, 120);
    let root = RootDigest::from_bytes(&claim.root).unwrap();
    assert_eq!(root.count, 25);
    assert_eq!(root.sum, expected_weight);
    assert_eq!(claimed.claimed_root_digest, Some(claim.root.clone()));
    assert_eq!(h.wal.get_checkpoint("s1").await.unwrap(), claimed.last_wal_entry_id);

    h.run_heights(121..=130).await;
    h.lifecycle.wait_idle().await;
    assert_eq!(h.state("s1").await, SessionState::Settled);
    assert_eq!(h.submitter.proven_sessions(), vec!["s1".to_string()]);
    let (proof_timeout, proof) = h.submitter.proofs.lock().unwrap()[0].clone();
    assert_eq!(proof_timeout, 130);
    let proof = ClosestProof::from_bytes(&proof.proof).unwrap();
    proof.verify(&root).unwrap();
    // The path is seeded by the block just before the tenant's proof slot.
    let proof_slot = SubmissionWindow::spread(121, 130, 2, &common::block(121).hash, TENANT);
    let seed = common::block(proof_slot.earliest_submit - 1);
    assert_eq!(proof.path, proof_path(&seed.hash, "s1"));

    assert!(!h.lifecycle.has_pending_sessions());
    assert_eq!(h.wal.size("s1").await.unwrap(), 0);
    assert_eq!(h.accumulator.tree_count(), 0);
    assert_eq!(h.dedup.local_sessions(), 0);
    assert_eq!(h.metrics.counter(names::CLAIMS_SUBMITTED, &[("tenant", TENANT)]), 1);
    assert_eq!(h.metrics.counter(names::PROOFS_SUBMITTED, &[("tenant", TENANT)]), 1);
    assert_eq!(
        h.metrics.counter(names::SESSIONS_SETTLED, &[("tenant", TENANT), ("service_id", "anvil")]),
        1
    );
    h.lifecycle.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_more_due_sessions_than_permits_all_claim_in_a_late_slot() {
    // A tenant whose claim slot is 117, the last height before the buffer.
    let open_hash = common::block(112).hash;
    let tenant = (0..1_000)
        .map(|i| format!("tenant-{i}"))
        .find(|t| SubmissionWindow::spread(112, 120, 2, &open_hash, t).earliest_submit == 117)
        .unwrap();
    let h = harness_for(100, &tenant, 1);
    h.ingest("s1", 4).await;
    h.ingest("s2", 6).await;

    h.run_heights(100..=116).await;
    assert_eq!(h.state("s1").await, SessionState::Active);
    assert_eq!(h.state("s2").await, SessionState::Active);
    assert_eq!(h.submitter.claim_calls.load(Ordering::SeqCst), 0);

    h.run_heights(117..=118).await;
    assert_eq!(h.submitter.claimed_sessions(), vec!["s1", "s2"]);
    assert!(h
        .submitter
        .claims
        .lock()
        .unwrap()
        .iter()
        .all(|(timeout, _)| *timeout == 120));

    h.run_heights(119..=130).await;
    h.lifecycle.wait_idle().await;
    for session_id in ["s1", "s2"] {
        assert_eq!(h.state(session_id).await, SessionState::Settled);
    }
    assert_eq!(h.submitter.proven_sessions(), vec!["s1", "s2"]);
    h.lifecycle.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_proofs_expire_the_session() {
    let h = harness(100);
    h.ingest("s1", 10).await;
    h.submitter.fail_proofs.store(true, Ordering::SeqCst);

    h.run_heights(100..=120).await;
    assert_eq!(h.state("s1").await, SessionState::Claimed);

    h.run_heights(121..=133).await;
    h.lifecycle.wait_idle().await;
    let expired = h.sessions.get("s1").await.unwrap().unwrap();
    assert_eq!(expired.state, SessionState::Expired);
    assert_eq!(expired.expiry_reason.as_deref(), Some("proof_failed"));
    assert!(h.submitter.proof_calls.load(Ordering::SeqCst) >= 3);
    assert!(h.submitter.proven_sessions().is_empty());
    assert_eq!(
        h.metrics.counter(
            names::SESSIONS_FAILED,
            &[("tenant", TENANT), ("service_id", "anvil"), ("reason", "proof_failed")]
        ),
        1
    );
    assert!(h.metrics.counter_total(names::PROOF_ERRORS) >= 1);
    assert_eq!(h.accumulator.tree_count(), 0);
    h.lifecycle.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_claims_expire_the_session() {
    let h = harness(100);
    h.ingest("s1", 5).await;
    h.submitter.fail_claims.store(true, Ordering::SeqCst);

    h.run_heights(100..=122).await;
    h.lifecycle.wait_idle().await;
    let expired = h.sessions.get("s1").await.unwrap().unwrap();
    assert_eq!(expired.state, SessionState::Expired);
    assert_eq!(expired.expiry_reason.as_deref(), Some("claim_failed"));
    assert!(h
        .metrics
        .counter(names::CLAIM_ERRORS, &[("tenant", TENANT), ("reason", "exhausted_retries")])
        >= 1);
    h.lifecycle.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_late_session_misses_claim_window() {
    let h = harness(125);
    h.ingest("s1", 3).await;

    h.run_heights(125..=126).await;
    h.lifecycle.wait_idle().await;
    let expired = h.sessions.get("s1").await.unwrap().unwrap();
    assert_eq!(expired.state, SessionState::Expired);
    assert_eq!(expired.expiry_reason.as_deref(), Some("claim_window_missed"));
    assert_eq!(h.submitter.claim_calls.load(Ordering::SeqCst), 0);

    // Further relays for the finished session are refused.
    let outcome = h
        .processor
        .process(&common::relay(TENANT, "s1", 99, 110))
        .await
        .unwrap();
    assert_eq!(outcome, RelayOutcome::Rejected("session_not_active"));
    h.lifecycle.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_claimed_session() {
    let h = harness(100);
    h.ingest("s1", 8).await;
    h.run_heights(100..=120).await;
    assert_eq!(h.state("s1").await, SessionState::Claimed);
    h.lifecycle.close().await;

    // A fresh manager over the same store picks the claimed session up.
    let restarted = Arc::new(SessionLifecycleManager::new(
        LifecycleConfig {
            tenant_id: TENANT.into(),
            ..LifecycleConfig::default()
        },
        h.sessions.clone(),
        h.chain.clone(),
        StaticParams::default_params(),
        Arc::new(NoopCallback),
        h.metrics.clone(),
    ));
    assert_eq!(restarted.load_sessions().await.unwrap(), 1);
    assert_eq!(
        restarted.sessions_by_state(SessionState::Claimed)[0].session_id,
        "s1"
    );
    restarted.check_sessions(131).await;
    restarted.wait_idle().await;
    // Claimed past the proof window: the claim stands, so the session settles.
    assert_eq!(h.state("s1").await, SessionState::Settled);
    restarted.close().await;
}

struct NoopCallback;

#[async_trait::async_trait]
impl relaymint_node::lifecycle::LifecycleCallback for NoopCallback {
    async fn on_session_active(
        &self,
        _: &relaymint_node::session_store::SessionSnapshot,
    ) -> relaymint_node::errors::MinerResult<()> {
        Ok(())
    }

    async fn on_session_needs_claim(
        &self,
        _: &relaymint_node::session_store::SessionSnapshot,
        _: &tokio_util::sync::CancellationToken,
    ) -> relaymint_node::errors::MinerResult<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn on_session_needs_proof(
        &self,
        _: &relaymint_node::session_store::SessionSnapshot,
        _: &tokio_util::sync::CancellationToken,
    ) -> relaymint_node::errors::MinerResult<()> {
        Ok(())
    }

    async fn on_session_settled(&self, _: &relaymint_node::session_store::SessionSnapshot) {}

    async fn on_session_expired(
        &self,
        _: &relaymint_node::session_store::SessionSnapshot,
        _: &str,
    ) {
    }
}
