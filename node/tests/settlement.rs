// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! End-to-end settlement through the tenant manager, with direct and batched
//! submission.
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockChain, RecordingSubmitter, StaticParams};
use relaymint_kernel::session::SessionState;
use relaymint_node::config::{BatchingSection, MinerConfig};
use relaymint_node::ingest::StoreRelaySource;
use relaymint_node::metrics::{names, InMemoryMetrics};
use relaymint_node::store::{MemoryStore, SharedStore};
use relaymint_node::tenant::{TenantDeps, TenantManager};

const TENANT: &str = "tenant-a";

struct Setup {
    manager: Arc<TenantManager>,
    producer: StoreRelaySource,
    submitter: Arc<RecordingSubmitter>,
    metrics: Arc<InMemoryMetrics>,
}

fn setup(chain: Arc<MockChain>, batching: Option<BatchingSection>) -> Setup {
    common::init_tracing();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let submitter = RecordingSubmitter::new();
    let metrics = Arc::new(InMemoryMetrics::new());
    let mut config = MinerConfig {
        instance_id: "replica-a".into(),
        ..MinerConfig::default()
    };
    config.settlement.batching = batching;
    let deps = TenantDeps {
        store: store.clone(),
        oracle: chain,
        params: StaticParams::default_params(),
        submitter: submitter.clone(),
        relay_source: Arc::new(StoreRelaySource::new("relaymint:relays", store.clone())),
        session_query: None,
        metrics: metrics.clone(),
    };
    Setup {
        manager: Arc::new(TenantManager::new(config, deps)),
        producer: StoreRelaySource::new("relaymint:relays", store),
        submitter,
        metrics,
    }
}

impl Setup {
    async fn publish(&self, session_id: &str, relays: u64) {
        for n in 0..relays {
            self.producer
                .publish(&common::relay(TENANT, session_id, n, 110))
                .await
                .unwrap();
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_direct_settlement_through_the_height_checker() {
    let chain = MockChain::at(105);
    let setup = setup(chain.clone(), None);
    setup.manager.add_tenant(TENANT, vec!["anvil".into()]).await.unwrap();
    setup.publish("s1", 12).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(setup.metrics.counter_total(names::RELAYS_PROCESSED), 12);

    for height in 105..=131 {
        chain.set_height(height);
        tokio::time::sleep(Duration::from_secs(7)).await;
    }

    let lifecycle = setup.manager.lifecycle(TENANT).unwrap();
    let state = lifecycle
        .wait_for_settlement("s1", Duration::from_secs(600))
        .await
        .unwrap();
    assert_eq!(state, SessionState::Settled);
    assert_eq!(setup.submitter.claimed_sessions(), vec!["s1".to_string()]);
    assert_eq!(setup.submitter.proven_sessions(), vec!["s1".to_string()]);
    assert_eq!(setup.metrics.counter(names::CLAIMS_SUBMITTED, &[("tenant", TENANT)]), 1);
    assert_eq!(setup.metrics.counter(names::PROOFS_SUBMITTED, &[("tenant", TENANT)]), 1);

    setup.manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_batched_settlement_groups_sessions() {
    let chain = MockChain::at(100);
    let setup = setup(chain.clone(), Some(BatchingSection::default()));
    setup.manager.add_tenant(TENANT, vec!["anvil".into()]).await.unwrap();
    for session_id in ["s1", "s2", "s3"] {
        setup.publish(session_id, 6).await;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(setup.metrics.counter_total(names::RELAYS_PROCESSED), 18);

    // One block per lifecycle poll.
    for height in 100..=131 {
        chain.set_height(height);
        tokio::time::sleep(Duration::from_secs(7)).await;
    }

    let lifecycle = setup.manager.lifecycle(TENANT).unwrap();
    for session_id in ["s1", "s2", "s3"] {
        let state = lifecycle
            .wait_for_settlement(session_id, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(state, SessionState::Settled);
    }

    // Same tenant and end height: one slot, so one claim batch and one proof
    // batch.
    assert_eq!(
        setup.submitter.claim_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    assert_eq!(
        setup.submitter.proof_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    assert_eq!(setup.submitter.claimed_sessions(), vec!["s1", "s2", "s3"]);
    assert!(setup
        .submitter
        .claims
        .lock()
        .unwrap()
        .iter()
        .all(|(timeout, _)| *timeout == 120));
    assert_eq!(
        setup
            .metrics
            .histogram_samples(names::SUBMISSION_BATCH_SIZE, &[("kind", "claim")]),
        vec![3.0]
    );
    assert_eq!(
        setup
            .metrics
            .histogram_samples(names::SUBMISSION_BATCH_SIZE, &[("kind", "proof")]),
        vec![3.0]
    );

    setup.manager.close().await;
}
