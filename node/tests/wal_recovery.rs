// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use std::sync::Arc;

use relaymint_kernel::session::SessionState;
use relaymint_node::accumulator::AccumulatorManager;
use relaymint_node::dedup::{DedupConfig, Deduplicator};
use relaymint_node::metrics::{names, noop, InMemoryMetrics};
use relaymint_node::recovery::{RecoveryConfig, RecoveryService};
use relaymint_node::session_store::{SessionSnapshot, SessionStore, SessionStoreConfig};
use relaymint_node::snapshot::SnapshotManager;
use relaymint_node::store::{EntryId, MemoryStore, SharedStore};
use relaymint_node::wal::{Wal, WalConfig, WalEntry};

const TENANT: &str = "tenant-a";

struct Node {
    wal: Arc<Wal>,
    sessions: Arc<SessionStore>,
    recovery: RecoveryService,
}

fn node(store: Arc<dyn SharedStore>, metrics: Arc<InMemoryMetrics>) -> Node {
    let wal = Arc::new(Wal::new(
        WalConfig {
            tenant_id: TENANT.into(),
            ..WalConfig::default()
        },
        store.clone(),
        metrics.clone(),
    ));
    let sessions = Arc::new(SessionStore::new(
        SessionStoreConfig {
            tenant_id: TENANT.into(),
            ..SessionStoreConfig::default()
        },
        store,
        metrics.clone(),
    ));
    let recovery = RecoveryService::new(
        RecoveryConfig {
            tenant_id: TENANT.into(),
            ..RecoveryConfig::default()
        },
        sessions.clone(),
        wal.clone(),
        metrics,
    );
    Node {
        wal,
        sessions,
        recovery,
    }
}

fn entry(n: u64) -> WalEntry {
    WalEntry {
        id: EntryId::ZERO,
        session_id: String::new(),
        relay_digest: format!("relay-{n}").into_bytes(),
        relay_payload: vec![1, 2, 3],
        weight: 2,
        tenant_id: String::new(),
        timestamp_ms: n,
    }
}

#[tokio::test]
async fn test_replays_only_entries_after_checkpoint() {
    common::init_tracing();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let node_a = node(store.clone(), metrics.clone());

    node_a
        .sessions
        .save(&SessionSnapshot::new("s1", TENANT, "anvil", "app", 100, 110))
        .await
        .unwrap();
    let mut ids = Vec::new();
    for n in 0..250 {
        ids.push(node_a.wal.append("s1", &entry(n)).await.unwrap());
    }
    node_a.wal.checkpoint("s1", ids[4]).await.unwrap();
    node_a.sessions.update_wal_position("s1", ids[4]).await.unwrap();

    // A second replica over the same store takes over.
    let node_b = node(store, metrics.clone());
    let recovered = node_b.recovery.recover_sessions().await.unwrap();
    assert_eq!(recovered.len(), 1);
    let session = &recovered[0];
    assert_eq!(session.snapshot.session_id, "s1");
    assert_eq!(session.pending.len(), 245);
    assert_eq!(session.pending[0].id, ids[5]);
    assert!(session.pending.windows(2).all(|w| w[0].id < w[1].id));
    assert!(node_b.recovery.get_recovered_session("s1").is_some());

    let accumulator = AccumulatorManager::new(TENANT, metrics.clone());
    let stats = node_b.recovery.restore_into(&accumulator, session).unwrap();
    assert_eq!(stats.applied, 245);
    assert_eq!(stats.skipped, 0);
    assert_eq!(accumulator.tree_stats("s1").unwrap(), (245, 490));
    assert!(node_b.recovery.get_recovered_session("s1").is_none());
    assert_eq!(metrics.counter_total(names::WAL_REPLAYS), 245);
}

#[tokio::test]
async fn test_terminal_sessions_are_not_recovered() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let node = node(store, Arc::new(InMemoryMetrics::new()));
    for (id, state) in [("live", SessionState::Active), ("done", SessionState::Settled)] {
        let mut snapshot = SessionSnapshot::new(id, TENANT, "anvil", "app", 100, 110);
        snapshot.state = state;
        node.sessions.save(&snapshot).await.unwrap();
        node.wal.append(id, &entry(1)).await.unwrap();
    }

    let recovered = node.recovery.recover_sessions().await.unwrap();
    let ids: Vec<&str> = recovered.iter().map(|r| r.snapshot.session_id.as_str()).collect();
    assert_eq!(ids, vec!["live"]);
}

#[tokio::test]
async fn test_claimed_session_restores_persisted_tree() {
    common::init_tracing();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let node_a = node(store.clone(), metrics.clone());
    let accumulator = Arc::new(AccumulatorManager::new(TENANT, metrics.clone()));
    let snapshots = SnapshotManager::new(
        TENANT,
        node_a.sessions.clone(),
        node_a.wal.clone(),
        accumulator.clone(),
        metrics.clone(),
    );

    let (_, created) = snapshots
        .ensure_session(&common::relay(TENANT, "s1", 0, 110))
        .await
        .unwrap();
    assert!(created);
    for n in 0..40 {
        snapshots.on_relay(&common::relay(TENANT, "s1", n, 110)).await.unwrap();
    }
    node_a
        .sessions
        .update_state("s1", SessionState::Claiming)
        .await
        .unwrap();
    let root = accumulator.flush_tree("s1").unwrap();
    snapshots.on_session_claimed("s1", &root).await.unwrap();

    let snapshot = node_a.sessions.get("s1").await.unwrap().unwrap();
    assert_eq!(snapshot.state, SessionState::Claimed);
    assert_eq!(snapshot.relay_count, 40);
    assert_eq!(snapshot.claimed_root_digest, Some(root.to_bytes()));
    assert_eq!(node_a.wal.get_checkpoint("s1").await.unwrap(), snapshot.last_wal_entry_id);

    let node_b = node(store.clone(), metrics.clone());
    let session = node_b.recovery.recover_session("s1").await.unwrap();
    assert!(session.tree.is_some());
    assert!(session.pending.is_empty());

    let fresh = AccumulatorManager::new(TENANT, metrics.clone());
    node_b.recovery.restore_into(&fresh, &session).unwrap();
    assert_eq!(fresh.get_tree_root("s1").unwrap(), Some(root));

    // Settling removes the WAL stream and the persisted tree.
    snapshots.on_session_settled("s1").await;
    assert_eq!(node_a.wal.size("s1").await.unwrap(), 0);
    assert!(node_a.sessions.load_tree("s1").await.unwrap().is_none());
    assert_eq!(accumulator.tree_count(), 0);
}

#[tokio::test]
async fn test_dedup_survives_restart() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let config = DedupConfig {
        tenant_id: TENANT.into(),
        ..DedupConfig::default()
    };
    let before = Deduplicator::new(config.clone(), store.clone(), noop());
    before.mark_processed(b"relay-1", "s1").await.unwrap();

    let after = Deduplicator::new(config, store, noop());
    assert!(after.is_duplicate(b"relay-1", "s1").await.unwrap());
    assert!(!after.is_duplicate(b"relay-2", "s1").await.unwrap());
}
