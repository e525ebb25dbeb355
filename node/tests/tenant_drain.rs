// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockChain, RecordingSubmitter, StaticParams};
use futures::StreamExt;
use relaymint_node::config::MinerConfig;
use relaymint_node::errors::MinerError;
use relaymint_node::ingest::StoreRelaySource;
use relaymint_node::metrics::{names, InMemoryMetrics};
use relaymint_node::store::{MemoryStore, SharedStore};
use relaymint_node::tenant::drain::DrainState;
use relaymint_node::tenant::registry::{RegistryAction, TenantStatus};
use relaymint_node::tenant::{TenantDeps, TenantEvent, TenantManager};
use tokio::sync::mpsc;

struct Setup {
    manager: Arc<TenantManager>,
    chain: Arc<MockChain>,
    producer: StoreRelaySource,
    metrics: Arc<InMemoryMetrics>,
}

fn setup(drain_timeout_secs: u64) -> Setup {
    common::init_tracing();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let chain = MockChain::at(100);
    let metrics = Arc::new(InMemoryMetrics::new());
    let mut config = MinerConfig {
        instance_id: "replica-a".into(),
        ..MinerConfig::default()
    };
    config.drain.timeout_secs = drain_timeout_secs;
    config.drain.check_interval_ms = 1_000;
    let deps = TenantDeps {
        store: store.clone(),
        oracle: chain.clone(),
        params: StaticParams::default_params(),
        submitter: RecordingSubmitter::new(),
        relay_source: Arc::new(StoreRelaySource::new("relaymint:relays", store.clone())),
        session_query: None,
        metrics: metrics.clone(),
    };
    Setup {
        manager: Arc::new(TenantManager::new(config, deps)),
        chain,
        producer: StoreRelaySource::new("relaymint:relays", store),
        metrics,
    }
}

#[tokio::test(start_paused = true)]
async fn test_add_drain_and_remove() {
    let s = setup(1_800);
    let mut updates = s.manager.registry().subscribe().await.unwrap();

    s.manager.add_tenant("t1", vec!["anvil".into()]).await.unwrap();
    s.manager.add_tenant("t2", vec!["ollama".into()]).await.unwrap();
    assert!(matches!(
        s.manager.add_tenant("t1", vec![]).await,
        Err(MinerError::AlreadyStarted(_))
    ));
    let ids: Vec<String> = s.manager.list_tenants().into_iter().map(|t| t.tenant_id).collect();
    assert_eq!(ids, vec!["t1", "t2"]);
    assert_eq!(s.metrics.gauge(names::TENANTS_ACTIVE, &[]), Some(2.0));
    assert_eq!(s.manager.registry().list().await.unwrap(), vec!["t1", "t2"]);

    for n in 0..5 {
        s.producer.publish(&common::relay("t1", "s1", n, 110)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(s.manager.get_tenant("t1").unwrap().pending_sessions, 1);

    s.manager.remove_tenant("t1").await.unwrap();
    assert!(matches!(
        s.manager.remove_tenant("t1").await,
        Err(MinerError::AlreadyStarted(_))
    ));
    let info = s.manager.get_tenant("t1").unwrap();
    assert_eq!(info.status, TenantStatus::Draining);
    assert_eq!(s.manager.drain_status("t1").state, DrainState::Draining);
    assert_eq!(
        s.manager.registry().get("t1").await.unwrap().unwrap().status,
        TenantStatus::Draining
    );

    // Still draining while the session is in flight.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(s.manager.get_tenant("t1").is_some());
    assert_eq!(s.manager.drain_status("t1").pending_sessions, 1);

    for height in 100..=131 {
        s.chain.set_height(height);
        tokio::time::sleep(Duration::from_secs(7)).await;
    }
    assert!(s.manager.wait_removed("t1", Duration::from_secs(60)).await);
    assert!(s.manager.get_tenant("t1").is_none());
    assert!(s.manager.get_tenant("t2").is_some());
    assert_eq!(s.manager.drain_status("t1").state, DrainState::NotStarted);
    assert!(s.manager.registry().get("t1").await.unwrap().is_none());
    assert_eq!(s.metrics.gauge(names::TENANTS_ACTIVE, &[]), Some(1.0));

    let mut actions = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(10), updates.next()).await
    {
        if event.tenant_id == "t1" {
            actions.push(event.action);
        }
    }
    assert_eq!(
        actions,
        vec![RegistryAction::Add, RegistryAction::Draining, RegistryAction::Remove]
    );

    s.manager.close().await;
    assert!(s.manager.list_tenants().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_drain_timeout_still_removes_tenant() {
    let s = setup(30);
    s.manager.add_tenant("t1", vec![]).await.unwrap();
    s.producer.publish(&common::relay("t1", "s1", 0, 110)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // The chain never reaches the claim window, so the session cannot settle.
    s.manager.remove_tenant("t1").await.unwrap();
    assert!(!s.manager.wait_removed("t1", Duration::from_secs(20)).await);
    assert!(s.manager.wait_removed("t1", Duration::from_secs(20)).await);
    assert!(s.manager.get_tenant("t1").is_none());
    s.manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_event_stream_is_applied_in_order() {
    let s = setup(30);
    let (tx, rx) = mpsc::channel(8);
    let manager = s.manager.clone();
    let runner = tokio::spawn(async move { manager.run(rx).await });

    tx.send(TenantEvent::Added {
        tenant_id: "t1".into(),
        services: vec!["anvil".into()],
    })
    .await
    .unwrap();
    tx.send(TenantEvent::Added {
        tenant_id: "t2".into(),
        services: vec![],
    })
    .await
    .unwrap();
    // No sessions, so the drain completes on its first check.
    tx.send(TenantEvent::Removed {
        tenant_id: "t2".into(),
    })
    .await
    .unwrap();
    tx.send(TenantEvent::Removed {
        tenant_id: "unknown".into(),
    })
    .await
    .unwrap();
    drop(tx);
    runner.await.unwrap();

    assert!(s.manager.wait_removed("t2", Duration::from_secs(5)).await);
    let ids: Vec<String> = s.manager.list_tenants().into_iter().map(|t| t.tenant_id).collect();
    assert_eq!(ids, vec!["t1"]);

    s.manager.close().await;
    assert!(matches!(
        s.manager.add_tenant("t3", vec![]).await,
        Err(MinerError::Closed(_))
    ));
}
