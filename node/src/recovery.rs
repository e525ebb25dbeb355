// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Failover recovery.
//!
//! A replica that takes over a tenant rebuilds each non-terminal session from
//! the shared store:
//!
//! 1. load the snapshot
//! 2. load the persisted tree image, if the session was already claimed
//! 3. read the WAL strictly after the checkpoint
//!
//! `restore_into` then feeds the image and the pending entries into the
//! accumulator. Sessions that fail to recover are skipped so one bad record
//! cannot block a tenant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use relaymint_kernel::session::SessionState;
use tokio::time::Instant;

use crate::accumulator::{AccumulatorManager, ReplayStats};
use crate::errors::{MinerError, MinerResult};
use crate::metrics::{names, SharedMetrics};
use crate::session_store::{SessionSnapshot, SessionStore};
use crate::wal::{Wal, WalEntry};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub tenant_id: String,
    /// Upper bound for a full `recover_sessions` pass.
    pub timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveredSession {
    pub snapshot: SessionSnapshot,
    /// Tree image persisted at claim time.
    pub tree: Option<Vec<u8>>,
    /// WAL entries after the checkpoint, in order.
    pub pending: Vec<WalEntry>,
}

pub struct RecoveryService {
    config: RecoveryConfig,
    sessions: Arc<SessionStore>,
    wal: Arc<Wal>,
    metrics: SharedMetrics,
    recovered: Mutex<HashMap<String, RecoveredSession>>,
}

impl RecoveryService {
    pub fn new(
        config: RecoveryConfig,
        sessions: Arc<SessionStore>,
        wal: Arc<Wal>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            config,
            sessions,
            wal,
            metrics,
            recovered: Mutex::new(HashMap::new()),
        }
    }

    /// Recover every non-terminal session of the tenant.
    pub async fn recover_sessions(&self) -> MinerResult<Vec<RecoveredSession>> {
        let started = Instant::now();
        let result = tokio::time::timeout(self.config.timeout, self.recover_all()).await;
        let recovered = match result {
            Ok(recovered) => recovered?,
            Err(_) => {
                tracing::error!(
                    tenant = %self.config.tenant_id,
                    timeout = ?self.config.timeout,
                    "session recovery timed out"
                );
                return Err(MinerError::Cancelled);
            }
        };
        self.metrics.record_histogram(
            names::RECOVERY_LATENCY,
            started.elapsed().as_secs_f64(),
            &[("tenant", self.config.tenant_id.as_str())],
        );
        tracing::info!(
            tenant = %self.config.tenant_id,
            sessions = recovered.len(),
            "recovered sessions"
        );
        Ok(recovered)
    }

    async fn recover_all(&self) -> MinerResult<Vec<RecoveredSession>> {
        let mut recovered = Vec::new();
        for state in SessionState::NON_TERMINAL {
            for snapshot in self.sessions.get_by_state(state).await? {
                let session_id = snapshot.session_id.clone();
                match self.recover_snapshot(snapshot).await {
                    Ok(session) => recovered.push(session),
                    Err(e) => {
                        self.metrics.increment_counter(
                            names::SESSIONS_SKIPPED_AT_STARTUP,
                            1,
                            &[("tenant", self.config.tenant_id.as_str()), ("reason", e.reason())],
                        );
                        tracing::warn!(
                            tenant = %self.config.tenant_id,
                            %session_id,
                            error = %e,
                            "skipping session during recovery"
                        );
                    }
                }
            }
        }
        Ok(recovered)
    }

    async fn recover_snapshot(&self, snapshot: SessionSnapshot) -> MinerResult<RecoveredSession> {
        let session_id = snapshot.session_id.clone();
        let checkpoint = self.wal.get_checkpoint(&session_id).await?;
        let pending = self.wal.read_from(&session_id, checkpoint).await?;
        let tree = if checkpoint.is_zero() {
            None
        } else {
            self.sessions.load_tree(&session_id).await?
        };

        tracing::debug!(
            tenant = %self.config.tenant_id,
            %session_id,
            state = %snapshot.state,
            %checkpoint,
            pending = pending.len(),
            has_tree = tree.is_some(),
            "recovered session"
        );
        self.metrics.increment_counter(
            names::RECOVERIES,
            1,
            &[("tenant", self.config.tenant_id.as_str())],
        );

        let session = RecoveredSession {
            snapshot,
            tree,
            pending,
        };
        self.recovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, session.clone());
        Ok(session)
    }

    /// Recover a single session regardless of state.
    pub async fn recover_session(&self, session_id: &str) -> MinerResult<RecoveredSession> {
        let snapshot = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| MinerError::NotFound(session_id.to_string()))?;
        self.recover_snapshot(snapshot).await
    }

    pub fn get_recovered_session(&self, session_id: &str) -> Option<RecoveredSession> {
        self.recovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn clear_recovered_session(&self, session_id: &str) {
        self.recovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    /// Rebuild the session tree from a recovery result and drop it from the
    /// cache.
    pub fn restore_into(
        &self,
        accumulator: &AccumulatorManager,
        session: &RecoveredSession,
    ) -> MinerResult<ReplayStats> {
        let session_id = session.snapshot.session_id.as_str();
        if let Some(image) = &session.tree {
            accumulator.restore_tree(session_id, image)?;
            let restored = accumulator.get_tree_root(session_id)?;
            if let (Some(root), Some(recorded)) = (restored, &session.snapshot.claimed_root_digest) {
                if root.to_bytes() != *recorded {
                    tracing::warn!(
                        tenant = %self.config.tenant_id,
                        session_id,
                        "restored tree root differs from the recorded claim"
                    );
                }
            }
        } else {
            accumulator.get_or_create_tree(session_id)?;
        }

        let stats = if session.pending.is_empty() {
            ReplayStats::default()
        } else {
            accumulator.rebuild_from_wal(session_id, &session.pending)?
        };
        self.clear_recovered_session(session_id);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::noop;
    use crate::session_store::SessionStoreConfig;
    use crate::store::{EntryId, MemoryStore};
    use crate::wal::WalConfig;

    struct Fixture {
        sessions: Arc<SessionStore>,
        wal: Arc<Wal>,
        recovery: RecoveryService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionStore::new(
            SessionStoreConfig {
                tenant_id: "tenant-a".into(),
                ..SessionStoreConfig::default()
            },
            store.clone(),
            noop(),
        ));
        let wal = Arc::new(Wal::new(
            WalConfig {
                tenant_id: "tenant-a".into(),
                ..WalConfig::default()
            },
            store,
            noop(),
        ));
        let recovery = RecoveryService::new(
            RecoveryConfig {
                tenant_id: "tenant-a".into(),
                ..RecoveryConfig::default()
            },
            sessions.clone(),
            wal.clone(),
            noop(),
        );
        Fixture {
            sessions,
            wal,
            recovery,
        }
    }

    fn entry(n: u64) -> WalEntry {
        WalEntry {
            id: EntryId::ZERO,
            session_id: String::new(),
            relay_digest: format!("relay-{n}").into_bytes(),
            relay_payload: vec![1],
            weight: 1,
            tenant_id: String::new(),
            timestamp_ms: n,
        }
    }

    #[tokio::test]
    async fn test_recovers_only_non_terminal_sessions() {
        let f = fixture();
        for id in ["s1", "s2", "s3"] {
            f.sessions
                .save(&SessionSnapshot::new(id, "tenant-a", "svc", "app", 100, 110))
                .await
                .unwrap();
            f.wal.append(id, &entry(1)).await.unwrap();
        }
        f.sessions.update_state("s2", SessionState::Settled).await.unwrap();
        f.sessions.set_expired("s3", "claim_window_missed").await.unwrap();

        let recovered = f.recovery.recover_sessions().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].snapshot.session_id, "s1");
        assert_eq!(recovered[0].pending.len(), 1);
        assert!(f.recovery.get_recovered_session("s1").is_some());
    }

    #[tokio::test]
    async fn test_claimed_session_restores_tree_and_tail() {
        let f = fixture();
        let acc = AccumulatorManager::new("tenant-a", noop());
        f.sessions
            .save(&SessionSnapshot::new("s1", "tenant-a", "svc", "app", 100, 110))
            .await
            .unwrap();
        let mut last = EntryId::ZERO;
        for n in 0..4 {
            let e = entry(n);
            last = f.wal.append("s1", &e).await.unwrap();
            acc.update_tree("s1", &e.relay_digest, &e.relay_payload, e.weight).unwrap();
        }
        let root = acc.flush_tree("s1").unwrap();
        f.sessions.save_tree("s1", acc.tree_image("s1").unwrap()).await.unwrap();
        f.sessions.update_state("s1", SessionState::Claiming).await.unwrap();
        f.sessions.mark_claimed("s1", &root.to_bytes()).await.unwrap();
        f.wal.checkpoint("s1", last).await.unwrap();

        let session = f.recovery.recover_session("s1").await.unwrap();
        assert!(session.tree.is_some());
        assert!(session.pending.is_empty());

        let fresh = AccumulatorManager::new("tenant-a", noop());
        f.recovery.restore_into(&fresh, &session).unwrap();
        assert_eq!(fresh.get_tree_root("s1").unwrap(), Some(root));
        assert!(f.recovery.get_recovered_session("s1").is_none());
    }

    #[tokio::test]
    async fn test_missing_session_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.recovery.recover_session("nope").await,
            Err(MinerError::NotFound(_))
        ));
    }
}
