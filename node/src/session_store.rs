// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Session Snapshot Store
//!
//! The authoritative, replica-visible record of each session. Layout under
//! `{prefix}:{tenant}`:
//!
//! | key | kind | content |
//! |---|---|---|
//! | `:session:{id}` | value | JSON [`SessionSnapshot`] |
//! | `:tree:{id}` | value | flushed tree image |
//! | `:counted:{id}` | set | hex digests already folded into the counters |
//! | `:index` | set | every session id of the tenant |
//! | `:state:{state}` | set | session ids currently in `state` |
//!
//! Every mutation is a guarded batch: the record is rewritten only if it still
//! holds the bytes that were read, and the state-index move happens in the
//! same batch, so a session is never listed under two states.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use relaymint_kernel::session::SessionState;
use serde::{Deserialize, Serialize};

use crate::errors::{MinerError, MinerResult};
use crate::metrics::{names, SharedMetrics};
use crate::store::{BatchOp, EntryId, Guard, SharedStore};

const MAX_CAS_ATTEMPTS: usize = 64;

/// Wall-clock milliseconds since the epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    pub key_prefix: String,
    pub tenant_id: String,
    pub session_ttl: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "relaymint:sessions".to_string(),
            tenant_id: String::new(),
            session_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|text| hex::decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub tenant_id: String,
    pub service_id: String,
    pub counterparty_id: String,
    pub start_height: u64,
    pub end_height: u64,
    pub state: SessionState,
    pub relay_count: u64,
    pub total_weight: u64,
    /// Encoded root, fixed once the session is claimed.
    #[serde(default, with = "hex_opt")]
    pub claimed_root_digest: Option<Vec<u8>>,
    #[serde(default)]
    pub last_wal_entry_id: EntryId,
    pub created_at_ms: u64,
    pub last_updated_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_reason: Option<String>,
}

impl SessionSnapshot {
    /// A fresh `Active` snapshot.
    pub fn new(
        session_id: &str,
        tenant_id: &str,
        service_id: &str,
        counterparty_id: &str,
        start_height: u64,
        end_height: u64,
    ) -> Self {
        let now = now_ms();
        Self {
            session_id: session_id.to_string(),
            tenant_id: tenant_id.to_string(),
            service_id: service_id.to_string(),
            counterparty_id: counterparty_id.to_string(),
            start_height,
            end_height,
            state: SessionState::Active,
            relay_count: 0,
            total_weight: 0,
            claimed_root_digest: None,
            last_wal_entry_id: EntryId::ZERO,
            created_at_ms: now,
            last_updated_at_ms: now,
            expiry_reason: None,
        }
    }
}

pub struct SessionStore {
    config: SessionStoreConfig,
    store: Arc<dyn SharedStore>,
    metrics: SharedMetrics,
    closed: AtomicBool,
}

impl SessionStore {
    pub fn new(
        config: SessionStoreConfig,
        store: Arc<dyn SharedStore>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            config,
            store,
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.config.tenant_id
    }

    fn base(&self) -> String {
        format!("{}:{}", self.config.key_prefix, self.config.tenant_id)
    }

    fn record_key(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.base(), session_id)
    }

    fn tree_key(&self, session_id: &str) -> String {
        format!("{}:tree:{}", self.base(), session_id)
    }

    fn counted_key(&self, session_id: &str) -> String {
        format!("{}:counted:{}", self.base(), session_id)
    }

    fn index_key(&self) -> String {
        format!("{}:index", self.base())
    }

    fn state_key(&self, state: SessionState) -> String {
        format!("{}:state:{}", self.base(), state.as_str())
    }

    fn ensure_open(&self) -> MinerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MinerError::Closed("session store"))
        } else {
            Ok(())
        }
    }

    fn store_error(&self, operation: &'static str) {
        self.metrics.increment_counter(
            names::SESSION_STORE_ERRORS,
            1,
            &[("tenant", self.config.tenant_id.as_str()), ("operation", operation)],
        );
    }

    /// Write a snapshot and place it in the tenant index and exactly one
    /// state index.
    pub async fn save(&self, snapshot: &SessionSnapshot) -> MinerResult<()> {
        self.ensure_open()?;
        let encoded = serde_json::to_vec(snapshot)?;
        let mut ops = vec![
            BatchOp::Set {
                key: self.record_key(&snapshot.session_id),
                value: encoded,
                ttl: Some(self.config.session_ttl),
            },
            BatchOp::SetAdd {
                key: self.index_key(),
                member: snapshot.session_id.clone(),
            },
        ];
        for state in SessionState::ALL {
            if state != snapshot.state {
                ops.push(BatchOp::SetRemove {
                    key: self.state_key(state),
                    member: snapshot.session_id.clone(),
                });
            }
        }
        ops.push(BatchOp::SetAdd {
            key: self.state_key(snapshot.state),
            member: snapshot.session_id.clone(),
        });

        if let Err(e) = self.store.exec_batch(None, ops).await {
            self.store_error("save");
            return Err(e.into());
        }
        tracing::debug!(
            tenant = %self.config.tenant_id,
            session_id = %snapshot.session_id,
            state = %snapshot.state,
            "saved session snapshot"
        );
        Ok(())
    }

    /// Save only if no record exists yet. Returns false when another writer
    /// created the session first.
    pub async fn create(&self, snapshot: &SessionSnapshot) -> MinerResult<bool> {
        self.ensure_open()?;
        let key = self.record_key(&snapshot.session_id);
        let ops = vec![
            BatchOp::Set {
                key: key.clone(),
                value: serde_json::to_vec(snapshot)?,
                ttl: Some(self.config.session_ttl),
            },
            BatchOp::SetAdd {
                key: self.index_key(),
                member: snapshot.session_id.clone(),
            },
            BatchOp::SetAdd {
                key: self.state_key(snapshot.state),
                member: snapshot.session_id.clone(),
            },
        ];
        let guard = Guard {
            key,
            expected: None,
        };
        Ok(self.store.exec_batch(Some(guard), ops).await?)
    }

    pub async fn get(&self, session_id: &str) -> MinerResult<Option<SessionSnapshot>> {
        self.ensure_open()?;
        match self.store.get(&self.record_key(session_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn load_members(&self, key: &str) -> MinerResult<Vec<SessionSnapshot>> {
        let mut snapshots = Vec::new();
        for session_id in self.store.set_members(key).await? {
            match self.get(&session_id).await {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                Ok(None) => {
                    // Record expired; the index entry is stale.
                    if let Err(e) = self.store.set_remove(key, &[session_id.clone()]).await {
                        tracing::warn!(%session_id, error = %e, "failed to drop stale index entry");
                    }
                }
                Err(e) => {
                    self.store_error("load");
                    tracing::warn!(
                        tenant = %self.config.tenant_id,
                        %session_id,
                        error = %e,
                        "skipping unreadable session snapshot"
                    );
                }
            }
        }
        Ok(snapshots)
    }

    pub async fn get_by_tenant(&self) -> MinerResult<Vec<SessionSnapshot>> {
        self.ensure_open()?;
        self.load_members(&self.index_key()).await
    }

    pub async fn get_by_state(&self, state: SessionState) -> MinerResult<Vec<SessionSnapshot>> {
        self.ensure_open()?;
        let mut snapshots = self.load_members(&self.state_key(state)).await?;
        snapshots.retain(|s| s.state == state);
        Ok(snapshots)
    }

    /// Remove a session record, its tree and all index memberships.
    pub async fn delete(&self, session_id: &str) -> MinerResult<()> {
        self.ensure_open()?;
        let member = session_id.to_string();
        let mut ops = vec![
            BatchOp::Del {
                key: self.record_key(session_id),
            },
            BatchOp::Del {
                key: self.tree_key(session_id),
            },
            BatchOp::Del {
                key: self.counted_key(session_id),
            },
            BatchOp::SetRemove {
                key: self.index_key(),
                member: member.clone(),
            },
        ];
        ops.extend(SessionState::ALL.iter().map(|state| BatchOp::SetRemove {
            key: self.state_key(*state),
            member: member.clone(),
        }));
        self.store.exec_batch(None, ops).await?;
        Ok(())
    }

    /// Guarded read-modify-write of one snapshot. `apply` returns whether it
    /// changed anything; unchanged snapshots are not written.
    async fn modify<F>(&self, session_id: &str, mut apply: F) -> MinerResult<SessionSnapshot>
    where
        F: FnMut(&mut SessionSnapshot) -> MinerResult<bool>,
    {
        self.ensure_open()?;
        let key = self.record_key(session_id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| MinerError::NotFound(session_id.to_string()))?;
            let mut snapshot: SessionSnapshot = serde_json::from_slice(&raw)?;
            let previous = snapshot.state;
            if !apply(&mut snapshot)? {
                return Ok(snapshot);
            }
            snapshot.last_updated_at_ms = now_ms();

            let mut ops = vec![BatchOp::Set {
                key: key.clone(),
                value: serde_json::to_vec(&snapshot)?,
                ttl: Some(self.config.session_ttl),
            }];
            if previous != snapshot.state {
                ops.push(BatchOp::SetRemove {
                    key: self.state_key(previous),
                    member: session_id.to_string(),
                });
                ops.push(BatchOp::SetAdd {
                    key: self.state_key(snapshot.state),
                    member: session_id.to_string(),
                });
            }

            let guard = Guard {
                key: key.clone(),
                expected: Some(raw),
            };
            if self.store.exec_batch(Some(guard), ops).await? {
                if previous != snapshot.state {
                    self.metrics.increment_counter(
                        names::SESSION_TRANSITIONS,
                        1,
                        &[
                            ("tenant", self.config.tenant_id.as_str()),
                            ("from_state", previous.as_str()),
                            ("to_state", snapshot.state.as_str()),
                        ],
                    );
                    tracing::info!(
                        tenant = %self.config.tenant_id,
                        session_id,
                        from = %previous,
                        to = %snapshot.state,
                        "session state changed"
                    );
                }
                return Ok(snapshot);
            }
            tokio::task::yield_now().await;
        }
        self.store_error("conflict");
        Err(MinerError::Conflict(session_id.to_string()))
    }

    fn transition(snapshot: &mut SessionSnapshot, to: SessionState) -> MinerResult<bool> {
        if snapshot.state == to {
            return Ok(false);
        }
        if !snapshot.state.can_transition_to(to) {
            return Err(MinerError::InvalidTransition {
                session_id: snapshot.session_id.clone(),
                from: snapshot.state,
                to,
            });
        }
        snapshot.state = to;
        Ok(true)
    }

    /// Move a session to `to`. No-op when it is already there; regressions
    /// and moves out of a terminal state fail with `InvalidTransition`.
    pub async fn update_state(
        &self,
        session_id: &str,
        to: SessionState,
    ) -> MinerResult<SessionSnapshot> {
        self.modify(session_id, |snapshot| Self::transition(snapshot, to))
            .await
    }

    /// Record the claimed root and move to `Claimed`. The first recorded root
    /// is kept.
    pub async fn mark_claimed(&self, session_id: &str, root: &[u8]) -> MinerResult<SessionSnapshot> {
        self.modify(session_id, |snapshot| {
            let moved = Self::transition(snapshot, SessionState::Claimed)?;
            if snapshot.claimed_root_digest.is_none() {
                snapshot.claimed_root_digest = Some(root.to_vec());
                return Ok(true);
            }
            Ok(moved)
        })
        .await
    }

    pub async fn set_expired(&self, session_id: &str, reason: &str) -> MinerResult<SessionSnapshot> {
        self.modify(session_id, |snapshot| {
            if !Self::transition(snapshot, SessionState::Expired)? {
                return Ok(false);
            }
            snapshot.expiry_reason = Some(reason.to_string());
            Ok(true)
        })
        .await
    }

    /// Advance the last applied WAL id. Older ids are ignored.
    pub async fn update_wal_position(&self, session_id: &str, entry_id: EntryId) -> MinerResult<()> {
        self.modify(session_id, |snapshot| {
            if entry_id <= snapshot.last_wal_entry_id {
                return Ok(false);
            }
            snapshot.last_wal_entry_id = entry_id;
            Ok(true)
        })
        .await
        .map(|_| ())
    }

    /// Count one relay of `weight`. Concurrent callers never lose updates.
    pub async fn increment_relay_count(&self, session_id: &str, weight: u64) -> MinerResult<()> {
        self.modify(session_id, |snapshot| {
            snapshot.relay_count = snapshot.relay_count.saturating_add(1);
            snapshot.total_weight = snapshot.total_weight.saturating_add(weight);
            Ok(true)
        })
        .await
        .map(|_| ())
    }

    /// Fold one applied relay into the snapshot: count it and advance the WAL
    /// position in a single guarded write. A digest already counted for the
    /// session only moves the position. Returns whether the relay was counted.
    pub async fn record_relay(
        &self,
        session_id: &str,
        relay_digest: &[u8],
        weight: u64,
        entry_id: EntryId,
    ) -> MinerResult<bool> {
        self.ensure_open()?;
        let key = self.record_key(session_id);
        let counted_key = self.counted_key(session_id);
        let member = hex::encode(relay_digest);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| MinerError::NotFound(session_id.to_string()))?;
            let mut snapshot: SessionSnapshot = serde_json::from_slice(&raw)?;
            // Every counting write rewrites the record, so the guard below
            // also covers this membership read.
            let seen = self.store.set_contains(&counted_key, &member).await?;

            let mut changed = false;
            if !seen {
                snapshot.relay_count = snapshot.relay_count.saturating_add(1);
                snapshot.total_weight = snapshot.total_weight.saturating_add(weight);
                changed = true;
            }
            if entry_id > snapshot.last_wal_entry_id {
                snapshot.last_wal_entry_id = entry_id;
                changed = true;
            }
            if !changed {
                return Ok(false);
            }
            snapshot.last_updated_at_ms = now_ms();

            let mut ops = vec![BatchOp::Set {
                key: key.clone(),
                value: serde_json::to_vec(&snapshot)?,
                ttl: Some(self.config.session_ttl),
            }];
            if !seen {
                ops.push(BatchOp::SetAdd {
                    key: counted_key.clone(),
                    member: member.clone(),
                });
                ops.push(BatchOp::Expire {
                    key: counted_key.clone(),
                    ttl: self.config.session_ttl,
                });
            }
            let guard = Guard {
                key: key.clone(),
                expected: Some(raw),
            };
            if self.store.exec_batch(Some(guard), ops).await? {
                if seen {
                    tracing::debug!(
                        tenant = %self.config.tenant_id,
                        session_id,
                        "relay already counted, advanced WAL position only"
                    );
                }
                return Ok(!seen);
            }
            tokio::task::yield_now().await;
        }
        self.store_error("conflict");
        Err(MinerError::Conflict(session_id.to_string()))
    }

    /// Persist a flushed tree image next to the snapshot.
    pub async fn save_tree(&self, session_id: &str, image: Vec<u8>) -> MinerResult<()> {
        self.ensure_open()?;
        self.store
            .set(&self.tree_key(session_id), image, Some(self.config.session_ttl))
            .await?;
        Ok(())
    }

    pub async fn load_tree(&self, session_id: &str) -> MinerResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.store.get(&self.tree_key(session_id)).await?)
    }

    pub async fn delete_tree(&self, session_id: &str) -> MinerResult<()> {
        self.ensure_open()?;
        self.store.delete(&[self.tree_key(session_id)]).await?;
        Ok(())
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(tenant = %self.config.tenant_id, "session store closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use crate::store::MemoryStore;

    fn new_store() -> (SessionStore, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let config = SessionStoreConfig {
            tenant_id: "tenant-a".into(),
            ..SessionStoreConfig::default()
        };
        (
            SessionStore::new(config, Arc::new(MemoryStore::new()), metrics.clone()),
            metrics,
        )
    }

    fn snapshot(id: &str) -> SessionSnapshot {
        SessionSnapshot::new(id, "tenant-a", "svc", "app-1", 100, 110)
    }

    #[tokio::test]
    async fn test_save_and_query_indices() {
        let (store, _) = new_store();
        store.save(&snapshot("s1")).await.unwrap();
        store.save(&snapshot("s2")).await.unwrap();

        assert_eq!(store.get("s1").await.unwrap().unwrap().end_height, 110);
        assert!(store.get("missing").await.unwrap().is_none());
        assert!(!store.create(&snapshot("s1")).await.unwrap());
        assert!(store.create(&snapshot("s3")).await.unwrap());
        store.delete("s3").await.unwrap();
        assert_eq!(store.get_by_tenant().await.unwrap().len(), 2);
        assert_eq!(store.get_by_state(SessionState::Active).await.unwrap().len(), 2);

        store.update_state("s1", SessionState::Claiming).await.unwrap();
        let active = store.get_by_state(SessionState::Active).await.unwrap();
        let claiming = store.get_by_state(SessionState::Claiming).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(claiming[0].session_id, "s1");
    }

    #[tokio::test]
    async fn test_update_state_rules() {
        let (store, metrics) = new_store();
        assert!(matches!(
            store.update_state("nope", SessionState::Claiming).await,
            Err(MinerError::NotFound(_))
        ));

        store.save(&snapshot("s1")).await.unwrap();
        store.update_state("s1", SessionState::Claimed).await.unwrap();
        store.update_state("s1", SessionState::Claimed).await.unwrap();
        assert_eq!(metrics.counter_total(names::SESSION_TRANSITIONS), 1);

        assert!(matches!(
            store.update_state("s1", SessionState::Active).await,
            Err(MinerError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_mark_claimed_keeps_first_root() {
        let (store, _) = new_store();
        store.save(&snapshot("s1")).await.unwrap();
        store.update_state("s1", SessionState::Claiming).await.unwrap();
        store.mark_claimed("s1", &[1, 2, 3]).await.unwrap();
        let again = store.mark_claimed("s1", &[9, 9]).await.unwrap();
        assert_eq!(again.claimed_root_digest, Some(vec![1, 2, 3]));

        let raw = serde_json::to_string(&again).unwrap();
        assert!(raw.contains("\"010203\""));
    }

    #[tokio::test]
    async fn test_set_expired_records_reason_and_is_terminal() {
        let (store, _) = new_store();
        store.save(&snapshot("s1")).await.unwrap();
        let expired = store.set_expired("s1", "claim_window_missed").await.unwrap();
        assert_eq!(expired.state, SessionState::Expired);
        assert_eq!(expired.expiry_reason.as_deref(), Some("claim_window_missed"));
        assert!(store.update_state("s1", SessionState::Settled).await.is_err());
        assert!(store.get_by_state(SessionState::Active).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let (store, _) = new_store();
        let store = Arc::new(store);
        store.save(&snapshot("s1")).await.unwrap();

        let mut tasks = Vec::new();
        for weight in 1..=10u64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.increment_relay_count("s1", weight).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let snap = store.get("s1").await.unwrap().unwrap();
        assert_eq!(snap.relay_count, 10);
        assert_eq!(snap.total_weight, 55);
    }

    #[tokio::test]
    async fn test_wal_position_only_advances() {
        let (store, _) = new_store();
        store.save(&snapshot("s1")).await.unwrap();
        store.update_wal_position("s1", EntryId::new(5, 0)).await.unwrap();
        store.update_wal_position("s1", EntryId::new(3, 0)).await.unwrap();
        let snap = store.get("s1").await.unwrap().unwrap();
        assert_eq!(snap.last_wal_entry_id, EntryId::new(5, 0));
    }

    #[tokio::test]
    async fn test_record_relay_counts_each_digest_once() {
        let (store, _) = new_store();
        store.save(&snapshot("s1")).await.unwrap();

        assert!(store.record_relay("s1", b"r1", 4, EntryId::new(1, 0)).await.unwrap());
        assert!(store.record_relay("s1", b"r2", 6, EntryId::new(2, 0)).await.unwrap());
        // Redelivered relay appended again to the WAL.
        assert!(!store.record_relay("s1", b"r1", 4, EntryId::new(3, 0)).await.unwrap());
        assert!(!store.record_relay("s1", b"r1", 4, EntryId::new(3, 0)).await.unwrap());

        let snap = store.get("s1").await.unwrap().unwrap();
        assert_eq!(snap.relay_count, 2);
        assert_eq!(snap.total_weight, 10);
        assert_eq!(snap.last_wal_entry_id, EntryId::new(3, 0));

        assert!(matches!(
            store.record_relay("nope", b"r1", 1, EntryId::new(1, 0)).await,
            Err(MinerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_records_of_one_digest_count_once() {
        let (store, _) = new_store();
        let store = Arc::new(store);
        store.save(&snapshot("s1")).await.unwrap();

        let mut tasks = Vec::new();
        for seq in 0..8u64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.record_relay("s1", b"same", 5, EntryId::new(1, seq)).await
            }));
        }
        let mut counted = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                counted += 1;
            }
        }
        assert_eq!(counted, 1);
        let snap = store.get("s1").await.unwrap().unwrap();
        assert_eq!((snap.relay_count, snap.total_weight), (1, 5));
        assert_eq!(snap.last_wal_entry_id, EntryId::new(1, 7));
    }

    #[tokio::test]
    async fn test_delete_and_close() {
        let (store, _) = new_store();
        store.save(&snapshot("s1")).await.unwrap();
        store.save_tree("s1", vec![7; 4]).await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
        assert!(store.load_tree("s1").await.unwrap().is_none());
        assert!(store.get_by_tenant().await.unwrap().is_empty());

        store.close();
        assert!(matches!(store.save(&snapshot("s2")).await, Err(MinerError::Closed(_))));
    }
}
