// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Keeps the session snapshot, the WAL and the in-memory tree in step.

use std::sync::Arc;

use relaymint_kernel::tree::RootDigest;

use crate::accumulator::AccumulatorManager;
use crate::chain::Relay;
use crate::errors::MinerResult;
use crate::metrics::{names, SharedMetrics};
use crate::session_store::{now_ms, SessionSnapshot, SessionStore};
use crate::store::EntryId;
use crate::wal::{Wal, WalEntry};

pub struct SnapshotManager {
    tenant_id: String,
    sessions: Arc<SessionStore>,
    wal: Arc<Wal>,
    accumulator: Arc<AccumulatorManager>,
    metrics: SharedMetrics,
}

impl SnapshotManager {
    pub fn new(
        tenant_id: &str,
        sessions: Arc<SessionStore>,
        wal: Arc<Wal>,
        accumulator: Arc<AccumulatorManager>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            sessions,
            wal,
            accumulator,
            metrics,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn accumulator(&self) -> &Arc<AccumulatorManager> {
        &self.accumulator
    }

    /// Load the snapshot for the relay's session, creating it on first sight.
    /// The flag is true if this call created it.
    pub async fn ensure_session(&self, relay: &Relay) -> MinerResult<(SessionSnapshot, bool)> {
        if let Some(existing) = self.sessions.get(&relay.session_id).await? {
            return Ok((existing, false));
        }
        let snapshot = SessionSnapshot::new(
            &relay.session_id,
            &self.tenant_id,
            &relay.service_id,
            &relay.counterparty_id,
            relay.session_start_height,
            relay.session_end_height,
        );
        if !self.sessions.create(&snapshot).await? {
            // Lost the race to another writer; use theirs.
            let existing = self
                .sessions
                .get(&relay.session_id)
                .await?
                .unwrap_or(snapshot);
            return Ok((existing, false));
        }
        self.accumulator.get_or_create_tree(&relay.session_id)?;
        self.metrics.increment_counter(
            names::SESSIONS_CREATED,
            1,
            &[("tenant", self.tenant_id.as_str()), ("service_id", relay.service_id.as_str())],
        );
        tracing::info!(
            tenant = %self.tenant_id,
            session_id = %relay.session_id,
            service_id = %relay.service_id,
            end_height = relay.session_end_height,
            "created session"
        );
        Ok((snapshot, true))
    }

    /// Make a relay durable and fold it in: WAL append, tree update, then
    /// relay count and WAL position together. Replaying a relay that failed
    /// half way leaves the counters matching the tree.
    pub async fn on_relay(&self, relay: &Relay) -> MinerResult<EntryId> {
        let entry = WalEntry {
            id: EntryId::ZERO,
            session_id: relay.session_id.clone(),
            relay_digest: relay.relay_digest.clone(),
            relay_payload: relay.relay_payload.clone(),
            weight: relay.weight,
            tenant_id: self.tenant_id.clone(),
            timestamp_ms: now_ms(),
        };
        let entry_id = self.wal.append(&relay.session_id, &entry).await?;
        self.accumulator.update_tree(
            &relay.session_id,
            &relay.relay_digest,
            &relay.relay_payload,
            relay.weight,
        )?;
        self.sessions
            .record_relay(&relay.session_id, &relay.relay_digest, relay.weight, entry_id)
            .await?;
        Ok(entry_id)
    }

    /// Persist the claimed root and the tree image, then checkpoint the WAL
    /// at the last folded entry.
    pub async fn on_session_claimed(&self, session_id: &str, root: &RootDigest) -> MinerResult<()> {
        let image = self.accumulator.tree_image(session_id)?;
        self.sessions.save_tree(session_id, image).await?;
        let snapshot = self.sessions.mark_claimed(session_id, &root.to_bytes()).await?;
        if !snapshot.last_wal_entry_id.is_zero() {
            self.wal
                .checkpoint(session_id, snapshot.last_wal_entry_id)
                .await?;
        }
        Ok(())
    }

    /// Drop the WAL stream, the persisted tree and the in-memory tree of a
    /// finished session. Best effort.
    pub async fn on_session_settled(&self, session_id: &str) {
        if let Err(e) = self.wal.delete_session(session_id).await {
            tracing::warn!(tenant = %self.tenant_id, session_id, error = %e, "failed to delete WAL stream");
        }
        if let Err(e) = self.sessions.delete_tree(session_id).await {
            tracing::warn!(tenant = %self.tenant_id, session_id, error = %e, "failed to delete tree image");
        }
        self.accumulator.delete_tree(session_id);
    }
}
