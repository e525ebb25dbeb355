// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Relay ingestion.
//!
//! [`RelayProcessor`] turns one validated relay into durable state:
//! dedup check, session ensure, WAL append, tree update, counters, dedup mark.
//! A delivery is acknowledged upstream only after that succeeded (or the
//! relay was rejected for good); anything else is left for redelivery.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relaymint_kernel::session::SessionState;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::chain::{Delivery, Relay, RelaySource};
use crate::dedup::Deduplicator;
use crate::errors::{MinerError, MinerResult};
use crate::lifecycle::SessionLifecycleManager;
use crate::metrics::{names, SharedMetrics};
use crate::snapshot::SnapshotManager;
use crate::store::{EntryId, SharedStore};

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Deliveries fetched per poll.
    pub batch_size: usize,
    /// Sleep after an empty or failed poll.
    pub idle_backoff: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Applied(EntryId),
    Duplicate,
    Rejected(&'static str),
}

pub struct RelayProcessor {
    tenant_id: String,
    snapshots: Arc<SnapshotManager>,
    dedup: Arc<Deduplicator>,
    lifecycle: Arc<SessionLifecycleManager>,
    metrics: SharedMetrics,
}

impl RelayProcessor {
    pub fn new(
        tenant_id: &str,
        snapshots: Arc<SnapshotManager>,
        dedup: Arc<Deduplicator>,
        lifecycle: Arc<SessionLifecycleManager>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            snapshots,
            dedup,
            lifecycle,
            metrics,
        }
    }

    fn reject(&self, relay: &Relay, reason: &'static str) -> RelayOutcome {
        self.metrics.increment_counter(
            names::RELAYS_REJECTED,
            1,
            &[("tenant", self.tenant_id.as_str()), ("reason", reason)],
        );
        tracing::debug!(
            tenant = %self.tenant_id,
            session_id = %relay.session_id,
            reason,
            "relay rejected"
        );
        RelayOutcome::Rejected(reason)
    }

    /// Errors mean the relay may not be durable and must be redelivered.
    pub async fn process(&self, relay: &Relay) -> MinerResult<RelayOutcome> {
        if relay.tenant_id != self.tenant_id {
            return Ok(self.reject(relay, "wrong_tenant"));
        }
        if relay.session_id.is_empty() || relay.relay_digest.is_empty() {
            return Ok(self.reject(relay, "malformed"));
        }
        if relay.session_end_height == 0 || relay.session_end_height < relay.session_start_height {
            return Ok(self.reject(relay, "unknown_session"));
        }

        if self.dedup.is_duplicate(&relay.relay_digest, &relay.session_id).await? {
            self.metrics.increment_counter(
                names::RELAYS_DEDUPLICATED,
                1,
                &[("tenant", self.tenant_id.as_str()), ("service_id", relay.service_id.as_str())],
            );
            return Ok(RelayOutcome::Duplicate);
        }

        let (snapshot, _) = self.snapshots.ensure_session(relay).await?;
        if snapshot.state != SessionState::Active {
            return Ok(self.reject(relay, "session_not_active"));
        }
        if self.lifecycle.get_session(&relay.session_id).is_none() {
            self.lifecycle.track_session(snapshot).await?;
        }

        let entry_id = self.snapshots.on_relay(relay).await?;

        if let Err(e) = self
            .dedup
            .mark_processed(&relay.relay_digest, &relay.session_id)
            .await
        {
            tracing::warn!(
                tenant = %self.tenant_id,
                session_id = %relay.session_id,
                error = %e,
                "relay applied but dedup mark failed"
            );
        }
        self.metrics.increment_counter(
            names::RELAYS_PROCESSED,
            1,
            &[("tenant", self.tenant_id.as_str()), ("service_id", relay.service_id.as_str())],
        );
        Ok(RelayOutcome::Applied(entry_id))
    }

    /// Process deliveries and return the ids that may be acknowledged.
    pub async fn process_batch(&self, deliveries: &[Delivery]) -> Vec<String> {
        let mut acks = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            match self.process(&delivery.relay).await {
                Ok(_) => acks.push(delivery.delivery_id.clone()),
                Err(e) => tracing::warn!(
                    tenant = %self.tenant_id,
                    delivery_id = %delivery.delivery_id,
                    session_id = %delivery.relay.session_id,
                    error = %e,
                    "relay not applied, leaving for redelivery"
                ),
            }
        }
        acks
    }

    /// Consume `source` until `cancel` fires.
    pub async fn run(&self, source: Arc<dyn RelaySource>, config: IngestConfig, cancel: CancellationToken) {
        tracing::info!(tenant = %self.tenant_id, "relay consumption started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let idle = match source.fetch(&self.tenant_id, config.batch_size).await {
                Ok(deliveries) if deliveries.is_empty() => true,
                Ok(deliveries) => {
                    let acks = self.process_batch(&deliveries).await;
                    if let Err(e) = source.ack(&self.tenant_id, &acks).await {
                        tracing::warn!(tenant = %self.tenant_id, error = %e, "failed to ack deliveries");
                    }
                    acks.len() < deliveries.len()
                }
                Err(e) => {
                    tracing::warn!(tenant = %self.tenant_id, error = %e, "relay fetch failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.idle_backoff) => {}
                }
            }
        }
        tracing::info!(tenant = %self.tenant_id, "relay consumption stopped");
    }
}

#[derive(Default)]
struct Cursor {
    loaded: bool,
    position: EntryId,
    fetched: Vec<EntryId>,
    acked: BTreeSet<EntryId>,
}

/// [`RelaySource`] over a per-tenant store stream. Deliveries are read after
/// an acknowledged cursor, so anything not acknowledged is read again on the
/// next fetch. The cursor only moves over a contiguous acknowledged prefix.
pub struct StoreRelaySource {
    key_prefix: String,
    store: Arc<dyn SharedStore>,
    cursors: Mutex<HashMap<String, Cursor>>,
}

impl StoreRelaySource {
    pub fn new(key_prefix: &str, store: Arc<dyn SharedStore>) -> Self {
        Self {
            key_prefix: key_prefix.to_string(),
            store,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    fn stream_key(&self, tenant_id: &str) -> String {
        format!("{}:{}", self.key_prefix, tenant_id)
    }

    fn cursor_key(&self, tenant_id: &str) -> String {
        format!("{}:{}:cursor", self.key_prefix, tenant_id)
    }

    /// Producer side: append a relay to its tenant's stream.
    pub async fn publish(&self, relay: &Relay) -> MinerResult<EntryId> {
        let payload = serde_json::to_vec(relay)?;
        Ok(self
            .store
            .stream_append(&self.stream_key(&relay.tenant_id), payload, None)
            .await?)
    }
}

#[async_trait]
impl RelaySource for StoreRelaySource {
    async fn fetch(&self, tenant_id: &str, max: usize) -> MinerResult<Vec<Delivery>> {
        let mut cursors = self.cursors.lock().await;
        let cursor = cursors.entry(tenant_id.to_string()).or_default();
        if !cursor.loaded {
            if let Some(raw) = self.store.get(&self.cursor_key(tenant_id)).await? {
                let text =
                    String::from_utf8(raw).map_err(|e| MinerError::Serialization(e.to_string()))?;
                cursor.position = text.parse()?;
            }
            cursor.loaded = true;
        }

        let raw = self
            .store
            .stream_range_after(&self.stream_key(tenant_id), cursor.position, Some(max))
            .await?;
        cursor.fetched = raw.iter().map(|(id, _)| *id).collect();

        let mut deliveries = Vec::with_capacity(raw.len());
        for (id, payload) in raw {
            match serde_json::from_slice::<Relay>(&payload) {
                Ok(relay) => deliveries.push(Delivery {
                    delivery_id: id.to_string(),
                    relay,
                }),
                Err(e) => {
                    tracing::warn!(tenant_id, entry_id = %id, error = %e, "dropping undecodable relay");
                    cursor.acked.insert(id);
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, tenant_id: &str, delivery_ids: &[String]) -> MinerResult<()> {
        let mut cursors = self.cursors.lock().await;
        let cursor = cursors.entry(tenant_id.to_string()).or_default();
        for id in delivery_ids {
            cursor.acked.insert(id.parse()?);
        }

        let before = cursor.position;
        for id in &cursor.fetched {
            if !cursor.acked.contains(id) {
                break;
            }
            cursor.position = *id;
        }
        let position = cursor.position;
        cursor.acked.retain(|id| *id > position);

        if position > before {
            self.store
                .set(&self.cursor_key(tenant_id), position.to_string().into_bytes(), None)
                .await?;
            self.store
                .stream_trim_through(&self.stream_key(tenant_id), position)
                .await?;
        }
        Ok(())
    }
}
