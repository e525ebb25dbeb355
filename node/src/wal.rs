// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Write-Ahead Log for relay updates
//!
//! Every relay is appended to a per-session stream in the shared store before
//! it is folded into the session tree. After a failover the new owner replays
//! the stream from the session checkpoint to rebuild the tree.
//!
//! # Record format
//! ```text
//! [version: u8][crc32(body): u32 LE][body: bincode(WalEntry)]
//! ```
//! The entry id is assigned by the store and is not part of the body.
//!
//! # Guarantees
//! - Entries of one session are totally ordered by id
//! - `read_from(after)` is exclusive of `after`; `EntryId::ZERO` reads everything
//! - Trimming only removes entries at or before the checkpoint, so reads
//!   relative to the checkpoint are unaffected by it
//! - Append failures propagate: the caller must retry or leave the relay
//!   unacknowledged upstream

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::{MinerError, MinerResult};
use crate::metrics::{names, SharedMetrics};
use crate::store::{EntryId, SharedStore};

const WAL_VERSION: u8 = 1;
const HEADER_LEN: usize = 5;

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub key_prefix: String,
    pub tenant_id: String,
    /// Approximate cap per session stream.
    pub max_len: u64,
    pub trim_interval: Duration,
    pub checkpoint_ttl: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            key_prefix: "relaymint:wal".to_string(),
            tenant_id: String::new(),
            max_len: 100_000,
            trim_interval: Duration::from_secs(300),
            checkpoint_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// One relay update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    #[serde(skip)]
    pub id: EntryId,
    pub session_id: String,
    pub relay_digest: Vec<u8>,
    pub relay_payload: Vec<u8>,
    pub weight: u64,
    pub tenant_id: String,
    pub timestamp_ms: u64,
}

fn encode_entry(entry: &WalEntry) -> MinerResult<Vec<u8>> {
    let body = bincode::serde::encode_to_vec(entry, bincode::config::standard())
        .map_err(|e| MinerError::Serialization(e.to_string()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(WAL_VERSION);
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_entry(id: EntryId, bytes: &[u8]) -> Result<WalEntry, String> {
    if bytes.len() < HEADER_LEN {
        return Err("truncated record".into());
    }
    if bytes[0] != WAL_VERSION {
        return Err(format!("unsupported version {}", bytes[0]));
    }
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[1..HEADER_LEN]);
    let body = &bytes[HEADER_LEN..];
    if crc32fast::hash(body) != u32::from_le_bytes(crc) {
        return Err("checksum mismatch".into());
    }
    let (mut entry, _): (WalEntry, usize) =
        bincode::serde::decode_from_slice(body, bincode::config::standard())
            .map_err(|e| e.to_string())?;
    entry.id = id;
    Ok(entry)
}

pub struct Wal {
    config: WalConfig,
    store: Arc<dyn SharedStore>,
    metrics: SharedMetrics,
    /// Sessions checkpointed by this instance; visited by the trim loop.
    tracked: Mutex<HashSet<String>>,
    started: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    trim_task: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    pub fn new(config: WalConfig, store: Arc<dyn SharedStore>, metrics: SharedMetrics) -> Self {
        Self {
            config,
            store,
            metrics,
            tracked: Mutex::new(HashSet::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            trim_task: Mutex::new(None),
        }
    }

    fn stream_key(&self, session_id: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, self.config.tenant_id, session_id)
    }

    fn checkpoint_key(&self, session_id: &str) -> String {
        format!(
            "{}:{}:{}:checkpoint",
            self.config.key_prefix, self.config.tenant_id, session_id
        )
    }

    fn ensure_open(&self) -> MinerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MinerError::Closed("wal"))
        } else {
            Ok(())
        }
    }

    fn labels<'a>(&'a self, session_id: &'a str) -> [(&'static str, &'a str); 2] {
        [("tenant", self.config.tenant_id.as_str()), ("session_id", session_id)]
    }

    fn stamp(&self, session_id: &str, entry: &WalEntry) -> WalEntry {
        let mut record = entry.clone();
        record.session_id = session_id.to_string();
        record.tenant_id = self.config.tenant_id.clone();
        record
    }

    /// Append one entry and return its store-assigned id.
    pub async fn append(&self, session_id: &str, entry: &WalEntry) -> MinerResult<EntryId> {
        self.ensure_open()?;
        let bytes = encode_entry(&self.stamp(session_id, entry))?;
        let id = self
            .store
            .stream_append(&self.stream_key(session_id), bytes, Some(self.config.max_len))
            .await?;
        self.metrics
            .increment_counter(names::WAL_APPENDS, 1, &self.labels(session_id));
        Ok(id)
    }

    /// Append several entries in one round trip.
    pub async fn append_batch(
        &self,
        session_id: &str,
        entries: &[WalEntry],
    ) -> MinerResult<Vec<EntryId>> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let payloads = entries
            .iter()
            .map(|entry| encode_entry(&self.stamp(session_id, entry)))
            .collect::<MinerResult<Vec<_>>>()?;
        let ids = self
            .store
            .stream_append_batch(&self.stream_key(session_id), payloads, Some(self.config.max_len))
            .await?;
        self.metrics.increment_counter(
            names::WAL_APPENDS,
            ids.len() as u64,
            &self.labels(session_id),
        );
        Ok(ids)
    }

    /// Entries strictly after `after`, in id order. Corrupt records are
    /// skipped and counted.
    pub async fn read_from(&self, session_id: &str, after: EntryId) -> MinerResult<Vec<WalEntry>> {
        self.ensure_open()?;
        let raw = self
            .store
            .stream_range_after(&self.stream_key(session_id), after, None)
            .await?;

        let mut entries = Vec::with_capacity(raw.len());
        for (id, bytes) in raw {
            match decode_entry(id, &bytes) {
                Ok(entry) => entries.push(entry),
                Err(reason) => {
                    tracing::warn!(
                        tenant = %self.config.tenant_id,
                        session_id,
                        entry_id = %id,
                        %reason,
                        "skipping corrupt WAL record"
                    );
                    self.metrics
                        .increment_counter(names::WAL_CORRUPT, 1, &self.labels(session_id));
                }
            }
        }

        self.metrics.increment_counter(
            names::WAL_REPLAYS,
            entries.len() as u64,
            &self.labels(session_id),
        );
        Ok(entries)
    }

    /// Record that everything up to and including `last_id` is folded into
    /// the persisted snapshot.
    pub async fn checkpoint(&self, session_id: &str, last_id: EntryId) -> MinerResult<()> {
        self.ensure_open()?;
        self.store
            .set(
                &self.checkpoint_key(session_id),
                last_id.to_string().into_bytes(),
                Some(self.config.checkpoint_ttl),
            )
            .await?;
        if let Ok(mut tracked) = self.tracked.lock() {
            tracked.insert(session_id.to_string());
        }
        self.metrics
            .increment_counter(names::WAL_CHECKPOINTS, 1, &self.labels(session_id));
        tracing::debug!(tenant = %self.config.tenant_id, session_id, checkpoint = %last_id, "WAL checkpoint");
        Ok(())
    }

    /// Last checkpoint, or `EntryId::ZERO` if none was recorded.
    pub async fn get_checkpoint(&self, session_id: &str) -> MinerResult<EntryId> {
        self.ensure_open()?;
        match self.store.get(&self.checkpoint_key(session_id)).await? {
            None => Ok(EntryId::ZERO),
            Some(raw) => {
                let text = String::from_utf8(raw)
                    .map_err(|e| MinerError::Serialization(e.to_string()))?;
                Ok(text.parse()?)
            }
        }
    }

    /// Drop entries at or before the checkpoint. Returns how many were removed.
    pub async fn trim(&self, session_id: &str) -> MinerResult<u64> {
        let checkpoint = self.get_checkpoint(session_id).await?;
        if checkpoint.is_zero() {
            return Ok(0);
        }
        let removed = self
            .store
            .stream_trim_through(&self.stream_key(session_id), checkpoint)
            .await?;
        if removed > 0 {
            tracing::debug!(tenant = %self.config.tenant_id, session_id, removed, "trimmed WAL");
        }
        Ok(removed)
    }

    pub async fn size(&self, session_id: &str) -> MinerResult<u64> {
        self.ensure_open()?;
        let len = self.store.stream_len(&self.stream_key(session_id)).await?;
        self.metrics
            .set_gauge(names::WAL_SIZE, len as f64, &self.labels(session_id));
        Ok(len)
    }

    /// Remove the stream and checkpoint of a finished session.
    pub async fn delete_session(&self, session_id: &str) -> MinerResult<()> {
        self.ensure_open()?;
        self.store
            .delete(&[self.stream_key(session_id), self.checkpoint_key(session_id)])
            .await?;
        if let Ok(mut tracked) = self.tracked.lock() {
            tracked.remove(session_id);
        }
        Ok(())
    }

    /// Spawn the periodic trim loop.
    pub fn start(self: &Arc<Self>) -> MinerResult<()> {
        self.ensure_open()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MinerError::AlreadyStarted("wal"));
        }
        let wal = Arc::clone(self);
        let handle = tokio::spawn(async move { wal.trim_loop().await });
        if let Ok(mut slot) = self.trim_task.lock() {
            *slot = Some(handle);
        }
        tracing::info!(tenant = %self.config.tenant_id, "WAL started");
        Ok(())
    }

    async fn trim_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.trim_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let sessions: Vec<String> = match self.tracked.lock() {
                Ok(tracked) => tracked.iter().cloned().collect(),
                Err(_) => return,
            };
            for session_id in sessions {
                if let Err(e) = self.trim(&session_id).await {
                    tracing::warn!(tenant = %self.config.tenant_id, %session_id, error = %e, "WAL trim failed");
                }
            }
        }
    }

    /// Stop the trim loop and reject further calls. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let handle = self.trim_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!(tenant = %self.config.tenant_id, "WAL closed");
    }
}
