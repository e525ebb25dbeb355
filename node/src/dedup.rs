// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Two-tier relay deduplication.
//!
//! L1 is a per-session local set capped at `local_cache_size`. Once full it
//! stops accepting entries instead of evicting, so recently marked digests
//! stay resident. L2 is a shared set per session with a TTL of
//! `ttl_blocks * block_time`, long enough to outlive the session window.
//! A local miss falls through to L2 and an L2 hit warms L1.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{MinerError, MinerResult};
use crate::metrics::{names, SharedMetrics};
use crate::store::SharedStore;

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub key_prefix: String,
    pub tenant_id: String,
    /// Per-session L1 capacity.
    pub local_cache_size: usize,
    pub ttl_blocks: u64,
    pub block_time: Duration,
    pub cleanup_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            key_prefix: "relaymint:dedup".to_string(),
            tenant_id: String::new(),
            local_cache_size: 10_000,
            ttl_blocks: 10,
            block_time: Duration::from_secs(6),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl DedupConfig {
    /// Lifetime of shared entries and of idle local caches.
    pub fn ttl(&self) -> Duration {
        let blocks = u32::try_from(self.ttl_blocks).unwrap_or(u32::MAX);
        self.block_time.saturating_mul(blocks)
    }
}

struct LocalSet {
    digests: HashSet<Vec<u8>>,
    last_used: Instant,
}

pub struct Deduplicator {
    config: DedupConfig,
    store: Arc<dyn SharedStore>,
    metrics: SharedMetrics,
    local: Mutex<HashMap<String, LocalSet>>,
    started: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl Deduplicator {
    pub fn new(config: DedupConfig, store: Arc<dyn SharedStore>, metrics: SharedMetrics) -> Self {
        Self {
            config,
            store,
            metrics,
            local: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            cleanup_task: Mutex::new(None),
        }
    }

    fn shared_key(&self, session_id: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, self.config.tenant_id, session_id)
    }

    fn ensure_open(&self) -> MinerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MinerError::Closed("deduplicator"))
        } else {
            Ok(())
        }
    }

    fn count(&self, name: &'static str, session_id: &str) {
        self.metrics.increment_counter(name, 1, &[("session_id", session_id)]);
    }

    fn error(&self, session_id: &str, operation: &'static str) {
        self.metrics.increment_counter(
            names::DEDUP_ERRORS,
            1,
            &[("session_id", session_id), ("operation", operation)],
        );
    }

    fn local_contains(&self, session_id: &str, digest: &[u8]) -> bool {
        let Ok(mut local) = self.local.lock() else {
            return false;
        };
        match local.get_mut(session_id) {
            Some(set) if set.digests.contains(digest) => {
                set.last_used = Instant::now();
                true
            }
            _ => false,
        }
    }

    fn local_insert<'a, I>(&self, session_id: &str, digests: I)
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let Ok(mut local) = self.local.lock() else {
            return;
        };
        let set = local
            .entry(session_id.to_string())
            .or_insert_with(|| LocalSet {
                digests: HashSet::new(),
                last_used: Instant::now(),
            });
        set.last_used = Instant::now();
        for digest in digests {
            if set.digests.len() >= self.config.local_cache_size {
                break;
            }
            set.digests.insert(digest.to_vec());
        }
    }

    pub async fn is_duplicate(&self, relay_digest: &[u8], session_id: &str) -> MinerResult<bool> {
        self.ensure_open()?;
        if self.local_contains(session_id, relay_digest) {
            self.count(names::DEDUP_LOCAL_HITS, session_id);
            return Ok(true);
        }

        let member = hex::encode(relay_digest);
        let found = match self
            .store
            .set_contains(&self.shared_key(session_id), &member)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                self.error(session_id, "check");
                return Err(e.into());
            }
        };

        if found {
            self.local_insert(session_id, [relay_digest]);
            self.count(names::DEDUP_SHARED_HITS, session_id);
        } else {
            self.count(names::DEDUP_MISSES, session_id);
        }
        Ok(found)
    }

    pub async fn mark_processed(&self, relay_digest: &[u8], session_id: &str) -> MinerResult<()> {
        self.mark_processed_batch(&[relay_digest.to_vec()], session_id)
            .await
    }

    pub async fn mark_processed_batch(
        &self,
        relay_digests: &[Vec<u8>],
        session_id: &str,
    ) -> MinerResult<()> {
        self.ensure_open()?;
        if relay_digests.is_empty() {
            return Ok(());
        }
        self.local_insert(session_id, relay_digests.iter().map(Vec::as_slice));

        let key = self.shared_key(session_id);
        let members: Vec<String> = relay_digests.iter().map(hex::encode).collect();
        let result = async {
            self.store.set_add(&key, &members).await?;
            self.store.expire(&key, self.config.ttl()).await
        }
        .await;
        if let Err(e) = result {
            self.error(session_id, "mark");
            return Err(e.into());
        }
        self.metrics.increment_counter(
            names::DEDUP_MARKED,
            relay_digests.len() as u64,
            &[("session_id", session_id)],
        );
        Ok(())
    }

    /// Forget a finished session in both tiers.
    pub async fn cleanup_session(&self, session_id: &str) -> MinerResult<()> {
        self.ensure_open()?;
        if let Ok(mut local) = self.local.lock() {
            local.remove(session_id);
        }
        if let Err(e) = self.store.delete(&[self.shared_key(session_id)]).await {
            self.error(session_id, "cleanup");
            return Err(e.into());
        }
        Ok(())
    }

    /// Number of sessions with a local cache.
    pub fn local_sessions(&self) -> usize {
        self.local.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn evict_idle(&self) {
        let ttl = self.config.ttl();
        let Ok(mut local) = self.local.lock() else {
            return;
        };
        let before = local.len();
        local.retain(|_, set| set.last_used.elapsed() < ttl);
        let evicted = before - local.len();
        if evicted > 0 {
            tracing::debug!(tenant = %self.config.tenant_id, evicted, "evicted idle dedup caches");
        }
    }

    pub fn start(self: &Arc<Self>) -> MinerResult<()> {
        self.ensure_open()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MinerError::AlreadyStarted("deduplicator"));
        }
        let dedup = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dedup.config.cleanup_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = dedup.cancel.cancelled() => return,
                    _ = ticker.tick() => dedup.evict_idle(),
                }
            }
        });
        if let Ok(mut slot) = self.cleanup_task.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let handle = self.cleanup_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Ok(mut local) = self.local.lock() {
            local.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use crate::store::MemoryStore;

    fn dedup_on(store: Arc<MemoryStore>, cache: usize) -> (Deduplicator, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let config = DedupConfig {
            tenant_id: "tenant-a".into(),
            local_cache_size: cache,
            ..DedupConfig::default()
        };
        (Deduplicator::new(config, store, metrics.clone()), metrics)
    }

    #[test]
    fn test_default_ttl_is_one_minute() {
        assert_eq!(DedupConfig::default().ttl(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_first_check_misses_then_hits() {
        let (dedup, metrics) = dedup_on(Arc::new(MemoryStore::new()), 100);
        assert!(!dedup.is_duplicate(b"r1", "s1").await.unwrap());
        dedup.mark_processed(b"r1", "s1").await.unwrap();
        assert!(dedup.is_duplicate(b"r1", "s1").await.unwrap());
        assert!(dedup.is_duplicate(b"r1", "s1").await.unwrap());
        assert_eq!(metrics.counter(names::DEDUP_LOCAL_HITS, &[("session_id", "s1")]), 2);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let (dedup, _) = dedup_on(Arc::new(MemoryStore::new()), 100);
        dedup.mark_processed(b"r1", "s1").await.unwrap();
        assert!(!dedup.is_duplicate(b"r1", "s2").await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_tier_seen_by_other_replica() {
        let store = Arc::new(MemoryStore::new());
        let (a, _) = dedup_on(store.clone(), 100);
        let (b, metrics) = dedup_on(store, 100);
        a.mark_processed_batch(&[b"r1".to_vec(), b"r2".to_vec()], "s1")
            .await
            .unwrap();
        assert!(b.is_duplicate(b"r2", "s1").await.unwrap());
        assert!(b.is_duplicate(b"r2", "s1").await.unwrap());
        assert_eq!(metrics.counter(names::DEDUP_SHARED_HITS, &[("session_id", "s1")]), 1);
        assert_eq!(metrics.counter(names::DEDUP_LOCAL_HITS, &[("session_id", "s1")]), 1);
    }

    #[tokio::test]
    async fn test_full_local_cache_still_answers_from_shared() {
        let (dedup, metrics) = dedup_on(Arc::new(MemoryStore::new()), 1);
        dedup.mark_processed(b"r1", "s1").await.unwrap();
        dedup.mark_processed(b"r2", "s1").await.unwrap();
        assert!(dedup.is_duplicate(b"r1", "s1").await.unwrap());
        assert!(dedup.is_duplicate(b"r2", "s1").await.unwrap());
        assert_eq!(metrics.counter(names::DEDUP_SHARED_HITS, &[("session_id", "s1")]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let store = Arc::new(MemoryStore::new());
        let (writer, _) = dedup_on(store.clone(), 100);
        let (reader, _) = dedup_on(store, 100);
        writer.mark_processed(b"r1", "s1").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!reader.is_duplicate(b"r1", "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_session_forgets_everything() {
        let (dedup, _) = dedup_on(Arc::new(MemoryStore::new()), 100);
        dedup.mark_processed(b"r1", "s1").await.unwrap();
        dedup.cleanup_session("s1").await.unwrap();
        assert_eq!(dedup.local_sessions(), 0);
        assert!(!dedup.is_duplicate(b"r1", "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_and_counts() {
        let store = Arc::new(MemoryStore::new());
        let (dedup, metrics) = dedup_on(store.clone(), 100);
        store.set_offline(true);
        assert!(dedup.is_duplicate(b"r1", "s1").await.is_err());
        assert_eq!(metrics.counter_total(names::DEDUP_ERRORS), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_loop_evicts_idle_caches() {
        let (dedup, _) = dedup_on(Arc::new(MemoryStore::new()), 100);
        let dedup = Arc::new(dedup);
        dedup.mark_processed(b"r1", "s1").await.unwrap();
        dedup.start().unwrap();
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(dedup.local_sessions(), 0);
        dedup.close().await;
    }
}
