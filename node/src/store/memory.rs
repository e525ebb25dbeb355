// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! In-process [`SharedStore`].
//!
//! Used for tests and single-process deployments. TTLs are evaluated lazily
//! against `tokio::time::Instant`, so paused-time tests observe expiry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use super::{BatchOp, EntryId, Guard, SharedStore, StoreError, StoreResult};

const CHANNEL_CAPACITY: usize = 256;

struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<EntryId, Vec<u8>>,
    last_id: EntryId,
}

impl Stream {
    fn next_id(&mut self) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let id = if now_ms > self.last_id.ms {
            EntryId::new(now_ms, 0)
        } else {
            self.last_id.successor()
        };
        self.last_id = id;
        id
    }

    fn push(&mut self, payload: Vec<u8>, max_len: Option<u64>) -> EntryId {
        let id = self.next_id();
        self.entries.insert(id, payload);
        if let Some(max_len) = max_len {
            while self.entries.len() as u64 > max_len {
                self.entries.pop_first();
            }
        }
        id
    }
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Stream>,
    values: HashMap<String, Expiring<Vec<u8>>>,
    sets: HashMap<String, Expiring<HashSet<String>>>,
    channels: HashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl Inner {
    fn value(&mut self, key: &str) -> Option<&mut Expiring<Vec<u8>>> {
        if self.values.get(key).map_or(false, |v| v.is_expired()) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }

    fn set(&mut self, key: &str) -> Option<&mut Expiring<HashSet<String>>> {
        if self.sets.get(key).map_or(false, |v| v.is_expired()) {
            self.sets.remove(key);
        }
        self.sets.get_mut(key)
    }

    fn delete(&mut self, key: &str) -> bool {
        let live_value = self.value(key).is_some();
        let live_set = self.set(key).is_some();
        let stream = self.streams.remove(key).is_some();
        self.values.remove(key);
        self.sets.remove(key);
        live_value || live_set || stream
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        let at = Some(Instant::now() + ttl);
        if let Some(v) = self.value(key) {
            v.expires_at = at;
            return true;
        }
        if let Some(s) = self.set(key) {
            s.expires_at = at;
            return true;
        }
        false
    }

    fn apply(&mut self, op: BatchOp) {
        match op {
            BatchOp::Set { key, value, ttl } => {
                self.values.insert(key, Expiring::new(value, ttl));
            }
            BatchOp::Del { key } => {
                self.delete(&key);
            }
            BatchOp::SetAdd { key, member } => {
                self.add_members(&key, std::slice::from_ref(&member));
            }
            BatchOp::SetRemove { key, member } => {
                self.remove_members(&key, std::slice::from_ref(&member));
            }
            BatchOp::Expire { key, ttl } => {
                self.expire(&key, ttl);
            }
        }
    }

    fn add_members(&mut self, key: &str, members: &[String]) -> u64 {
        if self.set(key).is_none() {
            self.sets.insert(key.to_string(), Expiring::new(HashSet::new(), None));
        }
        let set = match self.sets.get_mut(key) {
            Some(set) => set,
            None => return 0,
        };
        members
            .iter()
            .filter(|m| set.value.insert((*m).clone()))
            .count() as u64
    }

    fn remove_members(&mut self, key: &str, members: &[String]) -> u64 {
        let Some(set) = self.set(key) else {
            return 0;
        };
        let removed = members.iter().filter(|m| set.value.remove(*m)).count() as u64;
        if set.value.is_empty() {
            self.sets.remove(key);
        }
        removed
    }
}

/// In-memory store. Cloning is not supported; share it behind an `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every operation fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn stream_append(
        &self,
        key: &str,
        payload: Vec<u8>,
        max_len: Option<u64>,
    ) -> StoreResult<EntryId> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        Ok(inner
            .streams
            .entry(key.to_string())
            .or_default()
            .push(payload, max_len))
    }

    async fn stream_append_batch(
        &self,
        key: &str,
        payloads: Vec<Vec<u8>>,
        max_len: Option<u64>,
    ) -> StoreResult<Vec<EntryId>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let stream = inner.streams.entry(key.to_string()).or_default();
        Ok(payloads
            .into_iter()
            .map(|payload| stream.push(payload, max_len))
            .collect())
    }

    async fn stream_range_after(
        &self,
        key: &str,
        after: EntryId,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(EntryId, Vec<u8>)>> {
        self.check()?;
        let inner = self.inner.lock().await;
        let Some(stream) = inner.streams.get(key) else {
            return Ok(Vec::new());
        };
        let range = stream
            .entries
            .range((Bound::Excluded(after), Bound::Unbounded))
            .map(|(id, payload)| (*id, payload.clone()));
        Ok(match limit {
            Some(limit) => range.take(limit).collect(),
            None => range.collect(),
        })
    }

    async fn stream_trim_through(&self, key: &str, through: EntryId) -> StoreResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let Some(stream) = inner.streams.get_mut(key) else {
            return Ok(0);
        };
        let keep = stream.entries.split_off(&through.successor());
        let removed = stream.entries.len() as u64;
        stream.entries = keep;
        Ok(removed)
    }

    async fn stream_len(&self, key: &str) -> StoreResult<u64> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .get(key)
            .map_or(0, |stream| stream.entries.len() as u64))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.value(key).map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        inner.values.insert(key.to_string(), Expiring::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        if inner.value(key).is_some() {
            return Ok(false);
        }
        inner
            .values
            .insert(key.to_string(), Expiring::new(value, Some(ttl)));
        Ok(true)
    }

    async fn expire_if_equals(&self, key: &str, owner: &[u8], ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        match inner.value(key) {
            Some(v) if v.value == owner => {
                v.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_equals(&self, key: &str, owner: &[u8]) -> StoreResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let owned = inner.value(key).map_or(false, |v| v.value == owner);
        if owned {
            inner.values.remove(key);
        }
        Ok(owned)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        Ok(keys.iter().filter(|key| inner.delete(key)).count() as u64)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> StoreResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.add_members(key, members))
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> StoreResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.remove_members(key, members))
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let mut members: Vec<String> = inner
            .set(key)
            .map(|s| s.value.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.set(key).map_or(false, |s| s.value.contains(member)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.expire(key, ttl))
    }

    async fn exec_batch(&self, guard: Option<Guard>, ops: Vec<BatchOp>) -> StoreResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        if let Some(guard) = guard {
            let current = inner.value(&guard.key).map(|v| v.value.clone());
            if current != guard.expected {
                return Ok(false);
            }
        }
        for op in ops {
            inner.apply(op);
        }
        Ok(true)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> StoreResult<usize> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .channels
            .get(channel)
            .and_then(|tx| tx.send(payload).ok())
            .unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<broadcast::Receiver<Vec<u8>>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let tx = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(tx.subscribe())
    }
}
