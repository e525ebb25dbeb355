// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Shared Store Abstraction
//!
//! Every piece of state that must survive a replica crash or be visible to
//! other replicas lives behind [`SharedStore`]: WAL streams, session
//! snapshots and their indices, dedup sets, leader leases and the tenant
//! registry.
//!
//! # Model
//! - Streams: append-only, store-assigned [`EntryId`]s, totally ordered per key
//! - Key/value: opaque bytes with optional TTL
//! - Sets: string members with optional TTL
//! - Batches: all-or-nothing, optionally guarded by a compare-and-set
//! - Channels: fire-and-forget pub/sub

pub mod memory;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::MemoryStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed entry id: {0}")]
    InvalidEntryId(String),

    #[error("wrong value type at key {0}")]
    WrongType(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Stream entry id: milliseconds plus a per-millisecond sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// Sorts before every assigned id; "read from the start".
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Smallest id strictly greater than `self`.
    pub fn successor(&self) -> EntryId {
        match self.seq.checked_add(1) {
            Some(seq) => EntryId { ms: self.ms, seq },
            None => EntryId { ms: self.ms + 1, seq: 0 },
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == "0" {
            return Ok(EntryId::ZERO);
        }
        let (ms, seq) = s.split_once('-').unwrap_or((s, "0"));
        let ms = ms.parse().map_err(|_| StoreError::InvalidEntryId(s.to_string()))?;
        let seq = seq.parse().map_err(|_| StoreError::InvalidEntryId(s.to_string()))?;
        Ok(EntryId { ms, seq })
    }
}

impl Serialize for EntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One command inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// Precondition for a batch: the value at `key` must equal `expected`
/// (`None` = key absent) or the batch is not applied.
#[derive(Debug, Clone)]
pub struct Guard {
    pub key: String,
    pub expected: Option<Vec<u8>>,
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    // --- streams ---

    /// Append to a stream. With `max_len`, the oldest entries beyond it are dropped.
    async fn stream_append(
        &self,
        key: &str,
        payload: Vec<u8>,
        max_len: Option<u64>,
    ) -> StoreResult<EntryId>;

    /// Append several payloads in one round trip; ids are returned in order.
    async fn stream_append_batch(
        &self,
        key: &str,
        payloads: Vec<Vec<u8>>,
        max_len: Option<u64>,
    ) -> StoreResult<Vec<EntryId>>;

    /// Entries with id strictly greater than `after`, ascending.
    async fn stream_range_after(
        &self,
        key: &str,
        after: EntryId,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(EntryId, Vec<u8>)>>;

    /// Remove entries with id `<= through`. Returns the number removed.
    async fn stream_trim_through(&self, key: &str, through: EntryId) -> StoreResult<u64>;

    async fn stream_len(&self, key: &str) -> StoreResult<u64>;

    // --- key/value ---

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()>;

    /// Set only if the key does not exist. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<bool>;

    /// Extend the TTL only if the current value equals `owner`.
    async fn expire_if_equals(&self, key: &str, owner: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// Delete only if the current value equals `owner`.
    async fn delete_if_equals(&self, key: &str, owner: &[u8]) -> StoreResult<bool>;

    /// Delete keys of any type. Returns how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    // --- sets ---

    async fn set_add(&self, key: &str, members: &[String]) -> StoreResult<u64>;

    async fn set_remove(&self, key: &str, members: &[String]) -> StoreResult<u64>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    // --- transactions ---

    /// Apply `ops` atomically. Returns `false` without applying anything when
    /// the guard does not hold.
    async fn exec_batch(&self, guard: Option<Guard>, ops: Vec<BatchOp>) -> StoreResult<bool>;

    // --- pub/sub ---

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> StoreResult<usize>;

    async fn subscribe(&self, channel: &str) -> StoreResult<broadcast::Receiver<Vec<u8>>>;
}
