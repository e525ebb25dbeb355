// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Miner configuration.
//!
//! [`MinerConfig`] is the serde-facing document (JSON); every field has a
//! default so an empty object is a valid config. Components take their own
//! typed configs, projected per tenant by the `*_config` methods.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dedup::DedupConfig;
use crate::ingest::IngestConfig;
use crate::leader::LeaderConfig;
use crate::lifecycle::LifecycleConfig;
use crate::recovery::RecoveryConfig;
use crate::session_store::SessionStoreConfig;
use crate::settlement::{BatchConfig, SettlementConfig};
use crate::tenant::drain::DrainConfig;
use crate::tenant::registry::RegistryConfig;
use crate::timing::TimingConfig;
use crate::wal::WalConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    /// Identifies this replica in leases and the registry.
    pub instance_id: String,
    /// Root of every shared-store key written by the miner.
    pub key_prefix: String,
    pub wal: WalSection,
    pub sessions: SessionSection,
    pub dedup: DedupSection,
    pub leader: LeaderSection,
    pub lifecycle: LifecycleSection,
    pub settlement: SettlementSection,
    pub drain: DrainSection,
    pub ingest: IngestSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalSection {
    pub max_len: u64,
    pub trim_interval_secs: u64,
    pub checkpoint_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSection {
    pub local_cache_size: usize,
    pub ttl_blocks: u64,
    pub block_time_secs: u64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderSection {
    pub enabled: bool,
    pub lock_ttl_ms: u64,
    pub heartbeat_ms: u64,
    pub acquire_retry_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    pub poll_interval_ms: u64,
    pub claim_submission_buffer: u64,
    pub proof_submission_buffer: u64,
    pub max_concurrent_transitions: usize,
    pub recovery_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementSection {
    pub claim_retry_attempts: u32,
    pub claim_retry_delay_ms: u64,
    pub proof_retry_attempts: u32,
    pub proof_retry_delay_ms: u64,
    pub height_poll_interval_ms: u64,
    pub block_time_secs: u64,
    pub batching: Option<BatchingSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingSection {
    pub max_per_batch: usize,
    pub batch_wait_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainSection {
    pub timeout_secs: u64,
    pub check_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub batch_size: usize,
    pub idle_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("relaymint-{}", std::process::id()),
            key_prefix: "relaymint".to_string(),
            wal: WalSection::default(),
            sessions: SessionSection::default(),
            dedup: DedupSection::default(),
            leader: LeaderSection::default(),
            lifecycle: LifecycleSection::default(),
            settlement: SettlementSection::default(),
            drain: DrainSection::default(),
            ingest: IngestSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl Default for WalSection {
    fn default() -> Self {
        Self {
            max_len: 100_000,
            trim_interval_secs: 300,
            checkpoint_ttl_secs: 24 * 3600,
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self { ttl_secs: 24 * 3600 }
    }
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            local_cache_size: 10_000,
            ttl_blocks: 10,
            block_time_secs: 6,
            cleanup_interval_secs: 60,
        }
    }
}

impl Default for LeaderSection {
    fn default() -> Self {
        Self {
            enabled: false,
            lock_ttl_ms: 30_000,
            heartbeat_ms: 10_000,
            acquire_retry_ms: 5_000,
        }
    }
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 6_000,
            claim_submission_buffer: 2,
            proof_submission_buffer: 2,
            max_concurrent_transitions: 10,
            recovery_timeout_secs: 300,
        }
    }
}

impl Default for SettlementSection {
    fn default() -> Self {
        Self {
            claim_retry_attempts: 3,
            claim_retry_delay_ms: 2_000,
            proof_retry_attempts: 3,
            proof_retry_delay_ms: 2_000,
            height_poll_interval_ms: 1_000,
            block_time_secs: 6,
            batching: None,
        }
    }
}

impl Default for BatchingSection {
    fn default() -> Self {
        Self {
            max_per_batch: 10,
            batch_wait_ms: 5_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
        }
    }
}

impl Default for DrainSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            check_interval_ms: 5_000,
        }
    }
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_backoff_ms: 500,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "relaymint_node=info".to_string(),
        }
    }
}

impl MinerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: MinerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.instance_id.is_empty() {
            return invalid("instance_id must not be empty");
        }
        if self.key_prefix.is_empty() {
            return invalid("key_prefix must not be empty");
        }
        if self.sessions.ttl_secs == 0 {
            return invalid("sessions.ttl_secs must be positive");
        }
        if self.dedup.ttl_blocks == 0 || self.dedup.block_time_secs == 0 {
            return invalid("dedup ttl must be positive");
        }
        if self.leader.lock_ttl_ms == 0 {
            return invalid("leader.lock_ttl_ms must be positive");
        }
        if self.leader.heartbeat_ms >= self.leader.lock_ttl_ms {
            return invalid("leader.heartbeat_ms must be shorter than leader.lock_ttl_ms");
        }
        if self.lifecycle.max_concurrent_transitions == 0 {
            return invalid("lifecycle.max_concurrent_transitions must be positive");
        }
        if self.settlement.claim_retry_attempts == 0 || self.settlement.proof_retry_attempts == 0 {
            return invalid("settlement retry attempts must be positive");
        }
        if let Some(batching) = &self.settlement.batching {
            if batching.max_per_batch == 0 || batching.retry_attempts == 0 {
                return invalid("settlement.batching limits must be positive");
            }
        }
        if self.ingest.batch_size == 0 {
            return invalid("ingest.batch_size must be positive");
        }
        Ok(())
    }

    fn prefixed(&self, component: &str) -> String {
        format!("{}:{}", self.key_prefix, component)
    }

    pub fn wal_config(&self, tenant_id: &str) -> WalConfig {
        WalConfig {
            key_prefix: self.prefixed("wal"),
            tenant_id: tenant_id.to_string(),
            max_len: self.wal.max_len,
            trim_interval: Duration::from_secs(self.wal.trim_interval_secs),
            checkpoint_ttl: Duration::from_secs(self.wal.checkpoint_ttl_secs),
        }
    }

    pub fn session_store_config(&self, tenant_id: &str) -> SessionStoreConfig {
        SessionStoreConfig {
            key_prefix: self.prefixed("sessions"),
            tenant_id: tenant_id.to_string(),
            session_ttl: Duration::from_secs(self.sessions.ttl_secs),
        }
    }

    pub fn dedup_config(&self, tenant_id: &str) -> DedupConfig {
        DedupConfig {
            key_prefix: self.prefixed("dedup"),
            tenant_id: tenant_id.to_string(),
            local_cache_size: self.dedup.local_cache_size,
            ttl_blocks: self.dedup.ttl_blocks,
            block_time: Duration::from_secs(self.dedup.block_time_secs),
            cleanup_interval: Duration::from_secs(self.dedup.cleanup_interval_secs),
        }
    }

    pub fn leader_config(&self, tenant_id: &str) -> LeaderConfig {
        LeaderConfig {
            key_prefix: self.prefixed("leader"),
            identity: tenant_id.to_string(),
            instance_id: self.instance_id.clone(),
            lock_ttl: Duration::from_millis(self.leader.lock_ttl_ms),
            heartbeat_interval: Duration::from_millis(self.leader.heartbeat_ms),
            acquire_retry_interval: Duration::from_millis(self.leader.acquire_retry_ms),
        }
    }

    pub fn recovery_config(&self, tenant_id: &str) -> RecoveryConfig {
        RecoveryConfig {
            tenant_id: tenant_id.to_string(),
            timeout: Duration::from_secs(self.lifecycle.recovery_timeout_secs),
        }
    }

    pub fn lifecycle_config(&self, tenant_id: &str) -> LifecycleConfig {
        LifecycleConfig {
            tenant_id: tenant_id.to_string(),
            poll_interval: Duration::from_millis(self.lifecycle.poll_interval_ms),
            claim_submission_buffer: self.lifecycle.claim_submission_buffer,
            proof_submission_buffer: self.lifecycle.proof_submission_buffer,
            max_concurrent_transitions: self.lifecycle.max_concurrent_transitions,
        }
    }

    pub fn timing_config(&self) -> TimingConfig {
        TimingConfig {
            poll_interval: Duration::from_millis(self.settlement.height_poll_interval_ms),
            block_time: Duration::from_secs(self.settlement.block_time_secs),
        }
    }

    pub fn settlement_config(&self, tenant_id: &str) -> SettlementConfig {
        SettlementConfig {
            tenant_id: tenant_id.to_string(),
            claim_retry_attempts: self.settlement.claim_retry_attempts,
            claim_retry_delay: Duration::from_millis(self.settlement.claim_retry_delay_ms),
            proof_retry_attempts: self.settlement.proof_retry_attempts,
            proof_retry_delay: Duration::from_millis(self.settlement.proof_retry_delay_ms),
            claim_submission_buffer: self.lifecycle.claim_submission_buffer,
            proof_submission_buffer: self.lifecycle.proof_submission_buffer,
        }
    }

    pub fn batch_config(&self) -> Option<BatchConfig> {
        self.settlement.batching.as_ref().map(|b| BatchConfig {
            max_per_batch: b.max_per_batch,
            batch_wait: Duration::from_millis(b.batch_wait_ms),
            retry_attempts: b.retry_attempts,
            retry_delay: Duration::from_millis(b.retry_delay_ms),
            ..BatchConfig::default()
        })
    }

    pub fn drain_config(&self) -> DrainConfig {
        DrainConfig {
            timeout: Duration::from_secs(self.drain.timeout_secs),
            check_interval: Duration::from_millis(self.drain.check_interval_ms),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            key_prefix: self.prefixed("tenants"),
            index_key: format!("{}:tenants:index", self.key_prefix),
            event_channel: format!("{}:events:tenant_update", self.key_prefix),
        }
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            batch_size: self.ingest.batch_size,
            idle_backoff: Duration::from_millis(self.ingest.idle_backoff_ms),
        }
    }
}
