// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Shared tenant registry.
//!
//! Every replica publishes the tenants it manages so read-side components
//! (the ingestion proxy, dashboards) can discover them without talking to the
//! miner. Records are JSON under `{key_prefix}:{tenant}`, listed by an index
//! set, and each change is announced on `event_channel`.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;

use crate::errors::MinerResult;
use crate::metrics::{names, SharedMetrics};
use crate::session_store::now_ms;
use crate::store::{BatchOp, SharedStore};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub key_prefix: String,
    pub index_key: String,
    pub event_channel: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key_prefix: "relaymint:tenants".to_string(),
            index_key: "relaymint:tenants:index".to_string(),
            event_channel: "relaymint:events:tenant_update".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Draining,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub status: TenantStatus,
    pub services: Vec<String>,
    pub instance_id: String,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryAction {
    Add,
    Update,
    Draining,
    Remove,
}

impl RegistryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryAction::Add => "add",
            RegistryAction::Update => "update",
            RegistryAction::Draining => "draining",
            RegistryAction::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub action: RegistryAction,
    pub tenant_id: String,
    /// Absent for removals.
    pub record: Option<TenantRecord>,
}

pub type RegistryEvents = Pin<Box<dyn Stream<Item = RegistryEvent> + Send>>;

pub struct TenantRegistry {
    config: RegistryConfig,
    store: Arc<dyn SharedStore>,
    metrics: SharedMetrics,
}

impl TenantRegistry {
    pub fn new(config: RegistryConfig, store: Arc<dyn SharedStore>, metrics: SharedMetrics) -> Self {
        Self {
            config,
            store,
            metrics,
        }
    }

    fn record_key(&self, tenant_id: &str) -> String {
        format!("{}:{}", self.config.key_prefix, tenant_id)
    }

    /// Write (or remove, for [`RegistryAction::Remove`]) the record and
    /// announce the change. A failed announcement is logged only.
    pub async fn publish(
        &self,
        action: RegistryAction,
        tenant_id: &str,
        status: TenantStatus,
        services: &[String],
        instance_id: &str,
    ) -> MinerResult<()> {
        let key = self.record_key(tenant_id);
        let record = match action {
            RegistryAction::Remove => {
                let ops = vec![
                    BatchOp::Del { key },
                    BatchOp::SetRemove {
                        key: self.config.index_key.clone(),
                        member: tenant_id.to_string(),
                    },
                ];
                self.store.exec_batch(None, ops).await?;
                None
            }
            _ => {
                let record = TenantRecord {
                    tenant_id: tenant_id.to_string(),
                    status,
                    services: services.to_vec(),
                    instance_id: instance_id.to_string(),
                    updated_at_ms: now_ms(),
                };
                let ops = vec![
                    BatchOp::Set {
                        key,
                        value: serde_json::to_vec(&record)?,
                        ttl: None,
                    },
                    BatchOp::SetAdd {
                        key: self.config.index_key.clone(),
                        member: tenant_id.to_string(),
                    },
                ];
                self.store.exec_batch(None, ops).await?;
                Some(record)
            }
        };

        let event = RegistryEvent {
            action,
            tenant_id: tenant_id.to_string(),
            record,
        };
        let payload = serde_json::to_vec(&event)?;
        if let Err(e) = self.store.publish(&self.config.event_channel, payload).await {
            tracing::warn!(tenant = %tenant_id, action = action.as_str(), error = %e, "failed to announce tenant update");
        }
        self.metrics
            .increment_counter(names::REGISTRY_UPDATES, 1, &[("action", action.as_str())]);
        tracing::debug!(tenant = %tenant_id, action = action.as_str(), "tenant registry updated");
        Ok(())
    }

    pub async fn get(&self, tenant_id: &str) -> MinerResult<Option<TenantRecord>> {
        match self.store.get(&self.record_key(tenant_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Tenant ids in the index.
    pub async fn list(&self) -> MinerResult<Vec<String>> {
        let mut ids = self.store.set_members(&self.config.index_key).await?;
        ids.sort();
        Ok(ids)
    }

    /// Every indexed record. Index members whose record is gone are skipped.
    pub async fn all(&self) -> MinerResult<Vec<TenantRecord>> {
        let mut records = Vec::new();
        for tenant_id in self.list().await? {
            if let Some(record) = self.get(&tenant_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Registry events from now on. Lagged or undecodable messages are dropped.
    pub async fn subscribe(&self) -> MinerResult<RegistryEvents> {
        let rx = self.store.subscribe(&self.config.event_channel).await?;
        let stream = BroadcastStream::new(rx).filter_map(|message| async move {
            match message {
                Ok(payload) => serde_json::from_slice::<RegistryEvent>(&payload).ok(),
                Err(e) => {
                    tracing::warn!(error = %e, "tenant registry subscriber lagged");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }

    /// Remove every record and the index.
    pub async fn clear_all(&self) -> MinerResult<u64> {
        let mut keys: Vec<String> = self
            .list()
            .await?
            .iter()
            .map(|tenant_id| self.record_key(tenant_id))
            .collect();
        let records = keys.len() as u64;
        keys.push(self.config.index_key.clone());
        self.store.delete(&keys).await?;
        Ok(records)
    }
}
