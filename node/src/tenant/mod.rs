// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Tenant management.
//!
//! A [`TenantManager`] owns one [`TenantRuntime`] per managed identity. Each
//! runtime wires its own WAL, session store, deduplicator, accumulator,
//! recovery service, lifecycle manager and relay processor. Tenants are added
//! and removed through an ordered [`TenantEvent`] stream; removal drains
//! in-flight sessions before the runtime is torn down.

pub mod drain;
pub mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::accumulator::AccumulatorManager;
use crate::chain::{ChainOracle, ParamsSource, RelaySource, SessionQuery, TxSubmitter};
use crate::config::MinerConfig;
use crate::dedup::Deduplicator;
use crate::errors::{MinerError, MinerResult};
use crate::ingest::{IngestConfig, RelayProcessor};
use crate::leader::{LeaderElector, LeadershipObserver};
use crate::lifecycle::SessionLifecycleManager;
use crate::metrics::{names, SharedMetrics};
use crate::recovery::RecoveryService;
use crate::session_store::SessionStore;
use crate::settlement::{BatchingSubmitter, SettlementCallback};
use crate::snapshot::SnapshotManager;
use crate::store::SharedStore;
use crate::timing::SubmissionTimingCalculator;
use crate::wal::Wal;

use self::drain::{DrainState, DrainStatus, DrainTracker, PendingSessions};
use self::registry::{RegistryAction, TenantRegistry, TenantStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantEvent {
    Added { tenant_id: String, services: Vec<String> },
    Removed { tenant_id: String },
}

/// External collaborators shared by every tenant.
#[derive(Clone)]
pub struct TenantDeps {
    pub store: Arc<dyn SharedStore>,
    pub oracle: Arc<dyn ChainOracle>,
    pub params: Arc<dyn ParamsSource>,
    pub submitter: Arc<dyn TxSubmitter>,
    pub relay_source: Arc<dyn RelaySource>,
    pub session_query: Option<Arc<dyn SessionQuery>>,
    pub metrics: SharedMetrics,
}

#[derive(Debug, Clone)]
pub struct TenantInfo {
    pub tenant_id: String,
    pub status: TenantStatus,
    pub services: Vec<String>,
    pub is_leader: bool,
    pub pending_sessions: usize,
}

/// Everything one managed identity owns.
pub struct TenantRuntime {
    tenant_id: String,
    services: Vec<String>,
    status: Mutex<TenantStatus>,
    wal: Arc<Wal>,
    sessions: Arc<SessionStore>,
    dedup: Arc<Deduplicator>,
    accumulator: Arc<AccumulatorManager>,
    recovery: RecoveryService,
    lifecycle: Arc<SessionLifecycleManager>,
    processor: Arc<RelayProcessor>,
    leader: Option<Arc<LeaderElector>>,
    relay_source: Arc<dyn RelaySource>,
    ingest: IngestConfig,
    cancel: CancellationToken,
    consumption: Mutex<Option<CancellationToken>>,
    tasks: TaskTracker,
    lifecycle_started: AtomicBool,
    transition: tokio::sync::Mutex<()>,
}

impl TenantRuntime {
    fn build(
        config: &MinerConfig,
        deps: &TenantDeps,
        submitter: Arc<dyn TxSubmitter>,
        timing: Arc<SubmissionTimingCalculator>,
        tenant_id: &str,
        services: Vec<String>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let metrics = deps.metrics.clone();
        let wal = Arc::new(Wal::new(config.wal_config(tenant_id), deps.store.clone(), metrics.clone()));
        let sessions = Arc::new(SessionStore::new(
            config.session_store_config(tenant_id),
            deps.store.clone(),
            metrics.clone(),
        ));
        let dedup = Arc::new(Deduplicator::new(
            config.dedup_config(tenant_id),
            deps.store.clone(),
            metrics.clone(),
        ));
        let accumulator = Arc::new(AccumulatorManager::new(tenant_id, metrics.clone()));
        let snapshots = Arc::new(SnapshotManager::new(
            tenant_id,
            sessions.clone(),
            wal.clone(),
            accumulator.clone(),
            metrics.clone(),
        ));
        let recovery = RecoveryService::new(
            config.recovery_config(tenant_id),
            sessions.clone(),
            wal.clone(),
            metrics.clone(),
        );

        let mut callback = SettlementCallback::new(
            config.settlement_config(tenant_id),
            snapshots.clone(),
            dedup.clone(),
            timing,
            submitter,
            metrics.clone(),
        );
        if let Some(query) = &deps.session_query {
            callback = callback.with_session_query(query.clone());
        }
        let lifecycle = Arc::new(SessionLifecycleManager::new(
            config.lifecycle_config(tenant_id),
            sessions.clone(),
            deps.oracle.clone(),
            deps.params.clone(),
            Arc::new(callback),
            metrics.clone(),
        ));
        let processor = Arc::new(RelayProcessor::new(
            tenant_id,
            snapshots,
            dedup.clone(),
            lifecycle.clone(),
            metrics.clone(),
        ));

        Arc::new_cyclic(|runtime: &Weak<TenantRuntime>| {
            let leader = config.leader.enabled.then(|| {
                let observer = Arc::new(TenantObserver {
                    runtime: runtime.clone(),
                });
                Arc::new(
                    LeaderElector::new(config.leader_config(tenant_id), deps.store.clone(), metrics.clone())
                        .with_observer(observer),
                )
            });
            TenantRuntime {
                tenant_id: tenant_id.to_string(),
                services,
                status: Mutex::new(TenantStatus::Active),
                wal,
                sessions,
                dedup,
                accumulator,
                recovery,
                lifecycle,
                processor,
                leader,
                relay_source: deps.relay_source.clone(),
                ingest: config.ingest_config(),
                cancel: parent.child_token(),
                consumption: Mutex::new(None),
                tasks: TaskTracker::new(),
                lifecycle_started: AtomicBool::new(false),
                transition: tokio::sync::Mutex::new(()),
            }
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn status(&self) -> TenantStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: TenantStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn is_leader(&self) -> bool {
        self.leader.as_ref().map_or(true, |leader| leader.is_leader())
    }

    pub fn processor(&self) -> &Arc<RelayProcessor> {
        &self.processor
    }

    pub fn lifecycle(&self) -> &Arc<SessionLifecycleManager> {
        &self.lifecycle
    }

    pub fn accumulator(&self) -> &Arc<AccumulatorManager> {
        &self.accumulator
    }

    pub fn leader(&self) -> Option<&Arc<LeaderElector>> {
        self.leader.as_ref()
    }

    fn info(&self) -> TenantInfo {
        TenantInfo {
            tenant_id: self.tenant_id.clone(),
            status: self.status(),
            services: self.services.clone(),
            is_leader: self.is_leader(),
            pending_sessions: self.lifecycle.pending_session_count(),
        }
    }

    /// Start background loops. Without leader election the tenant is
    /// activated right away, otherwise on election.
    async fn start(&self) -> MinerResult<()> {
        self.wal.start()?;
        self.dedup.start()?;
        match &self.leader {
            Some(leader) => leader.start(),
            None => self.activate().await,
        }
    }

    /// Rebuild trees from snapshots and the WAL, then resume settlement and
    /// consumption.
    async fn activate(&self) -> MinerResult<()> {
        let _transition = self.transition.lock().await;
        if self.cancel.is_cancelled() {
            return Err(MinerError::Closed("tenant runtime"));
        }

        let recovered = self.recovery.recover_sessions().await?;
        for session in &recovered {
            let session_id = session.snapshot.session_id.as_str();
            // A tree left over from an earlier term would be replayed twice.
            self.accumulator.delete_tree(session_id);
            match self.recovery.restore_into(&self.accumulator, session) {
                Ok(stats) => tracing::debug!(
                    tenant = %self.tenant_id,
                    session_id,
                    applied = stats.applied,
                    skipped = stats.skipped,
                    "session restored"
                ),
                Err(e) => tracing::error!(
                    tenant = %self.tenant_id,
                    session_id,
                    error = %e,
                    "failed to restore session tree"
                ),
            }
        }

        if self.lifecycle_started.swap(true, Ordering::SeqCst) {
            self.lifecycle.load_sessions().await?;
            self.lifecycle.resume();
        } else if let Err(e) = self.lifecycle.start().await {
            self.lifecycle_started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.start_consumption();
        tracing::info!(tenant = %self.tenant_id, sessions = recovered.len(), "tenant activated");
        Ok(())
    }

    /// Stop consuming and settling without tearing anything down. Another
    /// replica now owns the tenant.
    async fn deactivate(&self) {
        let _transition = self.transition.lock().await;
        self.stop_consumption();
        self.lifecycle.pause();
        tracing::info!(tenant = %self.tenant_id, "tenant deactivated");
    }

    fn start_consumption(&self) {
        let token = self.cancel.child_token();
        let previous = self
            .consumption
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let processor = Arc::clone(&self.processor);
        let source = Arc::clone(&self.relay_source);
        let config = self.ingest.clone();
        self.tasks
            .spawn(async move { processor.run(source, config, token).await });
    }

    fn stop_consumption(&self) {
        let token = self
            .consumption
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Close every owned component and wait for its tasks.
    async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(leader) = &self.leader {
            leader.close().await;
        }
        self.tasks.close();
        self.tasks.wait().await;
        self.lifecycle.close().await;
        self.dedup.close().await;
        self.wal.close().await;
        self.sessions.close();
        self.accumulator.close();
        tracing::info!(tenant = %self.tenant_id, "tenant runtime stopped");
    }
}

struct TenantObserver {
    runtime: Weak<TenantRuntime>,
}

#[async_trait]
impl LeadershipObserver for TenantObserver {
    async fn on_elected(&self) -> MinerResult<()> {
        match self.runtime.upgrade() {
            Some(runtime) => runtime.activate().await,
            None => Err(MinerError::Closed("tenant runtime")),
        }
    }

    async fn on_lost(&self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.deactivate().await;
        }
    }
}

pub struct TenantManager {
    config: MinerConfig,
    deps: TenantDeps,
    submitter: Arc<dyn TxSubmitter>,
    batching: Option<Arc<BatchingSubmitter>>,
    timing: Arc<SubmissionTimingCalculator>,
    registry: TenantRegistry,
    drains: DrainTracker,
    tenants: RwLock<HashMap<String, Arc<TenantRuntime>>>,
    membership: tokio::sync::Mutex<()>,
    removed: Notify,
    tasks: TaskTracker,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl TenantManager {
    pub fn new(config: MinerConfig, deps: TenantDeps) -> Self {
        let batching = config.batch_config().map(|batch| {
            Arc::new(BatchingSubmitter::new(
                batch,
                deps.submitter.clone(),
                deps.metrics.clone(),
            ))
        });
        let submitter: Arc<dyn TxSubmitter> = match &batching {
            Some(batching) => batching.clone(),
            None => deps.submitter.clone(),
        };
        let timing = Arc::new(SubmissionTimingCalculator::new(
            config.timing_config(),
            deps.oracle.clone(),
            deps.params.clone(),
        ));
        let registry = TenantRegistry::new(
            config.registry_config(),
            deps.store.clone(),
            deps.metrics.clone(),
        );
        let drains = DrainTracker::new(config.drain_config());
        Self {
            config,
            deps,
            submitter,
            batching,
            timing,
            registry,
            drains,
            tenants: RwLock::new(HashMap::new()),
            membership: tokio::sync::Mutex::new(()),
            removed: Notify::new(),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> MinerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MinerError::Closed("tenant manager"))
        } else {
            Ok(())
        }
    }

    fn report_count(&self) {
        let count = self.tenants.read().unwrap_or_else(PoisonError::into_inner).len();
        self.deps
            .metrics
            .set_gauge(names::TENANTS_ACTIVE, count as f64, &[]);
    }

    fn runtime(&self, tenant_id: &str) -> Option<Arc<TenantRuntime>> {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant_id)
            .cloned()
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    /// Start managing `tenant_id`. Fails with `AlreadyStarted` if it is
    /// already managed (including while it drains).
    pub async fn add_tenant(&self, tenant_id: &str, services: Vec<String>) -> MinerResult<()> {
        self.ensure_open()?;
        if tenant_id.is_empty() {
            return Err(MinerError::InvalidInput("empty tenant id".to_string()));
        }
        let _membership = self.membership.lock().await;
        if self.runtime(tenant_id).is_some() {
            return Err(MinerError::AlreadyStarted("tenant"));
        }

        let runtime = TenantRuntime::build(
            &self.config,
            &self.deps,
            self.submitter.clone(),
            self.timing.clone(),
            tenant_id,
            services.clone(),
            &self.cancel,
        );
        if let Err(e) = runtime.start().await {
            tracing::error!(tenant = %tenant_id, error = %e, "failed to start tenant");
            runtime.shutdown().await;
            return Err(e);
        }

        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant_id.to_string(), runtime);
        self.report_count();

        if let Err(e) = self
            .registry
            .publish(
                RegistryAction::Add,
                tenant_id,
                TenantStatus::Active,
                &services,
                &self.config.instance_id,
            )
            .await
        {
            tracing::warn!(tenant = %tenant_id, error = %e, "failed to publish tenant");
        }
        tracing::info!(tenant = %tenant_id, services = ?services, "tenant added");
        Ok(())
    }

    /// Mark the tenant draining and tear it down in the background once its
    /// sessions are terminal or the drain times out. Consumption continues
    /// while draining.
    pub async fn remove_tenant(self: &Arc<Self>, tenant_id: &str) -> MinerResult<()> {
        self.ensure_open()?;
        let _membership = self.membership.lock().await;
        let runtime = self
            .runtime(tenant_id)
            .ok_or_else(|| MinerError::NotFound(tenant_id.to_string()))?;
        if runtime.status() == TenantStatus::Draining {
            return Err(MinerError::AlreadyStarted("tenant drain"));
        }

        let pending: Arc<dyn PendingSessions> = runtime.lifecycle.clone();
        self.drains.initiate(tenant_id, pending)?;
        runtime.set_status(TenantStatus::Draining);
        if let Err(e) = self
            .registry
            .publish(
                RegistryAction::Draining,
                tenant_id,
                TenantStatus::Draining,
                &runtime.services,
                &self.config.instance_id,
            )
            .await
        {
            tracing::warn!(tenant = %tenant_id, error = %e, "failed to publish drain");
        }
        tracing::info!(
            tenant = %tenant_id,
            pending = runtime.lifecycle.pending_session_count(),
            "tenant draining"
        );

        let manager = Arc::clone(self);
        self.tasks.spawn(async move { manager.teardown(runtime).await });
        Ok(())
    }

    async fn teardown(&self, runtime: Arc<TenantRuntime>) {
        let tenant_id = runtime.tenant_id.clone();
        let outcome = self.drains.wait(&tenant_id).await;
        if outcome == DrainState::Failed {
            let status = self.drains.status(&tenant_id);
            tracing::warn!(
                tenant = %tenant_id,
                pending = status.pending_sessions,
                error = ?status.error,
                "drain did not complete, removing tenant anyway"
            );
        }
        runtime.shutdown().await;

        if let Err(e) = self
            .registry
            .publish(
                RegistryAction::Remove,
                &tenant_id,
                TenantStatus::Draining,
                &[],
                &self.config.instance_id,
            )
            .await
        {
            tracing::warn!(tenant = %tenant_id, error = %e, "failed to unpublish tenant");
        }
        self.drains.clear(&tenant_id);
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tenant_id);
        self.report_count();
        self.removed.notify_waiters();
        tracing::info!(tenant = %tenant_id, drain = ?outcome, "tenant removed");
    }

    /// Wait until `tenant_id` is no longer managed, up to `timeout`.
    /// Returns false on timeout.
    pub async fn wait_removed(&self, tenant_id: &str, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.removed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.runtime(tenant_id).is_none() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub fn drain_status(&self, tenant_id: &str) -> DrainStatus {
        self.drains.status(tenant_id)
    }

    pub fn get_tenant(&self, tenant_id: &str) -> Option<TenantInfo> {
        self.runtime(tenant_id).map(|runtime| runtime.info())
    }

    pub fn list_tenants(&self) -> Vec<TenantInfo> {
        let mut tenants: Vec<TenantInfo> = self
            .tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|runtime| runtime.info())
            .collect();
        tenants.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        tenants
    }

    pub fn tenant(&self, tenant_id: &str) -> Option<Arc<TenantRuntime>> {
        self.runtime(tenant_id)
    }

    pub fn processor(&self, tenant_id: &str) -> Option<Arc<RelayProcessor>> {
        self.runtime(tenant_id).map(|runtime| runtime.processor.clone())
    }

    pub fn lifecycle(&self, tenant_id: &str) -> Option<Arc<SessionLifecycleManager>> {
        self.runtime(tenant_id).map(|runtime| runtime.lifecycle.clone())
    }

    /// Apply tenant events in order until the channel closes or the manager
    /// is closed. Failures are logged and the next event is applied.
    pub async fn run(self: &Arc<Self>, mut events: mpsc::Receiver<TenantEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let result = match &event {
                TenantEvent::Added { tenant_id, services } => {
                    self.add_tenant(tenant_id, services.clone()).await
                }
                TenantEvent::Removed { tenant_id } => self.remove_tenant(tenant_id).await,
            };
            if let Err(e) = result {
                tracing::warn!(event = ?event, error = %e, "tenant event not applied");
            }
        }
        tracing::debug!("tenant event loop stopped");
    }

    /// Cancel running drains, stop every tenant and wait for them. Registry
    /// records of tenants that were not being removed are left for other
    /// replicas. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.drains.close().await;
        self.tasks.close();
        self.tasks.wait().await;

        let remaining: Vec<Arc<TenantRuntime>> = self
            .tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, runtime)| runtime)
            .collect();
        for runtime in remaining {
            runtime.shutdown().await;
        }
        if let Some(batching) = &self.batching {
            batching.close().await;
        }
        self.report_count();
        self.removed.notify_waiters();
        tracing::info!("tenant manager closed");
    }
}
