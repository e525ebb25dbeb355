// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Lease-based leader election per managed identity.
//!
//! ```text
//! Standby --set_if_absent ok--> Leader --renew fails / resign--> Standby
//! ```
//! The lease is a single key holding the owner's instance id with a TTL.
//! Renewal extends the TTL only if the key still names this instance, so a
//! lease that expired and was taken over is never renewed by its old owner.
//!
//! Leadership is advisory. While a lease expires two replicas can briefly
//! disagree; downstream work stays safe because trees flush once and the chain
//! rejects duplicate claims and proofs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::{MinerError, MinerResult};
use crate::metrics::{names, SharedMetrics};
use crate::store::SharedStore;

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub key_prefix: String,
    /// The identity being elected for, usually a tenant id.
    pub identity: String,
    /// Lease owner value; unique per replica.
    pub instance_id: String,
    pub lock_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub acquire_retry_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            key_prefix: "relaymint:leader".to_string(),
            identity: String::new(),
            instance_id: String::new(),
            lock_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            acquire_retry_interval: Duration::from_secs(5),
        }
    }
}

/// Notified on leadership changes. `on_elected` runs before the elector
/// reports itself as leader, with the lease renewed meanwhile; if it fails the
/// lease is released again, and if the lease is lost while it runs `on_lost`
/// follows.
#[async_trait]
pub trait LeadershipObserver: Send + Sync {
    async fn on_elected(&self) -> MinerResult<()>;
    async fn on_lost(&self);
}

pub struct LeaderElector {
    config: LeaderConfig,
    store: Arc<dyn SharedStore>,
    metrics: SharedMetrics,
    observer: Option<Arc<dyn LeadershipObserver>>,
    leader: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    release_on_stop: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElector {
    pub fn new(config: LeaderConfig, store: Arc<dyn SharedStore>, metrics: SharedMetrics) -> Self {
        Self {
            config,
            store,
            metrics,
            observer: None,
            leader: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            release_on_stop: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LeadershipObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn lock_key(&self) -> String {
        format!("{}:{}", self.config.key_prefix, self.config.identity)
    }

    fn owner(&self) -> &[u8] {
        self.config.instance_id.as_bytes()
    }

    fn tenant_label(&self) -> [(&'static str, &str); 1] {
        [("tenant", self.config.identity.as_str())]
    }

    fn report_status(&self, leader: bool) {
        self.metrics.set_gauge(
            names::LEADER_STATUS,
            if leader { 1.0 } else { 0.0 },
            &[
                ("tenant", self.config.identity.as_str()),
                ("instance", self.config.instance_id.as_str()),
            ],
        );
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Current lease owner, if any.
    pub async fn leader_id(&self) -> MinerResult<Option<String>> {
        let owner = self.store.get(&self.lock_key()).await?;
        Ok(owner.map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    pub fn start(self: &Arc<Self>) -> MinerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MinerError::Closed("leader elector"));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MinerError::AlreadyStarted("leader elector"));
        }
        self.report_status(false);
        let elector = Arc::clone(self);
        let handle = tokio::spawn(async move { elector.run().await });
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(handle);
        }
        tracing::info!(
            identity = %self.config.identity,
            instance = %self.config.instance_id,
            "leader election started"
        );
        Ok(())
    }

    async fn run(&self) {
        loop {
            if self.is_leader() {
                self.renew().await;
            } else {
                self.try_acquire().await;
            }
            let wait = if self.is_leader() {
                self.config.heartbeat_interval
            } else {
                self.config.acquire_retry_interval
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if self.release_on_stop.load(Ordering::SeqCst) {
            if self.leader.swap(false, Ordering::SeqCst) {
                self.release().await;
                self.notify_lost().await;
            }
        } else {
            self.leader.store(false, Ordering::SeqCst);
        }
    }

    async fn try_acquire(&self) {
        let acquired = match self
            .store
            .set_if_absent(&self.lock_key(), self.owner().to_vec(), self.config.lock_ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(identity = %self.config.identity, error = %e, "lease acquisition failed");
                return;
            }
        };
        if !acquired {
            return;
        }

        if let Some(observer) = &self.observer {
            match self.activate(observer).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        identity = %self.config.identity,
                        "lease lost during activation, standing down"
                    );
                    observer.on_lost().await;
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        identity = %self.config.identity,
                        error = %e,
                        "activation after election failed, releasing lease"
                    );
                    self.release().await;
                    return;
                }
            }
        }

        self.leader.store(true, Ordering::SeqCst);
        self.report_status(true);
        self.metrics
            .increment_counter(names::LEADER_ACQUISITIONS, 1, &self.tenant_label());
        tracing::info!(
            identity = %self.config.identity,
            instance = %self.config.instance_id,
            "acquired leadership"
        );
    }

    /// Run `on_elected` while heartbeating the lease, since recovery can
    /// outlast the TTL. Returns whether the lease was still held throughout.
    async fn activate(&self, observer: &Arc<dyn LeadershipObserver>) -> MinerResult<bool> {
        let activation = observer.on_elected();
        tokio::pin!(activation);
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut held = true;
        loop {
            tokio::select! {
                result = &mut activation => return result.map(|()| held),
                _ = heartbeat.tick(), if held => match self.extend_lease().await {
                    Ok(true) => {
                        self.metrics
                            .increment_counter(names::LEADER_HEARTBEATS, 1, &self.tenant_label());
                    }
                    Ok(false) => held = false,
                    Err(e) => {
                        tracing::warn!(
                            identity = %self.config.identity,
                            error = %e,
                            "lease renewal during activation failed"
                        );
                        held = false;
                    }
                },
            }
        }
    }

    async fn extend_lease(&self) -> MinerResult<bool> {
        Ok(self
            .store
            .expire_if_equals(&self.lock_key(), self.owner(), self.config.lock_ttl)
            .await?)
    }

    async fn renew(&self) {
        match self.extend_lease().await {
            Ok(true) => {
                self.metrics
                    .increment_counter(names::LEADER_HEARTBEATS, 1, &self.tenant_label());
            }
            Ok(false) => {
                tracing::warn!(identity = %self.config.identity, "lease no longer owned");
                self.lose().await;
            }
            Err(e) => {
                tracing::warn!(identity = %self.config.identity, error = %e, "lease renewal failed");
                self.lose().await;
            }
        }
    }

    async fn lose(&self) {
        if self.leader.swap(false, Ordering::SeqCst) {
            self.notify_lost().await;
        }
    }

    async fn notify_lost(&self) {
        self.report_status(false);
        self.metrics
            .increment_counter(names::LEADER_LOSSES, 1, &self.tenant_label());
        tracing::info!(
            identity = %self.config.identity,
            instance = %self.config.instance_id,
            "lost leadership"
        );
        if let Some(observer) = &self.observer {
            observer.on_lost().await;
        }
    }

    async fn release(&self) {
        if let Err(e) = self
            .store
            .delete_if_equals(&self.lock_key(), self.owner())
            .await
        {
            tracing::warn!(identity = %self.config.identity, error = %e, "lease release failed");
        }
    }

    /// Give up leadership now. The elector stays in standby and may be
    /// elected again later.
    pub async fn resign(&self) {
        if self.leader.swap(false, Ordering::SeqCst) {
            self.release().await;
            self.notify_lost().await;
        }
    }

    async fn stop(&self, release: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_on_stop.store(release, Ordering::SeqCst);
        self.cancel.cancel();
        let handle = self.task.lock().ok().and_then(|mut slot| slot.take());
        match handle {
            Some(handle) => {
                let _ = handle.await;
            }
            None if release => self.resign().await,
            None => {}
        }
    }

    /// Stop the election loop and release the lease if held. Idempotent.
    pub async fn close(&self) {
        self.stop(true).await;
    }

    /// Stop without releasing, leaving the lease to expire as after a crash.
    pub async fn abandon(&self) {
        self.stop(false).await;
    }
}
