// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Session Lifecycle Manager
//!
//! Drives sessions through
//! `Active -> Claiming -> Claimed -> Proving -> Settled`, or to `Expired`,
//! from observed chain height. Every new height re-derives what each session
//! needs; a failed transition is not retried explicitly, the next height
//! simply evaluates it again.
//!
//! | state | height | next |
//! |---|---|---|
//! | Active | claimable | Claiming, claim callback |
//! | Active | >= claim close | Expired `claim_window_missed` |
//! | Claiming | claimable | claim callback again |
//! | Claiming | >= claim close | Expired `claim_failed` |
//! | Claimed | provable | Proving, proof callback |
//! | Claimed | >= proof close | Settled `proof_window_passed` |
//! | Proving | provable | proof callback again |
//! | Proving | >= proof close | Expired `proof_failed` |
//!
//! Claiming and Proving are persisted before the callback runs. Transitions
//! run on spawned tasks bounded by a semaphore; a per-session lock keeps two
//! transitions of one session from overlapping.
//!
//! A claim or proof is dispatched only once the tenant's slot in the window
//! (`earliest_submit`) is reached, so no permit is held while waiting for it.
//! Sessions deferred for lack of a permit are dispatched again at the same
//! height as soon as a running transition returns its permit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use relaymint_kernel::session::SessionState;
use relaymint_kernel::window::{SessionWindow, SubmissionWindow};
use tokio::sync::{Notify, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chain::{ChainOracle, ParamsSource};
use crate::errors::{MinerError, MinerResult};
use crate::metrics::{names, SharedMetrics};
use crate::session_store::{SessionSnapshot, SessionStore};
use crate::tenant::drain::PendingSessions;
use crate::timing::SubmissionKind;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub tenant_id: String,
    pub poll_interval: Duration,
    /// Blocks reserved at the end of the claim window.
    pub claim_submission_buffer: u64,
    pub proof_submission_buffer: u64,
    pub max_concurrent_transitions: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            poll_interval: Duration::from_secs(6),
            claim_submission_buffer: 2,
            proof_submission_buffer: 2,
            max_concurrent_transitions: 10,
        }
    }
}

/// Settlement strategy plugged into the state machine.
#[async_trait]
pub trait LifecycleCallback: Send + Sync {
    async fn on_session_active(&self, snapshot: &SessionSnapshot) -> MinerResult<()>;

    /// Submit the claim and return the encoded root that was claimed.
    async fn on_session_needs_claim(
        &self,
        snapshot: &SessionSnapshot,
        cancel: &CancellationToken,
    ) -> MinerResult<Vec<u8>>;

    async fn on_session_needs_proof(
        &self,
        snapshot: &SessionSnapshot,
        cancel: &CancellationToken,
    ) -> MinerResult<()>;

    async fn on_session_settled(&self, snapshot: &SessionSnapshot);

    async fn on_session_expired(&self, snapshot: &SessionSnapshot, reason: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Claim,
    Prove,
    Settle(&'static str),
    Expire(&'static str),
}

fn next_action(
    snapshot: &SessionSnapshot,
    window: &SessionWindow,
    height: u64,
    config: &LifecycleConfig,
) -> Option<Action> {
    let claimable = window.is_claimable(height, config.claim_submission_buffer);
    let provable = window.is_provable(height, config.proof_submission_buffer);
    match snapshot.state {
        SessionState::Active if height >= window.claim_close => {
            Some(Action::Expire("claim_window_missed"))
        }
        SessionState::Claiming if height >= window.claim_close => {
            Some(Action::Expire("claim_failed"))
        }
        SessionState::Active | SessionState::Claiming if claimable => Some(Action::Claim),
        SessionState::Claimed if height >= window.proof_close => {
            Some(Action::Settle("proof_window_passed"))
        }
        SessionState::Proving if height >= window.proof_close => {
            Some(Action::Expire("proof_failed"))
        }
        SessionState::Claimed | SessionState::Proving if provable => Some(Action::Prove),
        _ => None,
    }
}

pub struct SessionLifecycleManager {
    config: LifecycleConfig,
    sessions: Arc<SessionStore>,
    oracle: Arc<dyn ChainOracle>,
    params: Arc<dyn ParamsSource>,
    callback: Arc<dyn LifecycleCallback>,
    metrics: SharedMetrics,
    active: RwLock<HashMap<String, SessionSnapshot>>,
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    permits: Arc<Semaphore>,
    /// Set when a due transition found no free permit.
    deferred: AtomicBool,
    /// Tenant slots keyed by kind and window-open height.
    slots: Mutex<HashMap<(SubmissionKind, u64), SubmissionWindow>>,
    transitions: TaskTracker,
    changed: Notify,
    last_height: AtomicU64,
    paused: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionLifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        sessions: Arc<SessionStore>,
        oracle: Arc<dyn ChainOracle>,
        params: Arc<dyn ParamsSource>,
        callback: Arc<dyn LifecycleCallback>,
        metrics: SharedMetrics,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_transitions.max(1)));
        Self {
            config,
            sessions,
            oracle,
            params,
            callback,
            metrics,
            active: RwLock::new(HashMap::new()),
            session_locks: Mutex::new(HashMap::new()),
            permits,
            deferred: AtomicBool::new(false),
            slots: Mutex::new(HashMap::new()),
            transitions: TaskTracker::new(),
            changed: Notify::new(),
            last_height: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            checker: Mutex::new(None),
        }
    }

    fn tenant(&self) -> &str {
        &self.config.tenant_id
    }

    fn ensure_open(&self) -> MinerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MinerError::Closed("lifecycle manager"))
        } else {
            Ok(())
        }
    }

    /// Load every non-terminal session of the tenant and start the height
    /// checker.
    pub async fn start(self: &Arc<Self>) -> MinerResult<()> {
        self.ensure_open()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MinerError::AlreadyStarted("lifecycle manager"));
        }
        let loaded = self.load_sessions().await?;
        tracing::info!(tenant = %self.tenant(), sessions = loaded, "lifecycle manager started");

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.run_checker().await });
        if let Ok(mut slot) = self.checker.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Replace the in-memory view with the non-terminal sessions in the
    /// store. Returns how many were loaded.
    pub async fn load_sessions(&self) -> MinerResult<usize> {
        self.ensure_open()?;
        let mut loaded = HashMap::new();
        for state in SessionState::NON_TERMINAL {
            for snapshot in self.sessions.get_by_state(state).await? {
                loaded.insert(snapshot.session_id.clone(), snapshot);
            }
        }
        let count = loaded.len();
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        self.report_states();
        self.changed.notify_waiters();
        Ok(count)
    }

    async fn run_checker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if self.paused.load(Ordering::SeqCst) {
                continue;
            }
            let block = match self.oracle.last_block().await {
                Ok(block) => block,
                Err(e) => {
                    tracing::warn!(tenant = %self.tenant(), error = %e, "failed to read chain height");
                    continue;
                }
            };
            if block.height > self.last_height.load(Ordering::SeqCst) {
                self.check_sessions(block.height).await;
            }
        }
    }

    /// Evaluate every tracked session at `height` and spawn the transitions
    /// that are due. Heights at or below the last evaluated one are ignored.
    pub async fn check_sessions(self: &Arc<Self>, height: u64) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.last_height.fetch_max(height, Ordering::SeqCst) >= height {
            return;
        }
        self.dispatch(height).await;
    }

    async fn dispatch(self: &Arc<Self>, height: u64) {
        let params = match self.params.shared_params().await {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!(tenant = %self.tenant(), height, error = %e, "failed to read shared params");
                return;
            }
        };

        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, slot| slot.window_close > height);

        let snapshots: Vec<SessionSnapshot> = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for snapshot in snapshots {
            let window = SessionWindow::for_session(&params, snapshot.end_height);
            let Some(action) = next_action(&snapshot, &window, height, &self.config) else {
                continue;
            };
            if !self.slot_reached(action, &window, height).await {
                continue;
            }

            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                self.deferred.store(true, Ordering::SeqCst);
                self.metrics.increment_counter(
                    names::TRANSITIONS_DEFERRED,
                    1,
                    &[("tenant", self.tenant())],
                );
                tracing::debug!(
                    tenant = %self.tenant(),
                    session_id = %snapshot.session_id,
                    height,
                    "transition deferred, concurrency limit reached"
                );
                continue;
            };
            let Ok(guard) = self.session_lock(&snapshot.session_id).try_lock_owned() else {
                // A transition for this session is still running.
                continue;
            };

            tracing::debug!(
                tenant = %self.tenant(),
                session_id = %snapshot.session_id,
                state = %snapshot.state,
                height,
                ?action,
                "session transition due"
            );
            let manager = Arc::clone(self);
            self.transitions.spawn(async move {
                manager.run_transition(snapshot, action, height, permit, guard).await;
                Arc::clone(&manager).dispatch_deferred().await;
            });
        }
    }

    /// Re-run dispatch at the last height if something was deferred. Boxed
    /// because it is awaited from inside the tasks that `dispatch` spawns.
    fn dispatch_deferred(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) || self.paused.load(Ordering::SeqCst) {
                return;
            }
            if self.deferred.swap(false, Ordering::SeqCst) {
                let height = self.last_height();
                self.dispatch(height).await;
            }
        })
    }

    /// Claims and proofs wait for the tenant's slot before taking a permit.
    /// When the slot cannot be computed yet the callback does the waiting.
    async fn slot_reached(&self, action: Action, window: &SessionWindow, height: u64) -> bool {
        let (kind, open, close, buffer) = match action {
            Action::Claim => (
                SubmissionKind::Claim,
                window.claim_open,
                window.claim_close,
                self.config.claim_submission_buffer,
            ),
            Action::Prove => (
                SubmissionKind::Proof,
                window.proof_open,
                window.proof_close,
                self.config.proof_submission_buffer,
            ),
            Action::Settle(_) | Action::Expire(_) => return true,
        };
        match self.submission_slot(kind, open, close, buffer).await {
            Some(slot) => height >= slot.earliest_submit,
            None => true,
        }
    }

    async fn submission_slot(
        &self,
        kind: SubmissionKind,
        open: u64,
        close: u64,
        buffer: u64,
    ) -> Option<SubmissionWindow> {
        let cached = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, open))
            .cloned();
        if cached.is_some() {
            return cached;
        }
        let block = match self.oracle.block_at(open).await {
            Ok(Some(block)) => block,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(
                    tenant = %self.tenant(),
                    height = open,
                    error = %e,
                    "window-open block lookup failed"
                );
                return None;
            }
        };
        let slot = SubmissionWindow::spread(open, close, buffer, &block.hash, self.tenant());
        tracing::debug!(
            tenant = %self.tenant(),
            kind = kind.as_str(),
            earliest = slot.earliest_submit,
            deadline = slot.safe_deadline,
            "submission slot"
        );
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, open), slot.clone());
        Some(slot)
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .session_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    async fn run_transition(
        &self,
        snapshot: SessionSnapshot,
        action: Action,
        height: u64,
        _permit: OwnedSemaphorePermit,
        _guard: OwnedMutexGuard<()>,
    ) {
        let session_id = snapshot.session_id.clone();
        let result = match action {
            Action::Claim => self.claim(snapshot).await,
            Action::Prove => self.prove(snapshot).await,
            Action::Settle(reason) => self.settle(snapshot, reason).await,
            Action::Expire(reason) => self.expire(snapshot, reason).await,
        };
        match result {
            Ok(()) => {}
            Err(MinerError::Cancelled) => {
                tracing::debug!(tenant = %self.tenant(), %session_id, "transition cancelled");
            }
            Err(MinerError::InvalidTransition { .. }) => {
                // Another writer moved the session on; adopt its view.
                self.reload(&session_id).await;
            }
            Err(e) => {
                tracing::warn!(
                    tenant = %self.tenant(),
                    %session_id,
                    height,
                    ?action,
                    error = %e,
                    "session transition failed, will re-evaluate on next height"
                );
            }
        }
        self.changed.notify_waiters();
    }

    async fn claim(&self, snapshot: SessionSnapshot) -> MinerResult<()> {
        let claiming = self
            .sessions
            .update_state(&snapshot.session_id, SessionState::Claiming)
            .await?;
        self.store_local(claiming.clone());

        let root = self
            .callback
            .on_session_needs_claim(&claiming, &self.cancel)
            .await?;
        let claimed = self.sessions.mark_claimed(&claiming.session_id, &root).await?;
        self.store_local(claimed);
        Ok(())
    }

    async fn prove(&self, snapshot: SessionSnapshot) -> MinerResult<()> {
        let proving = self
            .sessions
            .update_state(&snapshot.session_id, SessionState::Proving)
            .await?;
        self.store_local(proving.clone());

        self.callback
            .on_session_needs_proof(&proving, &self.cancel)
            .await?;
        self.settle(proving, "proof_submitted").await
    }

    async fn settle(&self, snapshot: SessionSnapshot, reason: &'static str) -> MinerResult<()> {
        let settled = self
            .sessions
            .update_state(&snapshot.session_id, SessionState::Settled)
            .await?;
        self.store_local(settled.clone());
        self.metrics.increment_counter(
            names::SESSIONS_SETTLED,
            1,
            &[("tenant", self.tenant()), ("service_id", settled.service_id.as_str())],
        );
        tracing::info!(
            tenant = %self.tenant(),
            session_id = %settled.session_id,
            reason,
            relays = settled.relay_count,
            "session settled"
        );
        self.callback.on_session_settled(&settled).await;
        Ok(())
    }

    async fn expire(&self, snapshot: SessionSnapshot, reason: &'static str) -> MinerResult<()> {
        let expired = self
            .sessions
            .set_expired(&snapshot.session_id, reason)
            .await?;
        self.store_local(expired.clone());
        self.metrics.increment_counter(
            names::SESSIONS_FAILED,
            1,
            &[
                ("tenant", self.tenant()),
                ("service_id", expired.service_id.as_str()),
                ("reason", reason),
            ],
        );
        tracing::warn!(
            tenant = %self.tenant(),
            session_id = %expired.session_id,
            reason,
            relays = expired.relay_count,
            "session expired"
        );
        self.callback.on_session_expired(&expired, reason).await;
        Ok(())
    }

    async fn reload(&self, session_id: &str) {
        match self.sessions.get(session_id).await {
            Ok(Some(snapshot)) => self.store_local(snapshot),
            Ok(None) => self.forget(session_id),
            Err(e) => {
                tracing::warn!(tenant = %self.tenant(), session_id, error = %e, "failed to reload session");
            }
        }
    }

    /// Update the in-memory view. Terminal sessions leave the active map.
    fn store_local(&self, snapshot: SessionSnapshot) {
        {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            if snapshot.state.is_terminal() {
                active.remove(&snapshot.session_id);
            } else {
                active.insert(snapshot.session_id.clone(), snapshot.clone());
            }
        }
        if snapshot.state.is_terminal() {
            self.session_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&snapshot.session_id);
        }
        self.report_states();
        self.changed.notify_waiters();
    }

    fn forget(&self, session_id: &str) {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        self.report_states();
        self.changed.notify_waiters();
    }

    fn report_states(&self) {
        let mut counts: HashMap<SessionState, usize> = HashMap::new();
        for snapshot in self.active.read().unwrap_or_else(PoisonError::into_inner).values() {
            *counts.entry(snapshot.state).or_default() += 1;
        }
        for state in SessionState::NON_TERMINAL {
            self.metrics.set_gauge(
                names::SESSIONS_BY_STATE,
                counts.get(&state).copied().unwrap_or(0) as f64,
                &[("tenant", self.tenant()), ("state", state.as_str())],
            );
        }
    }

    /// Start tracking a session. Returns false if it was already tracked or
    /// is terminal.
    pub async fn track_session(&self, snapshot: SessionSnapshot) -> MinerResult<bool> {
        self.ensure_open()?;
        if snapshot.state.is_terminal() {
            return Ok(false);
        }
        {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            if active.contains_key(&snapshot.session_id) {
                return Ok(false);
            }
            active.insert(snapshot.session_id.clone(), snapshot.clone());
        }
        self.report_states();
        if let Err(e) = self.callback.on_session_active(&snapshot).await {
            tracing::warn!(
                tenant = %self.tenant(),
                session_id = %snapshot.session_id,
                error = %e,
                "session activation callback failed"
            );
        }
        Ok(true)
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn sessions_by_state(&self, state: SessionState) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.state == state)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn has_pending_sessions(&self) -> bool {
        self.pending_session_count() > 0
    }

    pub fn pending_session_count(&self) -> usize {
        self.active.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Wait until the session leaves the active set and return its final
    /// state.
    pub async fn wait_for_settlement(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> MinerResult<SessionState> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            if self.get_session(session_id).is_none() {
                let snapshot = self
                    .sessions
                    .get(session_id)
                    .await?
                    .ok_or_else(|| MinerError::NotFound(session_id.to_string()))?;
                return Ok(snapshot.state);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(MinerError::Cancelled);
            }
        }
    }

    /// Wait for every spawned transition to finish.
    pub async fn wait_idle(&self) {
        self.transitions.close();
        self.transitions.wait().await;
        if !self.closed.load(Ordering::SeqCst) {
            self.transitions.reopen();
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!(tenant = %self.tenant(), "lifecycle checks paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!(tenant = %self.tenant(), "lifecycle checks resumed");
    }

    pub fn last_height(&self) -> u64 {
        self.last_height.load(Ordering::SeqCst)
    }

    /// Stop the checker, cancel in-flight callbacks and wait for them.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let handle = self.checker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.transitions.close();
        self.transitions.wait().await;
        self.changed.notify_waiters();
        tracing::info!(tenant = %self.tenant(), "lifecycle manager closed");
    }
}

impl PendingSessions for SessionLifecycleManager {
    fn pending_session_count(&self) -> usize {
        SessionLifecycleManager::pending_session_count(self)
    }
}
