// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Drain tracking.
//!
//! A tenant being removed keeps settling its in-flight sessions. The tracker
//! polls the pending-session count until it reaches zero, and gives up after
//! `timeout` instead of blocking removal forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::errors::{MinerError, MinerResult};

/// Anything that can report how many sessions are not yet terminal.
pub trait PendingSessions: Send + Sync {
    fn pending_session_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct DrainConfig {
    pub timeout: Duration,
    pub check_interval: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            check_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainState {
    NotStarted,
    Draining,
    Completed,
    Failed,
}

impl DrainState {
    pub fn is_finished(&self) -> bool {
        matches!(self, DrainState::Completed | DrainState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct DrainStatus {
    pub tenant_id: String,
    pub state: DrainState,
    pub pending_sessions: usize,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub error: Option<String>,
}

impl DrainStatus {
    fn not_started(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            state: DrainState::NotStarted,
            pending_sessions: 0,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

struct Drain {
    status: DrainStatus,
    cancel: CancellationToken,
    state_tx: watch::Sender<DrainState>,
}

type Drains = Arc<Mutex<HashMap<String, Drain>>>;

pub struct DrainTracker {
    config: DrainConfig,
    drains: Drains,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl DrainTracker {
    pub fn new(config: DrainConfig) -> Self {
        Self {
            config,
            drains: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Begin draining `tenant_id`. Fails if a drain for it is already running.
    pub fn initiate(&self, tenant_id: &str, sessions: Arc<dyn PendingSessions>) -> MinerResult<()> {
        if self.cancel.is_cancelled() {
            return Err(MinerError::Closed("drain tracker"));
        }
        let cancel = self.cancel.child_token();
        {
            let mut drains = self.drains.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = drains.get(tenant_id) {
                if existing.status.state == DrainState::Draining {
                    return Err(MinerError::AlreadyStarted("drain"));
                }
            }
            let (state_tx, _) = watch::channel(DrainState::Draining);
            drains.insert(
                tenant_id.to_string(),
                Drain {
                    status: DrainStatus {
                        tenant_id: tenant_id.to_string(),
                        state: DrainState::Draining,
                        pending_sessions: sessions.pending_session_count(),
                        started_at: Some(Instant::now()),
                        finished_at: None,
                        error: None,
                    },
                    cancel: cancel.clone(),
                    state_tx,
                },
            );
        }
        tracing::info!(tenant = %tenant_id, timeout = ?self.config.timeout, "drain started");

        let drains = Arc::clone(&self.drains);
        let config = self.config.clone();
        let tenant_id = tenant_id.to_string();
        self.tasks.spawn(async move {
            let started = Instant::now();
            let (state, error) = loop {
                let pending = sessions.pending_session_count();
                update(&drains, &tenant_id, |status| status.pending_sessions = pending);
                if pending == 0 {
                    break (DrainState::Completed, None);
                }
                if started.elapsed() >= config.timeout {
                    break (DrainState::Failed, Some(format!("timed out with {pending} pending sessions")));
                }
                tokio::select! {
                    _ = cancel.cancelled() => break (DrainState::Failed, Some("cancelled".to_string())),
                    _ = tokio::time::sleep(config.check_interval) => {}
                }
            };

            match &error {
                None => tracing::info!(tenant = %tenant_id, "drain completed"),
                Some(reason) => tracing::error!(tenant = %tenant_id, %reason, "drain failed"),
            }
            let mut drains = drains.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(drain) = drains.get_mut(&tenant_id) {
                drain.status.state = state;
                drain.status.error = error;
                drain.status.finished_at = Some(Instant::now());
                drain.state_tx.send_replace(state);
            }
        });
        Ok(())
    }

    pub fn status(&self, tenant_id: &str) -> DrainStatus {
        self.drains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant_id)
            .map(|drain| drain.status.clone())
            .unwrap_or_else(|| DrainStatus::not_started(tenant_id))
    }

    /// Abort a running drain; it finishes as `Failed`.
    pub fn cancel(&self, tenant_id: &str) -> bool {
        let drains = self.drains.lock().unwrap_or_else(PoisonError::into_inner);
        match drains.get(tenant_id) {
            Some(drain) if drain.status.state == DrainState::Draining => {
                drain.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Wait for the drain of `tenant_id` to finish.
    pub async fn wait(&self, tenant_id: &str) -> DrainState {
        let mut rx = {
            let drains = self.drains.lock().unwrap_or_else(PoisonError::into_inner);
            match drains.get(tenant_id) {
                Some(drain) => drain.state_tx.subscribe(),
                None => return DrainState::NotStarted,
            }
        };
        let state = match rx.wait_for(DrainState::is_finished).await {
            Ok(state) => *state,
            Err(_) => self.status(tenant_id).state,
        };
        state
    }

    /// Forget a finished drain.
    pub fn clear(&self, tenant_id: &str) {
        let mut drains = self.drains.lock().unwrap_or_else(PoisonError::into_inner);
        if drains
            .get(tenant_id)
            .is_some_and(|drain| drain.status.state.is_finished())
        {
            drains.remove(tenant_id);
        }
    }

    /// Cancel every running drain and wait for the pollers.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

fn update(drains: &Drains, tenant_id: &str, apply: impl FnOnce(&mut DrainStatus)) {
    let mut drains = drains.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(drain) = drains.get_mut(tenant_id) {
        apply(&mut drain.status);
    }
}
