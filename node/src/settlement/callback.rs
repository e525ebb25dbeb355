// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Direct settlement strategy.
//!
//! Claim: wait for the tenant's slot in the claim window, flush the tree,
//! submit the root, persist tree image and checkpoint.
//! Proof: wait for the slot in the proof window, derive the proof path from
//! the block just before the tenant's earliest proof height, prove, verify
//! locally, submit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use relaymint_kernel::hash::proof_path;
use relaymint_kernel::window::SubmissionWindow;
use tokio_util::sync::CancellationToken;

use crate::chain::{Block, ClaimMsg, ProofMsg, SessionHeader, SessionQuery, TxSubmitter};
use crate::dedup::Deduplicator;
use crate::errors::{MinerError, MinerResult};
use crate::lifecycle::LifecycleCallback;
use crate::metrics::{names, SharedMetrics};
use crate::session_store::SessionSnapshot;
use crate::settlement::{with_retries, SettlementConfig};
use crate::snapshot::SnapshotManager;
use crate::timing::{SubmissionKind, SubmissionScheduler, SubmissionTimingCalculator};

pub struct SettlementCallback {
    config: SettlementConfig,
    snapshots: Arc<SnapshotManager>,
    dedup: Arc<Deduplicator>,
    timing: Arc<SubmissionTimingCalculator>,
    submitter: Arc<dyn TxSubmitter>,
    session_query: Option<Arc<dyn SessionQuery>>,
    scheduler: SubmissionScheduler,
    metrics: SharedMetrics,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SettlementCallback {
    pub fn new(
        config: SettlementConfig,
        snapshots: Arc<SnapshotManager>,
        dedup: Arc<Deduplicator>,
        timing: Arc<SubmissionTimingCalculator>,
        submitter: Arc<dyn TxSubmitter>,
        metrics: SharedMetrics,
    ) -> Self {
        let scheduler = SubmissionScheduler::new(&config.tenant_id, metrics.clone());
        Self {
            config,
            snapshots,
            dedup,
            timing,
            submitter,
            session_query: None,
            scheduler,
            metrics,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Prefer chain-side session headers over the locally recorded fields.
    pub fn with_session_query(mut self, query: Arc<dyn SessionQuery>) -> Self {
        self.session_query = Some(query);
        self
    }

    pub fn scheduler(&self) -> &SubmissionScheduler {
        &self.scheduler
    }

    fn tenant(&self) -> &str {
        &self.config.tenant_id
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    fn count_error(&self, kind: SubmissionKind, reason: &str) {
        let name = match kind {
            SubmissionKind::Claim => names::CLAIM_ERRORS,
            SubmissionKind::Proof => names::PROOF_ERRORS,
        };
        self.metrics
            .increment_counter(name, 1, &[("tenant", self.tenant()), ("reason", reason)]);
    }

    fn fail(&self, kind: SubmissionKind, session_id: &str, reason: &str) -> MinerError {
        self.count_error(kind, reason);
        self.scheduler.complete(kind, session_id);
        MinerError::SubmissionFailed {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn header(&self, snapshot: &SessionSnapshot) -> SessionHeader {
        if let Some(query) = &self.session_query {
            match query.session_header(self.tenant(), &snapshot.session_id).await {
                Ok(Some(header)) => return header,
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    tenant = %self.tenant(),
                    session_id = %snapshot.session_id,
                    error = %e,
                    "session header query failed, using local snapshot"
                ),
            }
        }
        SessionHeader {
            session_id: snapshot.session_id.clone(),
            service_id: snapshot.service_id.clone(),
            counterparty_id: snapshot.counterparty_id.clone(),
            start_height: snapshot.start_height,
            end_height: snapshot.end_height,
        }
    }

    /// Wait for the tenant's slot; fails once the safe deadline has passed.
    async fn wait_for_slot(
        &self,
        kind: SubmissionKind,
        session_id: &str,
        window: SubmissionWindow,
        cancel: &CancellationToken,
    ) -> MinerResult<Block> {
        self.scheduler.schedule(kind, session_id, window.clone());
        let block = self
            .timing
            .wait_for_height(window.earliest_submit, cancel)
            .await?;
        if window.is_past_deadline(block.height) {
            tracing::warn!(
                tenant = %self.tenant(),
                session_id,
                kind = kind.as_str(),
                height = block.height,
                deadline = window.safe_deadline,
                "submission deadline passed"
            );
            return Err(self.fail(kind, session_id, "deadline_passed"));
        }
        Ok(block)
    }

    async fn cleanup(&self, snapshot: &SessionSnapshot) {
        self.snapshots.on_session_settled(&snapshot.session_id).await;
        if let Err(e) = self.dedup.cleanup_session(&snapshot.session_id).await {
            tracing::warn!(
                tenant = %self.tenant(),
                session_id = %snapshot.session_id,
                error = %e,
                "failed to clean up dedup state"
            );
        }
        self.scheduler.complete(SubmissionKind::Claim, &snapshot.session_id);
        self.scheduler.complete(SubmissionKind::Proof, &snapshot.session_id);
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&snapshot.session_id);
    }
}

#[async_trait]
impl LifecycleCallback for SettlementCallback {
    async fn on_session_active(&self, snapshot: &SessionSnapshot) -> MinerResult<()> {
        self.snapshots
            .accumulator()
            .get_or_create_tree(&snapshot.session_id)?;
        Ok(())
    }

    async fn on_session_needs_claim(
        &self,
        snapshot: &SessionSnapshot,
        cancel: &CancellationToken,
    ) -> MinerResult<Vec<u8>> {
        let session_id = snapshot.session_id.as_str();
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let window = self
            .timing
            .claim_window(
                self.tenant(),
                snapshot.end_height,
                self.config.claim_submission_buffer,
                cancel,
            )
            .await?;
        self.wait_for_slot(SubmissionKind::Claim, session_id, window.clone(), cancel)
            .await?;

        let accumulator = self.snapshots.accumulator();
        let root = match accumulator.flush_tree(session_id) {
            Ok(root) => root,
            Err(e) => return Err(self.fail(SubmissionKind::Claim, session_id, e.reason())),
        };
        if root.count == 0 {
            return Err(self.fail(SubmissionKind::Claim, session_id, "empty_tree"));
        }

        let msg = ClaimMsg {
            tenant_id: self.tenant().to_string(),
            header: self.header(snapshot).await,
            root: root.to_bytes(),
        };
        let submitted = with_retries(
            self.config.claim_retry_attempts,
            self.config.claim_retry_delay,
            cancel,
            |_| self.submitter.submit_claims(window.window_close, vec![msg.clone()]),
        )
        .await;
        match submitted {
            Ok(()) => {}
            Err(MinerError::Cancelled) => return Err(MinerError::Cancelled),
            Err(_) => return Err(self.fail(SubmissionKind::Claim, session_id, "exhausted_retries")),
        }

        self.metrics
            .increment_counter(names::CLAIMS_SUBMITTED, 1, &[("tenant", self.tenant())]);
        self.scheduler.complete(SubmissionKind::Claim, session_id);
        tracing::info!(
            tenant = %self.tenant(),
            session_id,
            relays = root.count,
            sum = root.sum,
            "claim submitted"
        );

        self.snapshots.on_session_claimed(session_id, &root).await?;
        Ok(root.to_bytes())
    }

    async fn on_session_needs_proof(
        &self,
        snapshot: &SessionSnapshot,
        cancel: &CancellationToken,
    ) -> MinerResult<()> {
        let session_id = snapshot.session_id.as_str();
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let window = self
            .timing
            .proof_window(
                self.tenant(),
                snapshot.end_height,
                self.config.proof_submission_buffer,
                cancel,
            )
            .await?;
        let latest = self
            .wait_for_slot(SubmissionKind::Proof, session_id, window.clone(), cancel)
            .await?;

        let seed_height = window.earliest_submit.saturating_sub(1);
        let seed_hash = self.timing.block_hash_at(seed_height, latest).await;
        let path = proof_path(&seed_hash, session_id);

        let accumulator = self.snapshots.accumulator();
        let proof = accumulator
            .prove_closest(session_id, &path)
            .map_err(|e| self.fail(SubmissionKind::Proof, session_id, e.reason()))?;
        if let Some(root) = accumulator.get_tree_root(session_id)? {
            if proof.verify(&root).is_err() {
                return Err(self.fail(SubmissionKind::Proof, session_id, "invalid_proof"));
            }
        }
        let encoded = proof
            .to_bytes()
            .map_err(|e| MinerError::from_kernel(session_id, e))?;

        let msg = ProofMsg {
            tenant_id: self.tenant().to_string(),
            header: self.header(snapshot).await,
            proof: encoded,
        };
        let submitted = with_retries(
            self.config.proof_retry_attempts,
            self.config.proof_retry_delay,
            cancel,
            |_| self.submitter.submit_proofs(window.window_close, vec![msg.clone()]),
        )
        .await;
        match submitted {
            Ok(()) => {}
            Err(MinerError::Cancelled) => return Err(MinerError::Cancelled),
            Err(_) => return Err(self.fail(SubmissionKind::Proof, session_id, "exhausted_retries")),
        }

        self.metrics
            .increment_counter(names::PROOFS_SUBMITTED, 1, &[("tenant", self.tenant())]);
        self.scheduler.complete(SubmissionKind::Proof, session_id);
        tracing::info!(tenant = %self.tenant(), session_id, seed_height, "proof submitted");
        Ok(())
    }

    async fn on_session_settled(&self, snapshot: &SessionSnapshot) {
        self.cleanup(snapshot).await;
    }

    async fn on_session_expired(&self, snapshot: &SessionSnapshot, reason: &str) {
        tracing::warn!(
            tenant = %self.tenant(),
            session_id = %snapshot.session_id,
            reason,
            relays = snapshot.relay_count,
            weight = snapshot.total_weight,
            "settlement lost for expired session"
        );
        self.cleanup(snapshot).await;
    }
}
