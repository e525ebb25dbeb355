// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Submission timing.
//!
//! Chain height is polled; nothing pushes blocks to us. A submission waits
//! until its window has opened, reads the hash of the window-open block and
//! derives a per-tenant [`SubmissionWindow`] from it, then waits again until
//! `earliest_submit`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use relaymint_kernel::window::{SessionWindow, SubmissionWindow};
use tokio_util::sync::CancellationToken;

use crate::chain::{Block, ChainOracle, ParamsSource};
use crate::errors::{MinerError, MinerResult};
use crate::metrics::{names, SharedMetrics};

#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub poll_interval: Duration,
    /// Expected block interval, for estimates only.
    pub block_time: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            block_time: Duration::from_secs(6),
        }
    }
}

pub struct SubmissionTimingCalculator {
    config: TimingConfig,
    oracle: Arc<dyn ChainOracle>,
    params: Arc<dyn ParamsSource>,
}

impl SubmissionTimingCalculator {
    pub fn new(
        config: TimingConfig,
        oracle: Arc<dyn ChainOracle>,
        params: Arc<dyn ParamsSource>,
    ) -> Self {
        Self {
            config,
            oracle,
            params,
        }
    }

    pub fn oracle(&self) -> &Arc<dyn ChainOracle> {
        &self.oracle
    }

    pub async fn session_window(&self, session_end_height: u64) -> MinerResult<SessionWindow> {
        let params = self.params.shared_params().await?;
        Ok(SessionWindow::for_session(&params, session_end_height))
    }

    /// Block until the claim window is open and return this tenant's slot in it.
    pub async fn claim_window(
        &self,
        tenant_id: &str,
        session_end_height: u64,
        buffer: u64,
        cancel: &CancellationToken,
    ) -> MinerResult<SubmissionWindow> {
        let window = self.session_window(session_end_height).await?;
        self.spread(tenant_id, window.claim_open, window.claim_close, buffer, cancel)
            .await
    }

    pub async fn proof_window(
        &self,
        tenant_id: &str,
        session_end_height: u64,
        buffer: u64,
        cancel: &CancellationToken,
    ) -> MinerResult<SubmissionWindow> {
        let window = self.session_window(session_end_height).await?;
        self.spread(tenant_id, window.proof_open, window.proof_close, buffer, cancel)
            .await
    }

    async fn spread(
        &self,
        tenant_id: &str,
        open: u64,
        close: u64,
        buffer: u64,
        cancel: &CancellationToken,
    ) -> MinerResult<SubmissionWindow> {
        let latest = self.wait_for_height(open, cancel).await?;
        let hash = self.block_hash_at(open, latest).await;
        Ok(SubmissionWindow::spread(open, close, buffer, &hash, tenant_id))
    }

    /// Hash of the block at `height`, or of `fallback` when the oracle cannot
    /// look blocks up by height.
    pub async fn block_hash_at(&self, height: u64, fallback: Block) -> Vec<u8> {
        match self.oracle.block_at(height).await {
            Ok(Some(block)) => block.hash,
            Ok(None) => fallback.hash,
            Err(e) => {
                tracing::warn!(height, error = %e, "block lookup failed, using latest block hash");
                fallback.hash
            }
        }
    }

    /// Poll until the chain reaches `target`. Oracle errors are logged and
    /// polling continues.
    pub async fn wait_for_height(
        &self,
        target: u64,
        cancel: &CancellationToken,
    ) -> MinerResult<Block> {
        loop {
            match self.oracle.last_block().await {
                Ok(block) if block.height >= target => return Ok(block),
                Ok(_) => {}
                Err(e) => tracing::warn!(target, error = %e, "height poll failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(MinerError::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    pub fn estimate_time_until_height(&self, current: u64, target: u64) -> Duration {
        let blocks = u32::try_from(target.saturating_sub(current)).unwrap_or(u32::MAX);
        self.config.block_time.saturating_mul(blocks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmissionKind {
    Claim,
    Proof,
}

impl SubmissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionKind::Claim => "claim",
            SubmissionKind::Proof => "proof",
        }
    }
}

/// Pending claim and proof submissions of one tenant with their windows.
pub struct SubmissionScheduler {
    tenant_id: String,
    metrics: SharedMetrics,
    pending: Mutex<HashMap<(SubmissionKind, String), SubmissionWindow>>,
}

impl SubmissionScheduler {
    pub fn new(tenant_id: &str, metrics: SharedMetrics) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            metrics,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn schedule(&self, kind: SubmissionKind, session_id: &str, window: SubmissionWindow) {
        let gauge = match kind {
            SubmissionKind::Claim => names::CLAIM_SCHEDULED_HEIGHT,
            SubmissionKind::Proof => names::PROOF_SCHEDULED_HEIGHT,
        };
        self.metrics.set_gauge(
            gauge,
            window.earliest_submit as f64,
            &[("tenant", self.tenant_id.as_str()), ("session_id", session_id)],
        );
        tracing::debug!(
            tenant = %self.tenant_id,
            session_id,
            kind = kind.as_str(),
            earliest = window.earliest_submit,
            deadline = window.safe_deadline,
            "scheduled submission"
        );
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, session_id.to_string()), window);
    }

    pub fn window(&self, kind: SubmissionKind, session_id: &str) -> Option<SubmissionWindow> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, session_id.to_string()))
            .cloned()
    }

    fn select(&self, kind: SubmissionKind, keep: impl Fn(&SubmissionWindow) -> bool) -> Vec<String> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = pending
            .iter()
            .filter(|((k, _), window)| *k == kind && keep(window))
            .map(|((_, id), _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Sessions whose submission may go out at `height`.
    pub fn ready_at(&self, kind: SubmissionKind, height: u64) -> Vec<String> {
        self.select(kind, |w| w.can_submit(height) && !w.is_past_deadline(height))
    }

    /// Sessions whose safe deadline has passed.
    pub fn overdue_at(&self, kind: SubmissionKind, height: u64) -> Vec<String> {
        self.select(kind, |w| w.is_past_deadline(height))
    }

    pub fn complete(&self, kind: SubmissionKind, session_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, session_id.to_string()));
    }

    pub fn pending_count(&self, kind: SubmissionKind) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::noop;
    use async_trait::async_trait;
    use relaymint_kernel::window::SharedParams;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Chain {
        height: AtomicU64,
    }

    #[async_trait]
    impl ChainOracle for Chain {
        async fn last_block(&self) -> MinerResult<Block> {
            let height = self.height.fetch_add(1, Ordering::SeqCst);
            Ok(Block {
                height,
                hash: height.to_be_bytes().to_vec(),
            })
        }

        async fn block_at(&self, height: u64) -> MinerResult<Option<Block>> {
            Ok(Some(Block {
                height,
                hash: height.to_be_bytes().to_vec(),
            }))
        }
    }

    struct Params;

    #[async_trait]
    impl ParamsSource for Params {
        async fn shared_params(&self) -> MinerResult<SharedParams> {
            Ok(SharedParams::default())
        }
    }

    fn calculator(start: u64) -> SubmissionTimingCalculator {
        SubmissionTimingCalculator::new(
            TimingConfig::default(),
            Arc::new(Chain {
                height: AtomicU64::new(start),
            }),
            Arc::new(Params),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_window_waits_for_open_and_is_deterministic() {
        let cancel = CancellationToken::new();
        let a = calculator(105).claim_window("tenant-a", 110, 2, &cancel).await.unwrap();
        let b = calculator(112).claim_window("tenant-a", 110, 2, &cancel).await.unwrap();
        assert_eq!(a, b);
        assert_eq!((a.window_open, a.window_close), (112, 120));
        assert!(a.earliest_submit >= 112 && a.earliest_submit < 118);
        assert_eq!(a.safe_deadline, 118);
    }

    #[tokio::test(start_paused = true)]
    async fn test_proof_window_bounds() {
        let cancel = CancellationToken::new();
        let w = calculator(121).proof_window("tenant-a", 110, 2, &cancel).await.unwrap();
        assert_eq!((w.window_open, w.window_close), (121, 130));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_height_is_cancellable() {
        let calc = calculator(0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            calc.wait_for_height(1_000_000, &cancel).await,
            Err(MinerError::Cancelled)
        ));
    }

    #[test]
    fn test_estimate() {
        let calc = calculator(0);
        assert_eq!(calc.estimate_time_until_height(100, 105), Duration::from_secs(30));
        assert_eq!(calc.estimate_time_until_height(105, 100), Duration::ZERO);
    }

    #[test]
    fn test_scheduler_ready_and_overdue() {
        let scheduler = SubmissionScheduler::new("tenant-a", noop());
        scheduler.schedule(
            SubmissionKind::Claim,
            "s1",
            SubmissionWindow::spread(112, 120, 2, b"hash", "tenant-a"),
        );
        let window = scheduler.window(SubmissionKind::Claim, "s1").unwrap();

        assert!(scheduler.ready_at(SubmissionKind::Claim, 111).is_empty());
        assert_eq!(
            scheduler.ready_at(SubmissionKind::Claim, window.earliest_submit),
            vec!["s1".to_string()]
        );
        assert!(scheduler.ready_at(SubmissionKind::Proof, window.earliest_submit).is_empty());
        assert!(scheduler.ready_at(SubmissionKind::Claim, 118).is_empty());
        assert_eq!(scheduler.overdue_at(SubmissionKind::Claim, 118), vec!["s1".to_string()]);

        scheduler.complete(SubmissionKind::Claim, "s1");
        assert_eq!(scheduler.pending_count(SubmissionKind::Claim), 0);
    }
}
