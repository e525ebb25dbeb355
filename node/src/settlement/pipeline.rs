// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Batched submission.
//!
//! [`BatchingSubmitter`] is a [`TxSubmitter`] decorator. Each caller's
//! messages are queued with a reply channel; a worker per message kind
//! collects them for up to `batch_wait` (or until `max_per_batch` are
//! queued), groups them by timeout height, submits each group in chunks of at
//! most `max_per_batch` with retries, and answers every caller with the
//! outcome of the chunk that carried its message.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chain::{ClaimMsg, ProofMsg, TxSubmitter};
use crate::errors::{MinerError, MinerResult};
use crate::metrics::{names, SharedMetrics};
use crate::settlement::with_retries;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_per_batch: usize,
    pub batch_wait: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_per_batch: 10,
            batch_wait: Duration::from_secs(5),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            queue_capacity: 1024,
        }
    }
}

trait Batched: Clone + Send + Sync + 'static {
    fn session_id(&self) -> &str;
}

impl Batched for ClaimMsg {
    fn session_id(&self) -> &str {
        &self.header.session_id
    }
}

impl Batched for ProofMsg {
    fn session_id(&self) -> &str {
        &self.header.session_id
    }
}

struct Queued<M> {
    timeout_height: u64,
    msg: M,
    reply: oneshot::Sender<MinerResult<()>>,
}

type SubmitFn<M> = Arc<dyn Fn(u64, Vec<M>) -> BoxFuture<'static, MinerResult<()>> + Send + Sync>;

pub struct BatchingSubmitter {
    claims: mpsc::Sender<Queued<ClaimMsg>>,
    proofs: mpsc::Sender<Queued<ProofMsg>>,
    cancel: CancellationToken,
    workers: TaskTracker,
    closed: AtomicBool,
}

impl BatchingSubmitter {
    /// Spawn the claim and proof workers in front of `inner`.
    pub fn new(config: BatchConfig, inner: Arc<dyn TxSubmitter>, metrics: SharedMetrics) -> Self {
        let cancel = CancellationToken::new();
        let workers = TaskTracker::new();
        let capacity = config.queue_capacity.max(1);

        let (claims, claim_rx) = mpsc::channel(capacity);
        let claim_inner = inner.clone();
        let submit_claims: SubmitFn<ClaimMsg> = Arc::new(
            move |height: u64, msgs: Vec<ClaimMsg>| -> BoxFuture<'static, MinerResult<()>> {
                let inner = claim_inner.clone();
                Box::pin(async move { inner.submit_claims(height, msgs).await })
            },
        );
        workers.spawn(run_worker(
            "claim",
            claim_rx,
            submit_claims,
            config.clone(),
            metrics.clone(),
            cancel.clone(),
        ));

        let (proofs, proof_rx) = mpsc::channel(capacity);
        let submit_proofs: SubmitFn<ProofMsg> = Arc::new(
            move |height: u64, msgs: Vec<ProofMsg>| -> BoxFuture<'static, MinerResult<()>> {
                let inner = inner.clone();
                Box::pin(async move { inner.submit_proofs(height, msgs).await })
            },
        );
        workers.spawn(run_worker(
            "proof",
            proof_rx,
            submit_proofs,
            config,
            metrics,
            cancel.clone(),
        ));

        Self {
            claims,
            proofs,
            cancel,
            workers,
            closed: AtomicBool::new(false),
        }
    }

    async fn enqueue<M: Batched>(
        &self,
        queue: &mpsc::Sender<Queued<M>>,
        timeout_height: u64,
        msgs: Vec<M>,
    ) -> MinerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MinerError::Closed("batching submitter"));
        }
        let mut replies = Vec::with_capacity(msgs.len());
        for msg in msgs {
            let (reply, rx) = oneshot::channel();
            queue
                .send(Queued {
                    timeout_height,
                    msg,
                    reply,
                })
                .await
                .map_err(|_| MinerError::Closed("batching submitter"))?;
            replies.push(rx);
        }
        for outcome in join_all(replies).await {
            outcome.map_err(|_| MinerError::Closed("batching submitter"))??;
        }
        Ok(())
    }

    /// Stop the workers. Queued messages that were not submitted yet are
    /// answered with `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.workers.close();
        self.workers.wait().await;
    }
}

#[async_trait]
impl TxSubmitter for BatchingSubmitter {
    async fn submit_claims(&self, timeout_height: u64, msgs: Vec<ClaimMsg>) -> MinerResult<()> {
        self.enqueue(&self.claims, timeout_height, msgs).await
    }

    async fn submit_proofs(&self, timeout_height: u64, msgs: Vec<ProofMsg>) -> MinerResult<()> {
        self.enqueue(&self.proofs, timeout_height, msgs).await
    }
}

async fn run_worker<M: Batched>(
    kind: &'static str,
    mut rx: mpsc::Receiver<Queued<M>>,
    submit: SubmitFn<M>,
    config: BatchConfig,
    metrics: SharedMetrics,
    cancel: CancellationToken,
) {
    let max = config.max_per_batch.max(1);
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };

        let mut pending = vec![first];
        let deadline = tokio::time::Instant::now() + config.batch_wait;
        while pending.len() < max {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => break,
                item = rx.recv() => match item {
                    Some(item) => pending.push(item),
                    None => break,
                },
            }
        }

        flush(kind, pending, &submit, &config, &metrics, &cancel).await;
    }

    rx.close();
    while let Ok(item) = rx.try_recv() {
        let _ = item.reply.send(Err(MinerError::Closed("batching submitter")));
    }
}

async fn flush<M: Batched>(
    kind: &'static str,
    pending: Vec<Queued<M>>,
    submit: &SubmitFn<M>,
    config: &BatchConfig,
    metrics: &SharedMetrics,
    cancel: &CancellationToken,
) {
    let mut by_height: BTreeMap<u64, Vec<Queued<M>>> = BTreeMap::new();
    for item in pending {
        by_height.entry(item.timeout_height).or_default().push(item);
    }

    let max = config.max_per_batch.max(1);
    for (timeout_height, mut group) in by_height {
        while !group.is_empty() {
            let rest = group.split_off(group.len().min(max));
            let chunk = std::mem::replace(&mut group, rest);
            let msgs: Vec<M> = chunk.iter().map(|item| item.msg.clone()).collect();

            metrics.record_histogram(
                names::SUBMISSION_BATCH_SIZE,
                msgs.len() as f64,
                &[("kind", kind)],
            );
            let result = with_retries(config.retry_attempts, config.retry_delay, cancel, |_| {
                submit(timeout_height, msgs.clone())
            })
            .await;

            match &result {
                Ok(()) => {
                    tracing::debug!(kind, timeout_height, size = chunk.len(), "batch submitted")
                }
                Err(e) => tracing::warn!(
                    kind,
                    timeout_height,
                    size = chunk.len(),
                    error = %e,
                    "batch submission failed"
                ),
            }
            for item in chunk {
                let outcome = match &result {
                    Ok(()) => Ok(()),
                    Err(e) => Err(MinerError::SubmissionFailed {
                        session_id: item.msg.session_id().to_string(),
                        reason: e.to_string(),
                    }),
                };
                let _ = item.reply.send(outcome);
            }
        }
    }
}
