// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Claim and proof submission.
//!
//! [`SettlementCallback`] is the lifecycle strategy that waits for this
//! tenant's slot in a window, builds the chain message and submits it with
//! bounded retries. [`BatchingSubmitter`] wraps any [`crate::chain::TxSubmitter`]
//! and coalesces messages from many sessions into fewer transactions.

pub mod callback;
pub mod pipeline;

use std::time::Duration;

pub use callback::SettlementCallback;
pub use pipeline::{BatchConfig, BatchingSubmitter};

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub tenant_id: String,
    pub claim_retry_attempts: u32,
    pub claim_retry_delay: Duration,
    pub proof_retry_attempts: u32,
    pub proof_retry_delay: Duration,
    pub claim_submission_buffer: u64,
    pub proof_submission_buffer: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            claim_retry_attempts: 3,
            claim_retry_delay: Duration::from_secs(2),
            proof_retry_attempts: 3,
            proof_retry_delay: Duration::from_secs(2),
            claim_submission_buffer: 2,
            proof_submission_buffer: 2,
        }
    }
}

/// Run `op` up to `attempts` times with `delay` between failures. Returns the
/// last error once attempts are exhausted; cancellation ends the wait early.
pub(crate) async fn with_retries<F, Fut>(
    attempts: u32,
    delay: Duration,
    cancel: &tokio_util::sync::CancellationToken,
    mut op: F,
) -> crate::errors::MinerResult<()>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = crate::errors::MinerResult<()>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::warn!(attempt, attempts, error = %e, "submission attempt failed, retrying");
            }
        }
        attempt += 1;
        tokio::select! {
            _ = cancel.cancelled() => return Err(crate::errors::MinerError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
