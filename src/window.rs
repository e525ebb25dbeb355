// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Claim/proof window math.
//!
//! All heights are chain block heights. Windows are half-open: `[open, close)`.

use serde::{Deserialize, Serialize};

use crate::hash::spread_seed;

/// Protocol parameters that position the claim and proof windows relative to
/// a session's end height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedParams {
    pub num_blocks_per_session: u64,
    pub grace_period_end_offset_blocks: u64,
    pub claim_window_open_offset_blocks: u64,
    pub claim_window_close_offset_blocks: u64,
    pub proof_window_open_offset_blocks: u64,
    pub proof_window_close_offset_blocks: u64,
}

impl Default for SharedParams {
    fn default() -> Self {
        Self {
            num_blocks_per_session: 10,
            grace_period_end_offset_blocks: 1,
            claim_window_open_offset_blocks: 1,
            claim_window_close_offset_blocks: 8,
            proof_window_open_offset_blocks: 1,
            proof_window_close_offset_blocks: 9,
        }
    }
}

/// Claim and proof windows of a single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub session_end_height: u64,
    pub claim_open: u64,
    pub claim_close: u64,
    pub proof_open: u64,
    pub proof_close: u64,
}

impl SessionWindow {
    pub fn for_session(params: &SharedParams, session_end_height: u64) -> Self {
        let claim_open = session_end_height
            .saturating_add(params.claim_window_open_offset_blocks)
            .saturating_add(1);
        let claim_close = claim_open.saturating_add(params.claim_window_close_offset_blocks);
        let proof_open = claim_close.saturating_add(params.proof_window_open_offset_blocks);
        let proof_close = proof_open.saturating_add(params.proof_window_close_offset_blocks);
        Self {
            session_end_height,
            claim_open,
            claim_close,
            proof_open,
            proof_close,
        }
    }

    pub fn is_in_claim_window(&self, height: u64) -> bool {
        height >= self.claim_open && height < self.claim_close
    }

    pub fn is_in_proof_window(&self, height: u64) -> bool {
        height >= self.proof_open && height < self.proof_close
    }

    /// Claim window with the last `buffer` blocks reserved for inclusion.
    pub fn is_claimable(&self, height: u64, buffer: u64) -> bool {
        height >= self.claim_open && height < self.claim_close.saturating_sub(buffer)
    }

    pub fn is_provable(&self, height: u64, buffer: u64) -> bool {
        height >= self.proof_open && height < self.proof_close.saturating_sub(buffer)
    }

    pub fn blocks_until_claim_open(&self, height: u64) -> u64 {
        self.claim_open.saturating_sub(height)
    }

    pub fn blocks_until_claim_close(&self, height: u64) -> u64 {
        self.claim_close.saturating_sub(height)
    }

    pub fn blocks_until_proof_open(&self, height: u64) -> u64 {
        self.proof_open.saturating_sub(height)
    }

    pub fn blocks_until_proof_close(&self, height: u64) -> u64 {
        self.proof_close.saturating_sub(height)
    }
}

/// When a particular tenant should submit inside a shared window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionWindow {
    pub window_open: u64,
    pub window_close: u64,
    pub earliest_submit: u64,
    pub safe_deadline: u64,
    pub block_hash: alloc::vec::Vec<u8>,
}

impl SubmissionWindow {
    /// Spread submissions of different tenants across `[open, close - buffer)`.
    ///
    /// The offset is a pure function of the window-open block hash and the
    /// tenant id, so every replica of a tenant picks the same height while
    /// distinct tenants land on different heights. `earliest_submit` never
    /// exceeds `safe_deadline`.
    pub fn spread(
        window_open: u64,
        window_close: u64,
        buffer: u64,
        block_hash: &[u8],
        tenant_id: &str,
    ) -> Self {
        let safe_close = window_close.saturating_sub(buffer).max(window_open);
        let span = safe_close - window_open;
        let offset = if span == 0 {
            0
        } else {
            spread_seed(block_hash, tenant_id) % span
        };
        let earliest_submit = window_open + offset;
        let safe_deadline = safe_close.max(earliest_submit);
        Self {
            window_open,
            window_close,
            earliest_submit,
            safe_deadline,
            block_hash: block_hash.to_vec(),
        }
    }

    pub fn is_within_window(&self, height: u64) -> bool {
        height >= self.window_open && height < self.window_close
    }

    pub fn can_submit(&self, height: u64) -> bool {
        height >= self.earliest_submit && height < self.window_close
    }

    /// `safe_deadline` is exclusive, like the window close it is derived from.
    pub fn is_past_deadline(&self, height: u64) -> bool {
        height >= self.safe_deadline
    }

    pub fn blocks_until_earliest_submit(&self, height: u64) -> u64 {
        self.earliest_submit.saturating_sub(height)
    }

    pub fn blocks_until_deadline(&self, height: u64) -> u64 {
        self.safe_deadline.saturating_sub(height)
    }
}
