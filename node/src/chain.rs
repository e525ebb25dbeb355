// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Narrow contracts to the chain and to relay ingestion.
//!
//! The miner never talks to a node directly; these traits are implemented by
//! the query/broadcast clients of the host process (and by scripted mocks in
//! tests).

use async_trait::async_trait;
use relaymint_kernel::window::SharedParams;
use serde::{Deserialize, Serialize};

use crate::errors::MinerResult;

/// An observed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: u64,
    pub hash: Vec<u8>,
}

/// Polled source of chain height. Nothing is pushed.
#[async_trait]
pub trait ChainOracle: Send + Sync {
    async fn last_block(&self) -> MinerResult<Block>;

    /// Block at an exact height, when the backend can look it up. Callers fall
    /// back to the latest observed block otherwise.
    async fn block_at(&self, _height: u64) -> MinerResult<Option<Block>> {
        Ok(None)
    }
}

#[async_trait]
pub trait ParamsSource: Send + Sync {
    async fn shared_params(&self) -> MinerResult<SharedParams>;
}

/// Identifies a session on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub session_id: String,
    pub service_id: String,
    pub counterparty_id: String,
    pub start_height: u64,
    pub end_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimMsg {
    pub tenant_id: String,
    pub header: SessionHeader,
    /// Encoded [`relaymint_kernel::tree::RootDigest`].
    pub root: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofMsg {
    pub tenant_id: String,
    pub header: SessionHeader,
    /// Encoded [`relaymint_kernel::tree::ClosestProof`].
    pub proof: Vec<u8>,
}

/// Broadcast client. Submissions are safe to retry: the chain rejects a second
/// claim or proof for the same session.
#[async_trait]
pub trait TxSubmitter: Send + Sync {
    async fn submit_claims(&self, timeout_height: u64, msgs: Vec<ClaimMsg>) -> MinerResult<()>;
    async fn submit_proofs(&self, timeout_height: u64, msgs: Vec<ProofMsg>) -> MinerResult<()>;
}

/// Authoritative session metadata; used to build chain messages when the
/// locally recorded snapshot is incomplete.
#[async_trait]
pub trait SessionQuery: Send + Sync {
    async fn session_header(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> MinerResult<Option<SessionHeader>>;
}

/// A validated relay receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub session_id: String,
    pub relay_digest: Vec<u8>,
    pub relay_payload: Vec<u8>,
    pub weight: u64,
    pub tenant_id: String,
    pub service_id: String,
    pub counterparty_id: String,
    pub session_start_height: u64,
    pub session_end_height: u64,
}

/// A relay handed out by a [`RelaySource`], acknowledged by `delivery_id`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: String,
    pub relay: Relay,
}

/// Upstream relay stream for one tenant. A delivery is acknowledged only after
/// it has been made durable; unacknowledged deliveries are redelivered.
#[async_trait]
pub trait RelaySource: Send + Sync {
    async fn fetch(&self, tenant_id: &str, max: usize) -> MinerResult<Vec<Delivery>>;
    async fn ack(&self, tenant_id: &str, delivery_ids: &[String]) -> MinerResult<()>;
}
