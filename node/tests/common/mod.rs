// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Scripted chain collaborators shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relaymint_kernel::window::SharedParams;
use relaymint_node::chain::{
    Block, ChainOracle, ClaimMsg, ParamsSource, ProofMsg, Relay, TxSubmitter,
};
use relaymint_node::errors::{MinerError, MinerResult};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("relaymint_node=debug")
        .with_test_writer()
        .try_init();
}

pub fn block(height: u64) -> Block {
    Block {
        height,
        hash: blake3::hash(&height.to_be_bytes()).as_bytes().to_vec(),
    }
}

/// Chain whose height is set by the test.
pub struct MockChain {
    height: AtomicU64,
}

impl MockChain {
    pub fn at(height: u64) -> Arc<Self> {
        Arc::new(Self {
            height: AtomicU64::new(height),
        })
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainOracle for MockChain {
    async fn last_block(&self) -> MinerResult<Block> {
        Ok(block(self.height()))
    }

    async fn block_at(&self, height: u64) -> MinerResult<Option<Block>> {
        Ok((height <= self.height()).then(|| block(height)))
    }
}

pub struct StaticParams(pub SharedParams);

impl StaticParams {
    pub fn default_params() -> Arc<Self> {
        Arc::new(Self(SharedParams::default()))
    }
}

#[async_trait]
impl ParamsSource for StaticParams {
    async fn shared_params(&self) -> MinerResult<SharedParams> {
        Ok(self.0)
    }
}

/// Records every submission; claims or proofs can be made to fail.
#[derive(Default)]
pub struct RecordingSubmitter {
    pub claims: Mutex<Vec<(u64, ClaimMsg)>>,
    pub proofs: Mutex<Vec<(u64, ProofMsg)>>,
    pub claim_calls: AtomicUsize,
    pub proof_calls: AtomicUsize,
    pub fail_claims: AtomicBool,
    pub fail_proofs: AtomicBool,
}

impl RecordingSubmitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn claimed_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .claims
            .lock()
            .unwrap()
            .iter()
            .map(|(_, msg)| msg.header.session_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn proven_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .proofs
            .lock()
            .unwrap()
            .iter()
            .map(|(_, msg)| msg.header.session_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl TxSubmitter for RecordingSubmitter {
    async fn submit_claims(&self, timeout_height: u64, msgs: Vec<ClaimMsg>) -> MinerResult<()> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(MinerError::Chain("claim rejected".into()));
        }
        let mut claims = self.claims.lock().unwrap();
        claims.extend(msgs.into_iter().map(|msg| (timeout_height, msg)));
        Ok(())
    }

    async fn submit_proofs(&self, timeout_height: u64, msgs: Vec<ProofMsg>) -> MinerResult<()> {
        self.proof_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_proofs.load(Ordering::SeqCst) {
            return Err(MinerError::Chain("proof rejected".into()));
        }
        let mut proofs = self.proofs.lock().unwrap();
        proofs.extend(msgs.into_iter().map(|msg| (timeout_height, msg)));
        Ok(())
    }
}

/// The `n`th relay of a session ending at `end_height`.
pub fn relay(tenant_id: &str, session_id: &str, n: u64, end_height: u64) -> Relay {
    Relay {
        session_id: session_id.to_string(),
        relay_digest: blake3::hash(format!("{session_id}/{n}").as_bytes())
            .as_bytes()
            .to_vec(),
        relay_payload: format!("payload-{n}").into_bytes(),
        weight: 1 + n % 5,
        tenant_id: tenant_id.to_string(),
        service_id: "anvil".to_string(),
        counterparty_id: "app-1".to_string(),
        session_start_height: end_height.saturating_sub(9),
        session_end_height: end_height,
    }
}
