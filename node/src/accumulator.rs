// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Per-session accumulators.
//!
//! Owns one [`SumTree`] per session in process memory. Trees are never shared
//! across replicas; the WAL and the persisted tree image are what cross the
//! process boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use relaymint_kernel::hash::Digest;
use relaymint_kernel::tree::proof::ClosestProof;
use relaymint_kernel::tree::{RootDigest, SumTree};

use crate::errors::{MinerError, MinerResult};
use crate::metrics::{names, SharedMetrics};
use crate::wal::WalEntry;

/// Outcome of a WAL replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: usize,
    pub skipped: usize,
}

pub struct AccumulatorManager {
    tenant_id: String,
    trees: RwLock<HashMap<String, SumTree>>,
    metrics: SharedMetrics,
    closed: AtomicBool,
}

impl AccumulatorManager {
    pub fn new(tenant_id: &str, metrics: SharedMetrics) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            trees: RwLock::new(HashMap::new()),
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> MinerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MinerError::Closed("accumulator"))
        } else {
            Ok(())
        }
    }

    fn report_count(&self, count: usize) {
        self.metrics.set_gauge(
            names::TREES_ACTIVE,
            count as f64,
            &[("tenant", self.tenant_id.as_str())],
        );
    }

    fn tree_error(&self, session_id: &str, err: MinerError) -> MinerError {
        self.metrics.increment_counter(
            names::TREE_ERRORS,
            1,
            &[("tenant", self.tenant_id.as_str()), ("reason", err.reason())],
        );
        tracing::debug!(tenant = %self.tenant_id, session_id, error = %err, "tree operation failed");
        err
    }

    /// Returns true if a new tree was created.
    pub fn get_or_create_tree(&self, session_id: &str) -> MinerResult<bool> {
        self.ensure_open()?;
        let mut trees = self.trees.write().unwrap_or_else(PoisonError::into_inner);
        if trees.contains_key(session_id) {
            return Ok(false);
        }
        trees.insert(session_id.to_string(), SumTree::new());
        self.report_count(trees.len());
        Ok(true)
    }

    /// Insert a leaf, creating the session tree on first use.
    pub fn update_tree(
        &self,
        session_id: &str,
        key: &[u8],
        value: &[u8],
        weight: u64,
    ) -> MinerResult<()> {
        self.ensure_open()?;
        let mut trees = self.trees.write().unwrap_or_else(PoisonError::into_inner);
        let created = !trees.contains_key(session_id);
        let tree = trees.entry(session_id.to_string()).or_default();
        let result = tree.update(key, value, weight);
        if created {
            let count = trees.len();
            self.report_count(count);
        }
        result.map_err(|e| self.tree_error(session_id, MinerError::from_kernel(session_id, e)))
    }

    /// Freeze the tree and return its root. Idempotent.
    pub fn flush_tree(&self, session_id: &str) -> MinerResult<RootDigest> {
        self.ensure_open()?;
        let mut trees = self.trees.write().unwrap_or_else(PoisonError::into_inner);
        let tree = trees
            .get_mut(session_id)
            .ok_or_else(|| MinerError::NotFound(session_id.to_string()))?;
        let first = !tree.is_flushed();
        let root = tree.flush();
        if first {
            self.metrics.increment_counter(
                names::TREE_FLUSHES,
                1,
                &[("tenant", self.tenant_id.as_str())],
            );
            tracing::debug!(
                tenant = %self.tenant_id,
                session_id,
                leaves = tree.len(),
                sum = root.sum,
                "flushed session tree"
            );
        }
        Ok(root)
    }

    /// Root of a flushed tree, `None` while still accepting updates.
    pub fn get_tree_root(&self, session_id: &str) -> MinerResult<Option<RootDigest>> {
        self.ensure_open()?;
        let trees = self.trees.read().unwrap_or_else(PoisonError::into_inner);
        trees
            .get(session_id)
            .map(SumTree::root)
            .ok_or_else(|| MinerError::NotFound(session_id.to_string()))
    }

    pub fn prove_closest(&self, session_id: &str, path: &Digest) -> MinerResult<ClosestProof> {
        self.ensure_open()?;
        let trees = self.trees.read().unwrap_or_else(PoisonError::into_inner);
        let tree = trees
            .get(session_id)
            .ok_or_else(|| MinerError::NotFound(session_id.to_string()))?;
        tree.prove_closest(path)
            .map_err(|e| self.tree_error(session_id, MinerError::from_kernel(session_id, e)))
    }

    /// Serialized tree, for persisting next to the session snapshot.
    pub fn tree_image(&self, session_id: &str) -> MinerResult<Vec<u8>> {
        self.ensure_open()?;
        let trees = self.trees.read().unwrap_or_else(PoisonError::into_inner);
        let tree = trees
            .get(session_id)
            .ok_or_else(|| MinerError::NotFound(session_id.to_string()))?;
        tree.to_bytes().map_err(|e| MinerError::from_kernel(session_id, e))
    }

    /// Replace the session tree with a persisted image.
    pub fn restore_tree(&self, session_id: &str, image: &[u8]) -> MinerResult<()> {
        self.ensure_open()?;
        let tree = SumTree::from_bytes(image)
            .map_err(|e| self.tree_error(session_id, MinerError::from_kernel(session_id, e)))?;
        let mut trees = self.trees.write().unwrap_or_else(PoisonError::into_inner);
        trees.insert(session_id.to_string(), tree);
        self.report_count(trees.len());
        Ok(())
    }

    /// Apply WAL entries in order. Entries the tree rejects are logged and
    /// skipped; the replay itself only fails if the manager is closed.
    pub fn rebuild_from_wal(&self, session_id: &str, entries: &[WalEntry]) -> MinerResult<ReplayStats> {
        self.ensure_open()?;
        let mut stats = ReplayStats::default();
        let mut trees = self.trees.write().unwrap_or_else(PoisonError::into_inner);
        let tree = trees.entry(session_id.to_string()).or_default();
        for entry in entries {
            match tree.update(&entry.relay_digest, &entry.relay_payload, entry.weight) {
                Ok(()) => stats.applied += 1,
                Err(e) => {
                    stats.skipped += 1;
                    tracing::warn!(
                        tenant = %self.tenant_id,
                        session_id,
                        entry_id = %entry.id,
                        error = %e,
                        "skipping WAL entry during rebuild"
                    );
                }
            }
        }
        let count = trees.len();
        self.report_count(count);
        tracing::info!(
            tenant = %self.tenant_id,
            session_id,
            applied = stats.applied,
            skipped = stats.skipped,
            "rebuilt session tree from WAL"
        );
        Ok(stats)
    }

    pub fn delete_tree(&self, session_id: &str) -> bool {
        let mut trees = self.trees.write().unwrap_or_else(PoisonError::into_inner);
        let removed = trees.remove(session_id).is_some();
        self.report_count(trees.len());
        removed
    }

    pub fn tree_count(&self) -> usize {
        self.trees.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// `(leaves, weight sum)` of a session tree.
    pub fn tree_stats(&self, session_id: &str) -> MinerResult<(usize, u64)> {
        let trees = self.trees.read().unwrap_or_else(PoisonError::into_inner);
        trees
            .get(session_id)
            .map(|tree| (tree.len(), tree.sum()))
            .ok_or_else(|| MinerError::NotFound(session_id.to_string()))
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut trees = self.trees.write().unwrap_or_else(PoisonError::into_inner);
        trees.clear();
        self.report_count(0);
    }
}
