// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Closest-leaf inclusion proofs.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::hash::{hash_leaf, hash_node, leaf_path, Digest};
use crate::tree::RootDigest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling_hash: Digest,
    pub sibling_sum: u64,
    pub sibling_on_left: bool,
}

/// Inclusion proof for the leaf closest to a requested path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosestProof {
    /// The path the prover was asked about.
    pub path: Digest,
    pub leaf_key: Vec<u8>,
    pub leaf_value: Vec<u8>,
    pub leaf_weight: u64,
    /// Leaf-to-root order.
    pub steps: Vec<ProofStep>,
}

impl ClosestProof {
    /// Fold the proof up to a root and compare with `root`.
    pub fn verify(&self, root: &RootDigest) -> KernelResult<()> {
        let mut hash = hash_leaf(&leaf_path(&self.leaf_key), &self.leaf_value, self.leaf_weight);
        let mut sum = self.leaf_weight;

        for step in &self.steps {
            hash = if step.sibling_on_left {
                hash_node(&step.sibling_hash, step.sibling_sum, &hash, sum)
            } else {
                hash_node(&hash, sum, &step.sibling_hash, step.sibling_sum)
            };
            sum = sum
                .checked_add(step.sibling_sum)
                .ok_or(KernelError::Overflow)?;
        }

        if hash == root.hash && sum == root.sum {
            Ok(())
        } else {
            Err(KernelError::InvalidProof)
        }
    }

    pub fn to_bytes(&self) -> KernelResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|_| KernelError::Encoding)
    }

    pub fn from_bytes(bytes: &[u8]) -> KernelResult<Self> {
        let (proof, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|_| KernelError::Encoding)?;
        Ok(proof)
    }
}
