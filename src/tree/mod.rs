// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Merkle sum tree used as the per-session relay accumulator.
//!
//! Leaves are keyed by `BLAKE3(key)` and kept sorted, so the root depends only
//! on the set of leaves, never on insertion order. Internal nodes commit to
//! both child hashes and child weight sums; the root therefore fixes the total
//! weight claimed for the session.
//!
//! A tree is mutable until [`SumTree::flush`]. After that it is frozen: updates
//! fail with [`KernelError::AlreadyFlushed`] and the cached root is returned on
//! every further flush.

pub mod proof;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::hash::{hash_leaf, hash_node, leaf_path, Digest};

pub use proof::{ClosestProof, ProofStep};

/// Root commitment: node hash, total weight and leaf count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootDigest {
    pub hash: Digest,
    pub sum: u64,
    pub count: u64,
}

impl RootDigest {
    pub const ENCODED_LEN: usize = 48;

    pub const EMPTY: RootDigest = RootDigest {
        hash: [0u8; 32],
        sum: 0,
        count: 0,
    };

    /// `hash (32) || sum (u64 LE) || count (u64 LE)`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.hash);
        out.extend_from_slice(&self.sum.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(KernelError::Encoding);
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[..32]);
        let mut sum = [0u8; 8];
        sum.copy_from_slice(&bytes[32..40]);
        let mut count = [0u8; 8];
        count.copy_from_slice(&bytes[40..48]);
        Ok(Self {
            hash,
            sum: u64::from_le_bytes(sum),
            count: u64::from_le_bytes(count),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Leaf {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub weight: u64,
}

/// Serialized form used to persist a tree next to its session snapshot.
#[derive(Serialize, Deserialize)]
struct TreeImage {
    leaves: Vec<Leaf>,
    root: Option<RootDigest>,
}

#[derive(Debug, Clone, Default)]
pub struct SumTree {
    leaves: BTreeMap<Digest, Leaf>,
    sum: u64,
    root: Option<RootDigest>,
}

impl SumTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the leaf for `key`.
    pub fn update(&mut self, key: &[u8], value: &[u8], weight: u64) -> KernelResult<()> {
        if self.root.is_some() {
            return Err(KernelError::AlreadyFlushed);
        }
        if key.is_empty() {
            return Err(KernelError::EmptyKey);
        }

        let path = leaf_path(key);
        let previous = self.leaves.get(&path).map(|leaf| leaf.weight).unwrap_or(0);
        let sum = (self.sum - previous)
            .checked_add(weight)
            .ok_or(KernelError::Overflow)?;

        self.leaves.insert(
            path,
            Leaf {
                key: key.to_vec(),
                value: value.to_vec(),
                weight,
            },
        );
        self.sum = sum;
        Ok(())
    }

    /// Freeze the tree and return its root. Repeated calls return the same root.
    pub fn flush(&mut self) -> RootDigest {
        if let Some(root) = self.root {
            return root;
        }
        let root = self.compute_root();
        self.root = Some(root);
        root
    }

    pub fn is_flushed(&self) -> bool {
        self.root.is_some()
    }

    pub fn root(&self) -> Option<RootDigest> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Prove the leaf whose path is closest (XOR metric) to `path`.
    pub fn prove_closest(&self, path: &Digest) -> KernelResult<ClosestProof> {
        if self.root.is_none() {
            return Err(KernelError::NotFlushed);
        }
        if self.leaves.is_empty() {
            return Err(KernelError::EmptyTree);
        }

        let mut best = 0usize;
        let mut best_distance = [0xffu8; 32];
        for (index, candidate) in self.leaves.keys().enumerate() {
            let distance = xor_distance(path, candidate);
            if index == 0 || distance < best_distance {
                best = index;
                best_distance = distance;
            }
        }

        let mut level = self.leaf_level();
        let mut index = best;
        let mut steps = Vec::new();
        while level.len() > 1 {
            let sibling = index ^ 1;
            if sibling < level.len() {
                let (hash, sum) = level[sibling];
                steps.push(ProofStep {
                    sibling_hash: hash,
                    sibling_sum: sum,
                    sibling_on_left: sibling < index,
                });
            }
            level = next_level(&level);
            index /= 2;
        }

        let leaf = self
            .leaves
            .values()
            .nth(best)
            .ok_or(KernelError::EmptyTree)?;

        Ok(ClosestProof {
            path: *path,
            leaf_key: leaf.key.clone(),
            leaf_value: leaf.value.clone(),
            leaf_weight: leaf.weight,
            steps,
        })
    }

    pub fn to_bytes(&self) -> KernelResult<Vec<u8>> {
        let image = TreeImage {
            leaves: self.leaves.values().cloned().collect(),
            root: self.root,
        };
        bincode::serde::encode_to_vec(&image, bincode::config::standard())
            .map_err(|_| KernelError::Encoding)
    }

    /// Rebuild a tree from [`SumTree::to_bytes`] output. A flushed image is
    /// re-flushed and its root checked against the recorded one.
    pub fn from_bytes(bytes: &[u8]) -> KernelResult<Self> {
        let (image, _): (TreeImage, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|_| KernelError::Encoding)?;

        let mut tree = SumTree::new();
        for leaf in &image.leaves {
            tree.update(&leaf.key, &leaf.value, leaf.weight)?;
        }
        if let Some(recorded) = image.root {
            if tree.flush() != recorded {
                return Err(KernelError::InvalidProof);
            }
        }
        Ok(tree)
    }

    fn leaf_level(&self) -> Vec<(Digest, u64)> {
        self.leaves
            .iter()
            .map(|(path, leaf)| (hash_leaf(path, &leaf.value, leaf.weight), leaf.weight))
            .collect()
    }

    fn compute_root(&self) -> RootDigest {
        if self.leaves.is_empty() {
            return RootDigest::EMPTY;
        }
        let mut level = self.leaf_level();
        while level.len() > 1 {
            level = next_level(&level);
        }
        let (hash, sum) = level[0];
        RootDigest {
            hash,
            sum,
            count: self.leaves.len() as u64,
        }
    }
}

/// Pair adjacent nodes; an odd trailing node is promoted unchanged.
fn next_level(level: &[(Digest, u64)]) -> Vec<(Digest, u64)> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [(lh, ls), (rh, rs)] => (hash_node(lh, *ls, rh, *rs), ls + rs),
            _ => pair[0],
        })
        .collect()
}

fn xor_distance(a: &Digest, b: &Digest) -> Digest {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}
