// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Canonical BLAKE3 hashing.
//!
//! Every digest that leaves this crate (tree nodes, proof paths, spreading
//! offsets) is computed here so that all replicas agree bit-for-bit.

/// Domain separators for the sum tree.
pub const LEAF_PREFIX: u8 = 0x00;
pub const NODE_PREFIX: u8 = 0x01;

pub type Digest = [u8; 32];

/// Hash an arbitrary byte slice.
pub fn hash_bytes(data: &[u8]) -> Digest {
    *blake3::hash(data).as_bytes()
}

/// Position of a key inside the tree's keyspace.
pub fn leaf_path(key: &[u8]) -> Digest {
    hash_bytes(key)
}

pub fn hash_leaf(path: &Digest, value: &[u8], weight: u64) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(path);
    hasher.update(hash_bytes(value).as_slice());
    hasher.update(&weight.to_le_bytes());
    *hasher.finalize().as_bytes()
}

pub fn hash_node(left: &Digest, left_sum: u64, right: &Digest, right_sum: u64) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left);
    hasher.update(&left_sum.to_le_bytes());
    hasher.update(right);
    hasher.update(&right_sum.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// Path used to select the proven leaf for a claimed session.
///
/// Derived from the hash of the block preceding the earliest proof height and
/// the session id, so it is unknown until that block exists.
pub fn proof_path(seed_block_hash: &[u8], session_id: &str) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(seed_block_hash);
    hasher.update(session_id.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Deterministic 64-bit value used to spread submissions of one tenant.
pub fn spread_seed(window_open_block_hash: &[u8], tenant_id: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(window_open_block_hash);
    hasher.update(tenant_id.as_bytes());
    let digest = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(first)
}
