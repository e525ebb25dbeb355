// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Error types.

use core::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// The tree has been flushed and no longer accepts updates.
    AlreadyFlushed,
    /// A proof was requested before the tree was flushed.
    NotFlushed,
    /// Proof requested from a tree with no leaves.
    EmptyTree,
    /// Leaf keys must be non-empty.
    EmptyKey,
    /// Weight sum exceeded u64.
    Overflow,
    /// Proof does not reconstruct the expected root.
    InvalidProof,
    /// Encoding or decoding failed.
    Encoding,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::AlreadyFlushed => "tree already flushed",
            KernelError::NotFlushed => "tree not flushed",
            KernelError::EmptyTree => "tree has no leaves",
            KernelError::EmptyKey => "empty leaf key",
            KernelError::Overflow => "weight overflow",
            KernelError::InvalidProof => "invalid proof",
            KernelError::Encoding => "encoding error",
        };
        f.write_str(msg)
    }
}

pub type KernelResult<T> = core::result::Result<T, KernelError>;
