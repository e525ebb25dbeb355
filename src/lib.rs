// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
#![no_std]

//! relaymint-kernel: deterministic session accounting for the relay miner.
//!
//! Everything in this crate is pure: no clocks, no I/O, no randomness.
//! The async runtime in `relaymint-node` drives these types.

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod error;
pub mod hash;
pub mod session;
pub mod window;
pub mod tree;

#[cfg(test)]
pub mod tests;
