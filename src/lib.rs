// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! `merklix` is a persistent, authenticated key-value index: a binary
//! radix tree keyed by the bits of a cryptographic hash, backed by an
//! append-only flat-file store so every historical root stays
//! addressable and a crash never needs more than a backward scan to
//! recover from.
//!
//! The pieces, in dependency order: [`hash`] (the pluggable digest),
//! [`node`] and [`meta`] (bit-exact on-disk layouts), [`write_buffer`]
//! and [`fs`] (how bytes actually reach disk), [`file_cache`] and
//! [`store`] (the append-only store itself), [`tree`] (the working set
//! and its insert/remove/commit operations), [`proof`] (inclusion and
//! exclusion proofs and their stateless verifier), and [`iterator`] (the
//! committed-tree walk behind `values()`).
//!
//! This crate only instruments with `tracing`; it installs no
//! subscriber, leaving that to the binary that embeds it.

pub mod error;
pub mod file_cache;
pub mod fs;
pub mod hash;
pub mod iterator;
pub mod meta;
pub mod node;
pub mod proof;
pub mod store;
pub mod tree;
pub mod write_buffer;

#[cfg(any(test, feature = "fuzzing"))]
mod proptest_suite;

pub use error::{Error, Result};
pub use hash::{Digest, Hasher, Sha256Hasher, DIGEST_LEN};
pub use proof::{Proof, ProofDecodeError, ProofError, Terminal};
pub use tree::{MerklixTree, StoreConfig, TreeConfig};
