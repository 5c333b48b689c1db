// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Error kinds for the store and tree engine.
//!
//! A single `thiserror`-derived enum with data-carrying variants covers
//! every failure kind the store and tree engine can surface, rather than
//! a separate exception type per kind.

use crate::hash::Digest;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the store and tree engine.
///
/// `verify` never returns an `Error` — it is total and always produces a
/// [`crate::proof::ProofError`] code instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Propagated, mostly verbatim, filesystem failure.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Bad magic, bad checksum, an impossible child pointer, or
    /// non-monotonic file indices. Recoverable by truncation only inside
    /// the recovery scan; fatal to the operation everywhere else.
    #[error("corrupted store: {0}")]
    Corruption(String),

    /// A requested node, or an historical root, could not be located by
    /// walking the meta chain.
    #[error("missing node for root {root:?}{}", node.map(|n| format!(" (node {n:?})")).unwrap_or_default())]
    MissingNode {
        root: Digest,
        node: Option<Digest>,
    },

    /// The operation was invoked in the wrong lifecycle state (opened
    /// twice, operated on while closed, destroyed while still open, ...).
    #[error("invalid state: {0}")]
    State(&'static str),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
