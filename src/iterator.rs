// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! A depth-first cursor over a committed tree's leaves, backing `values()`,
//! reading directly from the store rather than the in-memory working
//! arena so it always reflects what is actually durable.

use crate::error::Result;
use crate::fs::Filesystem;
use crate::hash::Hasher;
use crate::node::{NodePointer, NodeRecord};
use crate::store::Store;

/// Yields every `(key, value)` pair reachable from a root pointer.
/// Descends left before right, so in practice leaves come out in
/// ascending key order, but that ordering is a side effect of the
/// descent, not a guarantee callers should depend on.
pub struct TreeIterator<'a, FS: Filesystem + Clone, H: Hasher> {
    store: &'a Store<FS, H>,
    stack: Vec<NodePointer>,
}

impl<'a, FS: Filesystem + Clone, H: Hasher> TreeIterator<'a, FS, H> {
    pub(crate) fn new(store: &'a Store<FS, H>, root: NodePointer) -> Self {
        let mut stack = Vec::new();
        if !root.is_nil() {
            stack.push(root);
        }
        TreeIterator { store, stack }
    }
}

impl<'a, FS: Filesystem + Clone, H: Hasher> Iterator for TreeIterator<'a, FS, H> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let ptr = self.stack.pop()?;
            let record = match self.store.read_node(ptr.file_index, ptr.file_pos) {
                Ok(record) => record,
                Err(e) => return Some(Err(e)),
            };
            match record {
                NodeRecord::Internal { left, right } => {
                    if !right.is_nil() {
                        self.stack.push(right);
                    }
                    if !left.is_nil() {
                        self.stack.push(left);
                    }
                }
                NodeRecord::Leaf { key, value, .. } => {
                    return match self.store.read_value(value) {
                        Ok(bytes) => Some(Ok((key, bytes))),
                        Err(e) => Some(Err(e)),
                    };
                }
            }
        }
    }
}
