// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! The tree engine: an in-memory working set over a [`Store`], supporting
//! insert/remove/lookup, growing a dead-end chain on key collision and
//! collapsing one on removal ("ungrow"), and committing the dirty subtree
//! to disk.
//!
//! The working set is an arena (`RefCell<Vec<Node>>`) addressed by plain
//! indices, so node references stay `Copy` and resolve lazily rather than
//! threading borrows through the tree. The `RefCell` is what lets
//! read-only methods (`get`, `root_hash`) still materialize a `Node::Hash`
//! placeholder into its real form and memoize the result.

use crate::error::{Error, Result};
use crate::fs::Filesystem;
use crate::hash::{bit_at, common_prefix_len, hash_internal, hash_leaf, Digest, Hasher};
use crate::iterator::TreeIterator;
use crate::meta::Meta;
use crate::node::{NodePointer, NodeRecord, ValuePointer};
use crate::proof::{Proof, ProofError, Terminal};
use crate::store::Store;
use crate::write_buffer::WriteBuffer;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::path::PathBuf;

type NodeId = usize;

/// A leaf's value, either held in memory (just inserted or not yet
/// re-read from disk) or known only by its on-disk location.
#[derive(Clone, Debug)]
enum LeafValue {
    Memory(Vec<u8>),
    Stored(ValuePointer),
}

#[derive(Debug)]
struct InternalNode {
    left: NodeId,
    right: NodeId,
    dirty: bool,
    digest: Option<Digest>,
    pointer: Option<NodePointer>,
}

#[derive(Debug)]
struct LeafNode {
    key: Vec<u8>,
    value: LeafValue,
    dirty: bool,
    digest: Option<Digest>,
    pointer: Option<NodePointer>,
}

/// One arena slot. `Hash` is both an unresolved pointer to an on-disk
/// node *and* the representation of a NIL child (`NodePointer::nil`):
/// NIL is never materialized as its own variant, only as the hasher's
/// zero digest paired with the reserved file index.
#[derive(Debug)]
enum Node {
    Hash(NodePointer),
    Internal(InternalNode),
    Leaf(LeafNode),
}

/// Where a store directory lives and how the tree opened on it is
/// configured. `Serialize`/`Deserialize` let a caller load this straight
/// out of a config file rather than build it by hand.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct StoreConfig {
    pub prefix: PathBuf,
    pub standalone: bool,
    pub bits: usize,
}

/// Top-level configuration for [`MerklixTree::open`]. `hasher` carries
/// no data; it exists so the hash implementation is part of the type
/// the caller asks for, not inferred from context.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(bound = "")]
pub struct TreeConfig<H: Hasher> {
    pub store: StoreConfig,
    pub hasher: PhantomData<H>,
}

/// An authenticated key-value index backed by an append-only flat-file
/// store. `root` names the arena slot holding the current working root;
/// it moves when `remove` collapses the tree down to a single surviving
/// leaf, rather than staying pinned to slot 0.
pub struct MerklixTree<FS: Filesystem + Clone, H: Hasher> {
    store: Store<FS, H>,
    arena: RefCell<Vec<Node>>,
    root: NodeId,
    bits: usize,
    _hasher: PhantomData<H>,
}

/// What descending to remove a key produced, used to drive ungrow:
/// collapse while the sibling at each level is a dead end paired with a
/// bare leaf, then invalidate (without collapsing) every ancestor above
/// the point collapsing stopped.
enum RemoveOutcome {
    /// The key wasn't present along this path; nothing changed.
    NotFound,
    /// This subtree was a leaf matching the key; it is now NIL.
    Removed,
    /// This subtree collapsed entirely into a single surviving leaf.
    Collapsed(NodeId),
    /// This subtree is still a real internal node, possibly with one
    /// child updated.
    Kept(NodeId),
}

impl<FS: Filesystem + Clone, H: Hasher> MerklixTree<FS, H> {
    /// Opens (creating if necessary) the store at `config.store.prefix`
    /// and positions the working root at whatever the store currently
    /// considers committed.
    pub fn open(fs: FS, config: TreeConfig<H>) -> Result<Self> {
        let bits = config.store.bits;
        if bits == 0 || bits % 8 != 0 {
            return Err(Error::State("bits must be a positive multiple of 8"));
        }
        let store = Store::open(fs, config.store.prefix, bits, config.store.standalone)?;
        let root_ptr = store.current_root();
        let arena = RefCell::new(vec![Node::Hash(root_ptr)]);
        Ok(MerklixTree {
            store,
            arena,
            root: 0,
            bits,
            _hasher: PhantomData,
        })
    }

    /// Drops the in-memory working set. Any uncommitted insert/remove is
    /// lost, exactly as if the process had exited.
    pub fn close(self) -> Result<()> {
        Ok(())
    }

    /// Destroys the underlying store.
    pub fn destroy(self) -> Result<()> {
        self.store.destroy()
    }

    fn check_key_len(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.bits / 8 {
            return Err(Error::State("key length does not match the tree's configured bit width"));
        }
        Ok(())
    }

    fn alloc(&self, node: Node) -> NodeId {
        let mut arena = self.arena.borrow_mut();
        arena.push(node);
        arena.len() - 1
    }

    /// Materializes a `Node::Hash` placeholder into its real
    /// `Internal`/`Leaf` form by reading the store, leaving its children
    /// (if any) as fresh, still-unresolved placeholders. A no-op for
    /// anything already resolved, and for NIL.
    fn resolve(&self, id: NodeId) -> Result<()> {
        let pending = match &self.arena.borrow()[id] {
            Node::Hash(ptr) if !ptr.is_nil() => Some(*ptr),
            _ => None,
        };
        let Some(ptr) = pending else {
            return Ok(());
        };
        let record = self.store.read_node(ptr.file_index, ptr.file_pos)?;
        let node = match record {
            NodeRecord::Internal { left, right } => Node::Internal(InternalNode {
                left: self.alloc(Node::Hash(left)),
                right: self.alloc(Node::Hash(right)),
                dirty: false,
                digest: Some(ptr.digest),
                pointer: Some(ptr),
            }),
            NodeRecord::Leaf { digest, key, value } => Node::Leaf(LeafNode {
                key,
                value: LeafValue::Stored(value),
                dirty: false,
                digest: Some(digest),
                pointer: Some(ptr),
            }),
        };
        self.arena.borrow_mut()[id] = node;
        Ok(())
    }

    /// Looks up `key` in the working tree, resolving on-disk nodes along
    /// the way as needed.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key_len(key)?;
        let mut id = self.root;
        let mut depth = 0usize;
        loop {
            self.resolve(id)?;
            let arena = self.arena.borrow();
            match &arena[id] {
                Node::Hash(_) => return Ok(None),
                Node::Leaf(leaf) => {
                    if leaf.key != key {
                        return Ok(None);
                    }
                    return match &leaf.value {
                        LeafValue::Memory(v) => Ok(Some(v.clone())),
                        LeafValue::Stored(vp) => {
                            let vp = *vp;
                            drop(arena);
                            Ok(Some(self.store.read_value(vp)?))
                        }
                    };
                }
                Node::Internal(internal) => {
                    let bit = bit_at(key, depth);
                    id = if bit { internal.right } else { internal.left };
                    depth += 1;
                    more_asserts::debug_assert_le!(depth, self.bits, "descent depth is bounded by the key width");
                }
            }
        }
    }

    /// Inserts or overwrites `key`. Colliding with an existing leaf at a
    /// different key grows a dead-end-padded internal chain down to
    /// wherever the two keys first diverge.
    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.check_key_len(key)?;
        self.root = self.insert_at(self.root, 0, key, value)?;
        Ok(())
    }

    fn insert_at(&mut self, id: NodeId, depth: usize, key: &[u8], value: Vec<u8>) -> Result<NodeId> {
        self.resolve(id)?;
        enum Kind {
            Nil,
            Leaf(Vec<u8>),
            Internal(NodeId, NodeId),
        }
        let kind = {
            let arena = self.arena.borrow();
            match &arena[id] {
                Node::Hash(_) => Kind::Nil,
                Node::Leaf(l) => Kind::Leaf(l.key.clone()),
                Node::Internal(i) => Kind::Internal(i.left, i.right),
            }
        };
        match kind {
            Kind::Nil => {
                self.arena.borrow_mut()[id] = Node::Leaf(LeafNode {
                    key: key.to_vec(),
                    value: LeafValue::Memory(value),
                    dirty: true,
                    digest: None,
                    pointer: None,
                });
                Ok(id)
            }
            Kind::Leaf(existing_key) if existing_key == key => {
                if let Node::Leaf(l) = &mut self.arena.borrow_mut()[id] {
                    l.value = LeafValue::Memory(value);
                    l.dirty = true;
                    l.digest = None;
                    l.pointer = None;
                }
                Ok(id)
            }
            Kind::Leaf(existing_key) => self.grow(id, existing_key, depth, key, value),
            Kind::Internal(left, right) => {
                let bit = bit_at(key, depth);
                let child = if bit { right } else { left };
                let new_child = self.insert_at(child, depth + 1, key, value)?;
                if let Node::Internal(i) = &mut self.arena.borrow_mut()[id] {
                    if bit {
                        i.right = new_child;
                    } else {
                        i.left = new_child;
                    }
                    i.dirty = true;
                    i.digest = None;
                    i.pointer = None;
                }
                Ok(id)
            }
        }
    }

    /// Builds the dead-end-padded chain separating `existing_key` (the
    /// leaf already at `id`) from `new_key`, down to the bit depth where
    /// they diverge.
    fn grow(&mut self, id: NodeId, existing_key: Vec<u8>, depth: usize, new_key: &[u8], new_value: Vec<u8>) -> Result<NodeId> {
        let split_depth = common_prefix_len(&existing_key, new_key, self.bits);
        let new_leaf_id = self.alloc(Node::Leaf(LeafNode {
            key: new_key.to_vec(),
            value: LeafValue::Memory(new_value),
            dirty: true,
            digest: None,
            pointer: None,
        }));

        let existing_goes_right = bit_at(&existing_key, split_depth);
        let (split_left, split_right) = if existing_goes_right { (new_leaf_id, id) } else { (id, new_leaf_id) };
        let mut cur = self.alloc(Node::Internal(InternalNode {
            left: split_left,
            right: split_right,
            dirty: true,
            digest: None,
            pointer: None,
        }));

        for level in (depth..split_depth).rev() {
            let nil_id = self.alloc(Node::Hash(NodePointer::nil(H::zero())));
            let (left, right) = if bit_at(new_key, level) { (nil_id, cur) } else { (cur, nil_id) };
            cur = self.alloc(Node::Internal(InternalNode {
                left,
                right,
                dirty: true,
                digest: None,
                pointer: None,
            }));
        }
        Ok(cur)
    }

    /// Removes `key` if present; a no-op if it isn't, so callers never
    /// need to check presence first.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.check_key_len(key)?;
        match self.remove_at(self.root, 0, key)? {
            RemoveOutcome::NotFound => Ok(()),
            RemoveOutcome::Removed => {
                self.root = self.alloc(Node::Hash(NodePointer::nil(H::zero())));
                Ok(())
            }
            RemoveOutcome::Collapsed(id) | RemoveOutcome::Kept(id) => {
                self.root = id;
                Ok(())
            }
        }
    }

    fn remove_at(&mut self, id: NodeId, depth: usize, key: &[u8]) -> Result<RemoveOutcome> {
        self.resolve(id)?;
        enum Kind {
            Nil,
            Leaf(bool),
            Internal(NodeId, NodeId),
        }
        let kind = {
            let arena = self.arena.borrow();
            match &arena[id] {
                Node::Hash(ptr) => {
                    debug_assert!(ptr.is_nil(), "resolve always materializes non-nil pointers");
                    Kind::Nil
                }
                Node::Leaf(l) => Kind::Leaf(l.key == key),
                Node::Internal(i) => Kind::Internal(i.left, i.right),
            }
        };
        match kind {
            Kind::Nil => Ok(RemoveOutcome::NotFound),
            Kind::Leaf(true) => Ok(RemoveOutcome::Removed),
            Kind::Leaf(false) => Ok(RemoveOutcome::NotFound),
            Kind::Internal(left, right) => {
                let bit = bit_at(key, depth);
                let (child, sibling) = if bit { (right, left) } else { (left, right) };
                match self.remove_at(child, depth + 1, key)? {
                    RemoveOutcome::NotFound => Ok(RemoveOutcome::NotFound),
                    RemoveOutcome::Removed => {
                        self.resolve(sibling)?;
                        if self.is_leaf(sibling) {
                            Ok(RemoveOutcome::Collapsed(sibling))
                        } else {
                            let nil_id = self.alloc(Node::Hash(NodePointer::nil(H::zero())));
                            self.set_children(id, bit, nil_id, sibling);
                            self.invalidate(id);
                            Ok(RemoveOutcome::Kept(id))
                        }
                    }
                    RemoveOutcome::Collapsed(leaf_id) => {
                        self.resolve(sibling)?;
                        if self.is_nil(sibling) {
                            Ok(RemoveOutcome::Collapsed(leaf_id))
                        } else {
                            self.set_children(id, bit, leaf_id, sibling);
                            self.invalidate(id);
                            Ok(RemoveOutcome::Kept(id))
                        }
                    }
                    RemoveOutcome::Kept(new_child) => {
                        self.set_children(id, bit, new_child, sibling);
                        self.invalidate(id);
                        Ok(RemoveOutcome::Kept(id))
                    }
                }
            }
        }
    }

    fn is_leaf(&self, id: NodeId) -> bool {
        matches!(&self.arena.borrow()[id], Node::Leaf(_))
    }

    fn is_nil(&self, id: NodeId) -> bool {
        matches!(&self.arena.borrow()[id], Node::Hash(ptr) if ptr.is_nil())
    }

    /// Reassigns `id`'s children so that the side matching `bit` holds
    /// `child`, and the other side holds `sibling` unchanged.
    fn set_children(&self, id: NodeId, bit: bool, child: NodeId, sibling: NodeId) {
        let mut arena = self.arena.borrow_mut();
        if let Node::Internal(i) = &mut arena[id] {
            if bit {
                i.right = child;
                i.left = sibling;
            } else {
                i.left = child;
                i.right = sibling;
            }
        }
    }

    fn invalidate(&self, id: NodeId) {
        let mut arena = self.arena.borrow_mut();
        if let Node::Internal(i) = &mut arena[id] {
            i.dirty = true;
            i.digest = None;
            i.pointer = None;
        }
    }

    /// The working root's digest, computed without any I/O: a `Node::Hash`
    /// placeholder already carries its digest, and a dirty leaf's value is
    /// always held in memory, so no disk read is ever needed to answer
    /// this.
    pub fn root_hash(&self) -> Digest {
        self.node_digest(self.root)
    }

    fn node_digest(&self, id: NodeId) -> Digest {
        enum Pending {
            Done(Digest),
            Internal(NodeId, NodeId),
            Leaf(Vec<u8>, Vec<u8>),
        }
        let pending = {
            let arena = self.arena.borrow();
            match &arena[id] {
                Node::Hash(ptr) => Pending::Done(ptr.digest),
                Node::Internal(i) => match i.digest {
                    Some(d) => Pending::Done(d),
                    None => Pending::Internal(i.left, i.right),
                },
                Node::Leaf(l) => match l.digest {
                    Some(d) => Pending::Done(d),
                    None => match &l.value {
                        LeafValue::Memory(v) => Pending::Leaf(l.key.clone(), v.clone()),
                        LeafValue::Stored(_) => unreachable!("a clean leaf always has a cached digest"),
                    },
                },
            }
        };
        match pending {
            Pending::Done(d) => d,
            Pending::Internal(left, right) => {
                let digest = hash_internal::<H>(&self.node_digest(left), &self.node_digest(right));
                if let Node::Internal(i) = &mut self.arena.borrow_mut()[id] {
                    i.digest = Some(digest);
                }
                digest
            }
            Pending::Leaf(key, value) => {
                let digest = hash_leaf::<H>(&key, &value);
                if let Node::Leaf(l) = &mut self.arena.borrow_mut()[id] {
                    l.digest = Some(digest);
                }
                digest
            }
        }
    }

    /// Writes every dirty node reachable from the working root, then
    /// publishes the result as the store's new current (and, in
    /// standalone mode, historical) root.
    pub fn commit(&mut self) -> Result<Digest> {
        let mut writer = self.store.begin_commit();
        let root_ptr = self.commit_node(self.root, &mut writer)?;
        self.store.finish_commit(writer, root_ptr)
    }

    fn commit_node(&mut self, id: NodeId, writer: &mut WriteBuffer) -> Result<NodePointer> {
        enum Action {
            Done(NodePointer),
            Internal(NodeId, NodeId),
            Leaf(Vec<u8>, Vec<u8>),
        }
        let action = {
            let arena = self.arena.borrow();
            match &arena[id] {
                Node::Hash(ptr) => Action::Done(*ptr),
                Node::Internal(i) if !i.dirty => {
                    Action::Done(i.pointer.expect("a clean internal node always has a pointer"))
                }
                Node::Internal(i) => Action::Internal(i.left, i.right),
                Node::Leaf(l) if !l.dirty => Action::Done(l.pointer.expect("a clean leaf always has a pointer")),
                Node::Leaf(l) => match &l.value {
                    LeafValue::Memory(v) => Action::Leaf(l.key.clone(), v.clone()),
                    LeafValue::Stored(_) => unreachable!("a dirty leaf always holds its value in memory"),
                },
            }
        };
        match action {
            Action::Done(ptr) => Ok(ptr),
            Action::Internal(left, right) => {
                let left_ptr = self.commit_node(left, writer)?;
                let right_ptr = self.commit_node(right, writer)?;
                let ptr = self.store.write_node(writer, &NodeRecord::Internal { left: left_ptr, right: right_ptr });
                if let Node::Internal(i) = &mut self.arena.borrow_mut()[id] {
                    i.left = left;
                    i.right = right;
                    i.dirty = false;
                    i.digest = Some(ptr.digest);
                    i.pointer = Some(ptr);
                }
                Ok(ptr)
            }
            Action::Leaf(key, value) => {
                let value_ptr = self.store.write_value(writer, &value);
                let digest = hash_leaf::<H>(&key, &value);
                let record = NodeRecord::Leaf { digest, key, value: value_ptr };
                let ptr = self.store.write_node(writer, &record);
                if let Node::Leaf(l) = &mut self.arena.borrow_mut()[id] {
                    l.dirty = false;
                    l.digest = Some(ptr.digest);
                    l.pointer = Some(ptr);
                }
                Ok(ptr)
            }
        }
    }

    /// Produces an inclusion or exclusion proof for `key` against an
    /// already-committed `root_hash`, read entirely from the store,
    /// independent of whatever is currently dirty in memory.
    pub fn prove(&self, root_hash: Digest, key: &[u8]) -> Result<Proof> {
        self.check_key_len(key)?;
        let mut ptr = self.store.get_root(root_hash)?;
        let mut omitted = Vec::new();
        let mut siblings = Vec::new();
        let mut depth: u16 = 0;
        loop {
            if ptr.is_nil() {
                return Ok(Proof { depth, omitted, siblings, terminal: Terminal::DeadEnd });
            }
            match self.store.read_node(ptr.file_index, ptr.file_pos)? {
                NodeRecord::Leaf { key: leaf_key, value, .. } => {
                    let value_bytes = self.store.read_value(value)?;
                    let terminal = if leaf_key == key {
                        Terminal::Exists { value: value_bytes }
                    } else {
                        Terminal::Collision { key: leaf_key, value: value_bytes }
                    };
                    return Ok(Proof { depth, omitted, siblings, terminal });
                }
                NodeRecord::Internal { left, right } => {
                    let bit = bit_at(key, depth as usize);
                    let (next, sibling) = if bit { (right, left) } else { (left, right) };
                    if sibling.is_nil() {
                        omitted.push(true);
                    } else {
                        omitted.push(false);
                        siblings.push(sibling.digest);
                    }
                    ptr = next;
                    depth += 1;
                }
            }
        }
    }

    /// Stateless proof verification; never errors, always returns a
    /// [`ProofError`] code.
    pub fn verify(&self, root_hash: Digest, key: &[u8], proof: &Proof) -> (ProofError, Option<Vec<u8>>) {
        crate::proof::verify::<H>(root_hash, key, proof, self.bits)
    }

    /// Visits every `(key, value)` pair in the committed tree. Not
    /// ordered by key: callers needing a sorted scan should collect and
    /// sort the results themselves.
    pub fn values(&self, mut visit: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let root = self.store.current_root();
        for item in TreeIterator::new(&self.store, root) {
            let (key, value) = item?;
            visit(&key, &value)?;
        }
        Ok(())
    }
}


/// A fixed sequence of small scenarios exercising collision growth and
/// removal collapse, each worked by hand against an 8-bit key width:
/// `0x00`, `0xC0`, `0xD0`, `0x80` are chosen so `0xC0`/`0xD0` share three
/// leading bits and `0x80` later fills the dead end their collision
/// leaves at depth 2, all while staying inside the `bits % 8 == 0`
/// key-width invariant this crate enforces.
#[cfg(test)]
mod scenarios_test {
    use super::*;
    use crate::fs::MemFilesystem;
    use crate::hash::{hash_internal, hash_leaf, Sha256Hasher};

    fn open(fs: &MemFilesystem) -> MerklixTree<MemFilesystem, Sha256Hasher> {
        MerklixTree::open(
            fs.clone(),
            TreeConfig {
                store: StoreConfig {
                    prefix: PathBuf::from("/store"),
                    standalone: true,
                    bits: 8,
                },
                hasher: PhantomData,
            },
        )
        .unwrap()
    }

    const K0: u8 = 0x00;
    const KC: u8 = 0xC0;
    const KD: u8 = 0xD0;
    const K8: u8 = 0x80;

    #[test]
    fn single_leaf_root_is_its_own_digest() {
        let fs = MemFilesystem::new();
        let mut tree = open(&fs);
        tree.insert(&[K0], b"a".to_vec()).unwrap();
        let root = tree.commit().unwrap();
        assert_eq!(root, hash_leaf::<Sha256Hasher>(&[K0], b"a"));
    }

    #[test]
    fn two_leaves_at_depth_one() {
        let fs = MemFilesystem::new();
        let mut tree = open(&fs);
        tree.insert(&[K0], b"a".to_vec()).unwrap();
        tree.insert(&[KC], b"b".to_vec()).unwrap();
        let root = tree.commit().unwrap();

        let leaf0 = hash_leaf::<Sha256Hasher>(&[K0], b"a");
        let leafc = hash_leaf::<Sha256Hasher>(&[KC], b"b");
        // 0x00's top bit is 0 (left), 0xC0's top bit is 1 (right).
        assert_eq!(root, hash_internal::<Sha256Hasher>(&leaf0, &leafc));
    }

    #[test]
    fn colliding_keys_grow_a_dead_end_chain() {
        let fs = MemFilesystem::new();
        let mut tree = open(&fs);
        tree.insert(&[K0], b"a".to_vec()).unwrap();
        tree.insert(&[KC], b"b".to_vec()).unwrap();
        tree.insert(&[KD], b"c".to_vec()).unwrap();
        let root = tree.commit().unwrap();

        // 0xC0 = 1100_0000, 0xD0 = 1101_0000: they share bits 0,1,2 and
        // diverge at bit 3.
        let leafc = hash_leaf::<Sha256Hasher>(&[KC], b"b");
        let leafd = hash_leaf::<Sha256Hasher>(&[KD], b"c");
        let split = hash_internal::<Sha256Hasher>(&leafc, &leafd); // depth 3: C left, D right
        let depth2 = hash_internal::<Sha256Hasher>(&split, &Sha256Hasher::zero()); // bit2 of D is 0: dead end on the right
        let depth1 = hash_internal::<Sha256Hasher>(&Sha256Hasher::zero(), &depth2); // bit1 of D is 1: dead end on the left
        let leaf0 = hash_leaf::<Sha256Hasher>(&[K0], b"a");
        assert_eq!(root, hash_internal::<Sha256Hasher>(&leaf0, &depth1));

        // The left subtree (leaf `a`) is untouched by the collision.
        assert_eq!(tree.get(&[K0]).unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn a_new_key_fills_the_dead_end() {
        let fs = MemFilesystem::new();
        let mut tree = open(&fs);
        tree.insert(&[K0], b"a".to_vec()).unwrap();
        tree.insert(&[KC], b"b".to_vec()).unwrap();
        tree.insert(&[KD], b"c".to_vec()).unwrap();
        tree.insert(&[K8], b"d".to_vec()).unwrap();
        tree.commit().unwrap();

        // 0x80 = 1000_0000 fills what was the dead end at depth 2 after
        // the 0xC0/0xD0 collision grew the chain above.
        assert_eq!(tree.get(&[K8]).unwrap(), Some(b"d".to_vec()));
        assert_eq!(tree.get(&[KC]).unwrap(), Some(b"b".to_vec()));
        assert_eq!(tree.get(&[KD]).unwrap(), Some(b"c".to_vec()));
        assert_eq!(tree.get(&[K0]).unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn removing_back_to_two_leaves_matches_the_direct_two_leaf_tree() {
        let fs_direct = MemFilesystem::new();
        let mut tree_direct = open(&fs_direct);
        tree_direct.insert(&[K0], b"a".to_vec()).unwrap();
        tree_direct.insert(&[KC], b"b".to_vec()).unwrap();
        let direct_root = tree_direct.commit().unwrap();

        let fs_grown = MemFilesystem::new();
        let mut tree_grown = open(&fs_grown);
        tree_grown.insert(&[K0], b"a".to_vec()).unwrap();
        tree_grown.insert(&[KC], b"b".to_vec()).unwrap();
        tree_grown.insert(&[KD], b"c".to_vec()).unwrap();
        tree_grown.insert(&[K8], b"d".to_vec()).unwrap();
        tree_grown.remove(&[K8]).unwrap();
        tree_grown.remove(&[KD]).unwrap();
        let collapsed_root = tree_grown.commit().unwrap();

        assert_eq!(collapsed_root, direct_root);
        assert_eq!(tree_grown.get(&[K0]).unwrap(), Some(b"a".to_vec()));
        assert_eq!(tree_grown.get(&[KC]).unwrap(), Some(b"b".to_vec()));
        assert_eq!(tree_grown.get(&[KD]).unwrap(), None);
        assert_eq!(tree_grown.get(&[K8]).unwrap(), None);
    }

    #[test]
    fn truncating_a_torn_commit_recovers_the_prior_root_and_stays_writable() {
        use crate::fs::{FileHandle, Filesystem};

        let fs = MemFilesystem::new();
        let first_root = {
            let mut tree = open(&fs);
            tree.insert(&[K0], b"a".to_vec()).unwrap();
            tree.commit().unwrap()
        };
        let second_root = {
            let mut tree = open(&fs);
            tree.insert(&[KC], b"b".to_vec()).unwrap();
            tree.commit().unwrap()
        };
        assert_ne!(first_root, second_root);

        // Simulate a crash mid-write: truncate the store's single file to
        // partway through the second commit's node record, before its
        // meta record was ever written.
        let path = PathBuf::from("/store").join(crate::file_cache::file_name(1));
        let full_len = fs.lstat(&path).unwrap().size;
        let mut handle = fs.open(&path).unwrap();
        handle.truncate(full_len - 5).unwrap();
        handle.sync().unwrap();
        handle.close().unwrap();

        let mut reopened = open(&fs);
        assert_eq!(reopened.root_hash(), first_root);

        // Reinserting the same key and recommitting reproduces the second root.
        reopened.insert(&[KC], b"b".to_vec()).unwrap();
        let recommitted = reopened.commit().unwrap();
        assert_eq!(recommitted, second_root);
    }
}
