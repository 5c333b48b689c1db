// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! The append-only flat-file store: a directory of numbered files, a
//! bounded open-file cache, meta-record commit and recovery, and historical
//! root lookup through the meta chain.
//!
//! The store sits behind an open/commit/read API over a `Filesystem` trait
//! boundary, and recovers from a crash by scanning an append-only file
//! backward for the last checksum-verified meta record.

use crate::error::{Error, Result};
use crate::file_cache::{file_name, parse_file_name, FileCache};
use crate::fs::Filesystem;
use crate::hash::{Digest, Hasher};
use crate::meta::{Meta, META_SIZE};
use crate::node::{node_record_size, NodePointer, NodeRecord, ValuePointer};
use crate::write_buffer::WriteBuffer;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Upper bound on addressable files; index 0 is reserved.
pub const MAX_FILES: u16 = 0xFFFF;

/// Backward recovery scan reads in slabs no larger than this, aligned
/// down to a multiple of [`META_SIZE`].
const RECOVERY_SLAB_CAP: u64 = 1 << 20;

struct StoreState {
    /// Highest file index that exists on disk (the current append
    /// target). `0` means the store has never been written to.
    last_index: u16,
    /// Append cursor within `last_index`.
    append_pos: u64,
    /// The most recently committed meta record and its own location, or
    /// `None` if the store has never committed in standalone mode.
    last_meta: Option<(Meta, u16, u32)>,
    /// The current root. NIL until the first commit.
    root: NodePointer,
}

/// A directory of numbered append-only files holding committed node and
/// value records, plus (in standalone mode) a chain of meta records
/// making every historical root addressable by digest.
pub struct Store<FS: Filesystem + Clone, H: Hasher> {
    fs: FS,
    dir: PathBuf,
    bits: usize,
    standalone: bool,
    cache: FileCache<FS>,
    state: Mutex<StoreState>,
    root_cache: Mutex<HashMap<Digest, NodePointer>>,
    _hasher: PhantomData<H>,
}

impl<FS: Filesystem + Clone, H: Hasher> Store<FS, H> {
    /// Opens (creating if necessary) the store rooted at `dir`. In
    /// standalone mode, runs recovery to locate the last valid meta
    /// record; otherwise simply positions the append cursor at the end
    /// of the highest-numbered file.
    pub fn open(fs: FS, dir: impl Into<PathBuf>, bits: usize, standalone: bool) -> Result<Self> {
        let dir = dir.into();
        fs.mkdirp(&dir)?;

        let mut indices = Self::scan_indices(&fs, &dir)?;
        indices.sort_unstable();
        for window in indices.windows(2) {
            if window[1] != window[0] + 1 {
                return Err(Error::corruption(format!(
                    "gap in store file indices between {} and {}",
                    window[0], window[1]
                )));
            }
        }

        let cache = FileCache::new(fs.clone(), &dir);
        let state = if standalone {
            Self::recover(&fs, &dir, &indices, bits)?
        } else {
            match indices.last() {
                Some(&index) => {
                    let size = fs.lstat(&dir.join(file_name(index)))?.size;
                    StoreState {
                        last_index: index,
                        append_pos: size,
                        last_meta: None,
                        root: NodePointer::nil(H::zero()),
                    }
                }
                None => StoreState {
                    last_index: 0,
                    append_pos: 0,
                    last_meta: None,
                    root: NodePointer::nil(H::zero()),
                },
            }
        };

        Ok(Store {
            fs,
            dir,
            bits,
            standalone,
            cache,
            state: Mutex::new(state),
            root_cache: Mutex::new(HashMap::new()),
            _hasher: PhantomData,
        })
    }

    fn scan_indices(fs: &FS, dir: &std::path::Path) -> Result<Vec<u16>> {
        let mut indices = Vec::new();
        for name in fs.readdir(dir)? {
            if let Some(index) = parse_file_name(&name) {
                if index == 0 || index > MAX_FILES {
                    return Err(Error::corruption(format!("invalid store file index {index}")));
                }
                let stat = fs.lstat(&dir.join(&name))?;
                if !stat.is_file {
                    return Err(Error::corruption(format!("{name} is not a regular file")));
                }
                indices.push(index);
            }
        }
        Ok(indices)
    }

    /// Backward recovery scan: from the highest file index down, scan in
    /// `META_SIZE`-aligned steps for a checksummed meta record, truncating
    /// the torn tail on a match and unlinking any file in which no meta is
    /// found.
    fn recover(fs: &FS, dir: &std::path::Path, indices: &[u16], bits: usize) -> Result<StoreState> {
        let mut remaining: Vec<u16> = indices.to_vec();
        while let Some(&index) = remaining.last() {
            let path = dir.join(file_name(index));
            let len = fs.lstat(&path)?.size;
            if let Some((meta, pos)) = Self::scan_file_for_meta::<FS>(fs, &path, len)? {
                let truncated_to = pos as u64 + META_SIZE as u64;
                if truncated_to < len {
                    debug!(index, from = len, to = truncated_to, "recovery truncated a torn commit tail");
                }
                let mut handle = fs.open(&path)?;
                handle.truncate(truncated_to)?;
                handle.sync()?;
                handle.close()?;
                let root = if meta.root_index == 0 {
                    NodePointer::nil(H::zero())
                } else {
                    let mut h = fs.open(&dir.join(file_name(meta.root_index)))?;
                    let bytes = h.read_at(meta.root_pos as u64, node_record_size(bits))?;
                    h.close()?;
                    let record = NodeRecord::decode(&bytes, bits).map_err(|e| Error::corruption(e.to_string()))?;
                    NodePointer {
                        digest: record.digest::<H>(),
                        file_index: meta.root_index,
                        file_pos: meta.root_pos,
                    }
                };
                return Ok(StoreState {
                    last_index: index,
                    append_pos: pos as u64 + META_SIZE as u64,
                    last_meta: Some((meta, index, pos)),
                    root,
                });
            }
            warn!(index, "no meta record found in file; unlinking");
            fs.unlink(&path)?;
            remaining.pop();
        }
        Ok(StoreState {
            last_index: 0,
            append_pos: 0,
            last_meta: None,
            root: NodePointer::nil(H::zero()),
        })
    }

    fn scan_file_for_meta<F: Filesystem>(
        fs: &F,
        path: &std::path::Path,
        len: u64,
    ) -> Result<Option<(Meta, u32)>> {
        let mut handle = fs.open(path)?;
        let mut end = len - len % META_SIZE as u64;
        while end > 0 {
            let slab_len = (end.min(RECOVERY_SLAB_CAP / META_SIZE as u64 * META_SIZE as u64)).max(META_SIZE as u64);
            let slab_start = end - slab_len.min(end);
            let slab = handle.read_at(slab_start, (end - slab_start) as usize)?;
            let mut offset = slab.len();
            while offset >= META_SIZE {
                offset -= META_SIZE;
                let candidate = &slab[offset..offset + META_SIZE];
                if candidate[0..4] != crate::meta::META_MAGIC.to_le_bytes() {
                    continue;
                }
                if let Ok(meta) = Meta::decode::<H>(candidate) {
                    handle.close()?;
                    return Ok(Some((meta, (slab_start as usize + offset) as u32)));
                }
            }
            end = slab_start;
        }
        handle.close()?;
        Ok(None)
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn is_standalone(&self) -> bool {
        self.standalone
    }

    /// The store's current root, as of the last completed commit (NIL if
    /// none yet).
    pub fn current_root(&self) -> NodePointer {
        self.state.lock().root
    }

    /// Reads and decodes the node record at a known location.
    pub fn read_node(&self, file_index: u16, file_pos: u32) -> Result<NodeRecord> {
        let pin = self.state.lock().last_index;
        let lease = self.cache.acquire(file_index, pin)?;
        let size = node_record_size(self.bits);
        let bytes = lease.with_handle(|h| h.read_at(file_pos as u64, size))?;
        NodeRecord::decode(&bytes, self.bits).map_err(|e| Error::corruption(e.to_string()))
    }

    /// Reads a value blob previously written alongside a leaf.
    pub fn read_value(&self, ptr: ValuePointer) -> Result<Vec<u8>> {
        let pin = self.state.lock().last_index;
        let lease = self.cache.acquire(ptr.file_index, pin)?;
        lease.with_handle(|h| h.read_at(ptr.file_pos as u64, ptr.size as usize))
    }

    fn read_meta_at(&self, file_index: u16, file_pos: u32) -> Result<Meta> {
        let pin = self.state.lock().last_index;
        let lease = self.cache.acquire(file_index, pin)?;
        let bytes = lease.with_handle(|h| h.read_at(file_pos as u64, META_SIZE))?;
        Meta::decode::<H>(&bytes).map_err(|e| Error::corruption(e.to_string()))
    }

    /// A write buffer positioned at the store's current append cursor.
    pub fn begin_commit(&self) -> WriteBuffer {
        let state = self.state.lock();
        WriteBuffer::new(state.last_index.max(1), state.append_pos)
    }

    /// Encodes and appends a value blob through `writer`, returning its
    /// pointer.
    pub fn write_value(&self, writer: &mut WriteBuffer, bytes: &[u8]) -> ValuePointer {
        let (index, pos) = writer.write(bytes);
        ValuePointer {
            file_index: index,
            file_pos: pos,
            size: bytes.len() as u32,
        }
    }

    /// Encodes and appends a node record through `writer`, returning a
    /// pointer carrying the record's content digest.
    pub fn write_node(&self, writer: &mut WriteBuffer, record: &NodeRecord) -> NodePointer {
        let digest = record.digest::<H>();
        let bytes = record.encode(self.bits);
        let (index, pos) = writer.write(&bytes);
        NodePointer {
            digest,
            file_index: index,
            file_pos: pos,
        }
    }

    /// Finishes a commit: pads to `META_SIZE` alignment, appends the
    /// meta record (standalone mode only), flushes every chunk produced
    /// by `writer` to its destination file, and fsyncs every file
    /// touched before returning. Publishes `root` as the new current
    /// root only after every fsync succeeds.
    pub fn finish_commit(&self, mut writer: WriteBuffer, root: NodePointer) -> Result<Digest> {
        let meta_location = if self.standalone {
            let (prev_index, prev_pos) = self
                .state
                .lock()
                .last_meta
                .map(|(_, i, p)| (i, p))
                .unwrap_or((0, 0));
            let meta = Meta {
                prev_meta_index: prev_index,
                prev_meta_pos: prev_pos,
                root_index: root.file_index,
                root_pos: root.file_pos,
            };
            let (_, pos_off) = writer.position();
            let pad_len = (META_SIZE as u64 - pos_off as u64 % META_SIZE as u64) % META_SIZE as u64;
            if pad_len > 0 {
                writer.write(&vec![0u8; pad_len as usize]);
            }
            let meta_bytes = meta.encode::<H>();
            let (meta_index, meta_pos) = writer.write(&meta_bytes);
            Some((meta, meta_index, meta_pos))
        } else {
            None
        };

        let chunks = writer.flush();
        if chunks.len() > 1 {
            debug!(files = chunks.len(), "commit rolled across a file boundary");
        }
        let mut touched = Vec::new();
        let mut commit_bytes = 0u64;
        for chunk in &chunks {
            let pin = chunk.index;
            commit_bytes += chunk.bytes.len() as u64;
            let lease = self.cache.acquire(chunk.index, pin)?;
            lease.with_handle(|h| h.write(&chunk.bytes))?;
            if !touched.contains(&chunk.index) {
                touched.push(chunk.index);
            }
        }
        for index in &touched {
            let lease = self.cache.acquire(*index, *index)?;
            lease.with_handle(|h| h.sync())?;
        }
        metrics::counter!("merklix_store_commits_total").increment(1);
        metrics::histogram!("merklix_store_commit_bytes").record(commit_bytes as f64);

        let mut state = self.state.lock();
        let (cursor_index, cursor_pos) = writer.position();
        state.last_index = cursor_index;
        state.append_pos = cursor_pos as u64;
        state.root = root;
        if let Some((meta, mi, mp)) = meta_location {
            state.last_meta = Some((meta, mi, mp));
        }
        drop(state);

        if !root.is_nil() || self.standalone {
            self.root_cache.lock().insert(root.digest, root);
        }
        debug!(root = %crate::hash::digest_hex(&root.digest), "commit published new root");
        Ok(root.digest)
    }

    /// Resolves `hash` to a node pointer. `H::zero()` (or the current
    /// root's own digest) always resolves to the current root without
    /// consulting the meta chain.
    pub fn get_root(&self, hash: Digest) -> Result<NodePointer> {
        let current = self.current_root();
        if hash == H::zero() || hash == current.digest {
            return Ok(current);
        }
        if let Some(ptr) = self.root_cache.lock().get(&hash) {
            return Ok(*ptr);
        }
        if !self.standalone {
            return Err(Error::MissingNode { root: hash, node: None });
        }

        let mut cursor = self.state.lock().last_meta;
        while let Some((meta, _mi, _mp)) = cursor {
            let ptr = if meta.root_index == 0 {
                NodePointer::nil(H::zero())
            } else {
                let record = self.read_node(meta.root_index, meta.root_pos)?;
                NodePointer {
                    digest: record.digest::<H>(),
                    file_index: meta.root_index,
                    file_pos: meta.root_pos,
                }
            };
            self.root_cache.lock().insert(ptr.digest, ptr);
            if ptr.digest == hash {
                return Ok(ptr);
            }
            if meta.prev_meta_index == 0 {
                break;
            }
            cursor = Some((self.read_meta_at(meta.prev_meta_index, meta.prev_meta_pos)?, meta.prev_meta_index, meta.prev_meta_pos));
        }
        Err(Error::MissingNode { root: hash, node: None })
    }

    /// Unlinks every store file and removes the prefix directory. On
    /// "not empty" (another process raced a write in), renames the
    /// directory aside instead of failing.
    pub fn destroy(self) -> Result<()> {
        for name in self.fs.readdir(&self.dir)? {
            if parse_file_name(&name).is_some() {
                self.fs.unlink(&self.dir.join(&name))?;
            }
        }
        match self.fs.rmdir(&self.dir) {
            Ok(()) => Ok(()),
            Err(crate::fs::RmdirError::NotEmpty) => {
                let suffix: u64 = rand::thread_rng().gen();
                let sibling = self
                    .dir
                    .with_file_name(format!(
                        "{}-destroyed-{suffix:016x}",
                        self.dir.file_name().and_then(|n| n.to_str()).unwrap_or("store")
                    ));
                self.fs.rename(&self.dir, &sibling)?;
                warn!(path = ?sibling, "store directory not empty at destroy; renamed aside");
                Ok(())
            }
            Err(crate::fs::RmdirError::Other(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod store_test {
    use super::*;
    use crate::fs::StdFilesystem;
    use crate::hash::{hash_leaf, Sha256Hasher};
    use crate::node::NodeRecord;

    /// The store's behavior is exercised elsewhere (`tree.rs`) almost
    /// entirely against [`crate::fs::MemFilesystem`]; these drive the
    /// real `std::fs`-backed path directly, one layer below the tree
    /// engine, against actual files on disk.
    #[test]
    fn std_filesystem_commit_and_reopen_preserves_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let root_digest = {
            let store = Store::<StdFilesystem, Sha256Hasher>::open(StdFilesystem, dir.path(), 8, true).unwrap();
            let mut writer = store.begin_commit();
            let value_ptr = store.write_value(&mut writer, b"a");
            let record = NodeRecord::Leaf {
                digest: hash_leaf::<Sha256Hasher>(&[0x00], b"a"),
                key: vec![0x00],
                value: value_ptr,
            };
            let root_ptr = store.write_node(&mut writer, &record);
            store.finish_commit(writer, root_ptr).unwrap()
        };

        let reopened = Store::<StdFilesystem, Sha256Hasher>::open(StdFilesystem, dir.path(), 8, true).unwrap();
        assert_eq!(reopened.current_root().digest, root_digest);
        let record = reopened.read_node(reopened.current_root().file_index, reopened.current_root().file_pos).unwrap();
        match record {
            NodeRecord::Leaf { key, value, .. } => {
                assert_eq!(key, vec![0x00]);
                assert_eq!(reopened.read_value(value).unwrap(), b"a".to_vec());
            }
            other => panic!("expected a leaf record, got {other:?}"),
        }
    }

    #[test]
    fn gap_in_file_indices_is_rejected_at_open() {
        let dir = tempfile::tempdir().unwrap();
        // Create files 1 and 3, skipping 2.
        std::fs::write(dir.path().join(file_name(1)), []).unwrap();
        std::fs::write(dir.path().join(file_name(3)), []).unwrap();

        let result = Store::<StdFilesystem, Sha256Hasher>::open(StdFilesystem, dir.path(), 8, true);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn destroy_removes_the_store_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::<StdFilesystem, Sha256Hasher>::open(StdFilesystem, dir.path(), 8, true).unwrap();
        let path = dir.path().to_path_buf();
        store.destroy().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn empty_store_has_a_nil_root_and_no_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::<StdFilesystem, Sha256Hasher>::open(StdFilesystem, dir.path(), 8, true).unwrap();
        assert!(store.current_root().is_nil());
        assert_eq!(store.current_root().digest, Sha256Hasher::zero());
    }

    #[test]
    fn get_root_by_zero_digest_returns_the_current_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::<StdFilesystem, Sha256Hasher>::open(StdFilesystem, dir.path(), 8, true).unwrap();
        let resolved = store.get_root(Sha256Hasher::zero()).unwrap();
        assert_eq!(resolved, store.current_root());
    }

    #[test]
    fn get_root_for_an_unknown_hash_is_a_missing_node_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::<StdFilesystem, Sha256Hasher>::open(StdFilesystem, dir.path(), 8, true).unwrap();
        let bogus = [0x42u8; crate::hash::DIGEST_LEN];
        assert!(matches!(store.get_root(bogus), Err(Error::MissingNode { .. })));
    }
}
