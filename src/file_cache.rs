// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Bounded cache of open [`FileHandle`]s: at most `MAX_OPEN_FILES` handles
//! open at once, evicting a random victim when full rather than paying for
//! LRU bookkeeping on every access. The current append target and any
//! handle with an outstanding read lease are never evicted.
//!
//! Each cached file gets its own lock rather than one lock guarding the
//! whole cache, so a read in flight on one file never blocks an open or
//! close on another.

use crate::error::Result;
use crate::fs::{FileHandle, Filesystem};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;

/// Upper bound on simultaneously open file handles.
pub const MAX_OPEN_FILES: usize = 32;

struct Entry<F: FileHandle> {
    index: u16,
    handle: Mutex<F>,
    /// Outstanding read leases; an entry with `reads > 0` is never chosen
    /// as an eviction victim.
    reads: Mutex<u32>,
}

/// Caches open file handles for one store directory, keyed by file index.
///
/// `rng` is seeded per instance (rather than drawn from thread-local
/// state) so a test can construct a cache with a fixed seed and get a
/// reproducible eviction order.
pub(crate) struct FileCache<FS: Filesystem> {
    fs: FS,
    dir: PathBuf,
    entries: Mutex<Vec<Arc<Entry<FS::File>>>>,
    rng: Mutex<StdRng>,
}

/// A lease on an open handle. While held, the underlying file will not be
/// evicted from the cache.
pub(crate) struct Lease<F: FileHandle> {
    entry: Arc<Entry<F>>,
}

impl<F: FileHandle> Lease<F> {
    pub fn with_handle<T>(&self, f: impl FnOnce(&mut F) -> Result<T>) -> Result<T> {
        let mut guard = self.entry.handle.lock();
        f(&mut guard)
    }
}

impl<F: FileHandle> Drop for Lease<F> {
    fn drop(&mut self) {
        let mut reads = self.entry.reads.lock();
        *reads = reads.saturating_sub(1);
    }
}

impl<FS: Filesystem> FileCache<FS> {
    pub fn new(fs: FS, dir: impl Into<PathBuf>) -> Self {
        FileCache {
            fs,
            dir: dir.into(),
            entries: Mutex::new(Vec::with_capacity(MAX_OPEN_FILES)),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    #[cfg(test)]
    pub fn with_seed(fs: FS, dir: impl Into<PathBuf>, seed: u64) -> Self {
        FileCache {
            fs,
            dir: dir.into(),
            entries: Mutex::new(Vec::with_capacity(MAX_OPEN_FILES)),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn path_for(&self, index: u16) -> PathBuf {
        self.dir.join(file_name(index))
    }

    /// Acquires a read lease on `index`'s handle, opening it (and possibly
    /// evicting another entry) if it is not already cached.
    ///
    /// `pin` identifies a file index that must never be evicted even if it
    /// is not the one being requested — the store's current append
    /// target, whose handle may have buffered writes.
    pub fn acquire(&self, index: u16, pin: u16) -> Result<Lease<FS::File>> {
        {
            let entries = self.entries.lock();
            if let Some(entry) = entries.iter().find(|e| e.index == index) {
                *entry.reads.lock() += 1;
                return Ok(Lease { entry: entry.clone() });
            }
        }

        let handle = self.fs.open(&self.path_for(index))?;
        let entry = Arc::new(Entry {
            index,
            handle: Mutex::new(handle),
            reads: Mutex::new(1),
        });

        let mut entries = self.entries.lock();
        // Another thread may have opened and inserted the same index while
        // we didn't hold the lock; prefer its entry so we don't keep two
        // live handles for one file.
        if let Some(existing) = entries.iter().find(|e| e.index == index) {
            *existing.reads.lock() += 1;
            return Ok(Lease { entry: existing.clone() });
        }

        if entries.len() >= MAX_OPEN_FILES {
            self.evict_one(&mut entries, pin);
        }
        entries.push(entry.clone());
        Ok(Lease { entry })
    }

    /// Picks and removes one eviction victim, skipping `pin` and any entry
    /// with outstanding reads. The chosen handle is captured (and its
    /// `close` invoked) within this same pass, rather than by re-looking
    /// it up by index afterward — a second lookup could race with a
    /// concurrent `acquire` that replaces the slot.
    fn evict_one(&self, entries: &mut Vec<Arc<Entry<FS::File>>>, pin: u16) {
        let candidates: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.index != pin && *e.reads.lock() == 0)
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            // Every cached handle is pinned or leased; the cache is allowed
            // to temporarily exceed MAX_OPEN_FILES rather than block.
            return;
        }
        let pick = candidates[self.rng.lock().gen_range(0..candidates.len())];
        let victim = entries.remove(pick);
        tracing::trace!(index = victim.index, "evicting cached file handle");
        metrics::counter!("merklix_store_file_cache_evictions_total").increment(1);
        // Best-effort close; a flush failure here doesn't lose data since
        // writes are only ever issued through the store's own write
        // buffer, which fsyncs before it considers a commit durable.
        let _ = victim.handle.lock().close();
    }

    /// Removes `index` from the cache without requiring a lease, used when
    /// the store truncates or deletes a file during recovery.
    pub fn drop_index(&self, index: u16) {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.index != index);
    }

    pub fn open_count(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Canonical on-disk name for a numbered store file.
pub(crate) fn file_name(index: u16) -> String {
    format!("{:05}.dat", index)
}

/// Parses a file name produced by [`file_name`], returning `None` for
/// anything that doesn't match (e.g. the `meta` marker files or stray
/// entries left by another process).
pub(crate) fn parse_file_name(name: &str) -> Option<u16> {
    let stem = name.strip_suffix(".dat")?;
    if stem.len() != 5 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

#[cfg(test)]
mod file_cache_test {
    use super::*;
    use crate::fs::MemFilesystem;

    #[test]
    fn file_name_round_trips() {
        assert_eq!(file_name(1), "00001.dat");
        assert_eq!(parse_file_name("00001.dat"), Some(1));
        assert_eq!(parse_file_name("meta"), None);
        assert_eq!(parse_file_name("123.dat"), None);
    }

    #[test]
    fn acquire_reuses_cached_handle() {
        let fs = MemFilesystem::new();
        let cache = FileCache::with_seed(fs, "/store", 1);
        let lease1 = cache.acquire(1, 1).unwrap();
        drop(lease1);
        let _lease2 = cache.acquire(1, 1).unwrap();
        assert_eq!(cache.open_count(), 1);
    }

    #[test]
    fn evicts_when_over_capacity_but_never_the_pinned_index() {
        let fs = MemFilesystem::new();
        let cache = FileCache::with_seed(fs, "/store", 42);
        for i in 1..=(MAX_OPEN_FILES as u16 + 5) {
            let lease = cache.acquire(i, MAX_OPEN_FILES as u16 + 5).unwrap();
            drop(lease);
        }
        assert!(cache.open_count() <= MAX_OPEN_FILES);
        // the pin must still be reachable without forcing a fresh open
        // beyond the cap (it was never evicted).
        let _lease = cache.acquire(MAX_OPEN_FILES as u16 + 5, MAX_OPEN_FILES as u16 + 5).unwrap();
    }

    #[test]
    fn leased_entry_is_never_evicted() {
        let fs = MemFilesystem::new();
        let cache = FileCache::with_seed(fs, "/store", 7);
        let held = cache.acquire(1, 0).unwrap();
        for i in 2..=(MAX_OPEN_FILES as u16 + 10) {
            let lease = cache.acquire(i, 0).unwrap();
            drop(lease);
        }
        held.with_handle(|_| Ok(())).unwrap();
    }
}
