// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! The filesystem port consumed by [`crate::store`]: any object providing
//! `mkdirp`, `readdir`, `lstat`, `rename`, `unlink`, `rmdir`, and per-file
//! `open`/`read`/`write`/`truncate`/`sync`/`close`.
//!
//! Shipping an in-memory stand-in (`MemFilesystem`) alongside the real,
//! `std::fs`-backed implementation (`StdFilesystem`) keeps crash-recovery
//! and file-rolling tests fast and deterministic without touching disk.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

/// Metadata about a directory entry, as returned by `lstat`.
#[derive(Clone, Copy, Debug)]
pub struct Stat {
    pub is_file: bool,
    pub size: u64,
}

/// `rmdir` must distinguish "directory not empty" from every other
/// failure, since a store's `destroy` treats the two differently.
#[derive(Debug)]
pub enum RmdirError {
    NotEmpty,
    Other(Error),
}

/// A single numbered file: append, positional read, truncate, sync, close.
pub trait FileHandle: Send {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    fn truncate(&mut self, len: u64) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn close(&mut self) -> Result<()>;
}

/// The directory-and-file operations the store needs.
pub trait Filesystem: Send + Sync {
    type File: FileHandle;

    fn mkdirp(&self, path: &Path) -> Result<()>;
    fn readdir(&self, path: &Path) -> Result<Vec<String>>;
    fn lstat(&self, path: &Path) -> Result<Stat>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn unlink(&self, path: &Path) -> Result<()>;
    fn rmdir(&self, path: &Path) -> std::result::Result<(), RmdirError>;
    fn open(&self, path: &Path) -> Result<Self::File>;
}

/// Real, `std::fs`-backed filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdFilesystem;

pub struct StdFileHandle {
    path: PathBuf,
    file: File,
}

impl FileHandle for StdFileHandle {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io(&self.path, e))?;
        let mut buf = vec![0u8; len];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(buf)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::io(&self.path, e))?;
        self.file.write_all(bytes).map_err(|e| Error::io(&self.path, e))
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(|e| Error::io(&self.path, e))
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(|e| Error::io(&self.path, e))
    }

    fn len(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| Error::io(&self.path, e))
    }

    fn close(&mut self) -> Result<()> {
        // `File` closes on drop; nothing to flush beyond an explicit sync,
        // which callers issue themselves before a close that must survive
        // a crash.
        Ok(())
    }
}

impl Filesystem for StdFilesystem {
    type File = StdFileHandle;

    fn mkdirp(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| Error::io(path, e))
    }

    fn readdir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path).map_err(|e| Error::io(path, e))? {
            let entry = entry.map_err(|e| Error::io(path, e))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn lstat(&self, path: &Path) -> Result<Stat> {
        let meta = std::fs::symlink_metadata(path).map_err(|e| Error::io(path, e))?;
        Ok(Stat {
            is_file: meta.is_file(),
            size: meta.len(),
        })
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to).map_err(|e| Error::io(from, e))
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).map_err(|e| Error::io(path, e))
    }

    fn rmdir(&self, path: &Path) -> std::result::Result<(), RmdirError> {
        std::fs::remove_dir(path).map_err(|e| {
            if is_not_empty(&e) {
                RmdirError::NotEmpty
            } else {
                RmdirError::Other(Error::io(path, e))
            }
        })
    }

    fn open(&self, path: &Path) -> Result<Self::File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        Ok(StdFileHandle {
            path: path.to_path_buf(),
            file,
        })
    }
}

#[cfg(unix)]
fn is_not_empty(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc_enotempty())
}

#[cfg(unix)]
fn libc_enotempty() -> i32 {
    // ENOTEMPTY is 39 on Linux; std doesn't expose an ErrorKind for it yet.
    39
}

#[cfg(not(unix))]
fn is_not_empty(_e: &std::io::Error) -> bool {
    false
}

/// In-memory filesystem for tests, including crash-recovery simulation
/// (truncating a file mid-record and reopening).
#[derive(Clone, Default)]
pub struct MemFilesystem {
    inner: Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>,
    dirs: Arc<Mutex<std::collections::BTreeSet<PathBuf>>>,
}

pub struct MemFileHandle {
    path: PathBuf,
    fs: MemFilesystem,
    cursor_synced: bool,
}

impl MemFilesystem {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileHandle for MemFileHandle {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let files = self.fs.inner.lock();
        let data = files
            .get(&self.path)
            .ok_or_else(|| Error::corruption(format!("no such file: {:?}", self.path)))?;
        let start = offset as usize;
        let end = start + len;
        if end > data.len() {
            return Err(Error::io(
                &self.path,
                std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            ));
        }
        Ok(data[start..end].to_vec())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut files = self.fs.inner.lock();
        let data = files.entry(self.path.clone()).or_default();
        data.extend_from_slice(bytes);
        self.cursor_synced = false;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        let mut files = self.fs.inner.lock();
        let data = files.entry(self.path.clone()).or_default();
        data.truncate(len as usize);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.cursor_synced = true;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        let files = self.fs.inner.lock();
        Ok(files.get(&self.path).map(|d| d.len() as u64).unwrap_or(0))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Filesystem for MemFilesystem {
    type File = MemFileHandle;

    fn mkdirp(&self, path: &Path) -> Result<()> {
        self.dirs.lock().insert(path.to_path_buf());
        Ok(())
    }

    fn readdir(&self, path: &Path) -> Result<Vec<String>> {
        let files = self.inner.lock();
        let mut names = Vec::new();
        for p in files.keys() {
            if p.parent() == Some(path) {
                if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn lstat(&self, path: &Path) -> Result<Stat> {
        let files = self.inner.lock();
        match files.get(path) {
            Some(data) => Ok(Stat {
                is_file: true,
                size: data.len() as u64,
            }),
            None => Err(Error::io(path, std::io::ErrorKind::NotFound.into())),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.inner.lock();
        if let Some(data) = files.remove(from) {
            files.insert(to.to_path_buf(), data);
        }
        let mut dirs = self.dirs.lock();
        if dirs.remove(from) {
            dirs.insert(to.to_path_buf());
        }
        Ok(())
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        self.inner.lock().remove(path);
        Ok(())
    }

    fn rmdir(&self, path: &Path) -> std::result::Result<(), RmdirError> {
        let files = self.inner.lock();
        if files.keys().any(|p| p.parent() == Some(path)) {
            return Err(RmdirError::NotEmpty);
        }
        drop(files);
        self.dirs.lock().remove(path);
        Ok(())
    }

    fn open(&self, path: &Path) -> Result<Self::File> {
        self.inner.lock().entry(path.to_path_buf()).or_default();
        Ok(MemFileHandle {
            path: path.to_path_buf(),
            fs: self.clone(),
            cursor_synced: true,
        })
    }
}

#[cfg(test)]
mod fs_test {
    use super::*;

    #[test]
    fn mem_fs_append_and_read_round_trips() {
        let fs = MemFilesystem::new();
        let mut f = fs.open(Path::new("/a/1")).unwrap();
        f.write(b"hello").unwrap();
        f.write(b"world").unwrap();
        assert_eq!(f.len().unwrap(), 10);
        assert_eq!(f.read_at(0, 5).unwrap(), b"hello");
        assert_eq!(f.read_at(5, 5).unwrap(), b"world");
    }

    #[test]
    fn mem_fs_truncate_discards_tail() {
        let fs = MemFilesystem::new();
        let mut f = fs.open(Path::new("/a/1")).unwrap();
        f.write(b"abcdef").unwrap();
        f.truncate(3).unwrap();
        assert_eq!(f.len().unwrap(), 3);
        assert_eq!(f.read_at(0, 3).unwrap(), b"abc");
    }

    #[test]
    fn mem_fs_rmdir_fails_when_files_present() {
        let fs = MemFilesystem::new();
        fs.mkdirp(Path::new("/a")).unwrap();
        fs.open(Path::new("/a/1")).unwrap();
        match fs.rmdir(Path::new("/a")) {
            Err(RmdirError::NotEmpty) => {}
            other => panic!("expected NotEmpty, got {other:?}"),
        }
    }
}
