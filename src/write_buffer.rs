// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Accumulates a commit's bytes in memory, tracking the logical
//! `(file_index, file_offset)` those bytes will occupy once flushed to the
//! store. Letting a node record its own pointer *before* the bytes hit disk
//! is what lets [`crate::tree`] assemble parent records bottom-up in a
//! single pass.

/// Per-file cap: `0x7ffff000`, just under 2 GiB so that a `u32` file
/// position never has to represent the boundary itself.
pub const MAX_FILE_SIZE: u64 = 0x7ffff000;

/// A contiguous run of bytes destined for one logical file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Chunk {
    pub index: u16,
    pub bytes: Vec<u8>,
}

/// Accumulates bytes for one commit, rolling across file boundaries as
/// `MAX_FILE_SIZE` is approached.
pub(crate) struct WriteBuffer {
    data: Vec<u8>,
    /// Start of the not-yet-packaged slice within `data`.
    start: usize,
    /// Total bytes appended so far (== logical write cursor into `data`).
    written: usize,
    /// Logical file index the next byte will land in.
    index: u16,
    /// Logical offset within `index` the next byte will land at.
    offset: u64,
    /// Chunks already rolled off by a prior boundary crossing.
    chunks: Vec<Chunk>,
}

impl WriteBuffer {
    /// Creates a buffer that will begin appending at the given logical
    /// position — typically the store's current append cursor.
    pub fn new(start_index: u16, start_offset: u64) -> Self {
        WriteBuffer {
            data: Vec::new(),
            start: 0,
            written: 0,
            index: start_index,
            offset: start_offset,
            chunks: Vec::new(),
        }
    }

    /// The logical `(index, offset)` the next `write` call will begin at.
    pub fn position(&self) -> (u16, u32) {
        (self.index, self.offset as u32)
    }

    /// Doubles `data`'s capacity as needed to hold `n` more bytes, rolling
    /// to a new logical file first if `n` would cross `MAX_FILE_SIZE`.
    fn expand(&mut self, n: usize) {
        if self.offset + n as u64 > MAX_FILE_SIZE {
            self.roll();
        }
        let needed = self.written + n;
        if self.data.capacity() < needed {
            let mut cap = self.data.capacity().max(64);
            while cap < needed {
                cap *= 2;
            }
            self.data.reserve(cap - self.data.len());
        }
    }

    /// Packages the pending slice as a chunk for the current `index`,
    /// then advances to the next logical file.
    fn roll(&mut self) {
        self.chunks.push(Chunk {
            index: self.index,
            bytes: self.data[self.start..self.written].to_vec(),
        });
        self.start = self.written;
        self.offset = 0;
        self.index += 1;
    }

    /// Appends `bytes`, returning the logical `(index, offset)` at which
    /// they begin. A single record is never split across a file boundary:
    /// `expand` rolls over first if needed.
    pub fn write(&mut self, bytes: &[u8]) -> (u16, u32) {
        self.expand(bytes.len());
        let pos = self.position();
        self.data.extend_from_slice(bytes);
        self.offset += bytes.len() as u64;
        self.written += bytes.len();
        pos
    }

    /// Number of bytes appended since the last flush, not counting
    /// already-rolled chunks.
    pub fn pending_len(&self) -> usize {
        self.written - self.start
    }

    /// Packages any remaining bytes as a final chunk and returns every
    /// chunk produced since construction, resetting internal buffering
    /// state (the logical cursor — `index`/`offset` — is left untouched,
    /// so a subsequent commit can keep appending from where this one
    /// ended).
    pub fn flush(&mut self) -> Vec<Chunk> {
        if self.written > self.start {
            self.chunks.push(Chunk {
                index: self.index,
                bytes: self.data[self.start..self.written].to_vec(),
            });
        }
        self.data.clear();
        self.start = 0;
        self.written = 0;
        std::mem::take(&mut self.chunks)
    }
}

#[cfg(test)]
mod write_buffer_test {
    use super::*;

    #[test]
    fn single_write_stays_in_one_chunk() {
        let mut buf = WriteBuffer::new(1, 0);
        let (idx, pos) = buf.write(b"hello");
        assert_eq!((idx, pos), (1, 0));
        let (idx2, pos2) = buf.write(b"world");
        assert_eq!((idx2, pos2), (1, 5));
        let chunks = buf.flush();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 1);
        assert_eq!(chunks[0].bytes, b"helloworld");
    }

    #[test]
    fn crossing_max_file_size_rolls_to_a_new_index() {
        let mut buf = WriteBuffer::new(5, MAX_FILE_SIZE - 3);
        let (idx1, pos1) = buf.write(&[1, 2, 3]);
        assert_eq!((idx1, pos1), (5, (MAX_FILE_SIZE - 3) as u32));
        // This write would exceed the cap for file 5, so it rolls to file 6.
        let (idx2, pos2) = buf.write(&[4, 5, 6, 7]);
        assert_eq!((idx2, pos2), (6, 0));
        let chunks = buf.flush();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].index, 5);
        assert_eq!(chunks[0].bytes, vec![1, 2, 3]);
        assert_eq!(chunks[1].index, 6);
        assert_eq!(chunks[1].bytes, vec![4, 5, 6, 7]);
    }

    #[test]
    fn flush_resets_pending_state_but_keeps_the_logical_cursor() {
        let mut buf = WriteBuffer::new(1, 0);
        buf.write(b"abc");
        let _ = buf.flush();
        assert_eq!(buf.position(), (1, 3));
        assert_eq!(buf.pending_len(), 0);
        buf.write(b"d");
        assert_eq!(buf.position(), (1, 4));
    }
}
