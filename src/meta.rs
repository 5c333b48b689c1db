// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! The meta record: a fixed 36-byte footer written at the end of every
//! commit, linking backwards to the previous meta record and pointing at
//! the commit's root node. The backwards links form the meta chain that
//! `getRoot` walks to make every historical root addressable by digest.

use crate::hash::Hasher;
use crate::node::NodePointer;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// `"mklx"` read as a little-endian `u32`.
pub const META_MAGIC: u32 = 0x786c_6b6d;

/// Fixed size of a meta record, always aligned to this width within a
/// file.
pub const META_SIZE: usize = 36;

const CHECKSUM_INPUT_LEN: usize = 16;
const CHECKSUM_LEN: usize = 20;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum MetaDecodeError {
    #[error("meta record is {0} bytes, expected {META_SIZE}")]
    WrongLength(usize),
    #[error("bad meta magic {0:#x}")]
    BadMagic(u32),
    #[error("meta checksum mismatch")]
    BadChecksum,
}

/// One meta record: where the previous meta lives, and where this
/// commit's root node lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Meta {
    pub prev_meta_index: u16,
    pub prev_meta_pos: u32,
    pub root_index: u16,
    pub root_pos: u32,
}

impl Meta {
    /// The empty store's implicit state: no previous meta, NIL root.
    pub fn empty() -> Self {
        Meta {
            prev_meta_index: 0,
            prev_meta_pos: 0,
            root_index: 0,
            root_pos: 0,
        }
    }

    pub fn root_pointer(&self, root_digest: crate::hash::Digest) -> NodePointer {
        NodePointer {
            digest: root_digest,
            file_index: self.root_index,
            file_pos: self.root_pos,
        }
    }

    pub fn encode<H: Hasher>(&self) -> [u8; META_SIZE] {
        let mut head = Vec::with_capacity(CHECKSUM_INPUT_LEN);
        head.write_u32::<LittleEndian>(META_MAGIC).unwrap();
        head.write_u16::<LittleEndian>(self.prev_meta_index).unwrap();
        head.write_u32::<LittleEndian>(self.prev_meta_pos).unwrap();
        head.write_u16::<LittleEndian>(self.root_index).unwrap();
        head.write_u32::<LittleEndian>(self.root_pos).unwrap();
        debug_assert_eq!(head.len(), CHECKSUM_INPUT_LEN);

        let checksum = H::digest(&head);
        let mut out = [0u8; META_SIZE];
        out[..CHECKSUM_INPUT_LEN].copy_from_slice(&head);
        out[CHECKSUM_INPUT_LEN..].copy_from_slice(&checksum[..CHECKSUM_LEN]);
        out
    }

    /// Parses and verifies a candidate meta record, checking magic and
    /// the truncated checksum. Used both by normal reads and by the
    /// recovery scan, which treats any failure here as "no meta at this
    /// offset" rather than a hard error.
    pub fn decode<H: Hasher>(data: &[u8]) -> Result<Self, MetaDecodeError> {
        if data.len() != META_SIZE {
            return Err(MetaDecodeError::WrongLength(data.len()));
        }
        let head = &data[..CHECKSUM_INPUT_LEN];
        let mut cursor = std::io::Cursor::new(head);
        let magic = cursor.read_u32::<LittleEndian>().unwrap();
        if magic != META_MAGIC {
            return Err(MetaDecodeError::BadMagic(magic));
        }
        let prev_meta_index = cursor.read_u16::<LittleEndian>().unwrap();
        let prev_meta_pos = cursor.read_u32::<LittleEndian>().unwrap();
        let root_index = cursor.read_u16::<LittleEndian>().unwrap();
        let root_pos = cursor.read_u32::<LittleEndian>().unwrap();

        let expected = H::digest(head);
        if &expected[..CHECKSUM_LEN] != &data[CHECKSUM_INPUT_LEN..] {
            return Err(MetaDecodeError::BadChecksum);
        }

        Ok(Meta {
            prev_meta_index,
            prev_meta_pos,
            root_index,
            root_pos,
        })
    }
}

#[cfg(test)]
mod meta_test {
    use super::*;
    use crate::hash::Sha256Hasher;

    #[test]
    fn round_trips() {
        let meta = Meta {
            prev_meta_index: 3,
            prev_meta_pos: 7200,
            root_index: 4,
            root_pos: 128,
        };
        let bytes = meta.encode::<Sha256Hasher>();
        assert_eq!(bytes.len(), META_SIZE);
        let decoded = Meta::decode::<Sha256Hasher>(&bytes).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = Meta::empty().encode::<Sha256Hasher>();
        bytes[0] ^= 0xff;
        assert_eq!(
            Meta::decode::<Sha256Hasher>(&bytes),
            Err(MetaDecodeError::BadMagic(u32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3]
            ])))
        );
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let mut bytes = Meta::empty().encode::<Sha256Hasher>();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert_eq!(Meta::decode::<Sha256Hasher>(&bytes), Err(MetaDecodeError::BadChecksum));
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(
            Meta::decode::<Sha256Hasher>(&[0u8; 10]),
            Err(MetaDecodeError::WrongLength(10))
        );
    }
}
