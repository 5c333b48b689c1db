// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Bit-exact node record encoding: every slot on disk is a fixed-width
//! Internal or Leaf record.
//!
//! A committed node is either an `Internal` record or a `Leaf` record.
//! `Null` is never itself written to disk: a NIL child is represented
//! inline, as a [`NodePointer`] whose digest is the hasher's `zero` value
//! and whose `file_index` is `0`, a reserved index that is never actually
//! written.
//!
//! **Tag-bit placement.** Internal's layout places `left_index` at byte
//! offset `D` (right after `left_digest`). A Leaf record's tag-bearing
//! field must sit at that same offset so the decoder can tell the two
//! variants apart before it knows which one it holds — putting the raw
//! `key` there instead would make the high-bit tag land inside real key
//! bytes for any key width of 16 bits or more. So Leaf instead places its
//! `value_index` (the field carrying the tag bit) at offset `D`, the same
//! offset as Internal's `left_index`, and moves `key` to the tail of the
//! record. Record sizes are unaffected (`D + B/8 + 10` for Leaf, `2*D + 12`
//! for Internal); only the field order within Leaf changes.

use crate::hash::{hash_internal, Digest, Hasher, DIGEST_LEN};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

/// Reserved file index meaning "no file" / NIL. Real files are numbered
/// starting at 1.
pub const NIL_FILE_INDEX: u16 = 0;

/// Maximum file index storable outside a tagged `left_index`/`value_index`
/// field: the tag bit limits Internal's `left_index` to `0x7FFF`, but
/// `right_index` and Leaf's `value_index` are untagged and may use the
/// full `0xFFFF`.
pub const MAX_FILES: u16 = 0xFFFF;

/// Points at a committed node or value record: a content digest plus its
/// physical location. A NIL child is encoded as `NodePointer::nil(zero)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodePointer {
    pub digest: Digest,
    pub file_index: u16,
    pub file_pos: u32,
}

impl NodePointer {
    pub fn nil(zero: Digest) -> Self {
        NodePointer {
            digest: zero,
            file_index: NIL_FILE_INDEX,
            file_pos: 0,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.file_index == NIL_FILE_INDEX
    }
}

/// Points at a value blob written alongside its owning leaf.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ValuePointer {
    pub file_index: u16,
    pub file_pos: u32,
    pub size: u32,
}

/// A decoded on-disk node record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeRecord {
    Internal {
        left: NodePointer,
        right: NodePointer,
    },
    Leaf {
        digest: Digest,
        key: Vec<u8>,
        value: ValuePointer,
    },
}

/// Errors decoding a fixed-size node slot.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum NodeDecodeError {
    #[error("node record is {len} bytes, expected at least {min}")]
    TooShort { len: usize, min: usize },
}

/// Size in bytes of an `Internal` record: `2*D + 12`.
pub const fn internal_record_size() -> usize {
    2 * DIGEST_LEN + 12
}

/// Size in bytes of a `Leaf` record for a key width of `bits` bits:
/// `D + bits/8 + 10`.
pub const fn leaf_record_size(bits: usize) -> usize {
    DIGEST_LEN + bits / 8 + 10
}

/// Fixed width every node slot occupies on disk, so `read_node` can issue
/// one fixed-length read regardless of the record's actual variant.
pub const fn node_record_size(bits: usize) -> usize {
    let i = internal_record_size();
    let l = leaf_record_size(bits);
    if i > l { i } else { l }
}

const TAG_BIT: u16 = 0x8000;
const INDEX_MASK: u16 = 0x7fff;

impl NodeRecord {
    /// The record's own content digest. An `Internal` record carries only
    /// its children's digests, so its own digest is recomputed as
    /// `H(left ‖ right)`; a `Leaf` record carries its digest directly,
    /// written once at commit time by the tree engine.
    pub fn digest<H: Hasher>(&self) -> Digest {
        match self {
            NodeRecord::Internal { left, right } => hash_internal::<H>(&left.digest, &right.digest),
            NodeRecord::Leaf { digest, .. } => *digest,
        }
    }

    /// Encodes the record into a fixed-width, zero-padded slot of
    /// [`node_record_size`] bytes.
    pub fn encode(&self, bits: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(node_record_size(bits));
        match self {
            NodeRecord::Internal { left, right } => {
                more_asserts::debug_assert_le!(left.file_index, INDEX_MASK, "left index must fit the tagged field");
                out.extend_from_slice(&left.digest);
                out.write_u16::<LittleEndian>(left.file_index & INDEX_MASK).unwrap();
                out.write_u32::<LittleEndian>(left.file_pos).unwrap();
                out.extend_from_slice(&right.digest);
                out.write_u16::<LittleEndian>(right.file_index).unwrap();
                out.write_u32::<LittleEndian>(right.file_pos).unwrap();
            }
            NodeRecord::Leaf { digest, key, value } => {
                out.extend_from_slice(digest);
                out.write_u16::<LittleEndian>(value.file_index | TAG_BIT).unwrap();
                out.write_u32::<LittleEndian>(value.file_pos).unwrap();
                out.write_u32::<LittleEndian>(value.size).unwrap();
                out.extend_from_slice(key);
            }
        }
        out.resize(node_record_size(bits), 0);
        out
    }

    /// Decodes a fixed-width slot previously produced by [`Self::encode`].
    pub fn decode(data: &[u8], bits: usize) -> Result<Self, NodeDecodeError> {
        let min = DIGEST_LEN + 6;
        if data.len() < min {
            return Err(NodeDecodeError::TooShort { len: data.len(), min });
        }
        let mut cursor = Cursor::new(data);
        let mut digest = [0u8; DIGEST_LEN];
        cursor.read_exact(&mut digest).map_err(|_| NodeDecodeError::TooShort {
            len: data.len(),
            min,
        })?;
        let tagged_index = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| NodeDecodeError::TooShort { len: data.len(), min })?;
        let pos = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| NodeDecodeError::TooShort { len: data.len(), min })?;

        if tagged_index & TAG_BIT != 0 {
            // Leaf record: value_index (masked), value_pos, value_size, key.
            let size = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| NodeDecodeError::TooShort { len: data.len(), min: min + 4 })?;
            let key_len = bits / 8;
            let key_start = DIGEST_LEN + 10;
            let key_end = key_start + key_len;
            if data.len() < key_end {
                return Err(NodeDecodeError::TooShort { len: data.len(), min: key_end });
            }
            let key = data[key_start..key_end].to_vec();
            Ok(NodeRecord::Leaf {
                digest,
                key,
                value: ValuePointer {
                    file_index: tagged_index & INDEX_MASK,
                    file_pos: pos,
                    size,
                },
            })
        } else {
            // Internal record: left (already read), then right_digest/index/pos.
            let left = NodePointer {
                digest,
                file_index: tagged_index & INDEX_MASK,
                file_pos: pos,
            };
            let mut right_digest = [0u8; DIGEST_LEN];
            cursor.read_exact(&mut right_digest).map_err(|_| NodeDecodeError::TooShort {
                len: data.len(),
                min: internal_record_size(),
            })?;
            let right_index = cursor
                .read_u16::<LittleEndian>()
                .map_err(|_| NodeDecodeError::TooShort { len: data.len(), min: internal_record_size() })?;
            let right_pos = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| NodeDecodeError::TooShort { len: data.len(), min: internal_record_size() })?;
            Ok(NodeRecord::Internal {
                left,
                right: NodePointer {
                    digest: right_digest,
                    file_index: right_index,
                    file_pos: right_pos,
                },
            })
        }
    }
}

#[cfg(test)]
mod node_test {
    use super::*;
    use crate::hash::ZERO_DIGEST;

    fn ptr(b: u8) -> NodePointer {
        NodePointer {
            digest: [b; DIGEST_LEN],
            file_index: 7,
            file_pos: 1234,
        }
    }

    #[test]
    fn internal_round_trips() {
        let rec = NodeRecord::Internal {
            left: ptr(1),
            right: ptr(2),
        };
        let bytes = rec.encode(256);
        assert_eq!(bytes.len(), node_record_size(256));
        let decoded = NodeRecord::decode(&bytes, 256).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn leaf_round_trips() {
        let rec = NodeRecord::Leaf {
            digest: [9u8; DIGEST_LEN],
            key: vec![0xAB, 0xCD],
            value: ValuePointer {
                file_index: 3,
                file_pos: 99,
                size: 4,
            },
        };
        let bytes = rec.encode(16);
        assert_eq!(bytes.len(), node_record_size(16));
        let decoded = NodeRecord::decode(&bytes, 16).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn node_record_size_is_the_max_of_both_variants() {
        assert_eq!(node_record_size(256), internal_record_size());
        assert!(node_record_size(8) <= internal_record_size());
    }

    #[test]
    fn nil_pointer_uses_reserved_index() {
        let nil = NodePointer::nil(ZERO_DIGEST);
        assert!(nil.is_nil());
        assert_eq!(nil.file_index, NIL_FILE_INDEX);
    }

    #[test]
    fn internal_tag_bit_is_clear() {
        let rec = NodeRecord::Internal {
            left: ptr(1),
            right: ptr(2),
        };
        let bytes = rec.encode(256);
        let tagged = u16::from_le_bytes([bytes[DIGEST_LEN], bytes[DIGEST_LEN + 1]]);
        assert_eq!(tagged & TAG_BIT, 0);
    }

    #[test]
    fn leaf_tag_bit_is_set() {
        let rec = NodeRecord::Leaf {
            digest: [1u8; DIGEST_LEN],
            key: vec![0x00],
            value: ValuePointer { file_index: 1, file_pos: 0, size: 0 },
        };
        let bytes = rec.encode(8);
        let tagged = u16::from_le_bytes([bytes[DIGEST_LEN], bytes[DIGEST_LEN + 1]]);
        assert_ne!(tagged & TAG_BIT, 0);
    }
}
