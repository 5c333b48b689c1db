// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Compact inclusion/exclusion proofs and their stateless verifier. A
//! proof is a depth, a bit vector flagging which sibling digests are
//! omitted as dead ends (`H.zero`), the present siblings in root-to-leaf
//! order, and a terminal variant carrying whatever payload that variant
//! needs.
//!
//! Verification folds over the siblings, reconstructing the root hash
//! from the leaf upward, with structural checks up front. `verify` returns
//! a total `ProofError` code rather than a `Result`, since verification
//! must never fail with a thrown error — every input produces a code.

use crate::hash::{bit_at, common_prefix_len, hash_internal, hash_leaf, Digest, Hasher, DIGEST_LEN};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

/// The terminal node a proof's descent landed on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Terminal {
    /// The requested key was found; carries its value.
    Exists { value: Vec<u8> },
    /// A different leaf occupies the position the requested key would
    /// take; carries that leaf's full key and value so the verifier can
    /// recompute its hash (the full key is part of a leaf's pre-image for
    /// exactly this reason).
    Collision { key: Vec<u8>, value: Vec<u8> },
    /// The descent reached NIL: the key is provably absent.
    DeadEnd,
}

/// A proof of inclusion or exclusion for one key against one root hash.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Proof {
    pub depth: u16,
    /// `omitted[i]` is `true` when the sibling at level `i` (0 = nearest
    /// the root) was a dead end and is reconstructed as `H.zero` rather
    /// than carried explicitly.
    pub omitted: Vec<bool>,
    /// Present sibling digests only, in root-to-leaf order.
    pub siblings: Vec<Digest>,
    pub terminal: Terminal,
}

/// Codes returned by [`verify`] — verification is total: every input
/// produces one of these, never a thrown error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProofError {
    OkInclusion,
    OkExclusion,
    MismatchedRoot,
    Malformed,
    DepthTooLarge,
    UnexpectedNil,
    SameKey,
}

/// Errors decoding a proof from its wire encoding.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ProofDecodeError {
    #[error("proof bytes truncated")]
    TooShort,
    #[error("unrecognized terminal tag {0}")]
    BadTag(u8),
}

const TAG_DEAD_END: u8 = 0;
const TAG_EXISTS: u8 = 1;
const TAG_COLLISION: u8 = 2;

impl Proof {
    /// Encodes the proof to its wire format: `depth[2] ‖ omitted-bitset ‖
    /// siblings[D each] ‖ tag[1] ‖ terminal payload`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u16::<LittleEndian>(self.depth).unwrap();

        let bitset_len = (self.depth as usize).div_ceil(8);
        let mut bitset = vec![0u8; bitset_len];
        for (i, &omitted) in self.omitted.iter().enumerate() {
            if omitted {
                bitset[i / 8] |= 1 << (7 - i % 8);
            }
        }
        out.extend_from_slice(&bitset);

        for sibling in &self.siblings {
            out.extend_from_slice(sibling);
        }

        match &self.terminal {
            Terminal::DeadEnd => out.push(TAG_DEAD_END),
            Terminal::Exists { value } => {
                out.push(TAG_EXISTS);
                out.write_u32::<LittleEndian>(value.len() as u32).unwrap();
                out.extend_from_slice(value);
            }
            Terminal::Collision { key, value } => {
                out.push(TAG_COLLISION);
                out.extend_from_slice(key);
                out.write_u32::<LittleEndian>(value.len() as u32).unwrap();
                out.extend_from_slice(value);
            }
        }
        out
    }

    /// Decodes a proof previously produced by [`Self::to_bytes`].
    /// `key_bytes` is the configured key width (`bits / 8`), needed to know
    /// how many bytes a [`Terminal::Collision`]'s carried key occupies.
    pub fn from_bytes(bytes: &[u8], key_bytes: usize) -> Result<Self, ProofDecodeError> {
        let mut cursor = Cursor::new(bytes);
        let depth = cursor.read_u16::<LittleEndian>().map_err(|_| ProofDecodeError::TooShort)?;

        let bitset_len = (depth as usize).div_ceil(8);
        let mut bitset = vec![0u8; bitset_len];
        cursor.read_exact(&mut bitset).map_err(|_| ProofDecodeError::TooShort)?;
        let mut omitted = Vec::with_capacity(depth as usize);
        for i in 0..depth as usize {
            omitted.push(bitset[i / 8] & (1 << (7 - i % 8)) != 0);
        }

        let present = omitted.iter().filter(|&&o| !o).count();
        let mut siblings = Vec::with_capacity(present);
        for _ in 0..present {
            let mut digest = [0u8; DIGEST_LEN];
            cursor.read_exact(&mut digest).map_err(|_| ProofDecodeError::TooShort)?;
            siblings.push(digest);
        }

        let tag = cursor.read_u8().map_err(|_| ProofDecodeError::TooShort)?;
        let terminal = match tag {
            TAG_DEAD_END => Terminal::DeadEnd,
            TAG_EXISTS => {
                let len = cursor.read_u32::<LittleEndian>().map_err(|_| ProofDecodeError::TooShort)? as usize;
                let mut value = vec![0u8; len];
                cursor.read_exact(&mut value).map_err(|_| ProofDecodeError::TooShort)?;
                Terminal::Exists { value }
            }
            TAG_COLLISION => {
                let mut key = vec![0u8; key_bytes];
                cursor.read_exact(&mut key).map_err(|_| ProofDecodeError::TooShort)?;
                let len = cursor.read_u32::<LittleEndian>().map_err(|_| ProofDecodeError::TooShort)? as usize;
                let mut value = vec![0u8; len];
                cursor.read_exact(&mut value).map_err(|_| ProofDecodeError::TooShort)?;
                Terminal::Collision { key, value }
            }
            other => return Err(ProofDecodeError::BadTag(other)),
        };

        Ok(Proof { depth, omitted, siblings, terminal })
    }
}

/// Stateless verification against a trusted `root_hash`. `bits` is the
/// tree's configured key width, needed to bound depth and to size a
/// carried collision key.
pub fn verify<H: Hasher>(root_hash: Digest, key: &[u8], proof: &Proof, bits: usize) -> (ProofError, Option<Vec<u8>>) {
    if key.len() != bits / 8 {
        return (ProofError::Malformed, None);
    }
    let depth = proof.depth as usize;
    if depth > bits {
        return (ProofError::DepthTooLarge, None);
    }
    if proof.omitted.len() != depth {
        return (ProofError::Malformed, None);
    }

    let mut per_level = Vec::with_capacity(depth);
    let mut sib_idx = 0;
    for &omitted in &proof.omitted {
        if omitted {
            per_level.push(H::zero());
        } else {
            let Some(&sibling) = proof.siblings.get(sib_idx) else {
                return (ProofError::Malformed, None);
            };
            // A sibling explicitly marked "present" (not a compressed dead
            // end) that is nonetheless the zero digest is an inconsistent
            // proof: it should have been marked omitted instead.
            if sibling == H::zero() {
                return (ProofError::UnexpectedNil, None);
            }
            per_level.push(sibling);
            sib_idx += 1;
        }
    }
    if sib_idx != proof.siblings.len() {
        return (ProofError::Malformed, None);
    }

    let (leaf_hash, inclusion_value) = match &proof.terminal {
        Terminal::Exists { value } => (hash_leaf::<H>(key, value), Some(value.clone())),
        Terminal::Collision { key: carried_key, value } => {
            if carried_key.len() != bits / 8 {
                return (ProofError::Malformed, None);
            }
            if carried_key == key {
                return (ProofError::SameKey, None);
            }
            // The carried leaf must agree with the requested key on at least
            // the path actually descended; it need not diverge at exactly
            // bit `depth` — a single-leaf tree proves exclusion for any
            // absent key at depth 0, carrying a leaf that may agree on many
            // more bits than that.
            if common_prefix_len(carried_key, key, bits) < depth {
                return (ProofError::Malformed, None);
            }
            (hash_leaf::<H>(carried_key, value), None)
        }
        Terminal::DeadEnd => (H::zero(), None),
    };

    let mut hash = leaf_hash;
    for level in (0..depth).rev() {
        let bit = bit_at(key, level);
        let sibling = per_level[level];
        hash = if bit {
            hash_internal::<H>(&sibling, &hash)
        } else {
            hash_internal::<H>(&hash, &sibling)
        };
    }

    if hash != root_hash {
        return (ProofError::MismatchedRoot, None);
    }

    match &proof.terminal {
        Terminal::Exists { .. } => (ProofError::OkInclusion, inclusion_value),
        _ => (ProofError::OkExclusion, None),
    }
}

#[cfg(test)]
mod proof_test {
    use super::*;
    use crate::hash::Sha256Hasher;

    fn leaf(key: &[u8], value: &[u8]) -> Digest {
        hash_leaf::<Sha256Hasher>(key, value)
    }

    #[test]
    fn dead_end_round_trips_through_bytes() {
        let proof = Proof {
            depth: 3,
            omitted: vec![true, false, true],
            siblings: vec![[7u8; DIGEST_LEN]],
            terminal: Terminal::DeadEnd,
        };
        let bytes = proof.to_bytes();
        let decoded = Proof::from_bytes(&bytes, 1).unwrap();
        assert_eq!(decoded, proof);
    }

    #[test]
    fn exists_round_trips_through_bytes() {
        let proof = Proof {
            depth: 0,
            omitted: vec![],
            siblings: vec![],
            terminal: Terminal::Exists { value: b"hello".to_vec() },
        };
        let bytes = proof.to_bytes();
        let decoded = Proof::from_bytes(&bytes, 1).unwrap();
        assert_eq!(decoded, proof);
    }

    #[test]
    fn single_leaf_root_verifies_as_inclusion() {
        // A one-leaf tree: root digest equals the leaf's own digest, depth 0.
        let key = [0x00u8];
        let value = b"a".to_vec();
        let root = leaf(&key, &value);
        let proof = Proof {
            depth: 0,
            omitted: vec![],
            siblings: vec![],
            terminal: Terminal::Exists { value: value.clone() },
        };
        let (code, v) = verify::<Sha256Hasher>(root, &key, &proof, 8);
        assert_eq!(code, ProofError::OkInclusion);
        assert_eq!(v, Some(value));
    }

    #[test]
    fn empty_tree_proves_exclusion() {
        let proof = Proof {
            depth: 0,
            omitted: vec![],
            siblings: vec![],
            terminal: Terminal::DeadEnd,
        };
        let (code, v) = verify::<Sha256Hasher>(Sha256Hasher::zero(), &[0x00], &proof, 8);
        assert_eq!(code, ProofError::OkExclusion);
        assert_eq!(v, None);
    }

    #[test]
    fn tampering_with_root_is_detected() {
        let key = [0x00u8];
        let value = b"a".to_vec();
        let root = leaf(&key, &value);
        let mut tampered_root = root;
        tampered_root[0] ^= 0xff;
        let proof = Proof {
            depth: 0,
            omitted: vec![],
            siblings: vec![],
            terminal: Terminal::Exists { value },
        };
        let (code, _) = verify::<Sha256Hasher>(tampered_root, &key, &proof, 8);
        assert_eq!(code, ProofError::MismatchedRoot);
    }

    #[test]
    fn collision_proof_with_requested_key_is_same_key_error() {
        let key = [0x0Cu8];
        let proof = Proof {
            depth: 1,
            omitted: vec![false],
            siblings: vec![[1u8; DIGEST_LEN]],
            terminal: Terminal::Collision { key: key.to_vec(), value: b"x".to_vec() },
        };
        let (code, _) = verify::<Sha256Hasher>([0u8; DIGEST_LEN], &key, &proof, 8);
        assert_eq!(code, ProofError::SameKey);
    }

    #[test]
    fn depth_beyond_bits_is_rejected() {
        let proof = Proof {
            depth: 9,
            omitted: vec![false; 9],
            siblings: vec![[1u8; DIGEST_LEN]; 9],
            terminal: Terminal::DeadEnd,
        };
        let (code, _) = verify::<Sha256Hasher>([0u8; DIGEST_LEN], &[0x00], &proof, 8);
        assert_eq!(code, ProofError::DepthTooLarge);
    }

    #[test]
    fn present_sibling_equal_to_zero_digest_is_unexpected_nil() {
        let proof = Proof {
            depth: 1,
            omitted: vec![false],
            siblings: vec![Sha256Hasher::zero()],
            terminal: Terminal::DeadEnd,
        };
        let (code, _) = verify::<Sha256Hasher>([0u8; DIGEST_LEN], &[0x00], &proof, 8);
        assert_eq!(code, ProofError::UnexpectedNil);
    }

    #[test]
    fn malformed_when_omitted_length_disagrees_with_depth() {
        let proof = Proof {
            depth: 2,
            omitted: vec![false],
            siblings: vec![[1u8; DIGEST_LEN]],
            terminal: Terminal::DeadEnd,
        };
        let (code, _) = verify::<Sha256Hasher>([0u8; DIGEST_LEN], &[0x00], &proof, 8);
        assert_eq!(code, ProofError::Malformed);
    }
}
