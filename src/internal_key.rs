//! The internal key format shared by memtables, tables, and manifests.
//!
//! ## Format
//!
//! ```text
//! InternalKey:
//!   [user_key: bytes] [tag: u64 little-endian]
//!   tag = sequence << 8 | value type
//! ```
//!
//! ## Ordering
//!
//! Internal keys are ordered by:
//! 1. user key (ascending, under the user comparator)
//! 2. sequence (descending, newer first)
//! 3. value type (descending, a value before a tombstone)
//!
//! The tie-breaks fall out of comparing the packed tag as one descending
//! u64. Seeking to `(key, snapshot, Value)` therefore lands on the newest
//! entry for `key` whose sequence is at or below the snapshot.

use std::cmp::Ordering;
use std::fmt;

use crate::comparator::Comparator;
use crate::encoding::format::Raw;
use crate::encoding::{decode_fixed64, put_fixed64, write_varint32, MAX_VARINT32_LEN};
use crate::error::{Error, Result};

/// Monotonic per-database write counter. A snapshot is a sequence number:
/// a read at `s` observes the newest entry per key with sequence <= `s`.
pub type SequenceNumber = u64;

/// Sequence numbers share a 64-bit tag with the value type, leaving the low
/// eight bits for the type.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Distinguishes live values from tombstones in internal keys. The numeric
/// values are embedded in the on-disk format and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueType {
    /// Tombstone for a deleted key.
    Deletion = 0x0,
    /// A live value.
    Value = 0x1,
}

impl ValueType {
    pub fn from_u8(value: u8) -> Option<ValueType> {
        match value {
            0x0 => Some(ValueType::Deletion),
            0x1 => Some(ValueType::Value),
            _ => None,
        }
    }
}

/// The type to encode when seeking to a `(user_key, sequence)` pair. Tags
/// sort descending, so the largest defined type positions a seek at or
/// before every entry carrying the same user key and sequence.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

/// Packs a sequence number and value type into the 64-bit on-disk tag.
#[inline]
pub fn pack_sequence_and_type(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | value_type as u64
}

/// An internal key split into its components. Borrows the user key from the
/// encoded form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

impl ParsedInternalKey<'_> {
    pub fn encoded_len(&self) -> usize {
        self.user_key.len() + 8
    }
}

impl fmt::Display for ParsedInternalKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} : {:?}",
            Raw::bytes(self.user_key),
            self.sequence,
            self.value_type
        )
    }
}

/// Appends the encoding of `key` to `dst`.
pub fn append_internal_key(dst: &mut Vec<u8>, key: &ParsedInternalKey) {
    dst.extend_from_slice(key.user_key);
    put_fixed64(dst, pack_sequence_and_type(key.sequence, key.value_type));
}

/// Splits an encoded internal key into its components. Fails on input
/// shorter than the eight-byte tag or with an undefined value type.
pub fn parse_internal_key(encoded: &[u8]) -> Result<ParsedInternalKey<'_>> {
    if encoded.len() < 8 {
        return Err(Error::Corruption(format!(
            "internal key too short: {} bytes",
            encoded.len()
        )));
    }
    let (user_key, tag) = encoded.split_at(encoded.len() - 8);
    let num = decode_fixed64(tag);
    let value_type = ValueType::from_u8((num & 0xff) as u8).ok_or_else(|| {
        Error::Corruption(format!("undefined value type {:#04x}", num & 0xff))
    })?;
    Ok(ParsedInternalKey {
        user_key,
        sequence: num >> 8,
        value_type,
    })
}

/// The user-key prefix of an encoded internal key.
#[inline]
pub fn extract_user_key(encoded: &[u8]) -> &[u8] {
    assert!(encoded.len() >= 8, "internal key shorter than its tag");
    &encoded[..encoded.len() - 8]
}

/// The packed tag of an encoded internal key.
#[inline]
pub fn extract_tag(encoded: &[u8]) -> u64 {
    assert!(encoded.len() >= 8, "internal key shorter than its tag");
    decode_fixed64(&encoded[encoded.len() - 8..])
}

/// The low tag byte of an encoded internal key. The caller owns validity;
/// use [`parse_internal_key`] for untrusted input.
#[inline]
pub fn extract_value_type(encoded: &[u8]) -> u8 {
    (extract_tag(encoded) & 0xff) as u8
}

/// An owned, encoded internal key. Code in this layer passes internal keys
/// in this wrapper rather than as plain byte vectors so raw bytewise
/// comparison cannot be used by accident.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InternalKey {
    rep: Vec<u8>,
}

impl InternalKey {
    pub fn new(
        user_key: &[u8],
        sequence: SequenceNumber,
        value_type: ValueType,
    ) -> InternalKey {
        let mut rep = Vec::with_capacity(user_key.len() + 8);
        append_internal_key(
            &mut rep,
            &ParsedInternalKey {
                user_key,
                sequence,
                value_type,
            },
        );
        InternalKey { rep }
    }

    /// Wraps bytes already in encoded form.
    pub fn decode_from(encoded: &[u8]) -> InternalKey {
        InternalKey {
            rep: encoded.to_vec(),
        }
    }

    pub fn encoded(&self) -> &[u8] {
        debug_assert!(!self.rep.is_empty());
        &self.rep
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }

    pub fn clear(&mut self) {
        self.rep.clear();
    }
}

/// Orders encoded internal keys: user keys ascending under the wrapped
/// comparator, ties broken by the packed tag in descending order.
#[derive(Clone, Copy, Debug)]
pub struct InternalKeyComparator<C> {
    user: C,
}

impl<C: Comparator> InternalKeyComparator<C> {
    pub fn new(user: C) -> InternalKeyComparator<C> {
        InternalKeyComparator { user }
    }

    pub fn user_comparator(&self) -> &C {
        &self.user
    }
}

impl<C: Comparator> Comparator for InternalKeyComparator<C> {
    fn name(&self) -> &'static str {
        "emberdb.InternalKeyComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let ord = self.user.compare(extract_user_key(a), extract_user_key(b));
        if ord != Ordering::Equal {
            return ord;
        }
        // Larger tags (newer entries) sort first.
        extract_tag(b).cmp(&extract_tag(a))
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        // Shorten the user-key portion; the tag is rebuilt afterwards.
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut tmp = user_start.to_vec();
        self.user.find_shortest_separator(&mut tmp, user_limit);
        if tmp.len() < user_start.len()
            && self.user.compare(user_start, &tmp) == Ordering::Less
        {
            // The user key grew logically while shrinking physically.
            // Append the maximum tag so the result sorts before every entry
            // with the shortened user key.
            put_fixed64(
                &mut tmp,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(start, &tmp), Ordering::Less);
            debug_assert_eq!(self.compare(&tmp, limit), Ordering::Less);
            *start = tmp;
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key);
        let mut tmp = user_key.to_vec();
        self.user.find_short_successor(&mut tmp);
        if tmp.len() < user_key.len() && self.user.compare(user_key, &tmp) == Ordering::Less
        {
            put_fixed64(
                &mut tmp,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(key, &tmp), Ordering::Less);
            *key = tmp;
        }
    }
}

/// Encoded size below which a [`LookupKey`] skips the heap.
const LOOKUP_KEY_INLINE_LEN: usize = 200;

/// The bytes a point lookup probes the memtable with:
///
/// ```text
/// varint32(|user_key| + 8) | user_key | tag(snapshot, seek type)
/// ```
///
/// Three views are exposed without copying: the full length-prefixed
/// memtable key, the internal-key suffix, and the bare user key. Lookup
/// keys are scoped to a single read and avoid allocating for short keys.
pub struct LookupKey {
    space: [u8; LOOKUP_KEY_INLINE_LEN],
    heap: Vec<u8>,
    kstart: usize,
    len: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], sequence: SequenceNumber) -> LookupKey {
        let needed = MAX_VARINT32_LEN + user_key.len() + 8;
        let mut lk = LookupKey {
            space: [0; LOOKUP_KEY_INLINE_LEN],
            heap: Vec::new(),
            kstart: 0,
            len: 0,
        };
        if needed > LOOKUP_KEY_INLINE_LEN {
            lk.heap = vec![0; needed];
        }
        let tag = pack_sequence_and_type(sequence, VALUE_TYPE_FOR_SEEK);
        let buf = if lk.heap.is_empty() {
            &mut lk.space[..]
        } else {
            &mut lk.heap[..]
        };
        let mut pos = write_varint32(buf, (user_key.len() + 8) as u32);
        lk.kstart = pos;
        buf[pos..pos + user_key.len()].copy_from_slice(user_key);
        pos += user_key.len();
        buf[pos..pos + 8].copy_from_slice(&tag.to_le_bytes());
        lk.len = pos + 8;
        lk
    }

    fn bytes(&self) -> &[u8] {
        if self.heap.is_empty() {
            &self.space[..self.len]
        } else {
            &self.heap[..self.len]
        }
    }

    /// The full length-prefixed key a memtable stores.
    pub fn memtable_key(&self) -> &[u8] {
        self.bytes()
    }

    /// The internal-key suffix, without the length prefix.
    pub fn internal_key(&self) -> &[u8] {
        &self.bytes()[self.kstart..]
    }

    /// The bare user key.
    pub fn user_key(&self) -> &[u8] {
        let bytes = self.bytes();
        &bytes[self.kstart..bytes.len() - 8]
    }
}
