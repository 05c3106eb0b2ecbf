//! Prefix-compressed sorted blocks and their cursor.
//!
//! ## Block layout
//!
//! ```text
//! +---------------------------+
//! | Entry 0                   |
//! | Entry 1                   |
//! | ...                       |
//! | Entry m-1                 |
//! +---------------------------+
//! | Restart array (u32 * n)   |
//! | Restart count (u32)       |
//! +---------------------------+
//! ```
//!
//! Each entry stores only the suffix of its key that differs from the
//! previous entry in the same restart range:
//!
//! ```text
//! varint32 shared_len | varint32 non_shared_len | varint32 value_len
//! key suffix [non_shared_len] | value [value_len]
//! ```
//!
//! Every restart offset names an entry with `shared_len == 0`. Restart keys
//! are therefore complete, which is what makes the restart array binary
//! searchable.

use std::cmp::Ordering;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::comparator::Comparator;
use crate::encoding::{decode_fixed32, get_varint32, put_varint32};
use crate::errcorruption;
use crate::error::{Error, Result};

/// Entries between complete keys unless the builder is told otherwise.
pub const DEFAULT_RESTART_INTERVAL: usize = 16;

/// Accumulates sorted entries and serializes them into a block.
pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> BlockBuilder {
        assert!(restart_interval > 0, "restart interval must be positive");
        BlockBuilder {
            buffer: Vec::new(),
            restarts: Vec::new(),
            restart_interval,
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in ascending comparator order;
    /// prefix compression is computed against the previous key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.entry_count % self.restart_interval == 0 {
            self.restarts.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_len(&self.last_key, key)
        };
        let non_shared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, non_shared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    /// Appends the restart array and its length, consuming the builder.
    pub fn finish(mut self) -> Vec<u8> {
        for offset in &self.restarts {
            self.buffer.write_u32::<LittleEndian>(*offset).unwrap();
        }
        self.buffer
            .write_u32::<LittleEndian>(self.restarts.len() as u32)
            .unwrap();
        self.buffer
    }

    /// Bytes the finished block would occupy.
    pub fn estimated_size(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// An immutable parsed block. Owns its backing bytes; iterators borrow from
/// it and are created independently per reader.
#[derive(Debug)]
pub struct Block {
    data: Vec<u8>,
    restarts_offset: usize,
    num_restarts: usize,
}

impl Block {
    /// Validates the trailer: the restart count must fit inside the block.
    pub fn new(data: Vec<u8>) -> Result<Block> {
        if data.len() < 4 {
            return Err(Error::Corruption(
                "block too short for restart count".to_string(),
            ));
        }
        let num_restarts = decode_fixed32(&data[data.len() - 4..]) as usize;
        let max_restarts = (data.len() - 4) / 4;
        if num_restarts > max_restarts {
            return errcorruption!(
                "restart count {num_restarts} exceeds block capacity {max_restarts}"
            );
        }
        let restarts_offset = data.len() - (1 + num_restarts) * 4;
        Ok(Block {
            data,
            restarts_offset,
            num_restarts,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// A cursor over the block under `comparator`. A block with no restarts
    /// yields a cursor that is never valid.
    pub fn iter<'a, C: Comparator>(&'a self, comparator: &'a C) -> BlockIter<'a, C> {
        BlockIter::new(self, comparator)
    }
}

/// Decodes the header of the entry at `offset`, returning
/// `(shared, non_shared, value_len, key_offset)` with `key_offset` pointing
/// at the key suffix. `None` if the header does not fit in
/// `[offset, limit)` or the declared lengths overrun the entry region.
fn decode_entry(
    data: &[u8],
    offset: usize,
    limit: usize,
) -> Option<(usize, usize, usize, usize)> {
    if limit < offset + 3 {
        return None;
    }
    let mut p = offset;
    let shared;
    let non_shared;
    let value_len;
    if (data[p] | data[p + 1] | data[p + 2]) < 128 {
        // Fast path: all three lengths encode in one byte each.
        shared = data[p] as usize;
        non_shared = data[p + 1] as usize;
        value_len = data[p + 2] as usize;
        p += 3;
    } else {
        let (v, n) = get_varint32(&data[p..limit])?;
        shared = v as usize;
        p += n;
        let (v, n) = get_varint32(&data[p..limit])?;
        non_shared = v as usize;
        p += n;
        let (v, n) = get_varint32(&data[p..limit])?;
        value_len = v as usize;
        p += n;
    }
    if limit - p < non_shared + value_len {
        return None;
    }
    Some((shared, non_shared, value_len, p))
}

/// A cursor over a block's entries in ascending key order.
///
/// Starts out invalid; position it with `seek`, `seek_to_first`, or
/// `seek_to_last`. The first decode failure latches `Corruption` into
/// [`status`](BlockIter::status) and invalidates the cursor for good.
pub struct BlockIter<'a, C> {
    comparator: &'a C,
    data: &'a [u8],
    restarts_offset: usize,
    num_restarts: usize,
    /// Offset of the current entry; equals `restarts_offset` when invalid.
    current: usize,
    /// Restart range containing `current`.
    restart_index: usize,
    /// Reconstructed key, reused across entries.
    key: Vec<u8>,
    /// Value range `(offset, len)` inside `data`.
    value: (usize, usize),
    status: Option<Error>,
}

impl<'a, C: Comparator> BlockIter<'a, C> {
    fn new(block: &'a Block, comparator: &'a C) -> BlockIter<'a, C> {
        BlockIter {
            comparator,
            data: &block.data,
            restarts_offset: block.restarts_offset,
            num_restarts: block.num_restarts,
            current: block.restarts_offset,
            restart_index: block.num_restarts,
            key: Vec::new(),
            value: (block.restarts_offset, 0),
            status: None,
        }
    }

    pub fn valid(&self) -> bool {
        self.current < self.restarts_offset
    }

    /// The first corruption observed, if any. Latched: once set it never
    /// clears.
    pub fn status(&self) -> Result<()> {
        match &self.status {
            None => Ok(()),
            Some(err) => Err(err.clone()),
        }
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    pub fn value(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        &self.data[self.value.0..self.value.0 + self.value.1]
    }

    pub fn seek_to_first(&mut self) {
        if self.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    pub fn seek_to_last(&mut self) {
        if self.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(self.num_restarts - 1);
        while self.parse_next_key() && self.next_entry_offset() < self.restarts_offset {}
    }

    /// Positions the cursor at the first entry whose key is at or after
    /// `target`; invalid (without error) if every key is before it.
    pub fn seek(&mut self, target: &[u8]) {
        if self.num_restarts == 0 {
            return;
        }
        // Binary search for the last restart whose key is strictly before
        // the target; restart keys are stored in full.
        let mut left = 0usize;
        let mut right = self.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let region_offset = self.restart_point(mid);
            let Some((shared, non_shared, _, key_offset)) =
                decode_entry(self.data, region_offset, self.restarts_offset)
            else {
                self.corruption_error();
                return;
            };
            if shared != 0 {
                // A restart entry must carry its key in full.
                self.corruption_error();
                return;
            }
            let mid_key = &self.data[key_offset..key_offset + non_shared];
            if self.comparator.compare(mid_key, target) == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        // Linear scan within the restart range.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    /// Advances to the next entry; a cursor that is already invalid stays
    /// invalid.
    pub fn next(&mut self) {
        if !self.valid() {
            return;
        }
        self.parse_next_key();
    }

    /// Steps back to the previous entry; invalid after stepping off the
    /// front.
    pub fn prev(&mut self) {
        if !self.valid() {
            return;
        }
        // Back up to the restart range that ends before the current entry,
        // then replay it forward.
        let original = self.current;
        while self.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // Ran off the front.
                self.current = self.restarts_offset;
                self.restart_index = self.num_restarts;
                return;
            }
            self.restart_index -= 1;
        }
        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_key() && self.next_entry_offset() < original {}
    }

    fn next_entry_offset(&self) -> usize {
        self.value.0 + self.value.1
    }

    fn restart_point(&self, index: usize) -> usize {
        debug_assert!(index < self.num_restarts);
        decode_fixed32(&self.data[self.restarts_offset + index * 4..]) as usize
    }

    fn seek_to_restart_point(&mut self, index: usize) {
        self.key.clear();
        self.restart_index = index;
        // parse_next_key picks the offset up from the empty value range.
        self.value = (self.restart_point(index), 0);
    }

    fn corruption_error(&mut self) {
        self.current = self.restarts_offset;
        self.restart_index = self.num_restarts;
        self.key.clear();
        self.value = (self.restarts_offset, 0);
        if self.status.is_none() {
            self.status = Some(Error::Corruption("bad entry in block".to_string()));
        }
    }

    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.restarts_offset {
            // Off the end; invalid but not an error.
            self.current = self.restarts_offset;
            self.restart_index = self.num_restarts;
            return false;
        }
        let Some((shared, non_shared, value_len, key_offset)) =
            decode_entry(self.data, self.current, self.restarts_offset)
        else {
            self.corruption_error();
            return false;
        };
        if shared > self.key.len() {
            self.corruption_error();
            return false;
        }
        self.key.truncate(shared);
        self.key
            .extend_from_slice(&self.data[key_offset..key_offset + non_shared]);
        self.value = (key_offset + non_shared, value_len);
        // Track the largest restart at or before the new entry.
        while self.restart_index + 1 < self.num_restarts
            && self.restart_point(self.restart_index + 1) <= self.current
        {
            self.restart_index += 1;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::encoding::put_fixed32;
    use crate::internal_key::{
        append_internal_key, parse_internal_key, InternalKeyComparator, LookupKey,
        ParsedInternalKey, SequenceNumber, ValueType,
    };

    const CMP: BytewiseComparator = BytewiseComparator;

    fn numbered_block(n: usize, restart_interval: usize) -> Block {
        let mut builder = BlockBuilder::new(restart_interval);
        for i in 0..n {
            builder.add(format!("key{i}").as_bytes(), format!("v{i}").as_bytes());
        }
        Block::new(builder.finish()).unwrap()
    }

    fn collect_forward(block: &Block) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut iter = block.iter(&CMP);
        let mut entries = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            entries.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        iter.status().unwrap();
        entries
    }

    fn collect_backward(block: &Block) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut iter = block.iter(&CMP);
        let mut entries = Vec::new();
        iter.seek_to_last();
        while iter.valid() {
            entries.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.prev();
        }
        iter.status().unwrap();
        entries
    }

    #[test]
    fn test_forward_and_backward_visit_the_same_entries() {
        for &interval in &[1, 3, 4, 16] {
            let block = numbered_block(10, interval);
            let forward = collect_forward(&block);
            assert_eq!(forward.len(), 10);
            assert_eq!(forward[0].0, b"key0");
            assert_eq!(forward[9], (b"key9".to_vec(), b"v9".to_vec()));

            let mut backward = collect_backward(&block);
            backward.reverse();
            assert_eq!(forward, backward);
        }
    }

    #[test]
    fn test_prefix_reconstruction() {
        let mut builder = BlockBuilder::new(DEFAULT_RESTART_INTERVAL);
        builder.add(b"apple", b"fruit");
        builder.add(b"apply", b"verb");
        let block = Block::new(builder.finish()).unwrap();

        let mut iter = block.iter(&CMP);
        iter.seek_to_first();
        assert_eq!(iter.key(), b"apple");
        assert_eq!(iter.value(), b"fruit");
        iter.next();
        assert_eq!(iter.key(), b"apply");
        assert_eq!(iter.value(), b"verb");
        iter.next();
        assert!(!iter.valid());
        iter.status().unwrap();
    }

    #[test]
    fn test_seek_then_walk_backward_off_the_front() {
        let block = numbered_block(10, 4);
        let mut iter = block.iter(&CMP);

        iter.seek(b"key5");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key5");
        assert_eq!(iter.value(), b"v5");

        iter.prev();
        assert_eq!(iter.key(), b"key4");

        // key3, key2, key1, key0, then off the front.
        for expected in [&b"key3"[..], &b"key2"[..], &b"key1"[..], &b"key0"[..]] {
            iter.prev();
            assert!(iter.valid());
            assert_eq!(iter.key(), expected);
        }
        iter.prev();
        assert!(!iter.valid());
        iter.status().unwrap();

        // Invalid cursors stay put.
        iter.prev();
        assert!(!iter.valid());
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek_between_and_past_keys() {
        let block = numbered_block(10, 4);
        let mut iter = block.iter(&CMP);

        // No exact match: lands on the next key.
        iter.seek(b"key10a");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key2");

        iter.seek(b"");
        assert_eq!(iter.key(), b"key0");

        // Past the last key: invalid, not an error.
        iter.seek(b"zzz");
        assert!(!iter.valid());
        iter.status().unwrap();
    }

    #[test]
    fn test_seek_to_last_lands_on_final_entry() {
        for &interval in &[1, 4, 16] {
            let block = numbered_block(7, interval);
            let mut iter = block.iter(&CMP);
            iter.seek_to_last();
            assert!(iter.valid());
            assert_eq!(iter.key(), b"key6");
        }
    }

    #[test]
    fn test_restart_index_tracks_cursor() {
        let block = numbered_block(10, 4);
        let mut iter = block.iter(&CMP);
        iter.seek_to_first();
        while iter.valid() {
            // restart[restart_index] <= current < restart[restart_index+1]
            assert!(iter.restart_point(iter.restart_index) <= iter.current);
            if iter.restart_index + 1 < iter.num_restarts {
                assert!(iter.current < iter.restart_point(iter.restart_index + 1));
            }
            iter.next();
        }
    }

    #[test]
    fn test_empty_block() {
        let builder = BlockBuilder::new(4);
        assert!(builder.is_empty());
        let block = Block::new(builder.finish()).unwrap();
        let mut iter = block.iter(&CMP);
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
        iter.status().unwrap();
    }

    #[test]
    fn test_trailer_validation() {
        // Too short for the restart count.
        assert!(Block::new(vec![0, 0, 0]).unwrap_err().is_corruption());

        // Restart count larger than the block could hold.
        let mut data = Vec::new();
        put_fixed32(&mut data, 5);
        assert!(Block::new(data).unwrap_err().is_corruption());
    }

    #[test]
    fn test_entry_overrunning_block_latches_corruption() {
        // One entry claiming a 200-byte value that is not there.
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 3, 200]);
        data.extend_from_slice(b"abc");
        put_fixed32(&mut data, 0); // restart array
        put_fixed32(&mut data, 1); // restart count
        let block = Block::new(data).unwrap();

        let mut iter = block.iter(&CMP);
        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(iter.status().unwrap_err().is_corruption());

        // The latch holds across further motion.
        iter.next();
        assert!(!iter.valid());
        assert!(iter.status().unwrap_err().is_corruption());
    }

    #[test]
    fn test_shared_prefix_longer_than_previous_key_is_corruption() {
        // First entry of a restart range claims two shared bytes, but there
        // is no previous key.
        let mut data = Vec::new();
        data.extend_from_slice(&[2, 1, 0]);
        data.push(b'x');
        put_fixed32(&mut data, 0);
        put_fixed32(&mut data, 1);
        let block = Block::new(data).unwrap();

        let mut iter = block.iter(&CMP);
        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(iter.status().unwrap_err().is_corruption());
    }

    #[test]
    fn test_seek_through_corrupt_restart_entry() {
        // Two restarts; the second one's offset points at garbage with a
        // nonzero shared length, which seek's binary search must reject.
        let mut builder = BlockBuilder::new(1);
        builder.add(b"a", b"1");
        builder.add(b"b", b"2");
        let mut data = builder.finish();
        // Overwrite the second entry's shared length (entry layout:
        // shared, non_shared, value_len, key, value = 5 bytes per entry).
        data[5] = 9;
        let block = Block::new(data).unwrap();

        let mut iter = block.iter(&CMP);
        iter.seek(b"b");
        assert!(!iter.valid());
        assert!(iter.status().unwrap_err().is_corruption());
    }

    #[test]
    fn test_large_values_take_the_varint_path() {
        let mut builder = BlockBuilder::new(4);
        let big = vec![b'v'; 300];
        builder.add(b"big", &big);
        builder.add(b"bigger", &[b'w'; 200]);
        let block = Block::new(builder.finish()).unwrap();

        let mut iter = block.iter(&CMP);
        iter.seek_to_first();
        assert_eq!(iter.key(), b"big");
        assert_eq!(iter.value(), big.as_slice());
        iter.next();
        assert_eq!(iter.key(), b"bigger");
        assert_eq!(iter.value().len(), 200);
    }

    #[test]
    fn test_builder_size_accounting() {
        let mut builder = BlockBuilder::new(4);
        assert_eq!(builder.estimated_size(), 4);
        builder.add(b"key", b"value");
        let estimated = builder.estimated_size();
        assert_eq!(builder.entry_count(), 1);
        let data = builder.finish();
        assert_eq!(data.len(), estimated);
    }

    // Snapshot reads: a block of internal keys seeked with a LookupKey
    // lands on the newest entry at or below the snapshot sequence.

    fn internal_entry(
        user_key: &[u8],
        sequence: SequenceNumber,
        value_type: ValueType,
    ) -> Vec<u8> {
        let mut encoded = Vec::new();
        append_internal_key(
            &mut encoded,
            &ParsedInternalKey {
                user_key,
                sequence,
                value_type,
            },
        );
        encoded
    }

    fn versioned_block() -> Block {
        let mut builder = BlockBuilder::new(4);
        builder.add(&internal_entry(b"a", 5, ValueType::Value), b"a@5");
        builder.add(&internal_entry(b"a", 3, ValueType::Deletion), b"");
        builder.add(&internal_entry(b"b", 1, ValueType::Value), b"b@1");
        Block::new(builder.finish()).unwrap()
    }

    #[test]
    fn test_snapshot_seek_finds_newest_visible_entry() {
        let icmp = InternalKeyComparator::new(BytewiseComparator);
        let block = versioned_block();
        let mut iter = block.iter(&icmp);

        // Snapshot at 5: the live value.
        iter.seek(LookupKey::new(b"a", 5).internal_key());
        assert!(iter.valid());
        let parsed = parse_internal_key(iter.key()).unwrap();
        assert_eq!((parsed.user_key, parsed.sequence), (&b"a"[..], 5));
        assert_eq!(iter.value(), b"a@5");

        // Snapshot at 4: skips sequence 5, lands on the tombstone.
        iter.seek(LookupKey::new(b"a", 4).internal_key());
        let parsed = parse_internal_key(iter.key()).unwrap();
        assert_eq!(parsed.sequence, 3);
        assert_eq!(parsed.value_type, ValueType::Deletion);

        // Snapshot at 2: nothing visible for "a"; first entry past it.
        iter.seek(LookupKey::new(b"a", 2).internal_key());
        let parsed = parse_internal_key(iter.key()).unwrap();
        assert_eq!((parsed.user_key, parsed.sequence), (&b"b"[..], 1));
    }
}
