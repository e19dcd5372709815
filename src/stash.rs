// Copyright (c) The oram-store Authors.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The client-side stash: blocks waiting to be evicted along their path.
//!
//! Records are kept in insertion order; eviction selection depends only on
//! ids and leaf tags, never on payload bytes, and the lookup scan is
//! constant-time over the whole stash.

use crate::heap::VirtualHeap;
use crate::{BlockId, BucketId, HeapLevel, OramError, Result};
use std::cmp::Reverse;
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};

/// A block held client-side: its id, the leaf it is tagged for, and its
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashRecord {
    /// Logical block id.
    pub id: BlockId,
    /// The leaf bucket this block is currently mapped to.
    pub leaf: BucketId,
    /// The block payload.
    pub payload: Vec<u8>,
}

/// An insertion-ordered collection of [`StashRecord`]s.
#[derive(Debug, Clone, Default)]
pub struct Stash {
    records: Vec<StashRecord>,
}

impl Stash {
    /// An empty stash.
    pub fn new() -> Self {
        Stash::default()
    }

    /// A stash over pre-existing records (e.g. restored client state).
    pub fn from_records(records: Vec<StashRecord>) -> Self {
        Stash { records }
    }

    /// The number of stashed blocks.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the stash is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The stashed records, in insertion order.
    pub fn records(&self) -> &[StashRecord] {
        &self.records
    }

    /// Consumes the stash, yielding its records.
    pub fn into_records(self) -> Vec<StashRecord> {
        self.records
    }

    /// Appends a record.
    pub fn insert(&mut self, record: StashRecord) {
        self.records.push(record);
    }

    /// Whether a record with `id` is present. Constant-time scan.
    pub fn contains(&self, id: BlockId) -> bool {
        self.position_of(id).is_some()
    }

    /// The index of the record with `id`, if any. The scan touches every
    /// record and accumulates the hit with constant-time selection, so its
    /// shape is independent of where (and whether) the id matches.
    pub fn position_of(&self, id: BlockId) -> Option<usize> {
        let mut found = Choice::from(0u8);
        let mut position = 0u64;
        for (index, record) in self.records.iter().enumerate() {
            let matches = record.id.ct_eq(&id);
            position.conditional_assign(&(index as u64), matches);
            found |= matches;
        }
        if found.into() {
            Some(position as usize)
        } else {
            None
        }
    }

    /// Mutable access to the record at `index`.
    pub fn record_mut(&mut self, index: usize) -> &mut StashRecord {
        &mut self.records[index]
    }

    /// Removes and returns up to `max` records eligible for the level-`level`
    /// bucket on the path to `path_leaf`: those whose leaf shares at least
    /// `level` levels of path with it. Prefers the records with the greatest
    /// last common level (the ones that would otherwise be forced toward the
    /// root); ties fall back to insertion order.
    pub fn take_eligible(
        &mut self,
        heap: &VirtualHeap,
        path_leaf: BucketId,
        level: HeapLevel,
        max: usize,
    ) -> Vec<StashRecord> {
        let mut eligible: Vec<(usize, HeapLevel)> = self
            .records
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                let shared = heap.last_common_level(record.leaf, path_leaf);
                (shared >= level).then_some((index, shared))
            })
            .collect();
        // Stable sort keeps insertion order among equal depths.
        eligible.sort_by_key(|&(_, shared)| Reverse(shared));
        eligible.truncate(max);

        let mut indices: Vec<usize> = eligible.into_iter().map(|(index, _)| index).collect();
        indices.sort_unstable();
        let mut taken = Vec::with_capacity(indices.len());
        for index in indices.into_iter().rev() {
            taken.push(self.records.remove(index));
        }
        taken.reverse();
        taken
    }

    /// Serializes the stash for sealing into client state. Every payload
    /// must be `payload_size` bytes.
    pub fn to_bytes(&self, payload_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8 + self.records.len() * (16 + payload_size));
        out.extend_from_slice(&(self.records.len() as u64).to_be_bytes());
        for record in &self.records {
            if record.payload.len() != payload_size {
                return Err(OramError::InvalidArgument(format!(
                    "stash record {} has a payload of {} bytes, expected {payload_size}",
                    record.id,
                    record.payload.len()
                )));
            }
            out.extend_from_slice(&record.id.to_be_bytes());
            out.extend_from_slice(&record.leaf.to_be_bytes());
            out.extend_from_slice(&record.payload);
        }
        Ok(out)
    }

    /// Inverse of [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8], payload_size: usize) -> Result<Self> {
        let read_u64 = |slice: &[u8]| -> Result<u64> {
            Ok(u64::from_be_bytes(slice.try_into().map_err(|_| {
                OramError::Corrupt("truncated stash encoding".to_string())
            })?))
        };
        if bytes.len() < 8 {
            return Err(OramError::Corrupt("truncated stash encoding".to_string()));
        }
        let count = read_u64(&bytes[..8])? as usize;
        let record_len = 16 + payload_size;
        let expected = count
            .checked_mul(record_len)
            .and_then(|len| len.checked_add(8));
        if expected != Some(bytes.len()) {
            return Err(OramError::Corrupt(format!(
                "stash encoding of {} bytes does not hold {count} records",
                bytes.len()
            )));
        }
        let mut records = Vec::with_capacity(count);
        for chunk in bytes[8..].chunks_exact(record_len) {
            records.push(StashRecord {
                id: read_u64(&chunk[..8])?,
                leaf: read_u64(&chunk[8..16])?,
                payload: chunk[16..].to_vec(),
            });
        }
        Ok(Stash { records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: BlockId, leaf: BucketId) -> StashRecord {
        StashRecord {
            id,
            leaf,
            payload: vec![id as u8; 4],
        }
    }

    #[test]
    fn lookup_finds_records_anywhere() {
        let mut stash = Stash::new();
        assert_eq!(stash.position_of(3), None);
        stash.insert(record(5, 3));
        stash.insert(record(3, 4));
        stash.insert(record(9, 6));
        assert_eq!(stash.position_of(5), Some(0));
        assert_eq!(stash.position_of(3), Some(1));
        assert_eq!(stash.position_of(9), Some(2));
        assert!(!stash.contains(4));
    }

    #[test]
    fn eviction_requires_a_deep_enough_shared_path() {
        // Binary heap of height 2: leaves are 3..=6, path to 3 is [3, 1, 0].
        let heap = VirtualHeap::new(2, 2).unwrap();
        let mut stash = Stash::new();
        stash.insert(record(0, 3)); // shares the whole path
        stash.insert(record(1, 4)); // shares levels 0..=1
        stash.insert(record(2, 6)); // shares only the root

        let taken = stash.take_eligible(&heap, 3, 2, 4);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].id, 0);

        let taken = stash.take_eligible(&heap, 3, 1, 4);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].id, 1);

        let taken = stash.take_eligible(&heap, 3, 0, 4);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].id, 2);
        assert!(stash.is_empty());
    }

    #[test]
    fn eviction_prefers_the_deepest_blocks() {
        let heap = VirtualHeap::new(2, 2).unwrap();
        let mut stash = Stash::new();
        stash.insert(record(0, 6)); // root only
        stash.insert(record(1, 3)); // whole path
        stash.insert(record(2, 4)); // levels 0..=1
        stash.insert(record(3, 5)); // root only

        let taken = stash.take_eligible(&heap, 3, 0, 2);
        let ids: Vec<BlockId> = taken.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(stash.len(), 2);
    }

    #[test]
    fn eviction_ties_break_by_insertion_order() {
        let heap = VirtualHeap::new(2, 2).unwrap();
        let mut stash = Stash::new();
        stash.insert(record(7, 6));
        stash.insert(record(8, 5));
        stash.insert(record(9, 6));

        // All three share only the root with leaf 3.
        let taken = stash.take_eligible(&heap, 3, 0, 2);
        let ids: Vec<BlockId> = taken.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![7, 8]);
        assert_eq!(stash.records()[0].id, 9);
    }

    #[test]
    fn serialization_round_trips() {
        let mut stash = Stash::new();
        stash.insert(record(1, 3));
        stash.insert(record(2, 5));
        let bytes = stash.to_bytes(4).unwrap();
        let restored = Stash::from_bytes(&bytes, 4).unwrap();
        assert_eq!(restored.records(), stash.records());

        assert!(matches!(
            Stash::from_bytes(&bytes[..bytes.len() - 1], 4),
            Err(OramError::Corrupt(_))
        ));
        assert!(matches!(
            Stash::from_bytes(&[0u8; 4], 4),
            Err(OramError::Corrupt(_))
        ));
    }
}
