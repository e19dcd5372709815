// Copyright (c) The oram-store Authors.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Pure arithmetic over a virtual k-ary heap of buckets.
//!
//! Bucket id 0 is the root; bucket `b` has children `k*b + 1 ..= k*b + k` and
//! parent `(b - 1) / k`. A heap of height `H` has `H + 1` levels and
//! `(k^(H+1) - 1) / (k - 1)` buckets. Ids at or past the bucket count are
//! *nil* and treated as absent.

use crate::{BucketId, HeapLevel, OramError, Result, MAXIMUM_HEAP_HEIGHT};
use rand::{CryptoRng, Rng, RngCore};

/// A virtual k-ary heap described by its arity and height. Holds no storage;
/// every method is integer arithmetic over bucket ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualHeap {
    arity: u64,
    height: HeapLevel,
    bucket_count: u64,
}

impl VirtualHeap {
    /// Creates a heap with `arity >= 2` and the given height. Fails with
    /// `InvalidArgument` when the bucket count does not fit in a `u64`.
    pub fn new(arity: u64, height: HeapLevel) -> Result<Self> {
        if arity < 2 {
            return Err(OramError::InvalidArgument(format!(
                "heap arity must be at least 2, got {arity}"
            )));
        }
        if height > MAXIMUM_HEAP_HEIGHT {
            return Err(OramError::InvalidArgument(format!(
                "heap height {height} exceeds the maximum of {MAXIMUM_HEAP_HEIGHT}"
            )));
        }
        let bucket_count = bucket_count_with_levels(arity, height + 1).ok_or_else(|| {
            OramError::InvalidArgument(format!(
                "heap with arity {arity} and height {height} overflows the bucket id space"
            ))
        })?;
        Ok(VirtualHeap {
            arity,
            height,
            bucket_count,
        })
    }

    /// The smallest height whose leaf level holds at least `leaves` buckets.
    pub fn min_height_for_leaves(arity: u64, leaves: u64) -> Result<HeapLevel> {
        if arity < 2 || leaves == 0 {
            return Err(OramError::InvalidArgument(format!(
                "cannot size a heap with arity {arity} for {leaves} leaves"
            )));
        }
        let mut height: HeapLevel = 0;
        let mut capacity: u64 = 1;
        while capacity < leaves {
            height += 1;
            capacity = capacity.checked_mul(arity).ok_or_else(|| {
                OramError::InvalidArgument(format!(
                    "{leaves} leaves overflow the bucket id space at arity {arity}"
                ))
            })?;
            if height > MAXIMUM_HEAP_HEIGHT {
                return Err(OramError::InvalidArgument(format!(
                    "{leaves} leaves need a heap taller than {MAXIMUM_HEAP_HEIGHT}"
                )));
            }
        }
        Ok(height)
    }

    /// The heap's arity `k`.
    pub fn arity(&self) -> u64 {
        self.arity
    }

    /// The heap's height `H` (root is at level 0).
    pub fn height(&self) -> HeapLevel {
        self.height
    }

    /// The number of levels, `H + 1`.
    pub fn levels(&self) -> HeapLevel {
        self.height + 1
    }

    /// The total number of buckets.
    pub fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    /// The number of buckets at `level`.
    pub fn bucket_count_at(&self, level: HeapLevel) -> u64 {
        debug_assert!(level <= self.height);
        self.arity.pow(level)
    }

    /// The number of leaf buckets, `k^H`.
    pub fn leaf_bucket_count(&self) -> u64 {
        self.bucket_count_at(self.height)
    }

    /// The id of the first bucket at `level`.
    pub fn first_bucket_at(&self, level: HeapLevel) -> BucketId {
        debug_assert!(level <= self.height);
        // Levels up to the height were proven in-range by the constructor.
        bucket_count_with_levels(self.arity, level).unwrap_or(0)
    }

    /// The id of the last bucket at `level`.
    pub fn last_bucket_at(&self, level: HeapLevel) -> BucketId {
        debug_assert!(level <= self.height);
        bucket_count_with_levels(self.arity, level + 1)
            .map(|count| count - 1)
            .unwrap_or(0)
    }

    /// The first leaf bucket id.
    pub fn first_leaf_bucket(&self) -> BucketId {
        self.first_bucket_at(self.height)
    }

    /// The last leaf bucket id.
    pub fn last_leaf_bucket(&self) -> BucketId {
        self.last_bucket_at(self.height)
    }

    /// Whether `bucket` lies outside the heap.
    pub fn is_nil(&self, bucket: BucketId) -> bool {
        bucket >= self.bucket_count
    }

    /// The level of `bucket`.
    pub fn bucket_level(&self, bucket: BucketId) -> HeapLevel {
        debug_assert!(!self.is_nil(bucket));
        if self.arity == 2 {
            // log2floor(b + 1)
            return (bucket + 1).ilog2();
        }
        let target = (self.arity as u128 - 1) * (bucket as u128 + 1) + 1;
        let mut level: HeapLevel = 0;
        let mut power = self.arity as u128;
        while power < target {
            level += 1;
            power *= self.arity as u128;
        }
        level
    }

    /// The parent of `bucket`, or `None` for the root.
    pub fn parent(&self, bucket: BucketId) -> Option<BucketId> {
        if bucket == 0 {
            None
        } else {
            Some((bucket - 1) / self.arity)
        }
    }

    /// The `child`-th child of `bucket` (`0 <= child < k`), or `None` when it
    /// falls outside the heap.
    pub fn child(&self, bucket: BucketId, child: u64) -> Option<BucketId> {
        debug_assert!(child < self.arity);
        let id = self.arity * bucket + 1 + child;
        if self.is_nil(id) {
            None
        } else {
            Some(id)
        }
    }

    /// The ancestor of `bucket` at `level`, or `None` when `level` is below
    /// the bucket's own level.
    pub fn ancestor_at_level(&self, bucket: BucketId, level: HeapLevel) -> Option<BucketId> {
        let mut current = bucket;
        let mut current_level = self.bucket_level(bucket);
        if level > current_level {
            return None;
        }
        while current_level > level {
            current = (current - 1) / self.arity;
            current_level -= 1;
        }
        Some(current)
    }

    /// The bucket sequence `bucket, parent(bucket), ..., 0`.
    pub fn path_to_root(&self, bucket: BucketId) -> Vec<BucketId> {
        let mut path = Vec::with_capacity(self.levels() as usize);
        let mut current = bucket;
        path.push(current);
        while let Some(parent) = self.parent(current) {
            current = parent;
            path.push(current);
        }
        path
    }

    /// The level of the deepest common ancestor of `b1` and `b2`: both ids
    /// are lifted to the same level by parent steps, then lifted together
    /// until they coincide.
    pub fn last_common_level(&self, b1: BucketId, b2: BucketId) -> HeapLevel {
        let mut level1 = self.bucket_level(b1);
        let mut level2 = self.bucket_level(b2);
        let (mut b1, mut b2) = (b1, b2);
        while level1 > level2 {
            b1 = (b1 - 1) / self.arity;
            level1 -= 1;
        }
        while level2 > level1 {
            b2 = (b2 - 1) / self.arity;
            level2 -= 1;
        }
        while b1 != b2 {
            b1 = (b1 - 1) / self.arity;
            b2 = (b2 - 1) / self.arity;
            level1 -= 1;
        }
        level1
    }

    /// A leaf bucket drawn uniformly from a cryptographically strong source.
    pub fn random_leaf_bucket<R: RngCore + CryptoRng>(&self, rng: &mut R) -> BucketId {
        self.first_leaf_bucket() + rng.gen_range(0..self.leaf_bucket_count())
    }
}

/// `(k^levels - 1) / (k - 1)`, the bucket count of a heap with that many
/// levels, or `None` on overflow.
fn bucket_count_with_levels(arity: u64, levels: HeapLevel) -> Option<u64> {
    let mut power: u64 = 1;
    for _ in 0..levels {
        power = power.checked_mul(arity)?;
    }
    Some((power - 1) / (arity - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn bucket_counts_match_closed_forms() {
        let heap = VirtualHeap::new(2, 3).unwrap();
        assert_eq!(heap.bucket_count(), 15);
        assert_eq!(heap.leaf_bucket_count(), 8);
        assert_eq!(heap.first_leaf_bucket(), 7);
        assert_eq!(heap.last_leaf_bucket(), 14);
        assert_eq!(heap.bucket_count_at(2), 4);

        let heap = VirtualHeap::new(3, 2).unwrap();
        assert_eq!(heap.bucket_count(), 13);
        assert_eq!(heap.first_bucket_at(1), 1);
        assert_eq!(heap.last_bucket_at(1), 3);
        assert_eq!(heap.first_leaf_bucket(), 4);
        assert_eq!(heap.last_leaf_bucket(), 12);
    }

    #[test]
    fn levels_are_consistent_with_ranges() {
        for arity in [2u64, 3, 5] {
            let heap = VirtualHeap::new(arity, 4).unwrap();
            for level in 0..=heap.height() {
                assert_eq!(heap.bucket_level(heap.first_bucket_at(level)), level);
                assert_eq!(heap.bucket_level(heap.last_bucket_at(level)), level);
            }
        }
    }

    #[test]
    fn parent_inverts_child() {
        for arity in [2u64, 3, 4] {
            let heap = VirtualHeap::new(arity, 3).unwrap();
            for bucket in 0..heap.bucket_count() {
                for c in 0..arity {
                    if let Some(child) = heap.child(bucket, c) {
                        assert_eq!(heap.parent(child), Some(bucket));
                        assert_eq!(heap.bucket_level(child), heap.bucket_level(bucket) + 1);
                    }
                }
            }
        }
    }

    #[test]
    fn path_to_root_walks_parents() {
        let heap = VirtualHeap::new(2, 3).unwrap();
        assert_eq!(heap.path_to_root(11), vec![11, 5, 2, 0]);
        assert_eq!(heap.path_to_root(0), vec![0]);
        let heap = VirtualHeap::new(3, 2).unwrap();
        assert_eq!(heap.path_to_root(12), vec![12, 3, 0]);
    }

    #[test]
    fn last_common_level_of_self_is_own_level() {
        let heap = VirtualHeap::new(2, 4).unwrap();
        for bucket in 0..heap.bucket_count() {
            assert_eq!(heap.last_common_level(bucket, bucket), heap.bucket_level(bucket));
        }
    }

    #[test]
    fn last_common_level_across_levels() {
        let heap = VirtualHeap::new(2, 3).unwrap();
        // Leaves 7 and 8 share only the level-2 bucket 3.
        assert_eq!(heap.last_common_level(7, 8), 2);
        // Leaves 7 and 14 diverge at the root.
        assert_eq!(heap.last_common_level(7, 14), 0);
        // A leaf and its grandparent meet at the grandparent's level.
        assert_eq!(heap.last_common_level(7, 1), 1);
        assert_eq!(heap.last_common_level(1, 7), 1);
    }

    #[test]
    fn ancestors_follow_the_path() {
        let heap = VirtualHeap::new(2, 3).unwrap();
        assert_eq!(heap.ancestor_at_level(11, 0), Some(0));
        assert_eq!(heap.ancestor_at_level(11, 1), Some(2));
        assert_eq!(heap.ancestor_at_level(11, 2), Some(5));
        assert_eq!(heap.ancestor_at_level(11, 3), Some(11));
        assert_eq!(heap.ancestor_at_level(2, 2), None);
    }

    #[test]
    fn min_height_covers_requested_leaves() {
        assert_eq!(VirtualHeap::min_height_for_leaves(2, 1).unwrap(), 0);
        assert_eq!(VirtualHeap::min_height_for_leaves(2, 2).unwrap(), 1);
        assert_eq!(VirtualHeap::min_height_for_leaves(2, 8).unwrap(), 3);
        assert_eq!(VirtualHeap::min_height_for_leaves(2, 9).unwrap(), 4);
        assert_eq!(VirtualHeap::min_height_for_leaves(3, 10).unwrap(), 3);
        assert!(VirtualHeap::min_height_for_leaves(1, 4).is_err());
        assert!(VirtualHeap::min_height_for_leaves(2, 0).is_err());
    }

    #[test]
    fn rejects_degenerate_parameters() {
        assert!(matches!(
            VirtualHeap::new(1, 3),
            Err(OramError::InvalidArgument(_))
        ));
        assert!(matches!(
            VirtualHeap::new(2, MAXIMUM_HEAP_HEIGHT + 1),
            Err(OramError::InvalidArgument(_))
        ));
    }

    #[test]
    fn random_leaves_cover_the_leaf_range() {
        let heap = VirtualHeap::new(2, 3).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let mut seen = vec![false; heap.leaf_bucket_count() as usize];
        for _ in 0..512 {
            let leaf = heap.random_leaf_bucket(&mut rng);
            assert!(leaf >= heap.first_leaf_bucket());
            assert!(leaf <= heap.last_leaf_bucket());
            seen[(leaf - heap.first_leaf_bucket()) as usize] = true;
        }
        assert!(seen.iter().all(|&hit| hit));
    }
}
