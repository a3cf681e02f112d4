//! Free-range tracking for a block file
//!
//! Freed byte ranges are kept as extents in a B-tree keyed by start offset,
//! with automatic coalescing of adjacent ranges.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A contiguous range of bytes within a block file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Starting byte offset
    pub start: u64,
    /// Number of bytes
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Extent { start, length }
    }

    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Check if this extent contains a byte offset
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }

    /// Check if the two extents share at least one byte
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// True when one extent ends exactly where the other begins
    pub fn touches(&self, other: &Extent) -> bool {
        self.end() == other.start || other.end() == self.start
    }

    /// Span covering both extents, if they touch
    pub fn merge(&self, other: &Extent) -> Option<Extent> {
        self.touches(other).then(|| {
            let start = self.start.min(other.start);
            Extent::new(start, self.end().max(other.end()) - start)
        })
    }
}

/// Freed ranges of one block file, coalesced
#[derive(Debug, Clone, Default)]
pub struct FreeList {
    /// Free extents indexed by start offset
    extents: BTreeMap<u64, Extent>,

    /// Sum of all extent lengths
    free_bytes: u64,
}

impl FreeList {
    pub fn new() -> Self {
        FreeList::default()
    }

    /// Mark a range free
    ///
    /// Returns `false` without changing anything if any byte of the range is
    /// already free.
    pub fn insert(&mut self, extent: Extent) -> bool {
        if extent.length == 0 {
            return true;
        }
        if self.overlaps(&extent) {
            return false;
        }

        self.free_bytes += extent.length;
        self.insert_and_coalesce(extent);
        true
    }

    /// Check whether any byte of `extent` is free
    pub fn overlaps(&self, extent: &Extent) -> bool {
        // Only the last extent starting before our end can reach into us
        self.extents
            .range(..extent.end())
            .next_back()
            .map(|(_, free)| free.overlaps(extent))
            .unwrap_or(false)
    }

    /// Absorb free neighbours on either side, then store the merged span
    fn insert_and_coalesce(&mut self, extent: Extent) {
        let left = self
            .extents
            .range(..extent.start)
            .next_back()
            .and_then(|(_, prev)| prev.merge(&extent));
        let merged = left.unwrap_or(extent);
        if left.is_some() {
            self.extents.remove(&merged.start);
        }

        let right = self
            .extents
            .get(&merged.end())
            .and_then(|next| merged.merge(next));
        let merged = match right {
            Some(wider) => {
                self.extents.remove(&extent.end());
                wider
            }
            None => merged,
        };

        self.extents.insert(merged.start, merged);
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// Number of disjoint free spans
    pub fn extent_count(&self) -> usize {
        self.extents.len()
    }

    pub fn extents(&self) -> impl Iterator<Item = &Extent> {
        self.extents.values()
    }

    pub fn clear(&mut self) {
        self.extents.clear();
        self.free_bytes = 0;
    }
}
