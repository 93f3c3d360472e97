// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! An ordered set of packet numbers, stored as merged half-open ranges.
//!
//! The set is bounded: when the number of disjoint ranges exceeds the
//! configured capacity the lowest (oldest) range is dropped, so tracking
//! memory stays constant no matter how pathological the loss pattern is.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::collections::Bound;
use std::ops::Range;

#[derive(Clone, PartialEq, Eq)]
pub struct RangeSet {
    /// Disjoint, non-adjacent ranges keyed by start, mapped to their
    /// (exclusive) end.
    inner: BTreeMap<u64, u64>,

    capacity: usize,
}

impl RangeSet {
    /// Creates a set that keeps at most `capacity` disjoint ranges.
    pub fn new(capacity: usize) -> Self {
        RangeSet {
            inner: BTreeMap::default(),
            capacity: capacity.max(1),
        }
    }

    /// Inserts all values of `item` into the set, merging with any range it
    /// touches or overlaps.
    pub fn insert(&mut self, item: Range<u64>) {
        if item.start >= item.end {
            return;
        }

        let mut start = item.start;
        let mut end = item.end;

        // Absorb the closest range at or below the new start, if it reaches
        // the new range.
        if let Some((&s, &e)) = self.range_at_or_below(start) {
            if e >= start {
                self.inner.remove(&s);

                start = start.min(s);
                end = end.max(e);
            }
        }

        // Absorb every following range the (possibly grown) new range
        // reaches.
        while let Some((&s, &e)) = self.range_at_or_above(start) {
            if s > end {
                break;
            }

            self.inner.remove(&s);

            end = end.max(e);
        }

        self.inner.insert(start, end);

        // Oldest tracked ranges go first when over capacity.
        while self.inner.len() > self.capacity {
            let first = *self.inner.keys().next().unwrap();
            self.inner.remove(&first);
        }
    }

    /// Inserts a single value into the set.
    pub fn push_item(&mut self, item: u64) {
        self.insert(item..item + 1);
    }

    /// Removes all values up to and including `largest`.
    pub fn remove_until(&mut self, largest: u64) {
        let affected: Vec<(u64, u64)> = self
            .inner
            .range((Bound::Unbounded, Bound::Included(&largest)))
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in affected {
            self.inner.remove(&s);

            if e > largest + 1 {
                self.inner.insert(largest + 1, e);
            }
        }
    }

    /// Whether the given value is in the set.
    pub fn contains(&self, item: u64) -> bool {
        match self.range_at_or_below(item) {
            Some((_, &e)) => e > item,
            None => false,
        }
    }

    /// The smallest value in the set.
    pub fn first(&self) -> Option<u64> {
        self.inner.keys().next().copied()
    }

    /// The largest value in the set.
    pub fn last(&self) -> Option<u64> {
        self.inner.values().next_back().map(|e| e - 1)
    }

    /// The number of disjoint ranges in the set.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates over the disjoint ranges in ascending order.
    pub fn iter(&self) -> Iter {
        Iter {
            inner: self.inner.iter(),
        }
    }

    fn range_at_or_below(&self, item: u64) -> Option<(&u64, &u64)> {
        self.inner
            .range((Bound::Unbounded, Bound::Included(&item)))
            .next_back()
    }

    fn range_at_or_above(&self, item: u64) -> Option<(&u64, &u64)> {
        self.inner
            .range((Bound::Included(&item), Bound::Unbounded))
            .next()
    }
}

impl Default for RangeSet {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl std::fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ranges: Vec<std::ops::RangeInclusive<u64>> =
            self.iter().map(|r| r.start..=r.end - 1).collect();

        write!(f, "{ranges:?}")
    }
}

/// An iterator over the disjoint ranges of a [`RangeSet`].
pub struct Iter<'a> {
    inner: btree_map::Iter<'a, u64, u64>,
}

impl Iterator for Iter<'_> {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.inner.next()?;
        Some(start..end)
    }
}

impl DoubleEndedIterator for Iter<'_> {
    fn next_back(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.inner.next_back()?;
        Some(start..end)
    }
}

impl ExactSizeIterator for Iter<'_> {
    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(r: &RangeSet) -> Vec<Range<u64>> {
        r.iter().collect()
    }

    #[test]
    fn insert_disjoint() {
        let mut r = RangeSet::new(usize::MAX);

        r.insert(4..7);
        r.insert(9..12);

        assert_eq!(r.len(), 2);
        assert_eq!(collect(&r), vec![4..7, 9..12]);
    }

    #[test]
    fn insert_merges_overlap() {
        let mut r = RangeSet::new(usize::MAX);

        r.insert(3..6);
        r.insert(9..12);
        r.insert(5..10);

        assert_eq!(collect(&r), vec![3..12]);
    }

    #[test]
    fn insert_merges_adjacent() {
        let mut r = RangeSet::new(usize::MAX);

        r.insert(3..6);
        r.insert(6..9);

        assert_eq!(collect(&r), vec![3..9]);
    }

    #[test]
    fn insert_contained_is_noop() {
        let mut r = RangeSet::new(usize::MAX);

        r.insert(3..9);
        r.insert(4..6);
        r.insert(3..9);

        assert_eq!(collect(&r), vec![3..9]);
    }

    #[test]
    fn insert_spanning_multiple() {
        let mut r = RangeSet::new(usize::MAX);

        r.insert(3..5);
        r.insert(7..8);
        r.insert(10..12);
        r.insert(4..11);

        assert_eq!(collect(&r), vec![3..12]);
    }

    #[test]
    fn push_item_merges_neighbors() {
        let mut r = RangeSet::new(usize::MAX);

        r.push_item(1);
        r.push_item(3);
        assert_eq!(r.len(), 2);

        r.push_item(2);
        assert_eq!(collect(&r), vec![1..4]);
    }

    #[test]
    fn contains() {
        let mut r = RangeSet::new(usize::MAX);

        r.insert(4..7);
        r.insert(9..12);

        assert!(!r.contains(3));
        assert!(r.contains(4));
        assert!(r.contains(6));
        assert!(!r.contains(7));
        assert!(!r.contains(8));
        assert!(r.contains(11));
        assert!(!r.contains(12));
    }

    #[test]
    fn first_last() {
        let mut r = RangeSet::new(usize::MAX);
        assert_eq!(r.first(), None);
        assert_eq!(r.last(), None);

        r.insert(4..7);
        r.insert(9..12);

        assert_eq!(r.first(), Some(4));
        assert_eq!(r.last(), Some(11));
    }

    #[test]
    fn remove_until() {
        let mut r = RangeSet::new(usize::MAX);

        r.insert(3..6);
        r.insert(9..11);
        r.insert(13..20);

        r.remove_until(2);
        assert_eq!(collect(&r), vec![3..6, 9..11, 13..20]);

        r.remove_until(4);
        assert_eq!(collect(&r), vec![5..6, 9..11, 13..20]);

        r.remove_until(14);
        assert_eq!(collect(&r), vec![15..20]);

        r.remove_until(19);
        assert!(r.is_empty());
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut r = RangeSet::new(3);

        r.insert(10..11);
        r.insert(13..14);
        r.insert(3..6);
        assert_eq!(r.len(), 3);

        r.insert(16..20);
        assert_eq!(collect(&r), vec![10..11, 13..14, 16..20]);

        // A merging insert does not evict what it absorbs.
        r.insert(11..17);
        assert_eq!(collect(&r), vec![10..20]);
    }
}
