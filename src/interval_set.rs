//! Sorted sets of half-open byte ranges, used by blob transfer to track which parts of a blob
//!  were received (requester side) or are still to be sent (responder side).
//!
//! Entries are kept sorted by start, and no two entries overlap or touch: adding an interval
//!  merges it with every entry it overlaps or is adjacent to, possibly collapsing several
//!  entries into one.
//!
//! Storage is pluggable so the same merge logic runs on a growable `Vec` and on a fixed-size
//!  array that never allocates.

use std::fmt::{Debug, Formatter};
use std::ops::Range;

#[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct Interval {
    start: u64,
    end: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MergeResult {
    /// self lies strictly before the other interval, neither touching nor overlapping
    Before,
    /// self was merged into the other interval
    Merged,
    /// self lies strictly after the other interval
    After,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Interval {
        assert!(start <= end, "interval start {} is after its end {}", start, end);
        Interval { start, end }
    }

    /// `None` if `start + len` overflows
    pub fn from_len(start: u64, len: u64) -> Option<Interval> {
        start.checked_add(len)
            .map(|end| Interval { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Merges self into `other` if they overlap or touch, leaving `other` unchanged otherwise
    pub fn merge_into_if_intersects(&self, other: &mut Interval) -> MergeResult {
        if self.start <= other.start {
            if self.end < other.start {
                return MergeResult::Before;
            }
            other.start = self.start;
            if self.end > other.end {
                other.end = self.end;
            }
            return MergeResult::Merged;
        }
        if self.start > other.end {
            return MergeResult::After;
        }
        if self.end > other.end {
            other.end = self.end;
        }
        MergeResult::Merged
    }
}

impl Debug for Interval {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}


pub trait IntervalStorage {
    fn as_slice(&self) -> &[Interval];
    fn as_mut_slice(&mut self) -> &mut [Interval];
    /// returns `false` if there is no room for another entry
    fn try_insert(&mut self, idx: usize, interval: Interval) -> bool;
    fn remove_range(&mut self, range: Range<usize>);
    fn clear(&mut self);
}

impl IntervalStorage for Vec<Interval> {
    fn as_slice(&self) -> &[Interval] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [Interval] {
        self
    }

    fn try_insert(&mut self, idx: usize, interval: Interval) -> bool {
        self.insert(idx, interval);
        true
    }

    fn remove_range(&mut self, range: Range<usize>) {
        self.drain(range);
    }

    fn clear(&mut self) {
        Vec::clear(self)
    }
}

/// Inline storage for at most N entries
#[derive(Clone)]
pub struct FixedIntervals<const N: usize> {
    items: [Interval; N],
    len: usize,
}

impl<const N: usize> Default for FixedIntervals<N> {
    fn default() -> Self {
        FixedIntervals {
            items: [Interval::default(); N],
            len: 0,
        }
    }
}

impl<const N: usize> IntervalStorage for FixedIntervals<N> {
    fn as_slice(&self) -> &[Interval] {
        &self.items[..self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [Interval] {
        &mut self.items[..self.len]
    }

    fn try_insert(&mut self, idx: usize, interval: Interval) -> bool {
        if self.len == N {
            return false;
        }
        self.items.copy_within(idx..self.len, idx + 1);
        self.items[idx] = interval;
        self.len += 1;
        true
    }

    fn remove_range(&mut self, range: Range<usize>) {
        let removed = range.end - range.start;
        self.items.copy_within(range.end..self.len, range.start);
        self.len -= removed;
    }

    fn clear(&mut self) {
        self.len = 0;
    }
}


#[derive(Clone, Default)]
pub struct IntervalSet<S = Vec<Interval>> {
    storage: S,
}

impl<S: IntervalStorage + Default> IntervalSet<S> {
    pub fn new() -> IntervalSet<S> {
        IntervalSet {
            storage: S::default(),
        }
    }
}

impl<S: IntervalStorage> IntervalSet<S> {
    /// Adds an interval, merging it with all entries it touches or overlaps. Returns `false`
    ///  if the interval needed a new entry and the storage is full, in which case the set is
    ///  unchanged. Empty intervals are ignored.
    pub fn add(&mut self, interval: Interval) -> bool {
        if interval.is_empty() {
            return true;
        }

        let len = self.storage.as_slice().len();
        for idx in 0..len {
            match interval.merge_into_if_intersects(&mut self.storage.as_mut_slice()[idx]) {
                MergeResult::Before => {
                    return self.storage.try_insert(idx, interval);
                }
                MergeResult::After => {
                    continue;
                }
                MergeResult::Merged => {
                    self.merge_following(idx);
                    return true;
                }
            }
        }
        self.storage.try_insert(len, interval)
    }

    /// the entry at `merged_idx` grew, so it may now reach into entries after it
    fn merge_following(&mut self, merged_idx: usize) {
        let entries = self.storage.as_mut_slice();
        let mut end_idx = merged_idx + 1;
        while end_idx < entries.len() {
            let (head, tail) = entries.split_at_mut(end_idx);
            let result = tail[0].merge_into_if_intersects(&mut head[merged_idx]);
            debug_assert_ne!(result, MergeResult::Before);
            if result == MergeResult::After {
                break;
            }
            end_idx += 1;
        }
        self.storage.remove_range(merged_idx + 1 .. end_idx);
    }

    pub fn len(&self) -> usize {
        self.storage.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> Option<Interval> {
        self.storage.as_slice().get(idx).cloned()
    }

    pub fn first(&self) -> Option<Interval> {
        self.get(0)
    }

    pub fn as_slice(&self) -> &[Interval] {
        self.storage.as_slice()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.storage.as_slice().iter()
    }

    /// total number of bytes covered by the set's entries
    pub fn data_size(&self) -> u64 {
        self.iter()
            .map(|i| i.len())
            .sum()
    }

    pub fn clear(&mut self) {
        self.storage.clear();
    }

    /// Removes up to `max_len` bytes from the start of the first entry and returns them
    pub fn take_front(&mut self, max_len: u64) -> Option<Interval> {
        let first = self.storage.as_mut_slice().first_mut()?;
        let taken_end = first.start + max_len.min(first.len());
        let taken = Interval::new(first.start, taken_end);
        first.start = taken_end;
        if first.is_empty() {
            self.storage.remove_range(0..1);
        }
        Some(taken)
    }
}

impl<S: IntervalStorage> Debug for IntervalSet<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter())
            .finish()
    }
}
