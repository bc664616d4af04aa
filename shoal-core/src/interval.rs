//! Interval sets over byte offsets: which ranges of a resource are present,
//! requested or missing.
//!
//! An [`IntervalSet`] keeps a sorted vector of disjoint, non-adjacent closed
//! intervals. Inserting `[5,10]` then `[11,15]` yields the single interval
//! `[5,15]`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed interval `[min, max]` of offsets. Never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "(u64, u64)", into = "(u64, u64)")]
pub struct Interval {
    min: u64,
    max: u64,
}

/// Malformed interval input (`min > max`, or an empty length).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid range [{min}, {max}]")]
pub struct InvalidRangeError {
    pub min: u64,
    pub max: u64,
}

impl Interval {
    pub fn new(min: u64, max: u64) -> Result<Self, InvalidRangeError> {
        if min > max {
            return Err(InvalidRangeError { min, max });
        }
        Ok(Self { min, max })
    }

    /// Interval covering exactly one offset.
    pub fn single(at: u64) -> Self {
        Self { min: at, max: at }
    }

    /// Interval of `len` offsets starting at `start`. `len` must be non-zero and fit.
    pub fn with_len(start: u64, len: u64) -> Result<Self, InvalidRangeError> {
        if len == 0 {
            return Err(InvalidRangeError {
                min: start,
                max: start.wrapping_sub(1),
            });
        }
        let max = start
            .checked_add(len - 1)
            .ok_or(InvalidRangeError { min: start, max: u64::MAX })?;
        Ok(Self { min: start, max })
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// Number of offsets covered. Saturates for the full `u64` domain.
    pub fn len(&self) -> u64 {
        (self.max - self.min).saturating_add(1)
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.min <= offset && offset <= self.max
    }

    pub fn covers(&self, other: &Interval) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    /// The leading part of this interval, at most `len` offsets long.
    pub fn truncate(&self, len: u64) -> Interval {
        if len == 0 || len >= self.len() {
            return *self;
        }
        Interval {
            min: self.min,
            max: self.min + len - 1,
        }
    }
}

impl TryFrom<(u64, u64)> for Interval {
    type Error = InvalidRangeError;

    fn try_from((min, max): (u64, u64)) -> Result<Self, Self::Error> {
        Interval::new(min, max)
    }
}

impl From<Interval> for (u64, u64) {
    fn from(iv: Interval) -> Self {
        (iv.min, iv.max)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.min, self.max)
    }
}

/// Set of offsets stored as sorted, disjoint, non-adjacent intervals.
///
/// Equality is structural. The set has no bound of its own; callers that
/// track a resource of known size use [`IntervalSet::complement_within`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Interval>", into = "Vec<Interval>")]
pub struct IntervalSet {
    ranges: Vec<Interval>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_interval(iv: Interval) -> Self {
        Self { ranges: vec![iv] }
    }

    /// Union with `iv`, merging overlapping and adjacent intervals.
    pub fn add(&mut self, iv: Interval) {
        // First stored interval that overlaps or touches `iv`.
        let start = self
            .ranges
            .partition_point(|r| r.max.saturating_add(1) < iv.min);
        let mut end = start;
        let mut merged = iv;
        while end < self.ranges.len() && self.ranges[end].min <= merged.max.saturating_add(1) {
            merged.min = merged.min.min(self.ranges[end].min);
            merged.max = merged.max.max(self.ranges[end].max);
            end += 1;
        }
        self.ranges.splice(start..end, std::iter::once(merged));
    }

    /// Difference with `iv`. An interval straddling `iv` splits into up to two parts.
    pub fn remove(&mut self, iv: Interval) {
        let start = self.ranges.partition_point(|r| r.max < iv.min);
        let mut end = start;
        while end < self.ranges.len() && self.ranges[end].min <= iv.max {
            end += 1;
        }
        if start == end {
            return;
        }
        let first = self.ranges[start];
        let last = self.ranges[end - 1];
        let mut keep = Vec::with_capacity(2);
        if first.min < iv.min {
            keep.push(Interval {
                min: first.min,
                max: iv.min - 1,
            });
        }
        if last.max > iv.max {
            keep.push(Interval {
                min: iv.max + 1,
                max: last.max,
            });
        }
        self.ranges.splice(start..end, keep);
    }

    /// Membership test, O(log n).
    pub fn contains(&self, offset: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.min <= offset);
        idx > 0 && self.ranges[idx - 1].max >= offset
    }

    /// True if every offset of `iv` is in the set.
    pub fn covers(&self, iv: &Interval) -> bool {
        let idx = self.ranges.partition_point(|r| r.min <= iv.min);
        idx > 0 && self.ranges[idx - 1].covers(iv)
    }

    /// Interval of the set containing `offset`, if any.
    pub fn interval_containing(&self, offset: u64) -> Option<Interval> {
        let idx = self.ranges.partition_point(|r| r.min <= offset);
        if idx == 0 {
            return None;
        }
        let r = self.ranges[idx - 1];
        (r.max >= offset).then_some(r)
    }

    /// Smallest offset `>= offset` that is not in the set. `None` only when the
    /// set runs to `u64::MAX`.
    pub fn first_gap_at_or_after(&self, offset: u64) -> Option<u64> {
        match self.interval_containing(offset) {
            Some(r) => r.max.checked_add(1),
            None => Some(offset),
        }
    }

    /// Number of offsets in the set (saturating).
    pub fn len(&self) -> u64 {
        self.ranges
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn interval_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn first(&self) -> Option<Interval> {
        self.ranges.first().copied()
    }

    pub fn last(&self) -> Option<Interval> {
        self.ranges.last().copied()
    }

    /// Intervals in ascending order, copied out.
    pub fn iter(&self) -> impl Iterator<Item = Interval> + '_ {
        self.ranges.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<Interval> {
        self.ranges.clone()
    }

    pub fn union(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = self.clone();
        for iv in other.iter() {
            out.add(iv);
        }
        out
    }

    pub fn difference(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = self.clone();
        for iv in other.iter() {
            out.remove(iv);
        }
        out
    }

    pub fn intersection(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];
            let lo = a.min.max(b.min);
            let hi = a.max.min(b.max);
            if lo <= hi {
                out.push(Interval { min: lo, max: hi });
            }
            if a.max < b.max {
                i += 1;
            } else {
                j += 1;
            }
        }
        // Pieces of disjoint, non-adjacent inputs are themselves disjoint and non-adjacent.
        IntervalSet { ranges: out }
    }

    /// Offsets of `[0, total)` that are not in the set.
    pub fn complement_within(&self, total: u64) -> IntervalSet {
        if total == 0 {
            return IntervalSet::new();
        }
        let mut full = IntervalSet::from_interval(Interval {
            min: 0,
            max: total - 1,
        });
        for iv in self.iter() {
            full.remove(iv);
        }
        full
    }

    /// Longest interval; the lowest one wins ties.
    pub fn largest_interval(&self) -> Option<Interval> {
        self.ranges.iter().copied().fold(None, |best, r| match best {
            Some(b) if b.len() >= r.len() => Some(b),
            _ => Some(r),
        })
    }

    #[cfg(test)]
    fn is_normalized(&self) -> bool {
        self.ranges
            .windows(2)
            .all(|w| w[0].max.saturating_add(1) < w[1].min)
            && self.ranges.iter().all(|r| r.min <= r.max)
    }
}

impl From<Interval> for IntervalSet {
    fn from(iv: Interval) -> Self {
        IntervalSet::from_interval(iv)
    }
}

impl From<Vec<Interval>> for IntervalSet {
    fn from(ranges: Vec<Interval>) -> Self {
        ranges.into_iter().collect()
    }
}

impl From<IntervalSet> for Vec<Interval> {
    fn from(set: IntervalSet) -> Self {
        set.ranges
    }
}

impl FromIterator<Interval> for IntervalSet {
    fn from_iter<I: IntoIterator<Item = Interval>>(iter: I) -> Self {
        let mut set = IntervalSet::new();
        for iv in iter {
            set.add(iv);
        }
        set
    }
}

impl fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{r}")?;
        }
        f.write_str("}")
    }
}
