use std::fmt;
use std::ops::{BitAnd, Range};

use crate::clock::TimeStamp;

/// A totally ordered coordinate with a measurable distance.
pub trait Bound: Copy + Ord + fmt::Debug {
    /// Length of `[from, to)`, zero when empty.
    fn span(from: Self, to: Self) -> u64;
}

macro_rules! impl_bound_for_int {
    ($($t:ty),*) => {
        $(
            impl Bound for $t {
                fn span(from: Self, to: Self) -> u64 {
                    if to > from {
                        (to as i128 - from as i128) as u64
                    } else {
                        0
                    }
                }
            }
        )*
    };
}

impl_bound_for_int!(i32, i64, u32, u64, usize);

impl Bound for TimeStamp {
    fn span(from: Self, to: Self) -> u64 {
        i64::span(from.time(), to.time())
    }
}

/// Ordered collection of disjoint, non-touching `[begin, end)` ranges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntervalSet<T> {
    ranges: Vec<Range<T>>,
}

impl<T: Bound> IntervalSet<T> {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// A set holding the single range `[begin, end)`.
    pub fn from_range(begin: T, end: T) -> Self {
        let mut set = Self::new();
        set.include(begin, end);
        set
    }

    pub fn ranges(&self) -> &[Range<T>] {
        &self.ranges
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Range<T>> {
        self.ranges.iter()
    }

    /// Number of stored ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn last(&self) -> Option<&Range<T>> {
        self.ranges.last()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn contains(&self, point: T) -> bool {
        let idx = self.ranges.partition_point(|r| r.end <= point);
        self.ranges.get(idx).is_some_and(|r| r.start <= point)
    }

    /// Add `[begin, end)`, merging with every range it overlaps or touches.
    pub fn include(&mut self, begin: T, end: T) -> &mut Self {
        if begin >= end {
            return self;
        }

        let first = self.ranges.partition_point(|r| r.end < begin);
        let last = self.ranges.partition_point(|r| r.start <= end);

        let (start, stop) = if first < last {
            (
                self.ranges[first].start.min(begin),
                self.ranges[last - 1].end.max(end),
            )
        } else {
            (begin, end)
        };

        self.ranges.splice(first..last, [start..stop]);
        self
    }

    /// Remove `[begin, end)`, splitting a range that straddles either bound.
    pub fn exclude(&mut self, begin: T, end: T) -> &mut Self {
        if begin >= end {
            return self;
        }

        let first = self.ranges.partition_point(|r| r.end <= begin);
        let last = self.ranges.partition_point(|r| r.start < end);

        if first >= last {
            return self;
        }

        let mut kept = Vec::with_capacity(2);
        let head = &self.ranges[first];
        if head.start < begin {
            kept.push(head.start..begin);
        }
        let tail = &self.ranges[last - 1];
        if tail.end > end {
            kept.push(end..tail.end);
        }

        self.ranges.splice(first..last, kept);
        self
    }

    /// Remove everything before `bound`.
    pub fn exclude_below(&mut self, bound: T) -> &mut Self {
        let first = self.ranges.partition_point(|r| r.end <= bound);
        self.ranges.drain(..first);

        if let Some(head) = self.ranges.first_mut() {
            if head.start < bound {
                head.start = bound;
            }
        }

        self
    }

    /// Ranges present in both sets.
    pub fn intersect(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);

        while i < self.ranges.len() && j < other.ranges.len() {
            let a = &self.ranges[i];
            let b = &other.ranges[j];
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);

            if start < end {
                out.push(start..end);
            }

            if a.end < b.end {
                i += 1;
            } else {
                j += 1;
            }
        }

        Self { ranges: out }
    }

    /// The part of this set inside `[begin, end)`.
    pub fn subset(&self, begin: T, end: T) -> Self {
        self.intersect(&Self::from_range(begin, end))
    }

    /// Complement of this set restricted to `[lo, hi)`.
    pub fn invert(&self, lo: T, hi: T) -> Self {
        let mut out = Vec::new();

        if lo >= hi {
            return Self { ranges: out };
        }

        let mut cursor = lo;
        for r in &self.ranges {
            if r.end <= cursor {
                continue;
            }
            if r.start >= hi {
                break;
            }
            if r.start > cursor {
                out.push(cursor..r.start);
            }
            cursor = r.end;
            if cursor >= hi {
                break;
            }
        }

        if cursor < hi {
            out.push(cursor..hi);
        }

        Self { ranges: out }
    }

    /// Total covered length.
    pub fn count(&self) -> u64 {
        self.ranges.iter().map(|r| T::span(r.start, r.end)).sum()
    }
}

impl<T: Bound> Default for IntervalSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Bound> BitAnd for &IntervalSet<T> {
    type Output = IntervalSet<T>;

    fn bitand(self, rhs: Self) -> IntervalSet<T> {
        self.intersect(rhs)
    }
}

impl<T: Bound> FromIterator<Range<T>> for IntervalSet<T> {
    fn from_iter<I: IntoIterator<Item = Range<T>>>(iter: I) -> Self {
        let mut set = Self::new();
        for r in iter {
            set.include(r.start, r.end);
        }
        set
    }
}

impl<'a, T> IntoIterator for &'a IntervalSet<T> {
    type Item = &'a Range<T>;
    type IntoIter = std::slice::Iter<'a, Range<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

impl<T: fmt::Display> fmt::Display for IntervalSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "[{}..{})", r.start, r.end)?;
        }
        Ok(())
    }
}
