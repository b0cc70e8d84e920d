//! Damage tracking: which byte ranges of a shadowed resource have diverged
//! from the last transmitted snapshot.

use std::ops::Range;

/// Coalesced set of half-open byte intervals within `[0, size)`, with a
/// sentinel for "resend everything".
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub enum Damage {
    /// Contents match the last transmitted snapshot.
    #[default]
    Nothing,
    /// The whole resource must be resent.
    Everything,
    /// Sorted, non-overlapping, non-adjacent dirty intervals.
    Intervals(Vec<Range<usize>>),
}

impl Damage {
    /// Whether no byte is marked dirty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Nothing => true,
            Self::Everything => false,
            Self::Intervals(ranges) => ranges.is_empty(),
        }
    }

    /// Marks the whole resource dirty.
    pub fn add_everything(&mut self) {
        *self = Self::Everything;
    }

    /// Unions one interval into the set, coalescing overlapping and
    /// adjacent neighbors.
    pub fn add(&mut self, interval: Range<usize>) {
        if interval.is_empty() {
            return;
        }
        match self {
            Self::Everything => {}
            Self::Nothing => *self = Self::Intervals(vec![interval]),
            Self::Intervals(ranges) => {
                let mut merged = interval;
                let mut out = Vec::with_capacity(ranges.len() + 1);
                for range in ranges.drain(..) {
                    if range.end < merged.start || merged.end < range.start {
                        out.push(range);
                    } else {
                        merged.start = merged.start.min(range.start);
                        merged.end = merged.end.max(range.end);
                    }
                }
                let insert_at = out
                    .iter()
                    .position(|range| range.start > merged.start)
                    .unwrap_or(out.len());
                out.insert(insert_at, merged);
                *ranges = out;
            }
        }
    }

    /// Resolves the set into concrete intervals clipped to `[0, size)`.
    ///
    /// `Everything` becomes the single interval covering the resource.
    #[must_use]
    pub fn intervals(&self, size: usize) -> Vec<Range<usize>> {
        match self {
            Self::Nothing => Vec::new(),
            Self::Everything => {
                if size == 0 {
                    Vec::new()
                } else {
                    vec![0..size]
                }
            }
            Self::Intervals(ranges) => ranges
                .iter()
                .filter(|range| range.start < size)
                .map(|range| range.start..range.end.min(size))
                .filter(|range| !range.is_empty())
                .collect(),
        }
    }

    /// Clears the set.
    pub fn clear(&mut self) {
        *self = Self::Nothing;
    }
}
