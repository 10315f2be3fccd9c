//! range.rs — NØNOS kexec physical address intervals

use std::fmt;

pub const PAGE_SIZE: u64 = 4096;

/// 1 MiB. Nothing the loader allocates on its own goes below this.
pub const M1: u64 = 1 << 20;

pub const MAX_ADDR: u64 = u64::MAX;

#[inline]
pub fn align_up(v: u64, align: u64) -> u64 {
    if align == 0 {
        return v;
    }
    v.div_ceil(align) * align
}

/// Contiguous interval `[start, start + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Range {
    pub start: u64,
    pub size: u64,
}

impl Range {
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// `[start, end)`.
    pub fn from_interval(start: u64, end: u64) -> Self {
        Self { start, size: end - start }
    }

    /// Exclusive end, saturating at the top of the address space.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, p: u64) -> bool {
        self.start <= p && p < self.end()
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    pub fn disjunct(&self, other: &Range) -> bool {
        !self.overlaps(other)
    }

    pub fn is_superset_of(&self, other: &Range) -> bool {
        self.start <= other.start && self.end() >= other.end()
    }

    pub fn intersect(&self, other: &Range) -> Option<Range> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Range::from_interval(
            self.start.max(other.start),
            self.end().min(other.end()),
        ))
    }

    /// Points of `self` not in `other`: zero, one or two ranges.
    pub fn minus(&self, other: &Range) -> Vec<Range> {
        let mut out = Vec::with_capacity(2);
        if self.contains(other.start) && self.start != other.start {
            out.push(Range::from_interval(self.start, other.start));
        }
        if self.contains(other.end()) && self.end() != other.end() {
            out.push(Range::from_interval(other.end(), self.end()));
        }
        if out.is_empty() && self.disjunct(other) {
            out.push(*self);
        }
        out
    }

    /// Same end, new start. Shrinks or grows the range accordingly.
    pub fn with_start(&self, start: u64) -> Range {
        if start >= self.end() {
            return Range::new(start, 0);
        }
        Range::from_interval(start, self.end())
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end())
    }
}

/// Constraints for [`Ranges::find_space`].
#[derive(Debug, Clone, Copy)]
pub struct FindOpts {
    pub limit: Range,
    pub start_align: u64,
}

impl Default for FindOpts {
    fn default() -> Self {
        Self {
            limit: Range::from_interval(0, MAX_ADDR),
            start_align: 0,
        }
    }
}

impl FindOpts {
    pub fn within(limit: Range) -> Self {
        Self { limit, ..Self::default() }
    }

    pub fn above(min_addr: u64) -> Self {
        Self::within(Range::from_interval(min_addr, MAX_ADDR))
    }

    pub fn aligned(mut self, align: u64) -> Self {
        self.start_align = align;
        self
    }
}

/// List of non-overlapping ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ranges(pub Vec<Range>);

impl Ranges {
    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn minus(&self, r: &Range) -> Ranges {
        Ranges(self.0.iter().flat_map(|q| q.minus(r)).collect())
    }

    /// First fit: the lowest-indexed range that can hold `size` bytes inside
    /// `opts.limit`.
    pub fn find_space(&self, size: u64, opts: FindOpts) -> Option<Range> {
        let mut limit = opts.limit;
        if opts.start_align != 0 && limit.start % opts.start_align != 0 {
            limit = limit.with_start(align_up(limit.start, opts.start_align));
        }
        self.0.iter().find_map(|r| {
            let mut r = *r;
            if opts.start_align != 0 && r.start % opts.start_align != 0 {
                r = r.with_start(align_up(r.start, opts.start_align));
            }
            r.intersect(&limit)
                .filter(|o| o.size >= size)
                .map(|o| Range::new(o.start, size))
        })
    }
}

impl FromIterator<Range> for Ranges {
    fn from_iter<I: IntoIterator<Item = Range>>(iter: I) -> Self {
        Ranges(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn minus_splits() {
        let r = Range::new(0x1000, 0x3000);
        assert_eq!(
            r.minus(&Range::new(0x2000, 0x1000)),
            vec![Range::new(0x1000, 0x1000), Range::new(0x3000, 0x1000)]
        );
        assert_eq!(r.minus(&Range::new(0, 0x10000)), vec![]);
        assert_eq!(r.minus(&Range::new(0x8000, 0x10)), vec![r]);
        assert_eq!(
            r.minus(&Range::new(0x1000, 0x800)),
            vec![Range::new(0x1800, 0x2800)]
        );
    }

    #[test]
    fn intersect() {
        let a = Range::new(0, 0x100);
        let b = Range::new(0x80, 0x100);
        assert_eq!(a.intersect(&b), Some(Range::new(0x80, 0x80)));
        assert_eq!(a.intersect(&Range::new(0x100, 1)), None);
    }

    #[test]
    fn find_space_respects_limit_and_alignment() {
        let rs = Ranges(vec![Range::new(0x10, 0x100), Range::new(0x2010, 0x4000)]);
        assert_eq!(
            rs.find_space(0x1000, FindOpts::default().aligned(PAGE_SIZE)),
            Some(Range::new(0x3000, 0x1000))
        );
        assert_eq!(
            rs.find_space(0x80, FindOpts::within(Range::new(0x40, 0x1000))),
            Some(Range::new(0x40, 0x80))
        );
        assert_eq!(rs.find_space(0x5000, FindOpts::default()), None);
    }
}
