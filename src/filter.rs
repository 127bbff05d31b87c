//! Decisions about which intercepted calls end up in the ring.

use std::{
    ops::{Range, RangeInclusive},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::event::EventKind;

const MAX_OWNED_RANGES: usize = 8;

/// Address ranges the layer itself owns.  Calls whose address falls inside one of them are never
/// recorded, which keeps the hooks from reporting their own bookkeeping.
///
/// Registration is lock-free and append-only; lookups only read atomics.
pub struct OwnedRanges {
    starts: [AtomicUsize; MAX_OWNED_RANGES],
    ends: [AtomicUsize; MAX_OWNED_RANGES],
    len: AtomicUsize,
}

impl OwnedRanges {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: AtomicUsize = AtomicUsize::new(0);
        OwnedRanges {
            starts: [EMPTY; MAX_OWNED_RANGES],
            ends: [EMPTY; MAX_OWNED_RANGES],
            len: AtomicUsize::new(0),
        }
    }

    /// Returns `false` when the registry is full.
    pub fn register(&self, range: Range<usize>) -> bool {
        let idx = self.len.fetch_add(1, Ordering::AcqRel);
        if idx >= MAX_OWNED_RANGES {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        // A reader that sees `end` also sees `start`; until then the slot matches nothing.
        self.starts[idx].store(range.start, Ordering::Relaxed);
        self.ends[idx].store(range.end, Ordering::Release);
        true
    }

    pub fn contains(&self, addr: usize) -> bool {
        let len = self.len.load(Ordering::Acquire).min(MAX_OWNED_RANGES);
        (0..len).any(|i| {
            let end = self.ends[i].load(Ordering::Acquire);
            let start = self.starts[i].load(Ordering::Relaxed);
            start <= addr && addr < end
        })
    }
}

impl Default for OwnedRanges {
    fn default() -> Self {
        Self::new()
    }
}

/// Set of event kinds to record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KindSet(u8);

impl KindSet {
    pub const ALL: KindSet = KindSet(0xff);
    pub const NONE: KindSet = KindSet(0);

    pub fn with(self, kind: EventKind) -> KindSet {
        KindSet(self.0 | 1 << kind as u32)
    }

    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & (1 << kind as u32) != 0
    }
}

impl Default for KindSet {
    fn default() -> Self {
        KindSet::ALL
    }
}

impl FromIterator<EventKind> for KindSet {
    fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> Self {
        iter.into_iter().fold(KindSet::NONE, KindSet::with)
    }
}

/// Restricts which allocation sizes are recorded.  Each non-empty criterion must match; an empty
/// filter lets everything through.  Deallocations carry no size and are never filtered here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SizeFilter {
    ranges: Vec<RangeInclusive<u64>>,
    sizes: Vec<u64>,
}

impl SizeFilter {
    pub fn new(ranges: Vec<RangeInclusive<u64>>, sizes: Vec<u64>) -> Self {
        SizeFilter { ranges, sizes }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.sizes.is_empty()
    }

    pub fn accepts(&self, size: usize) -> bool {
        let size = size as u64;
        (self.ranges.is_empty() || self.ranges.iter().any(|r| r.contains(&size)))
            && (self.sizes.is_empty() || self.sizes.contains(&size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_ranges_are_half_open() {
        let owned = OwnedRanges::new();
        assert!(!owned.contains(0x1000));
        assert!(owned.register(0x1000..0x2000));
        assert!(owned.contains(0x1000));
        assert!(owned.contains(0x1fff));
        assert!(!owned.contains(0x2000));
        assert!(!owned.contains(0xfff));
    }

    #[test]
    fn owned_ranges_fill_up() {
        let owned = OwnedRanges::new();
        for i in 0..MAX_OWNED_RANGES {
            assert!(owned.register(i * 0x100..i * 0x100 + 0x10));
        }
        assert!(!owned.register(0x9000..0x9100));
        assert!(!owned.contains(0x9000));
        assert!(owned.contains(0x705));
    }

    #[test]
    fn kind_set() {
        let set: KindSet = [EventKind::ConstructArray, EventKind::DestroyArray]
            .into_iter()
            .collect();
        assert!(set.contains(EventKind::ConstructArray));
        assert!(!set.contains(EventKind::Allocate));
        assert!(EventKind::ALL.iter().all(|k| KindSet::ALL.contains(*k)));
    }

    #[test]
    fn empty_size_filter_accepts_everything() {
        let filter = SizeFilter::default();
        assert!(filter.is_empty());
        assert!(filter.accepts(0));
        assert!(filter.accepts(usize::MAX));
    }

    #[test]
    fn size_ranges_are_inclusive() {
        let filter = SizeFilter::new(vec![0..=100, 1024..=2048], vec![]);
        assert!(filter.accepts(100));
        assert!(filter.accepts(1024));
        assert!(!filter.accepts(101));
        assert!(!filter.accepts(4096));
    }

    #[test]
    fn ranges_and_sizes_must_both_match() {
        let filter = SizeFilter::new(vec![0..=100], vec![16, 200]);
        assert!(filter.accepts(16));
        assert!(!filter.accepts(200));
        assert!(!filter.accepts(17));
    }
}
