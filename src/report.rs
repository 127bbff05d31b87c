//! Analysis of drained events: allocation lifetimes, per-kind totals and a leak tree.
//!
//! Addresses are reported as-is.  The consumer runs in another process, so frames are never
//! symbolized here.

#![allow(clippy::ptr_arg)]

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    fmt::{Display, Formatter},
    time::Duration,
};

use num_format::{Locale, ToFormattedString};
use radix_trie::{iter::Children, SubTrie, Trie, TrieCommon, TrieKey};
use serde::{Deserialize, Serialize};

use crate::event::{Event, EventKind};

// Frames of one allocation, innermost first.
type CallStack = Vec<usize>;

// For each call stack, track (allocation size -> number of allocations).
type SizeCounts = HashMap<usize, usize>;

// Stand-in key for allocations recorded without any frame.
const UNKNOWN_FRAME: usize = 0;

#[derive(Clone, Debug)]
enum SiteStats {
    Detailed(SizeCounts),
    // Aggregate number of allocations/total bytes.
    Summary(usize, usize),
}

impl SiteStats {
    fn new() -> Self {
        SiteStats::Summary(0, 0)
    }

    fn summarize(&self) -> SiteStats {
        match self {
            SiteStats::Summary(..) => self.clone(),
            SiteStats::Detailed(counts) => {
                let mut allocations = 0;
                let mut bytes = 0;
                for (b, c) in counts.iter() {
                    allocations += c;
                    bytes += c * b;
                }
                SiteStats::Summary(allocations, bytes)
            }
        }
    }

    fn merge(&mut self, other: &SiteStats) {
        if let SiteStats::Summary(self_allocs, self_bytes) = self.summarize() {
            if let SiteStats::Summary(other_allocs, other_bytes) = other.summarize() {
                *self = SiteStats::Summary(self_allocs + other_allocs, self_bytes + other_bytes);
            }
        }
    }

    fn format_totals<W: fmt::Write>(&self, f: &mut W) -> Result<(), fmt::Error> {
        match self {
            SiteStats::Summary(allocations, bytes) => write!(
                f,
                "{} live, {}B",
                allocations.to_formatted_string(&Locale::en),
                bytes.to_formatted_string(&Locale::en)
            ),
            SiteStats::Detailed(_) => self.summarize().format_totals(f),
        }
    }

    fn num_allocations(&self) -> usize {
        match self {
            SiteStats::Summary(allocations, _) => *allocations,
            SiteStats::Detailed(_) => self.summarize().num_allocations(),
        }
    }
}

/// Surviving allocations grouped by the call stack that made them.
#[derive(Debug, Default)]
pub struct LeakProfile {
    callstacks: Trie<CallStack, SizeCounts>,
}

impl Display for LeakProfile {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        self.fmt_with_threshold(0.0, f)
    }
}

impl LeakProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocations in the profile.
    pub fn allocations(&self) -> usize {
        self.callstacks.values().flat_map(|counts| counts.values()).sum()
    }

    pub fn record(&mut self, frames: &[u64], size: usize) {
        let mut callstack: CallStack = frames.iter().map(|&ip| ip as usize).collect();
        if callstack.is_empty() {
            callstack.push(UNKNOWN_FRAME);
        }
        match self.callstacks.get_mut(&callstack) {
            Some(counts) => *counts.entry(size).or_insert(0) += 1,
            None => {
                self.callstacks
                    .insert(callstack, [(size, 1)].into_iter().collect());
            }
        }
    }

    // Every proper prefix of a stack becomes a node, so totals roll up frame by frame.
    fn summarize(&self) -> Trie<CallStack, SiteStats> {
        let mut all_stacks = Trie::new();
        for (callstack, counts) in self.callstacks.iter() {
            all_stacks.insert(callstack.clone(), SiteStats::Detailed(counts.clone()));
            for len in 1..callstack.len() {
                let prefix = Vec::from(&callstack[..len]);
                if all_stacks.get(&prefix).is_none() {
                    all_stacks.insert(prefix, SiteStats::new());
                }
            }
        }
        let mut summary = Trie::new();
        Self::aggregate_stats(&mut summary, &all_stacks);
        summary
    }

    // Scan the trie, store aggregate allocation counts in each node.
    fn aggregate_stats<'a, T: Clone + TrieCommon<'a, CallStack, SiteStats>>(
        trie: &mut Trie<CallStack, SiteStats>,
        node: T,
    ) -> SiteStats {
        let mut stats = node.clone().value().cloned().unwrap_or_else(SiteStats::new);
        for child in node.clone().children() {
            let child_stats = Self::aggregate_stats(trie, &child);
            stats.merge(&child_stats);
        }
        if let (Some(key), Some(_)) = (node.clone().key(), node.clone().value()) {
            trie.insert(key.clone(), stats.clone());
        }
        stats
    }

    /// Prints the tree, folding sites that hold fewer than `threshold` percent of the surviving
    /// allocations into one line per level.
    pub fn fmt_with_threshold<W: fmt::Write>(
        &self,
        threshold: f64,
        f: &mut W,
    ) -> Result<(), fmt::Error> {
        let total = self.allocations();
        if total == 0 {
            return f.write_str("no surviving allocations");
        }
        let summary = self.summarize();
        self.format_summary(&summary, total, threshold, "", f)
    }

    fn format_summary<'a, T: Clone + TrieCommon<'a, CallStack, SiteStats>, W: fmt::Write>(
        &self,
        stats: T,
        total: usize,
        threshold: f64,
        prefix: &str,
        f: &mut W,
    ) -> Result<(), fmt::Error> {
        if let (Some(key), Some(value)) = (stats.clone().key(), stats.clone().value()) {
            write!(f, "\n{}->", prefix)?;
            value.format_totals(f)?;
            match key.last() {
                Some(&UNKNOWN_FRAME) | None => f.write_str(": <no frames>")?,
                Some(frame) => write!(f, ": {:#x}", frame)?,
            }
        }

        let mut children_sorted: Vec<_> = trie_children_with_keys(stats).collect();
        let nchildren = children_sorted.len();
        children_sorted.sort_by_key(|c| {
            std::cmp::Reverse(c.value().map_or(0, SiteStats::num_allocations))
        });

        let mut below_threshold = 0;
        for (idx, child) in children_sorted.iter().enumerate() {
            let allocations = child.value().map_or(0, SiteStats::num_allocations);
            if 100.0 * (allocations as f64) / (total as f64) < threshold {
                below_threshold += allocations;
                continue;
            }
            let child_prefix = if idx == nchildren - 1 {
                format!("{}  ", prefix)
            } else {
                format!("{} |", prefix)
            };
            self.format_summary(child, total, threshold, child_prefix.as_str(), f)?;
        }

        if below_threshold > 0 {
            write!(
                f,
                "\n{}  ->{} live in places below the threshold ({}%)",
                prefix,
                below_threshold.to_formatted_string(&Locale::en),
                threshold
            )?;
        }

        Ok(())
    }
}

// Iterate through the nearest descendants that have keys.
struct ChildrenWithKey<'a, K, V> {
    stack: Vec<Children<'a, K, V>>,
}

impl<'a, K, V> ChildrenWithKey<'a, K, V> {
    fn new<T>(trie: T) -> Self
    where
        T: TrieCommon<'a, K, V>,
        K: TrieKey,
    {
        ChildrenWithKey {
            stack: vec![trie.children()],
        }
    }
}

impl<'a, K, V> Iterator for ChildrenWithKey<'a, K, V>
where
    K: TrieKey,
{
    type Item = SubTrie<'a, K, V>;

    fn next(&mut self) -> Option<SubTrie<'a, K, V>> {
        loop {
            let child = match self.stack.last_mut()?.next() {
                Some(child) => child,
                None => {
                    self.stack.pop();
                    continue;
                }
            };
            if child.key().is_some() {
                return Some(child);
            }
            self.stack.push(child.children());
        }
    }
}

fn trie_children_with_keys<'a, K, V, T>(trie: T) -> ChildrenWithKey<'a, K, V>
where
    T: Clone + TrieCommon<'a, K, V>,
    K: TrieKey,
{
    ChildrenWithKey::new(trie)
}

/// An allocation with no matching release, in a form fit for dumping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Survivor {
    pub address: u64,
    pub size: u32,
    pub kind: EventKind,
    pub timestamp: u64,
    pub frames: Vec<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KindTotals {
    pub events: u64,
    pub bytes: u64,
}

/// What a single event meant to the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A new live allocation.  `replaced` is set when the address was already live, meaning its
    /// release was lost.
    Allocated { replaced: bool },
    /// A release of a live allocation.
    Released {
        allocated_by: EventKind,
        lifetime: Duration,
        mismatched: bool,
    },
    /// A release of an address with no live allocation.
    Unmatched,
    /// A record with an enumerator this build does not know.
    Unknown,
}

/// Pairs allocations with their releases by address.
#[derive(Debug, Default)]
pub struct Tracker {
    live: HashMap<u64, Event>,
    totals: [KindTotals; EventKind::ALL.len()],
    unknown: u64,
    unmatched: u64,
    mismatched: u64,
    replaced: u64,
    released: u64,
    lifetime_total: u128,
    overflowed: bool,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &Event) -> Outcome {
        let Some(kind) = event.kind() else {
            self.unknown += 1;
            return Outcome::Unknown;
        };
        let totals = &mut self.totals[kind as usize];
        totals.events += 1;
        totals.bytes += u64::from(event.size);

        if kind.is_allocation() {
            let replaced = self.live.insert(event.address, *event).is_some();
            if replaced {
                self.replaced += 1;
            }
            return Outcome::Allocated { replaced };
        }

        match self.live.entry(event.address) {
            Entry::Vacant(_) => {
                self.unmatched += 1;
                Outcome::Unmatched
            }
            Entry::Occupied(oe) => {
                let allocation = oe.remove();
                // Both kinds were validated on the way in.
                let allocated_by = allocation.kind().unwrap_or(EventKind::Allocate);
                let mismatched = !allocated_by.released_by(kind);
                if mismatched {
                    self.mismatched += 1;
                }
                let nanos = event.timestamp.saturating_sub(allocation.timestamp);
                self.released += 1;
                self.lifetime_total += u128::from(nanos);
                Outcome::Released {
                    allocated_by,
                    lifetime: Duration::from_nanos(nanos),
                    mismatched,
                }
            }
        }
    }

    /// Records that the producer dropped events; counts past this point are lower bounds.
    pub fn note_overflow(&mut self) {
        self.overflowed = true;
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn totals(&self, kind: EventKind) -> KindTotals {
        self.totals[kind as usize]
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_bytes(&self) -> u64 {
        self.live.values().map(|e| u64::from(e.size)).sum()
    }

    pub fn unmatched(&self) -> u64 {
        self.unmatched
    }

    pub fn mismatched(&self) -> u64 {
        self.mismatched
    }

    pub fn mean_lifetime(&self) -> Option<Duration> {
        if self.released == 0 {
            return None;
        }
        let mean = self.lifetime_total / u128::from(self.released);
        Some(Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX)))
    }

    /// Live allocations, oldest first.
    pub fn survivors(&self) -> Vec<Survivor> {
        let mut survivors: Vec<Survivor> = self
            .live
            .values()
            .filter_map(|e| {
                Some(Survivor {
                    address: e.address,
                    size: e.size,
                    kind: e.kind()?,
                    timestamp: e.timestamp,
                    frames: e.frames().to_vec(),
                })
            })
            .collect();
        survivors.sort_by_key(|s| (s.timestamp, s.address));
        survivors
    }

    pub fn leaks(&self) -> LeakProfile {
        let mut profile = LeakProfile::new();
        for event in self.live.values() {
            profile.record(event.frames(), event.size as usize);
        }
        profile
    }
}

impl Display for Tracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        writeln!(f, "{:<12} {:>14} {:>18}", "entry point", "events", "bytes")?;
        for kind in EventKind::ALL {
            let totals = self.totals(kind);
            if totals.events == 0 {
                continue;
            }
            writeln!(
                f,
                "{:<12} {:>14} {:>17}B",
                kind.entry_point(),
                totals.events.to_formatted_string(&Locale::en),
                totals.bytes.to_formatted_string(&Locale::en)
            )?;
        }
        writeln!(
            f,
            "live: {} allocations, {}B",
            self.live_count().to_formatted_string(&Locale::en),
            self.live_bytes().to_formatted_string(&Locale::en)
        )?;
        writeln!(f, "releases without allocation: {}", self.unmatched)?;
        writeln!(f, "mismatched releases: {}", self.mismatched)?;
        if self.replaced > 0 {
            writeln!(f, "allocations whose release was lost: {}", self.replaced)?;
        }
        if self.unknown > 0 {
            writeln!(f, "records of unknown kind: {}", self.unknown)?;
        }
        match self.mean_lifetime() {
            Some(mean) => write!(f, "mean lifetime: {:?}", mean)?,
            None => f.write_str("mean lifetime: n/a")?,
        }
        if self.overflowed {
            f.write_str("\nWARNING: the ring overflowed; some events were lost")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(address: u64, size: u32, kind: EventKind, timestamp: u64, frames: &[u64]) -> Event {
        Event::new(address, size, kind, timestamp, frames, frames.len())
    }

    #[test]
    fn releases_pair_with_allocations() {
        let mut tracker = Tracker::new();
        let outcome = tracker.observe(&event(0x10, 48, EventKind::ConstructArray, 1_000, &[1]));
        assert_eq!(outcome, Outcome::Allocated { replaced: false });
        let outcome = tracker.observe(&event(0x10, 0, EventKind::DestroyArray, 3_000, &[2]));
        assert_eq!(
            outcome,
            Outcome::Released {
                allocated_by: EventKind::ConstructArray,
                lifetime: Duration::from_nanos(2_000),
                mismatched: false,
            }
        );
        assert_eq!(tracker.live_count(), 0);
        assert_eq!(tracker.mean_lifetime(), Some(Duration::from_nanos(2_000)));
        assert_eq!(tracker.totals(EventKind::ConstructArray).bytes, 48);
    }

    #[test]
    fn wrong_release_is_a_mismatch() {
        let mut tracker = Tracker::new();
        tracker.observe(&event(0x10, 8, EventKind::ConstructArray, 0, &[]));
        let outcome = tracker.observe(&event(0x10, 0, EventKind::Deallocate, 5, &[]));
        assert!(matches!(outcome, Outcome::Released { mismatched: true, .. }));
        assert_eq!(tracker.mismatched(), 1);
    }

    #[test]
    fn unmatched_release_and_lost_release() {
        let mut tracker = Tracker::new();
        assert_eq!(
            tracker.observe(&event(0x20, 0, EventKind::Deallocate, 0, &[])),
            Outcome::Unmatched
        );
        tracker.observe(&event(0x30, 8, EventKind::Allocate, 0, &[]));
        assert_eq!(
            tracker.observe(&event(0x30, 16, EventKind::Allocate, 1, &[])),
            Outcome::Allocated { replaced: true }
        );
        assert_eq!(tracker.unmatched(), 1);
        assert_eq!(tracker.live_bytes(), 16);
        assert_eq!(tracker.mean_lifetime(), None);
    }

    #[test]
    fn survivors_are_ordered_by_time() {
        let mut tracker = Tracker::new();
        tracker.observe(&event(0x50, 1, EventKind::Allocate, 20, &[7]));
        tracker.observe(&event(0x40, 2, EventKind::ConstructObject, 10, &[8, 9]));
        let survivors = tracker.survivors();
        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors[0].address, 0x40);
        assert_eq!(survivors[0].frames, vec![8, 9]);
        assert_eq!(survivors[1].kind, EventKind::Allocate);
    }

    #[test]
    fn summary_mentions_overflow() {
        let mut tracker = Tracker::new();
        tracker.observe(&event(0x10, 1_500, EventKind::Allocate, 0, &[]));
        assert!(!tracker.to_string().contains("WARNING"));
        tracker.note_overflow();
        let text = tracker.to_string();
        assert!(text.contains("1,500B"));
        assert!(text.contains("WARNING"));
    }

    #[test]
    fn leak_tree_rolls_up_common_frames() {
        let mut profile = LeakProfile::new();
        profile.record(&[0xa, 0xb, 0xc], 10);
        profile.record(&[0xa, 0xb, 0xd], 20);
        profile.record(&[0xa, 0xe], 30);
        profile.record(&[], 5);
        assert_eq!(profile.allocations(), 4);

        let text = profile.to_string();
        assert!(text.contains("3 live, 60B: 0xa"));
        assert!(text.contains("2 live, 30B: 0xb"));
        assert!(text.contains("1 live, 5B: <no frames>"));
    }

    #[test]
    fn threshold_folds_small_sites() {
        let mut profile = LeakProfile::new();
        for _ in 0..99 {
            profile.record(&[0x1, 0x2], 8);
        }
        profile.record(&[0x3], 8);
        let mut text = String::new();
        profile.fmt_with_threshold(5.0, &mut text).unwrap();
        assert!(text.contains("99 live, 792B: 0x1"));
        assert!(!text.contains(": 0x3"));
        assert!(text.contains("1 live in places below the threshold (5%)"));
    }

    #[test]
    fn empty_profile() {
        assert_eq!(LeakProfile::new().to_string(), "no surviving allocations");
    }
}
