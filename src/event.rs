//! Fixed-layout allocation events exchanged through the shared ring.
//!
//! An [`Event`] is plain old data: every bit pattern is a valid value, so a consumer can copy
//! records straight out of a region that another process writes to.  The operation kind is kept
//! as its raw enumerator and decoded on access.

use std::{fmt, mem, str::FromStr};

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

use crate::stack::MAX_FRAMES;

/// The operation that produced an event.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// `malloc`
    Allocate = 0,
    /// `operator new(size_t)`
    ConstructObject = 1,
    /// `operator new[](size_t)`
    ConstructArray = 2,
    /// `operator new(size_t, const std::nothrow_t&)`
    ConstructObjectNoFail = 3,
    /// `free`
    Deallocate = 4,
    /// `operator delete(void*)`
    DestroyObject = 5,
    /// `operator delete[](void*)`
    DestroyArray = 6,
    /// `operator delete(void*, const std::nothrow_t&)`
    DestroyObjectNoFail = 7,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Allocate,
        EventKind::ConstructObject,
        EventKind::ConstructArray,
        EventKind::ConstructObjectNoFail,
        EventKind::Deallocate,
        EventKind::DestroyObject,
        EventKind::DestroyArray,
        EventKind::DestroyObjectNoFail,
    ];

    pub fn from_raw(raw: u32) -> Option<EventKind> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn is_allocation(self) -> bool {
        (self as u32) < 4
    }

    /// Whether memory obtained with `self` may legally be released with `release`.
    pub fn released_by(self, release: EventKind) -> bool {
        use EventKind::*;
        matches!(
            (self, release),
            (Allocate, Deallocate)
                | (ConstructObject, DestroyObject)
                | (ConstructObject, DestroyObjectNoFail)
                | (ConstructObjectNoFail, DestroyObject)
                | (ConstructObjectNoFail, DestroyObjectNoFail)
                | (ConstructArray, DestroyArray)
        )
    }

    /// Name of the intercepted entry point, as the application sees it.
    pub fn entry_point(self) -> &'static str {
        match self {
            EventKind::Allocate => "malloc",
            EventKind::ConstructObject => "new",
            EventKind::ConstructArray => "new[]",
            EventKind::ConstructObjectNoFail => "new(nothrow)",
            EventKind::Deallocate => "free",
            EventKind::DestroyObject => "delete",
            EventKind::DestroyArray => "delete[]",
            EventKind::DestroyObjectNoFail => "delete(nothrow)",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim() {
            "allocate" | "malloc" => EventKind::Allocate,
            "construct_object" | "new" => EventKind::ConstructObject,
            "construct_array" | "new[]" => EventKind::ConstructArray,
            "construct_object_no_fail" | "new(nothrow)" => EventKind::ConstructObjectNoFail,
            "deallocate" | "free" => EventKind::Deallocate,
            "destroy_object" | "delete" => EventKind::DestroyObject,
            "destroy_array" | "delete[]" => EventKind::DestroyArray,
            "destroy_object_no_fail" | "delete(nothrow)" => EventKind::DestroyObjectNoFail,
            other => return Err(format!("unknown event kind `{}`", other)),
        };
        Ok(kind)
    }
}

/// One intercepted allocator call.
///
/// Layout (little-endian on the supported targets):
///
/// | offset | field       | type              |
/// |--------|-------------|-------------------|
/// | 0      | address     | u64               |
/// | 8      | timestamp   | u64               |
/// | 16     | size        | u32               |
/// | 20     | frame count | u32               |
/// | 24     | kind        | u32               |
/// | 28     | stamp       | u32               |
/// | 32     | frames      | u64 x `MAX_FRAMES`|
///
/// The stamp belongs to the ring: it marks the slot holding the record as committed.  Records
/// built here carry zero.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Event {
    pub address: u64,
    pub timestamp: u64,
    pub size: u32,
    frame_count: u32,
    kind: u32,
    stamp: u32,
    frames: [u64; MAX_FRAMES],
}

const_assert_eq!(mem::size_of::<Event>(), 32 + 8 * MAX_FRAMES);
const_assert_eq!(mem::align_of::<Event>(), 8);

/// Byte offset of the commit stamp inside a record.
pub(crate) const STAMP_OFFSET: usize = mem::offset_of!(Event, stamp);

const_assert_eq!(STAMP_OFFSET, 28);

impl Event {
    /// Copies the inputs into the fixed layout.  `stack[..count]` are the captured frames,
    /// most recent first; `count` is clamped to the frame capacity and the rest is zeroed.
    pub fn new(
        address: u64,
        size: u32,
        kind: EventKind,
        timestamp: u64,
        stack: &[u64],
        count: usize,
    ) -> Event {
        let count = count.min(MAX_FRAMES).min(stack.len());
        let mut frames = [0; MAX_FRAMES];
        frames[..count].copy_from_slice(&stack[..count]);
        Event {
            address,
            timestamp,
            size,
            frame_count: count as u32,
            kind: kind as u32,
            stamp: 0,
            frames,
        }
    }

    /// `None` when the record carries an enumerator this build does not know.
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_raw(self.kind)
    }

    /// The valid frames only.
    pub fn frames(&self) -> &[u64] {
        let count = (self.frame_count as usize).min(MAX_FRAMES);
        &self.frames[..count]
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Event) -> bool {
        self.address == other.address
            && self.timestamp == other.timestamp
            && self.size == other.size
            && self.kind == other.kind
            && self.frames() == other.frames()
    }
}

impl Eq for Event {}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frames: Vec<String> = self.frames().iter().map(|ip| format!("{:#x}", ip)).collect();
        f.debug_struct("Event")
            .field("address", &format_args!("{:#x}", self.address))
            .field("timestamp", &self.timestamp)
            .field("size", &self.size)
            .field("kind", &self.kind())
            .field("frames", &frames)
            .finish()
    }
}

/// Requested sizes are recorded in 32 bits.
pub fn record_size(size: usize) -> u32 {
    u32::try_from(size).unwrap_or(u32::MAX)
}

/// Monotonic nanoseconds from the cheapest clock the platform offers.
pub fn timestamp() -> u64 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC_COARSE;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

    // Cannot fail for a valid clock id and pointer.
    let ts = unsafe {
        let mut ts: libc::timespec = mem::zeroed();
        libc::clock_gettime(CLOCK, &mut ts);
        ts
    };
    (ts.tv_sec as u64)
        .wrapping_mul(1_000_000_000)
        .wrapping_add(ts.tv_nsec as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_copies_inputs() {
        let stack = [0x10, 0x20, 0x30];
        let e = Event::new(0xdead, 48, EventKind::ConstructArray, 7, &stack, 2);
        assert_eq!(e.address, 0xdead);
        assert_eq!(e.size, 48);
        assert_eq!(e.timestamp, 7);
        assert_eq!(e.kind(), Some(EventKind::ConstructArray));
        assert_eq!(e.frames(), &[0x10, 0x20]);
    }

    #[test]
    fn frame_count_is_clamped() {
        let stack = [1u64; MAX_FRAMES + 5];
        let e = Event::new(1, 1, EventKind::Allocate, 0, &stack, stack.len());
        assert_eq!(e.frames().len(), MAX_FRAMES);

        let e = Event::new(1, 1, EventKind::Allocate, 0, &stack[..3], 10);
        assert_eq!(e.frames().len(), 3);
    }

    #[test]
    fn equality_ignores_frames_past_count() {
        let a = Event::new(1, 2, EventKind::Deallocate, 3, &[4, 5], 1);
        let mut b = a;
        b.frames[1] = 99;
        assert_eq!(a, b);
        b.frames[0] = 99;
        assert_ne!(a, b);
    }

    #[test]
    fn unknown_kind_decodes_to_none() {
        let mut e = Event::new(1, 2, EventKind::Allocate, 3, &[], 0);
        e.kind = 42;
        assert_eq!(e.kind(), None);
    }

    #[test]
    fn pairing_rules() {
        assert!(EventKind::ConstructArray.released_by(EventKind::DestroyArray));
        assert!(!EventKind::ConstructArray.released_by(EventKind::DestroyObject));
        assert!(!EventKind::Allocate.released_by(EventKind::DestroyObject));
        assert!(EventKind::ConstructObjectNoFail.released_by(EventKind::DestroyObject));
    }

    #[test]
    fn kind_names_parse() {
        assert_eq!("new[]".parse::<EventKind>(), Ok(EventKind::ConstructArray));
        assert_eq!("destroy_object".parse::<EventKind>(), Ok(EventKind::DestroyObject));
        assert!("realloc".parse::<EventKind>().is_err());
    }

    #[test]
    fn size_saturates() {
        assert_eq!(record_size(48), 48);
        assert_eq!(record_size(usize::MAX), u32::MAX);
    }

    #[test]
    fn timestamps_do_not_go_backwards() {
        let a = timestamp();
        let b = timestamp();
        assert!(b >= a);
    }
}
