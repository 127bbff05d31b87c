//! Lock-free multi-producer ring of [`Event`]s living in shared memory.
//!
//! Region layout:
//!
//! ```text
//! offset 0   capacity   u32   number of event slots, a power of two
//! offset 4   head       u32   next record a consumer reads
//! offset 8   tail       u32   next slot a producer reserves
//! offset 12  overflow   u32   1 once any write was dropped, never cleared by producers
//! offset 16  Event[capacity]
//! ```
//!
//! `head` and `tail` are free-running counters; the slot of a counter is the counter modulo
//! `capacity`.  `tail - head` is the number of reserved, unread slots, so all `capacity` slots are
//! usable.  A write that would overwrite an unread record is dropped and raises the sticky
//! overflow flag.
//!
//! A producer reserves a slot with a single compare-and-advance of the shared `tail`, copies the
//! record and then commits it by storing `counter + 1` into the slot's stamp word with release
//! semantics.  The reader takes the record at `head` only once that stamp is visible, so it never
//! sees a partial copy, and no producer ever waits for another.  All reservation state lives in
//! the region, which keeps a handle usable from both sides of a `fork`.

use std::{
    ffi::CString,
    fs::File,
    io, mem,
    os::unix::io::FromRawFd,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, Ordering},
};

use log::debug;
use static_assertions::const_assert_eq;

use crate::{
    error::TransportError,
    event::{Event, STAMP_OFFSET},
};

pub const HEADER_SIZE: usize = 16;
pub const SLOT_SIZE: usize = mem::size_of::<Event>();

#[repr(C)]
struct Header {
    capacity: AtomicU32,
    head: AtomicU32,
    tail: AtomicU32,
    overflow: AtomicU32,
}

const_assert_eq!(mem::size_of::<Header>(), HEADER_SIZE);
const_assert_eq!(HEADER_SIZE % mem::align_of::<Event>(), 0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteResult {
    Written,
    Dropped,
}

/// Attachment to a ring region.  Dropping it unmaps the region without destroying it.
pub struct Ring {
    base: NonNull<u8>,
    map_len: usize,
    capacity: u32,
    mask: u32,
    name: Option<String>,
}

// All shared state is accessed through atomics or through slots owned by a reservation.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Attaches to the region `name` as its producer, creating it when absent.  Either way the
    /// region starts out empty with the overflow flag clear: records left behind by an earlier
    /// producer are discarded.
    pub fn open_or_create(name: &str, capacity: u32) -> Result<Ring, TransportError> {
        let cname = shm_name(name)?;
        let len = region_len(capacity)?;
        let (file, created) = shm_open_or_create(&cname, name)?;
        let size = file_size(&file, name)?;

        let ring = if created || size == 0 {
            file.set_len(len as u64)
                .map_err(|source| TransportError::Resize {
                    name: name.to_string(),
                    len,
                    source,
                })?;
            debug!("created ring {} with {} slots", name, capacity);
            Self::map(&file, name, len)?.with_capacity(capacity)
        } else {
            if size < HEADER_SIZE {
                return Err(TransportError::Truncated {
                    name: name.to_string(),
                    actual: size,
                    expected: len,
                });
            }
            let ring = Self::map(&file, name, size)?;
            let existing = ring.stored_capacity();
            if existing != capacity {
                return Err(TransportError::CapacityMismatch {
                    name: name.to_string(),
                    existing,
                    requested: capacity,
                });
            }
            if size < len {
                return Err(TransportError::Truncated {
                    name: name.to_string(),
                    actual: size,
                    expected: len,
                });
            }
            debug!("reusing ring {} with {} slots", name, capacity);
            ring.with_capacity(capacity)
        };
        ring.reset(0);
        Ok(ring.named(name))
    }

    /// Attaches to an existing region as a consumer.  The capacity comes from the header.
    pub fn open(name: &str) -> Result<Ring, TransportError> {
        let cname = shm_name(name)?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(TransportError::Open {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        let file = unsafe { File::from_raw_fd(fd) };
        let size = file_size(&file, name)?;
        if size < HEADER_SIZE {
            return Err(TransportError::Truncated {
                name: name.to_string(),
                actual: size,
                expected: HEADER_SIZE,
            });
        }
        let ring = Self::map(&file, name, size)?;
        let capacity = ring.stored_capacity();
        let expected = region_len(capacity)?;
        if size < expected {
            return Err(TransportError::Truncated {
                name: name.to_string(),
                actual: size,
                expected,
            });
        }
        Ok(ring.with_capacity(capacity).named(name))
    }

    /// A zeroed region shared with children forked after this call but with no name.
    pub fn anonymous(capacity: u32) -> Result<Ring, TransportError> {
        let len = region_len(capacity)?;
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        let ring = Self::from_mapping(addr, len, "<anonymous>")?.with_capacity(capacity);
        ring.reset(0);
        Ok(ring)
    }

    /// Removes the name of a region.  Attached handles stay valid.
    pub fn unlink(name: &str) -> Result<(), TransportError> {
        let cname = shm_name(name)?;
        if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
            return Err(TransportError::Open {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Appends `event` unless that would overwrite an unread record.  Never waits for other
    /// producers.
    pub fn try_write(&self, event: &Event) -> WriteResult {
        let header = self.header();
        let mut tail = header.tail.load(Ordering::Relaxed);
        loop {
            // Acquire pairs with the consumer's release of `head`: the slot is free to reuse.
            let head = header.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= self.capacity {
                // A stale tail can trail a head that has moved on in the meantime.
                let current = header.tail.load(Ordering::Relaxed);
                if current != tail {
                    tail = current;
                    continue;
                }
                header.overflow.store(1, Ordering::Relaxed);
                return WriteResult::Dropped;
            }
            match header.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => tail = current,
            }
        }

        // The stamp is only ever accessed atomically, so the copy goes around it.
        unsafe {
            let src = event as *const Event as *const u8;
            let dst = self.slot(tail) as *mut u8;
            let rest = STAMP_OFFSET + mem::size_of::<u32>();
            ptr::copy_nonoverlapping(src, dst, STAMP_OFFSET);
            ptr::copy_nonoverlapping(src.add(rest), dst.add(rest), SLOT_SIZE - rest);
            self.stamp(tail).store(tail.wrapping_add(1), Ordering::Release);
        }
        WriteResult::Written
    }

    /// Takes the oldest unread record.  `None` when the ring is empty or the oldest reservation
    /// is still being written.  Single consumer per region.
    pub fn read(&self) -> Option<Event> {
        let header = self.header();
        let head = header.head.load(Ordering::Relaxed);
        if head == header.tail.load(Ordering::Relaxed) {
            return None;
        }
        if unsafe { self.stamp(head) }.load(Ordering::Acquire) != head.wrapping_add(1) {
            return None;
        }
        let event = unsafe { self.slot(head).read() };
        // Hand the slot back to producers only after the copy.
        header.head.store(head.wrapping_add(1), Ordering::Release);
        Some(event)
    }

    /// Whether any write was dropped since the region was created or last reset.
    pub fn overflow(&self) -> bool {
        self.header().overflow.load(Ordering::Relaxed) != 0
    }

    /// Clears the overflow flag.  Meant for consumers; producers only ever set it.
    pub fn reset_overflow(&self) {
        self.header().overflow.store(0, Ordering::Relaxed);
    }

    /// Unread records, counting reservations whose copy is still in progress.
    pub fn len(&self) -> usize {
        let header = self.header();
        let tail = header.tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head).min(self.capacity) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn map(file: &File, name: &str, len: usize) -> Result<Ring, TransportError> {
        use std::os::unix::io::AsRawFd;

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        Self::from_mapping(addr, len, name)
    }

    fn from_mapping(addr: *mut libc::c_void, len: usize, name: &str) -> Result<Ring, TransportError> {
        if addr == libc::MAP_FAILED {
            return Err(TransportError::Map {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        let base = NonNull::new(addr as *mut u8).ok_or_else(|| TransportError::Map {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::Other, "null mapping"),
        })?;
        // Until the capacity is known the handle may only touch the header.
        Ok(Ring {
            base,
            map_len: len,
            capacity: 0,
            mask: 0,
            name: None,
        })
    }

    // Empties the ring with both counters at `start`.  Every stamp is set to what the previous
    // lap would have left, so no slot looks committed before it is written again.
    fn reset(&self, start: u32) {
        let header = self.header();
        for counter in (0..self.capacity).map(|i| start.wrapping_add(i)) {
            let stale = counter.wrapping_sub(self.capacity).wrapping_add(1);
            unsafe { self.stamp(counter) }.store(stale, Ordering::Relaxed);
        }
        header.head.store(start, Ordering::Relaxed);
        header.tail.store(start, Ordering::Relaxed);
        header.overflow.store(0, Ordering::Relaxed);
        header.capacity.store(self.capacity, Ordering::Release);
    }

    fn with_capacity(mut self, capacity: u32) -> Ring {
        self.capacity = capacity;
        self.mask = capacity - 1;
        self
    }

    fn named(mut self, name: &str) -> Ring {
        self.name = Some(name.to_string());
        self
    }

    fn stored_capacity(&self) -> u32 {
        self.header().capacity.load(Ordering::Acquire)
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.base.as_ptr() as *const Header) }
    }

    // Bounds were established when the handle was built: `map_len >= region_len(capacity)`.
    unsafe fn slot(&self, counter: u32) -> *mut Event {
        let index = (counter & self.mask) as usize;
        self.base.as_ptr().add(HEADER_SIZE + index * SLOT_SIZE) as *mut Event
    }

    // Slots start at 8-byte boundaries and the stamp sits at a 4-byte offset inside them.
    unsafe fn stamp(&self, counter: u32) -> &AtomicU32 {
        &*((self.slot(counter) as *const u8).add(STAMP_OFFSET) as *const AtomicU32)
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.map_len) };
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("overflow", &self.overflow())
            .finish()
    }
}

/// Bytes needed for a region of `capacity` slots.
pub fn region_len(capacity: u32) -> Result<usize, TransportError> {
    if capacity < 2 || !capacity.is_power_of_two() {
        return Err(TransportError::InvalidCapacity(capacity as u64));
    }
    (capacity as usize)
        .checked_mul(SLOT_SIZE)
        .and_then(|data| data.checked_add(HEADER_SIZE))
        .ok_or(TransportError::TooLarge(capacity as u64))
}

/// Largest power-of-two slot count whose region fits in `bytes`, at least 2.
pub fn slots_for_bytes(bytes: u64) -> u32 {
    let slots = bytes.saturating_sub(HEADER_SIZE as u64) / SLOT_SIZE as u64;
    let slots = slots.clamp(2, 1 << 31);
    1 << (63 - slots.leading_zeros())
}

fn shm_name(name: &str) -> Result<CString, TransportError> {
    let valid = name.len() > 1
        && name.len() <= 255
        && name.starts_with('/')
        && !name[1..].contains('/');
    if !valid {
        return Err(TransportError::InvalidName(name.to_string()));
    }
    CString::new(name).map_err(|_| TransportError::InvalidName(name.to_string()))
}

fn shm_open_or_create(cname: &CString, name: &str) -> Result<(File, bool), TransportError> {
    let mode: libc::mode_t = 0o666;
    let fd = unsafe {
        libc::shm_open(
            cname.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            mode,
        )
    };
    if fd >= 0 {
        return Ok((unsafe { File::from_raw_fd(fd) }, true));
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EEXIST) {
        return Err(TransportError::Open {
            name: name.to_string(),
            source: err,
        });
    }
    let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, mode) };
    if fd < 0 {
        return Err(TransportError::Open {
            name: name.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok((unsafe { File::from_raw_fd(fd) }, false))
}

fn file_size(file: &File, name: &str) -> Result<usize, TransportError> {
    file.metadata()
        .map(|m| m.len() as usize)
        .map_err(|source| TransportError::Open {
            name: name.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn event(n: u64) -> Event {
        let frames = [n, n + 1, n + 2];
        Event::new(n, n as u32, EventKind::Allocate, n * 10, &frames, 3)
    }

    fn slot_bytes(ring: &Ring, counter: u32) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(ring.slot(counter) as *const u8, SLOT_SIZE).to_vec() }
    }

    fn unique_name(tag: &str) -> String {
        format!("/mem_hook_test_{}_{}", tag, std::process::id())
    }

    #[test]
    fn round_trip() {
        let ring = Ring::anonymous(8).unwrap();
        assert_eq!(ring.read(), None);
        assert_eq!(ring.try_write(&event(1)), WriteResult::Written);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.read(), Some(event(1)));
        assert_eq!(ring.read(), None);
        assert!(!ring.overflow());
    }

    #[test]
    fn capacity_four_scenario() {
        let ring = Ring::anonymous(4).unwrap();
        for n in 1..=4 {
            assert_eq!(ring.try_write(&event(n)), WriteResult::Written);
        }
        assert_eq!(ring.try_write(&event(5)), WriteResult::Dropped);
        assert!(ring.overflow());
        assert_eq!(ring.read(), Some(event(1)));
        assert_eq!(ring.read(), Some(event(2)));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn full_ring_is_left_untouched() {
        let ring = Ring::anonymous(4).unwrap();
        for n in 0..4 {
            ring.try_write(&event(n));
        }
        let tail = ring.header().tail.load(Ordering::SeqCst);
        let at_head = slot_bytes(&ring, ring.header().head.load(Ordering::SeqCst));
        for n in 100..110 {
            assert_eq!(ring.try_write(&event(n)), WriteResult::Dropped);
        }
        assert_eq!(ring.header().tail.load(Ordering::SeqCst), tail);
        assert_eq!(slot_bytes(&ring, ring.header().head.load(Ordering::SeqCst)), at_head);
        assert!(ring.overflow());
    }

    #[test]
    fn overflow_is_sticky_until_reset() {
        let ring = Ring::anonymous(2).unwrap();
        ring.try_write(&event(1));
        ring.try_write(&event(2));
        ring.try_write(&event(3));
        while ring.read().is_some() {}
        assert_eq!(ring.try_write(&event(4)), WriteResult::Written);
        assert!(ring.overflow());
        ring.reset_overflow();
        assert!(!ring.overflow());
    }

    #[test]
    fn writing_past_capacity_keeps_the_oldest() {
        let ring = Ring::anonymous(8).unwrap();
        for n in 0..9 {
            ring.try_write(&event(n));
        }
        let read: Vec<u64> = std::iter::from_fn(|| ring.read()).map(|e| e.address).collect();
        assert_eq!(read, (0..8).collect::<Vec<_>>());
        assert!(ring.overflow());
    }

    #[test]
    fn counters_wrap_around_u32() {
        let ring = Ring::anonymous(4).unwrap();
        ring.reset(u32::MAX - 2);
        for round in 0..3u64 {
            for n in 0..4 {
                assert_eq!(ring.try_write(&event(round * 10 + n)), WriteResult::Written);
            }
            assert_eq!(ring.try_write(&event(99)), WriteResult::Dropped);
            for n in 0..4 {
                assert_eq!(ring.read().map(|e| e.address), Some(round * 10 + n));
            }
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn unfinished_reservation_holds_back_the_reader_only() {
        let ring = Ring::anonymous(4).unwrap();
        // A producer that reserved slot 0 and has not committed it yet.
        ring.header().tail.fetch_add(1, Ordering::SeqCst);
        assert_eq!(ring.try_write(&event(2)), WriteResult::Written);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.read(), None);

        unsafe {
            ring.slot(0).write(event(1));
            ring.stamp(0).store(1, Ordering::Release);
        }
        assert_eq!(ring.read(), Some(event(1)));
        assert_eq!(ring.read(), Some(event(2)));
        assert_eq!(ring.read(), None);
    }

    #[test]
    fn stamps_from_an_earlier_lap_are_not_committed() {
        let ring = Ring::anonymous(2).unwrap();
        for round in 0..4 {
            assert_eq!(ring.try_write(&event(round)), WriteResult::Written);
            assert_eq!(ring.read(), Some(event(round)));

            // Reserved but not yet committed: the stamp left in the slot is an old one.
            let counter = ring.header().tail.fetch_add(1, Ordering::SeqCst);
            assert_eq!(ring.read(), None);
            unsafe {
                ring.slot(counter).write(event(100 + round));
                ring.stamp(counter).store(counter.wrapping_add(1), Ordering::Release);
            }
            assert_eq!(ring.read(), Some(event(100 + round)));
        }
    }

    #[test]
    fn rejects_bad_capacities() {
        assert!(matches!(Ring::anonymous(0), Err(TransportError::InvalidCapacity(0))));
        assert!(matches!(Ring::anonymous(1), Err(TransportError::InvalidCapacity(1))));
        assert!(matches!(Ring::anonymous(6), Err(TransportError::InvalidCapacity(6))));
    }

    #[test]
    fn rejects_bad_names() {
        for name in ["", "/", "no_slash", "/a/b", "/nul\0"] {
            assert!(
                matches!(Ring::open_or_create(name, 4), Err(TransportError::InvalidName(_))),
                "{:?}",
                name
            );
        }
    }

    #[test]
    fn bytes_to_slots() {
        assert_eq!(slots_for_bytes(0), 2);
        assert_eq!(slots_for_bytes((HEADER_SIZE + 4 * SLOT_SIZE) as u64), 4);
        assert_eq!(slots_for_bytes((HEADER_SIZE + 7 * SLOT_SIZE) as u64), 4);
        assert_eq!(slots_for_bytes(u64::MAX), 1 << 31);
    }

    #[test]
    fn named_region_is_shared_between_handles() {
        let name = unique_name("shared");
        let _ = Ring::unlink(&name);
        let producer = Ring::open_or_create(&name, 16).unwrap();
        let consumer = Ring::open(&name).unwrap();
        assert_eq!(consumer.capacity(), 16);
        assert_eq!(consumer.name(), Some(name.as_str()));

        producer.try_write(&event(7));
        assert_eq!(consumer.read(), Some(event(7)));
        assert!(producer.is_empty());

        // Detaching the producer leaves published records readable.
        producer.try_write(&event(8));
        drop(producer);
        assert_eq!(consumer.read(), Some(event(8)));
        Ring::unlink(&name).unwrap();
    }

    #[test]
    fn fresh_named_region_accepts_writes() {
        let name = unique_name("fresh");
        let _ = Ring::unlink(&name);
        let producer = Ring::open_or_create(&name, 16).unwrap();
        assert_eq!(producer.capacity(), 16);
        assert_eq!(producer.try_write(&event(3)), WriteResult::Written);
        assert!(!producer.overflow());
        assert_eq!(Ring::open(&name).unwrap().read(), Some(event(3)));
        Ring::unlink(&name).unwrap();
    }

    #[test]
    fn new_producer_starts_from_a_clean_region() {
        let name = unique_name("reuse");
        let _ = Ring::unlink(&name);
        let first = Ring::open_or_create(&name, 2).unwrap();
        for n in 0..3 {
            first.try_write(&event(n));
        }
        assert!(first.overflow());
        drop(first);

        let second = Ring::open_or_create(&name, 2).unwrap();
        let consumer = Ring::open(&name).unwrap();
        assert!(!consumer.overflow());
        assert!(consumer.is_empty());
        assert_eq!(consumer.read(), None);
        assert_eq!(second.try_write(&event(9)), WriteResult::Written);
        assert_eq!(consumer.read(), Some(event(9)));
        Ring::unlink(&name).unwrap();
    }

    #[test]
    fn reattaching_checks_capacity() {
        let name = unique_name("mismatch");
        let _ = Ring::unlink(&name);
        let _first = Ring::open_or_create(&name, 8).unwrap();
        assert!(Ring::open_or_create(&name, 8).is_ok());
        assert!(matches!(
            Ring::open_or_create(&name, 16),
            Err(TransportError::CapacityMismatch {
                existing: 8,
                requested: 16,
                ..
            })
        ));
        Ring::unlink(&name).unwrap();
    }

    #[test]
    fn opening_a_missing_region_fails() {
        let name = unique_name("missing");
        let _ = Ring::unlink(&name);
        assert!(matches!(Ring::open(&name), Err(TransportError::Open { .. })));
    }
}
