//! Static bump arena that serves allocations made while the real allocator is being resolved.
//!
//! `dlsym` may call `malloc` before it has found the `malloc` to forward to.  Those requests are
//! carved out of a fixed static block that is never returned to the real allocator; its address
//! range is registered as owned by the layer so that later frees into it are dropped silently.

use std::{
    cell::UnsafeCell,
    ops::Range,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use libc::c_void;

// Strictest alignment `malloc` guarantees on the supported targets.
const ALIGN: usize = 16;

pub const BOOTSTRAP_ARENA_SIZE: usize = 256 * 1024;

#[repr(C, align(16))]
struct Block<const N: usize>(UnsafeCell<[u8; N]>);

pub struct BootstrapArena<const N: usize> {
    block: Block<N>,
    next: AtomicUsize,
}

// Disjoint chunks are handed out through the atomic cursor.
unsafe impl<const N: usize> Sync for BootstrapArena<N> {}

impl<const N: usize> BootstrapArena<N> {
    pub const fn new() -> Self {
        BootstrapArena {
            block: Block(UnsafeCell::new([0; N])),
            next: AtomicUsize::new(0),
        }
    }

    /// Returns `size` bytes aligned to 16, or null once the arena is exhausted.  Memory is never
    /// reused.
    pub fn allocate(&self, size: usize) -> *mut c_void {
        let size = match size.max(1).checked_add(ALIGN - 1) {
            Some(padded) => padded & !(ALIGN - 1),
            None => return ptr::null_mut(),
        };
        let mut offset = self.next.load(Ordering::Relaxed);
        loop {
            let end = match offset.checked_add(size) {
                Some(end) if end <= N => end,
                _ => return ptr::null_mut(),
            };
            match self
                .next
                .compare_exchange_weak(offset, end, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return unsafe { self.base().add(offset) as *mut c_void },
                Err(current) => offset = current,
            }
        }
    }

    pub fn range(&self) -> Range<usize> {
        let start = self.base() as usize;
        start..start + N
    }

    pub fn contains(&self, ptr: *const c_void) -> bool {
        self.range().contains(&(ptr as usize))
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    fn base(&self) -> *mut u8 {
        self.block.0.get() as *mut u8
    }
}

impl<const N: usize> Default for BootstrapArena<N> {
    fn default() -> Self {
        Self::new()
    }
}

pub static ARENA: BootstrapArena<BOOTSTRAP_ARENA_SIZE> = BootstrapArena::new();
