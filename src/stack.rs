//! Bounded call-stack capture.
//!
//! Two strategies with the same contract: fill a caller-provided buffer with up to `len` return
//! addresses, most recent first, after discarding `skip` leading frames, and report how many were
//! written.  Neither symbolizes nor blocks.  The strategy used by the hooks is fixed at build time
//! through the `frame-pointers` feature.

use std::{cell::Cell, mem};

/// Frame capacity of an [`Event`](crate::Event).
pub const MAX_FRAMES: usize = 20;

pub trait StackCapture {
    /// Writes up to `frames.len()` return addresses into `frames` and returns the count.
    fn capture(&self, frames: &mut [u64], skip: usize) -> usize;
}

/// Uses the platform unwinder (`_Unwind_Backtrace` on Linux) through the `backtrace` crate.
///
/// The unwinder may allocate the first time it touches a module's unwind tables.  Callers must
/// make sure such allocations cannot re-enter the hooks; see [`crate::hook`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PlatformUnwinder;

impl StackCapture for PlatformUnwinder {
    #[inline(never)]
    fn capture(&self, frames: &mut [u64], skip: usize) -> usize {
        let mut seen = 0;
        let mut count = 0;
        if frames.is_empty() {
            return 0;
        }
        // The hooks guarantee that no other capture runs on this thread concurrently, and the
        // unwinder itself is thread-safe, so the crate-level lock is unnecessary.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if seen >= skip {
                    frames[count] = frame.ip() as u64;
                    count += 1;
                }
                seen += 1;
                count < frames.len()
            });
        }
        count
    }
}

/// Follows the chain of saved frame pointers.
///
/// Only correct for code compiled with frame pointers.  Every candidate frame is checked against
/// the current thread's stack before it is read, so a broken chain truncates the result instead
/// of faulting.
#[derive(Clone, Copy, Debug, Default)]
pub struct FramePointerWalker;

impl StackCapture for FramePointerWalker {
    #[inline(never)]
    fn capture(&self, frames: &mut [u64], skip: usize) -> usize {
        let fp = frame_address();
        let bounds = match StackBounds::current() {
            // Frames of our callers live above our own.
            Some(bounds) => StackBounds {
                low: bounds.low.max(fp),
                high: bounds.high,
            },
            None => StackBounds {
                low: fp,
                high: fp.saturating_add(FALLBACK_STACK_SPAN),
            },
        };
        unsafe { walk(fp, bounds, frames, skip) }
    }
}

#[cfg(feature = "frame-pointers")]
pub type DefaultCapture = FramePointerWalker;
#[cfg(not(feature = "frame-pointers"))]
pub type DefaultCapture = PlatformUnwinder;

// Used when the thread's stack extent cannot be queried.
const FALLBACK_STACK_SPAN: usize = 1 << 20;

/// Half-open address range `[low, high)` that may hold frame records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackBounds {
    pub low: usize,
    pub high: usize,
}

thread_local! {
    static THREAD_STACK: Cell<Option<StackBounds>> = const { Cell::new(None) };
}

impl StackBounds {
    /// Extent of the calling thread's stack, queried once per thread.
    pub fn current() -> Option<StackBounds> {
        THREAD_STACK
            .try_with(|cached| {
                if cached.get().is_none() {
                    cached.set(Self::query());
                }
                cached.get()
            })
            .ok()
            .flatten()
    }

    #[cfg(target_os = "linux")]
    fn query() -> Option<StackBounds> {
        unsafe {
            let mut attr: libc::pthread_attr_t = mem::zeroed();
            if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
                return None;
            }
            let mut addr = std::ptr::null_mut();
            let mut size = 0;
            let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 || addr.is_null() {
                return None;
            }
            let low = addr as usize;
            Some(StackBounds {
                low,
                high: low.saturating_add(size),
            })
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn query() -> Option<StackBounds> {
        None
    }

    // A frame record is two words: saved frame pointer, then return address.
    fn holds_record(&self, fp: usize) -> bool {
        fp != 0
            && fp % mem::align_of::<usize>() == 0
            && fp >= self.low
            && fp
                .checked_add(2 * mem::size_of::<usize>())
                .map_or(false, |end| end <= self.high)
    }
}

/// Walks frame records starting at `fp`.  Stops at the first record outside `bounds`, at a null
/// return address, or when the chain does not move towards the stack base.
///
/// # Safety
///
/// All memory inside `bounds` must be readable.
pub unsafe fn walk(mut fp: usize, bounds: StackBounds, frames: &mut [u64], skip: usize) -> usize {
    let mut seen = 0;
    let mut count = 0;
    while count < frames.len() && bounds.holds_record(fp) {
        let record = fp as *const usize;
        let next = record.read();
        let ret = record.add(1).read();
        if ret == 0 {
            break;
        }
        if seen >= skip {
            frames[count] = ret as u64;
            count += 1;
        }
        seen += 1;
        if next <= fp {
            break;
        }
        fp = next;
    }
    count
}

#[inline(always)]
fn frame_address() -> usize {
    let fp: usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        std::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        fp = 0;
    }
    fp
}
