//! Interposition layer: drop-in replacements for the allocator entry points.
//!
//! Every replacement calls the real implementation (before recording for allocations, after
//! recording for deallocations), captures the stack, and appends an [`Event`] to the ring.  The
//! caller gets exactly what the real entry point returned; a full ring or a short stack never
//! becomes visible to it.
//!
//! Recursion is cut two ways.  A thread-local flag marks the body of an intercepted call, and any
//! allocator call made while it is set (by the unwinder, by `operator new` calling `malloc`, by
//! our own bookkeeping) goes straight to the real entry point unrecorded.  Memory the layer
//! serves itself lives in [`OwnedRanges`] and is never recorded nor handed to the real allocator.

use std::{
    cell::Cell,
    hint, ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
    thread,
};

use libc::{c_void, size_t};
use once_cell::sync::OnceCell;

use crate::{
    arena::ARENA,
    bootstrap::{self, NextInChain},
    event::{record_size, timestamp, Event, EventKind},
    filter::{KindSet, OwnedRanges, SizeFilter},
    ring::{Ring, WriteResult},
    stack::{DefaultCapture, StackCapture, MAX_FRAMES},
};

pub type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
// `operator new` reports failure by throwing, so the exception must be able to cross our frames.
pub type NewFn = unsafe extern "C-unwind" fn(size_t) -> *mut c_void;
pub type NewNoThrowFn = unsafe extern "C" fn(size_t, *const c_void) -> *mut c_void;
pub type DeleteFn = unsafe extern "C" fn(*mut c_void);
pub type DeleteNoThrowFn = unsafe extern "C" fn(*mut c_void, *const c_void);

/// The real implementations, one per intercepted operation.
#[derive(Clone, Copy)]
pub struct EntryPoints {
    pub malloc: MallocFn,
    pub free: FreeFn,
    pub new: NewFn,
    pub new_array: NewFn,
    pub new_nothrow: NewNoThrowFn,
    pub delete: DeleteFn,
    pub delete_array: DeleteFn,
    pub delete_nothrow: DeleteNoThrowFn,
}

thread_local! {
    // Set while this thread runs the body of an intercepted call.
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a hook until dropped, including during unwinding.
pub(crate) struct HookGuard(());

impl HookGuard {
    /// `None` when the thread is already inside a hook.
    pub(crate) fn enter() -> Option<HookGuard> {
        match IN_HOOK.try_with(|flag| flag.replace(true)) {
            Ok(false) => Some(HookGuard(())),
            _ => None,
        }
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        let _ = IN_HOOK.try_with(|flag| flag.set(false));
    }
}

/// Attachment of the interposer to its ring that can be severed while other threads write.
pub struct Transport {
    ring: AtomicPtr<Ring>,
    writers: AtomicUsize,
}

impl Transport {
    pub fn new(ring: Ring) -> Self {
        Transport {
            ring: AtomicPtr::new(Box::into_raw(Box::new(ring))),
            writers: AtomicUsize::new(0),
        }
    }

    /// `None` once detached.
    pub fn write(&self, event: &Event) -> Option<WriteResult> {
        self.writers.fetch_add(1, Ordering::SeqCst);
        let ring = self.ring.load(Ordering::SeqCst);
        let result = unsafe { ring.as_ref() }.map(|ring| ring.try_write(event));
        self.writers.fetch_sub(1, Ordering::Release);
        result
    }

    pub fn is_attached(&self) -> bool {
        !self.ring.load(Ordering::Acquire).is_null()
    }

    /// Stops all further writes and hands the ring back once in-flight writes have finished.
    /// Dropping the returned ring unmaps it; the region itself survives for consumers.
    pub fn detach(&self) -> Option<Box<Ring>> {
        let ring = self.ring.swap(ptr::null_mut(), Ordering::SeqCst);
        if ring.is_null() {
            return None;
        }
        let mut spins = 0u32;
        while self.writers.load(Ordering::SeqCst) != 0 {
            if spins < 64 {
                spins += 1;
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
        Some(unsafe { Box::from_raw(ring) })
    }

    /// Forgets the ring without waiting for writers.  Only valid in a freshly forked child, where
    /// none of the threads counted as writers exist.
    pub(crate) fn abandon(&self) {
        let ring = self.ring.swap(ptr::null_mut(), Ordering::SeqCst);
        self.writers.store(0, Ordering::SeqCst);
        if !ring.is_null() {
            drop(unsafe { Box::from_raw(ring) });
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        drop(self.detach());
    }
}

/// Wraps a set of real entry points and records every call into a ring.
pub struct Interposer<S = DefaultCapture> {
    real: EntryPoints,
    transport: Transport,
    owned: OwnedRanges,
    sizes: SizeFilter,
    kinds: KindSet,
    skip: usize,
    capture: S,
}

impl<S: StackCapture> Interposer<S> {
    pub fn new(real: EntryPoints, ring: Ring, capture: S) -> Self {
        Interposer {
            real,
            transport: Transport::new(ring),
            owned: OwnedRanges::new(),
            sizes: SizeFilter::default(),
            kinds: KindSet::ALL,
            skip: 0,
            capture,
        }
    }

    pub fn with_filters(mut self, sizes: SizeFilter, kinds: KindSet) -> Self {
        self.sizes = sizes;
        self.kinds = kinds;
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn real(&self) -> &EntryPoints {
        &self.real
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn owned_ranges(&self) -> &OwnedRanges {
        &self.owned
    }

    /// `malloc`
    ///
    /// # Safety
    ///
    /// Same contract as the real `malloc`.
    pub unsafe fn allocate(&self, size: size_t) -> *mut c_void {
        let Some(_guard) = HookGuard::enter() else {
            return (self.real.malloc)(size);
        };
        let ptr = (self.real.malloc)(size);
        self.record(ptr, size, EventKind::Allocate);
        ptr
    }

    /// `operator new(size_t)`
    ///
    /// # Safety
    ///
    /// Same contract as the real `operator new`; may unwind with a C++ exception.
    pub unsafe fn construct_object(&self, size: size_t) -> *mut c_void {
        let Some(_guard) = HookGuard::enter() else {
            return (self.real.new)(size);
        };
        let ptr = (self.real.new)(size);
        self.record(ptr, size, EventKind::ConstructObject);
        ptr
    }

    /// `operator new[](size_t)`
    ///
    /// # Safety
    ///
    /// Same contract as the real `operator new[]`; may unwind with a C++ exception.
    pub unsafe fn construct_array(&self, size: size_t) -> *mut c_void {
        let Some(_guard) = HookGuard::enter() else {
            return (self.real.new_array)(size);
        };
        let ptr = (self.real.new_array)(size);
        self.record(ptr, size, EventKind::ConstructArray);
        ptr
    }

    /// `operator new(size_t, const std::nothrow_t&)`
    ///
    /// # Safety
    ///
    /// Same contract as the real nothrow `operator new`.
    pub unsafe fn construct_object_no_fail(&self, size: size_t, tag: *const c_void) -> *mut c_void {
        let Some(_guard) = HookGuard::enter() else {
            return (self.real.new_nothrow)(size, tag);
        };
        let ptr = (self.real.new_nothrow)(size, tag);
        self.record(ptr, size, EventKind::ConstructObjectNoFail);
        ptr
    }

    /// `free`
    ///
    /// # Safety
    ///
    /// Same contract as the real `free`.
    pub unsafe fn deallocate(&self, ptr: *mut c_void) {
        if self.owned.contains(ptr as usize) {
            return;
        }
        let Some(_guard) = HookGuard::enter() else {
            return (self.real.free)(ptr);
        };
        self.record(ptr, 0, EventKind::Deallocate);
        (self.real.free)(ptr)
    }

    /// `operator delete(void*)`
    ///
    /// # Safety
    ///
    /// Same contract as the real `operator delete`.
    pub unsafe fn destroy_object(&self, ptr: *mut c_void) {
        if self.owned.contains(ptr as usize) {
            return;
        }
        let Some(_guard) = HookGuard::enter() else {
            return (self.real.delete)(ptr);
        };
        self.record(ptr, 0, EventKind::DestroyObject);
        (self.real.delete)(ptr)
    }

    /// `operator delete[](void*)`
    ///
    /// # Safety
    ///
    /// Same contract as the real `operator delete[]`.
    pub unsafe fn destroy_array(&self, ptr: *mut c_void) {
        if self.owned.contains(ptr as usize) {
            return;
        }
        let Some(_guard) = HookGuard::enter() else {
            return (self.real.delete_array)(ptr);
        };
        self.record(ptr, 0, EventKind::DestroyArray);
        (self.real.delete_array)(ptr)
    }

    /// `operator delete(void*, const std::nothrow_t&)`
    ///
    /// # Safety
    ///
    /// Same contract as the real nothrow `operator delete`.
    pub unsafe fn destroy_object_no_fail(&self, ptr: *mut c_void, tag: *const c_void) {
        if self.owned.contains(ptr as usize) {
            return;
        }
        let Some(_guard) = HookGuard::enter() else {
            return (self.real.delete_nothrow)(ptr, tag);
        };
        self.record(ptr, 0, EventKind::DestroyObjectNoFail);
        (self.real.delete_nothrow)(ptr, tag)
    }

    fn record(&self, address: *mut c_void, size: usize, kind: EventKind) {
        let address = address as usize;
        if address == 0 || !self.kinds.contains(kind) || self.owned.contains(address) {
            return;
        }
        if kind.is_allocation() && !self.sizes.accepts(size) {
            return;
        }
        let mut frames = [0u64; MAX_FRAMES];
        let count = self.capture.capture(&mut frames, self.skip);
        let event = Event::new(
            address as u64,
            record_size(size),
            kind,
            timestamp(),
            &frames,
            count,
        );
        // Loss is signalled through the ring's overflow flag only.
        let _ = self.transport.write(&event);
    }
}

static HOOK: OnceCell<Interposer> = OnceCell::new();
static REAL: OnceCell<EntryPoints> = OnceCell::new();

pub(crate) fn publish_real(real: EntryPoints) {
    let _ = REAL.set(real);
}

/// The real entry points, resolved by the first call that needs them.  Calls the resolver makes
/// meanwhile find the guard taken and get `None`: only they are served from the arena.
pub(crate) fn real_entry_points() -> Option<&'static EntryPoints> {
    if let Some(real) = REAL.get() {
        return Some(real);
    }
    let _guard = HookGuard::enter()?;
    match bootstrap::resolve_entry_points(&NextInChain, false) {
        Ok(real) => Some(REAL.get_or_init(|| real)),
        Err(err) => bootstrap::abort_bootstrap(&err),
    }
}

// Runs in the child after `fork`.  One process produces into a region, and that is the parent.
pub(crate) unsafe extern "C" fn detach_in_child() {
    if let Some(hook) = HOOK.get() {
        hook.transport().abandon();
    }
}

pub(crate) fn publish_hook(hook: Interposer) -> Result<&'static Interposer, Interposer> {
    HOOK.try_insert(hook).map_err(|(_, rejected)| rejected)
}

/// Process-wide entry points used by the `LD_PRELOAD` library.
///
/// Until the bootstrap has installed the interposer, calls are forwarded without recording.  The
/// first of them resolves the real entry points; only calls made while that resolution runs are
/// served from the static bootstrap arena, so the application itself never sees arena memory.
pub struct MemHook;

impl MemHook {
    pub fn installed() -> Option<&'static Interposer> {
        HOOK.get()
    }

    /// # Safety
    ///
    /// Same contract as `malloc`.
    pub unsafe fn malloc(size: size_t) -> *mut c_void {
        match HOOK.get() {
            Some(hook) => hook.allocate(size),
            None => match real_entry_points() {
                Some(real) => (real.malloc)(size),
                None => ARENA.allocate(size),
            },
        }
    }

    /// # Safety
    ///
    /// Same contract as `free`.
    pub unsafe fn free(ptr: *mut c_void) {
        match HOOK.get() {
            Some(hook) => hook.deallocate(ptr),
            None => Self::early_release(ptr, |real| (real.free)(ptr)),
        }
    }

    /// # Safety
    ///
    /// Same contract as `operator new(size_t)`.
    pub unsafe fn operator_new(size: size_t) -> *mut c_void {
        match HOOK.get() {
            Some(hook) => hook.construct_object(size),
            None => Self::early_new(size, |real| (real.new)(size)),
        }
    }

    /// # Safety
    ///
    /// Same contract as `operator new[](size_t)`.
    pub unsafe fn operator_new_array(size: size_t) -> *mut c_void {
        match HOOK.get() {
            Some(hook) => hook.construct_array(size),
            None => Self::early_new(size, |real| (real.new_array)(size)),
        }
    }

    /// # Safety
    ///
    /// Same contract as `operator new(size_t, const std::nothrow_t&)`.
    pub unsafe fn operator_new_nothrow(size: size_t, tag: *const c_void) -> *mut c_void {
        match HOOK.get() {
            Some(hook) => hook.construct_object_no_fail(size, tag),
            None => match real_entry_points() {
                Some(real) => (real.new_nothrow)(size, tag),
                None => ARENA.allocate(size),
            },
        }
    }

    /// # Safety
    ///
    /// Same contract as `operator delete(void*)`.
    pub unsafe fn operator_delete(ptr: *mut c_void) {
        match HOOK.get() {
            Some(hook) => hook.destroy_object(ptr),
            None => Self::early_release(ptr, |real| (real.delete)(ptr)),
        }
    }

    /// # Safety
    ///
    /// Same contract as `operator delete[](void*)`.
    pub unsafe fn operator_delete_array(ptr: *mut c_void) {
        match HOOK.get() {
            Some(hook) => hook.destroy_array(ptr),
            None => Self::early_release(ptr, |real| (real.delete_array)(ptr)),
        }
    }

    /// # Safety
    ///
    /// Same contract as `operator delete(void*, const std::nothrow_t&)`.
    pub unsafe fn operator_delete_nothrow(ptr: *mut c_void, tag: *const c_void) {
        match HOOK.get() {
            Some(hook) => hook.destroy_object_no_fail(ptr, tag),
            None => Self::early_release(ptr, |real| (real.delete_nothrow)(ptr, tag)),
        }
    }

    unsafe fn early_new<F>(size: size_t, real_new: F) -> *mut c_void
    where
        F: FnOnce(&EntryPoints) -> *mut c_void,
    {
        if let Some(real) = real_entry_points() {
            return real_new(real);
        }
        let ptr = ARENA.allocate(size);
        if ptr.is_null() {
            // Throwing is not an option this early.
            libc::abort();
        }
        ptr
    }

    // Arena memory is never released.  Anything else freed while the resolver runs cannot be
    // released either and is leaked.
    unsafe fn early_release<F>(ptr: *mut c_void, real_release: F)
    where
        F: FnOnce(&EntryPoints),
    {
        if ptr.is_null() || ARENA.contains(ptr) {
            return;
        }
        if let Some(real) = real_entry_points() {
            real_release(real);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FixedStack;

    impl StackCapture for FixedStack {
        fn capture(&self, frames: &mut [u64], _skip: usize) -> usize {
            let stack = [0xa, 0xb, 0xc];
            frames[..3].copy_from_slice(&stack);
            3
        }
    }

    static FREED: AtomicUsize = AtomicUsize::new(0);
    static POOL: [u64; 8] = [0; 8];

    unsafe extern "C" fn sys_malloc(size: size_t) -> *mut c_void {
        libc::malloc(size)
    }
    unsafe extern "C" fn sys_free(ptr: *mut c_void) {
        libc::free(ptr)
    }
    unsafe extern "C-unwind" fn sys_new(size: size_t) -> *mut c_void {
        libc::malloc(size.max(1))
    }
    unsafe extern "C" fn sys_new_nothrow(size: size_t, _tag: *const c_void) -> *mut c_void {
        libc::malloc(size.max(1))
    }
    unsafe extern "C" fn sys_delete_nothrow(ptr: *mut c_void, _tag: *const c_void) {
        libc::free(ptr)
    }
    unsafe extern "C" fn null_malloc(_size: size_t) -> *mut c_void {
        ptr::null_mut()
    }
    unsafe extern "C" fn pool_malloc(_size: size_t) -> *mut c_void {
        POOL.as_ptr() as *mut c_void
    }
    unsafe extern "C" fn counting_free(_ptr: *mut c_void) {
        FREED.fetch_add(1, Ordering::SeqCst);
    }

    fn system() -> EntryPoints {
        EntryPoints {
            malloc: sys_malloc,
            free: sys_free,
            new: sys_new,
            new_array: sys_new,
            new_nothrow: sys_new_nothrow,
            delete: sys_free,
            delete_array: sys_free,
            delete_nothrow: sys_delete_nothrow,
        }
    }

    fn interposer(real: EntryPoints, capacity: u32) -> Interposer<FixedStack> {
        Interposer::new(real, Ring::anonymous(capacity).unwrap(), FixedStack)
    }

    // Drains the ring by detaching it.
    fn drain<S: StackCapture>(hook: &Interposer<S>) -> Vec<Event> {
        let ring = hook.transport().detach().unwrap();
        std::iter::from_fn(|| ring.read()).collect()
    }

    #[test]
    fn array_construction_records_one_event() {
        let hook = interposer(system(), 16);
        let ptr = unsafe { hook.construct_array(48) };
        assert!(!ptr.is_null());
        let events = drain(&hook);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), Some(EventKind::ConstructArray));
        assert_eq!(events[0].size, 48);
        assert_eq!(events[0].address, ptr as u64);
        assert_eq!(events[0].frames(), &[0xa, 0xb, 0xc]);
        unsafe { libc::free(ptr) };
    }

    #[test]
    fn every_operation_records_its_kind() {
        let hook = interposer(system(), 16);
        unsafe {
            let a = hook.allocate(8);
            let b = hook.construct_object(16);
            let c = hook.construct_array(32);
            let d = hook.construct_object_no_fail(64, ptr::null());
            hook.deallocate(a);
            hook.destroy_object(b);
            hook.destroy_array(c);
            hook.destroy_object_no_fail(d, ptr::null());
        }
        let events = drain(&hook);
        let kinds: Vec<_> = events.iter().filter_map(Event::kind).collect();
        assert_eq!(kinds, EventKind::ALL.to_vec());
        let sizes: Vec<_> = events.iter().map(|e| e.size).collect();
        assert_eq!(sizes, vec![8, 16, 32, 64, 0, 0, 0, 0]);
        assert_eq!(events[0].address, events[4].address);
        assert_eq!(events[3].address, events[7].address);
    }

    #[test]
    fn owned_memory_is_neither_recorded_nor_released() {
        let mut real = system();
        real.malloc = pool_malloc;
        real.free = counting_free;
        let hook = interposer(real, 16);
        let start = POOL.as_ptr() as usize;
        assert!(hook.owned_ranges().register(start..start + 64));

        let ptr = unsafe { hook.allocate(24) };
        assert_eq!(ptr as usize, start);
        unsafe { hook.deallocate(ptr) };
        assert_eq!(FREED.load(Ordering::SeqCst), 0);
        assert!(drain(&hook).is_empty());
    }

    #[test]
    fn failed_allocations_and_null_frees_are_not_recorded() {
        let mut real = system();
        real.malloc = null_malloc;
        let hook = interposer(real, 16);
        unsafe {
            assert!(hook.allocate(1 << 20).is_null());
            hook.deallocate(ptr::null_mut());
        }
        assert!(drain(&hook).is_empty());
    }

    #[test]
    fn filters_select_recorded_events() {
        let kinds: KindSet = [EventKind::Allocate].into_iter().collect();
        let hook = interposer(system(), 16).with_filters(SizeFilter::new(vec![0..=32], vec![]), kinds);
        unsafe {
            let small = hook.allocate(16);
            let large = hook.allocate(4096);
            let object = hook.construct_object(8);
            hook.deallocate(small);
            hook.deallocate(large);
            hook.destroy_object(object);
        }
        let events = drain(&hook);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].size, 16);
    }

    #[test]
    fn full_ring_never_fails_the_caller() {
        let hook = interposer(system(), 2);
        let ptrs: Vec<_> = (0..6).map(|_| unsafe { hook.allocate(8) }).collect();
        assert!(ptrs.iter().all(|p| !p.is_null()));
        for p in ptrs {
            unsafe { hook.deallocate(p) };
        }
        let ring = hook.transport().detach().unwrap();
        assert!(ring.overflow());
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn detached_interposer_keeps_serving() {
        let hook = interposer(system(), 4);
        assert!(hook.transport().is_attached());
        assert!(hook.transport().detach().is_some());
        assert!(hook.transport().detach().is_none());
        assert!(!hook.transport().is_attached());
        let ptr = unsafe { hook.allocate(8) };
        assert!(!ptr.is_null());
        unsafe { hook.deallocate(ptr) };
    }

    static NESTED: OnceCell<Interposer<FixedStack>> = OnceCell::new();

    // An `operator new` that allocates through the hooked `malloc`, like libstdc++ does.
    unsafe extern "C-unwind" fn new_through_malloc(size: size_t) -> *mut c_void {
        NESTED.get().unwrap().allocate(size)
    }

    #[test]
    fn nested_calls_are_not_recorded() {
        let mut real = system();
        real.new = new_through_malloc;
        let hook = NESTED.get_or_init(|| interposer(real, 16));
        let ptr = unsafe { hook.construct_object(40) };
        let events = drain(hook);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), Some(EventKind::ConstructObject));
        assert_eq!(events[0].size, 40);
        unsafe { libc::free(ptr) };
    }

    #[test]
    fn abandoned_transport_stops_recording() {
        let hook = interposer(system(), 4);
        // Counts left behind by threads that do not exist in a forked child.
        hook.transport().writers.fetch_add(3, Ordering::SeqCst);
        hook.transport().abandon();
        assert!(!hook.transport().is_attached());
        assert!(hook.transport().detach().is_none());
        let ptr = unsafe { hook.allocate(8) };
        assert!(!ptr.is_null());
        unsafe { hook.deallocate(ptr) };
    }

    // Nothing in this test binary installs the hooks, so the real entry points stay unresolved
    // for as long as the guard makes resolution impossible.
    #[test]
    fn calls_during_resolution_use_the_arena() {
        let _guard = HookGuard::enter().unwrap();
        assert!(REAL.get().is_none());
        unsafe {
            let ptr = MemHook::malloc(24);
            assert!(ARENA.contains(ptr));
            let object = MemHook::operator_new(8);
            assert!(ARENA.contains(object));
            MemHook::free(ptr);
            MemHook::operator_delete(object);
        }
    }

    #[test]
    fn guard_is_released_after_each_call() {
        let hook = interposer(system(), 16);
        unsafe {
            let a = hook.allocate(8);
            let b = hook.allocate(8);
            hook.deallocate(a);
            hook.deallocate(b);
        }
        assert_eq!(drain(&hook).len(), 4);
        assert!(HookGuard::enter().is_some());
    }
}
