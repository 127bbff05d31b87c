//! Companion crate to [`mem_hook`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept the program's `malloc`/`free` and C++ `new`/`delete`
//! calls and stream them to a `mem_hook` ring.
//!
//! The hooks are installed by the library constructor, before `main` runs, and detached by its
//! destructor.  Calls that arrive while the constructor is still running are served without
//! being recorded.

// Exported names are the Itanium-mangled C++ operators.
#![allow(non_snake_case)]

use libc::{c_void, size_t};
use mem_hook::{bootstrap, MemHook};

extern "C" fn mem_hook_init() {
    bootstrap::initialize();
}

extern "C" fn mem_hook_fini() {
    bootstrap::teardown();
}

#[used]
#[link_section = ".init_array"]
static INIT: extern "C" fn() = mem_hook_init;

#[used]
#[link_section = ".fini_array"]
static FINI: extern "C" fn() = mem_hook_fini;

/// Records the call, then returns what the next `malloc` in lookup order returned.
///
/// # Safety
///
/// Same contract as `malloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    MemHook::malloc(size)
}

/// # Safety
///
/// Same contract as `free`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    MemHook::free(ptr)
}

/// `operator new(std::size_t)`
///
/// # Safety
///
/// Same contract as `operator new`; `std::bad_alloc` propagates to the caller.
#[no_mangle]
pub unsafe extern "C-unwind" fn _Znwm(size: size_t) -> *mut c_void {
    MemHook::operator_new(size)
}

/// `operator new[](std::size_t)`
///
/// # Safety
///
/// Same contract as `operator new[]`; `std::bad_alloc` propagates to the caller.
#[no_mangle]
pub unsafe extern "C-unwind" fn _Znam(size: size_t) -> *mut c_void {
    MemHook::operator_new_array(size)
}

/// `operator new(std::size_t, const std::nothrow_t&)`
///
/// # Safety
///
/// Same contract as the nothrow `operator new`.
#[no_mangle]
pub unsafe extern "C" fn _ZnwmRKSt9nothrow_t(size: size_t, tag: *const c_void) -> *mut c_void {
    MemHook::operator_new_nothrow(size, tag)
}

/// `operator delete(void*)`
///
/// # Safety
///
/// Same contract as `operator delete`.
#[no_mangle]
pub unsafe extern "C" fn _ZdlPv(ptr: *mut c_void) {
    MemHook::operator_delete(ptr)
}

/// `operator delete[](void*)`
///
/// # Safety
///
/// Same contract as `operator delete[]`.
#[no_mangle]
pub unsafe extern "C" fn _ZdaPv(ptr: *mut c_void) {
    MemHook::operator_delete_array(ptr)
}

/// `operator delete(void*, const std::nothrow_t&)`
///
/// # Safety
///
/// Same contract as the nothrow `operator delete`.
#[no_mangle]
pub unsafe extern "C" fn _ZdlPvRKSt9nothrow_t(ptr: *mut c_void, tag: *const c_void) {
    MemHook::operator_delete_nothrow(ptr, tag)
}
