//! Load-time installation and teardown of the hooks.
//!
//! Installation resolves the next definition of every intercepted symbol, opens the event ring
//! and publishes the [`Interposer`] the exported entry points dispatch to.  Any failure is fatal:
//! the process is terminated with [`BOOTSTRAP_FAILURE_STATUS`] before it can run unobserved.
//!
//! The process that installs the hooks is the only producer of its region.  A child created with
//! `fork` drops the inherited attachment and keeps running unrecorded; one that `exec`s loads the
//! library again and bootstraps on its own.

use std::{io, mem, ptr::NonNull};

use libc::{c_char, c_void, size_t};
use log::{debug, error, info, warn};

use crate::{
    arena::ARENA,
    config::{Config, LOG_VAR},
    error::BootstrapError,
    hook::{
        self, DeleteFn, DeleteNoThrowFn, EntryPoints, FreeFn, HookGuard, Interposer, MallocFn,
        MemHook, NewFn, NewNoThrowFn,
    },
    ring::Ring,
    stack::DefaultCapture,
};

/// Exit status of a process whose hooks could not be installed (`EX_OSERR`).
pub const BOOTSTRAP_FAILURE_STATUS: i32 = 71;

/// Symbol names as the dynamic linker knows them, NUL-terminated.
pub mod symbols {
    pub const MALLOC: &str = "malloc\0";
    pub const FREE: &str = "free\0";
    pub const NEW: &str = "_Znwm\0";
    pub const NEW_ARRAY: &str = "_Znam\0";
    pub const NEW_NOTHROW: &str = "_ZnwmRKSt9nothrow_t\0";
    pub const DELETE: &str = "_ZdlPv\0";
    pub const DELETE_ARRAY: &str = "_ZdaPv\0";
    pub const DELETE_NOTHROW: &str = "_ZdlPvRKSt9nothrow_t\0";
}

/// Finds the implementation an intercepted symbol would have bound to without us.
pub trait Resolver {
    /// `symbol` is NUL-terminated.
    fn resolve(&self, symbol: &'static str) -> Option<NonNull<c_void>>;
}

/// `dlsym(RTLD_NEXT, ..)`: the next definition after this library in lookup order.
#[derive(Clone, Copy, Debug, Default)]
pub struct NextInChain;

impl Resolver for NextInChain {
    fn resolve(&self, symbol: &'static str) -> Option<NonNull<c_void>> {
        debug_assert!(symbol.ends_with('\0'));
        NonNull::new(unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr() as *const c_char) })
    }
}

fn display_name(symbol: &'static str) -> &'static str {
    symbol.trim_end_matches('\0')
}

/// Reinterprets a resolved address as the function pointer type `F`.
unsafe fn lookup<F: Copy, R: Resolver + ?Sized>(
    resolver: &R,
    symbol: &'static str,
) -> Result<F, BootstrapError> {
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<*mut c_void>());
    let addr = resolver
        .resolve(symbol)
        .ok_or(BootstrapError::Unresolved(display_name(symbol)))?;
    Ok(mem::transmute_copy(&addr.as_ptr()))
}

// C++ operators are absent from processes that never load libstdc++.  When they are not
// required, the slots get stand-ins that abort if anything ever calls them.
unsafe fn lookup_cxx<F: Copy, R: Resolver + ?Sized>(
    resolver: &R,
    symbol: &'static str,
    required: bool,
    stand_in: F,
) -> Result<F, BootstrapError> {
    match lookup(resolver, symbol) {
        Ok(f) => Ok(f),
        Err(err) if required => Err(err),
        Err(_) => {
            warn!("{} not found, calls to it will abort", display_name(symbol));
            Ok(stand_in)
        }
    }
}

fn missing(name: &str) -> ! {
    error!("no real {} to forward to", name);
    unsafe { libc::abort() }
}

unsafe extern "C-unwind" fn missing_new(_size: size_t) -> *mut c_void {
    missing("operator new")
}
unsafe extern "C-unwind" fn missing_new_array(_size: size_t) -> *mut c_void {
    missing("operator new[]")
}
unsafe extern "C" fn missing_new_nothrow(_size: size_t, _tag: *const c_void) -> *mut c_void {
    missing("operator new(nothrow)")
}
unsafe extern "C" fn missing_delete(_ptr: *mut c_void) {
    missing("operator delete")
}
unsafe extern "C" fn missing_delete_array(_ptr: *mut c_void) {
    missing("operator delete[]")
}
unsafe extern "C" fn missing_delete_nothrow(_ptr: *mut c_void, _tag: *const c_void) {
    missing("operator delete(nothrow)")
}

/// Resolves all eight entry points.  `malloc` and `free` are always mandatory.
pub fn resolve_entry_points<R: Resolver + ?Sized>(
    resolver: &R,
    require_cxx: bool,
) -> Result<EntryPoints, BootstrapError> {
    use symbols::*;
    unsafe {
        Ok(EntryPoints {
            malloc: lookup::<MallocFn, _>(resolver, MALLOC)?,
            free: lookup::<FreeFn, _>(resolver, FREE)?,
            new: lookup_cxx::<NewFn, _>(resolver, NEW, require_cxx, missing_new)?,
            new_array: lookup_cxx::<NewFn, _>(resolver, NEW_ARRAY, require_cxx, missing_new_array)?,
            new_nothrow: lookup_cxx::<NewNoThrowFn, _>(
                resolver,
                NEW_NOTHROW,
                require_cxx,
                missing_new_nothrow,
            )?,
            delete: lookup_cxx::<DeleteFn, _>(resolver, DELETE, require_cxx, missing_delete)?,
            delete_array: lookup_cxx::<DeleteFn, _>(
                resolver,
                DELETE_ARRAY,
                require_cxx,
                missing_delete_array,
            )?,
            delete_nothrow: lookup_cxx::<DeleteNoThrowFn, _>(
                resolver,
                DELETE_NOTHROW,
                require_cxx,
                missing_delete_nothrow,
            )?,
        })
    }
}

/// Resolves the real entry points, opens the ring named by `config` and publishes the process-wide
/// interposer.  Nothing is recorded before this returns `Ok`, and nothing is ever recorded if it
/// fails.
pub fn install<R: Resolver + ?Sized>(
    resolver: &R,
    config: &Config,
) -> Result<&'static Interposer, BootstrapError> {
    // Allocations made from here on are bookkeeping, never events.
    let _guard = HookGuard::enter();
    if MemHook::installed().is_some() {
        return Err(BootstrapError::AlreadyInstalled);
    }

    let real = resolve_entry_points(resolver, config.require_cxx)?;
    hook::publish_real(real);

    let capacity = config.slot_capacity();
    let ring = Ring::open_or_create(&config.channel, capacity)?;
    let interposer = Interposer::new(real, ring, DefaultCapture::default())
        .with_filters(config.size_filter(), config.kind_set())
        .with_skip(config.skip_frames);
    interposer.owned_ranges().register(ARENA.range());

    let installed = hook::publish_hook(interposer).map_err(|_| BootstrapError::AlreadyInstalled)?;
    let status = unsafe { libc::pthread_atfork(None, None, Some(hook::detach_in_child)) };
    if status != 0 {
        return Err(BootstrapError::ForkHandler(io::Error::from_raw_os_error(status)));
    }
    info!(
        "recording into {} ({} slots, {} bytes of bootstrap arena used)",
        config.channel,
        capacity,
        ARENA.used()
    );
    Ok(installed)
}

/// Terminates the process immediately, without running exit handlers that might allocate.
pub fn abort_bootstrap(err: &BootstrapError) -> ! {
    error!("mem_hook: {}", err);
    unsafe { libc::_exit(BOOTSTRAP_FAILURE_STATUS) }
}

/// [`install`], terminating the process on failure.
pub fn install_or_exit<R: Resolver + ?Sized>(resolver: &R, config: &Config) -> &'static Interposer {
    install(resolver, config).unwrap_or_else(|err| abort_bootstrap(&err))
}

/// Library constructor body: reads the environment and installs the hooks.
pub fn initialize() {
    // Resolved first, so that reading the configuration allocates from the real allocator.
    let _ = hook::real_entry_points();
    let _guard = HookGuard::enter();
    init_logging();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => abort_bootstrap(&err.into()),
    };
    debug!("{:?}", config);
    install_or_exit(&NextInChain, &config);
}

/// Library destructor body: stops recording and unmaps the ring.  The region stays available to
/// consumers.
pub fn teardown() {
    let Some(hook) = MemHook::installed() else {
        return;
    };
    if let Some(ring) = hook.transport().detach() {
        debug!(
            "detached from {}, {} unread, overflow: {}",
            ring.name().unwrap_or("<anonymous>"),
            ring.len(),
            ring.overflow()
        );
    }
}

// Logging stays off unless asked for: the target's stderr is not ours.
fn init_logging() {
    if std::env::var_os(LOG_VAR).is_none() {
        return;
    }
    let _ = env_logger::Builder::from_env(env_logger::Env::new().filter(LOG_VAR))
        .format_timestamp(None)
        .try_init();
}
