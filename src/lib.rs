//! `mem_hook` records every heap allocation and release a program performs, together with the
//! call stack that performed it, and streams these records to another process through a ring
//! buffer in POSIX shared memory.  Unlike a profiler that aggregates inside the target, the target
//! only pays for a stack walk and a fixed-size copy per call; matching allocations with their
//! releases, finding leaks and spotting `new[]`/`free` mismatches happens in the consumer.
//!
//! Intercepted entry points: `malloc`, `free`, and the C++ `operator new`, `operator new[]`,
//! nothrow `operator new`, `operator delete`, `operator delete[]` and nothrow `operator delete`.
//!
//! ## Recording a program
//!
//! The companion [`lib_mem_hook`] crate builds a dynamic library that installs the hooks when it
//! is loaded:
//!
//! ```bash
//! LD_PRELOAD=libmem_hook_preload.so MEM_HOOK_CHANNEL=/my_trace ./my_program
//! ```
//!
//! If the hooks cannot be installed (a real entry point cannot be resolved, the shared region
//! cannot be created, the configuration is invalid), the program is terminated with exit status
//! [`BOOTSTRAP_FAILURE_STATUS`] before it gets to run.  A full ring never affects the program:
//! the event is dropped and the ring's overflow flag is raised.
//!
//! Settings are read from `MEM_HOOK_*` environment variables, see [`Config`].  Stacks are
//! captured with the platform unwinder, or by walking frame pointers when built with the
//! `frame-pointers` feature.
//!
//! ## Reading the events
//!
//! Any process can attach to the region by name with [`Ring::open`] and drain it with
//! [`Ring::read`].  The `mh_drain` tool from this crate does that and reports lifetimes, per-entry
//! point totals and the allocations still alive, grouped by call stack:
//!
//! ```bash
//! mh_drain --channel /my_trace --follow --threshold 1
//! ```
//!
//! where `--threshold` hides call sites holding fewer than the given percentage of the surviving
//! allocations.

pub mod arena;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod hook;
pub mod report;
pub mod ring;
pub mod stack;

pub use bootstrap::{install, NextInChain, Resolver, BOOTSTRAP_FAILURE_STATUS};
pub use config::Config;
pub use error::{BootstrapError, ConfigError, TransportError};
pub use event::{Event, EventKind};
pub use hook::{EntryPoints, Interposer, MemHook};
pub use report::{LeakProfile, Tracker};
pub use ring::{Ring, WriteResult};
pub use stack::{DefaultCapture, StackCapture, MAX_FRAMES};
