//! A parallel, stop-the-world, precise mark-sweep collector core for a
//! managed runtime, modeled on the Go runtime's `mgc0.c`.
//!
//! This crate implements the marking and sweeping machinery — mark
//! bitmap, work-stealing marking engine, sweeper, and cycle controller
//! — and nothing else. The allocator, the mutator scheduler, and OS
//! stack/thread introspection are external collaborators the runtime
//! binding supplies through the [`span::PageHeap`] and
//! [`roots::RootProvider`] traits.

pub mod bitmap;
pub mod config;
pub mod controller;
pub mod error;
pub mod finalizer;
pub mod mmap;
pub mod object;
pub mod parfor;
pub mod roots;
pub mod scan;
pub mod span;
pub mod stats;
pub mod sweep;
pub mod util;
pub mod workbuf;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use config::{config, GcConfig, GC_PERCENT_DISABLED};
pub use controller::{Collector, MemStats};
pub use error::{throw, throw_oom, GcError};
pub use finalizer::{FinalizerFn, FinalizerQueue, QueuedFinalizer};
pub use object::{GcProgram, Object, Op, LOOP_BIT, PRECISE_BIT};
pub use roots::{RootProvider, ThreadRoots};
pub use scan::{GcMap, MapEntry, MapSlot, ProgramTable};
pub use span::{PageHeap, Span, SpanState, SweepResult, TypeTable};
pub use stats::{CycleReport, GcStats, PauseRing, RING};
pub use sweep::Sweeper;

/// `set_gc_percent` (spec.md section 6): atomically swaps the pacing
/// target, returning the previous value. `new < 0` disables collection.
pub fn set_gc_percent(new: i64) -> i64 {
    config().set_gc_percent(new)
}

/// Current `GOGC`-equivalent pacing target.
pub fn gc_percent() -> i64 {
    config().gcpercent()
}
