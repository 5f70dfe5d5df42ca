//! Error taxonomy (spec.md section 7). Only configuration parsing produces
//! a recoverable [`GcError`]; everything else the collector can hit is a
//! fatal invariant violation and goes through [`throw`], matching the Go
//! runtime's `runtime·throw` — nothing unwinds past it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GcError {
    /// A collector invariant was violated: misaligned work buffer, bad
    /// span state during sweep, unknown GC opcode, and so on. Fatal.
    #[error("gc invariant violated: {0}")]
    Invariant(&'static str),

    /// The collector could not obtain backing memory for its own
    /// metadata (work-buffer chunk, buffer-list growth, roots vector).
    /// Fatal.
    #[error("gc out of memory: {0}")]
    OutOfMemory(&'static str),

    /// Malformed `GOGC` / `GOGCTRACE` environment input. Recoverable —
    /// callers get a `Result` instead of a panic at startup.
    #[error("invalid gc configuration: {0}")]
    Config(String),
}

/// Aborts the process with an invariant-violation message. Named after
/// `runtime·throw` in the Go collector this crate's behavior is grounded
/// on: a GC invariant failure is not something a caller can recover from.
#[inline(always)]
#[track_caller]
pub fn throw(msg: &'static str) -> ! {
    panic!("{}", GcError::Invariant(msg));
}

/// Same as [`throw`] but for the out-of-memory-on-GC-metadata taxon.
#[inline(always)]
#[track_caller]
pub fn throw_oom(msg: &'static str) -> ! {
    panic!("{}", GcError::OutOfMemory(msg));
}
