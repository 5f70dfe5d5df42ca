//! Shared scaffolding for the end-to-end scenario tests (spec.md section
//! 8), built on top of the crate's own `testutil` mocks rather than
//! duplicating a second mock allocator here.

pub use stw_gc::testutil::{leak_bytes, MockPageHeap, MockRootProvider};
pub use stw_gc::{bitmap::WORD_BYTES, Collector, GcProgram, Object, Op, ProgramTable};
