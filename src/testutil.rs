//! In-process mock [`PageHeap`]/[`RootProvider`] implementations, shared
//! by this crate's own test modules and by the `tests/` integration
//! suite (SPEC_FULL.md 10.4). Not part of the public API surface a real
//! runtime binding would use — gated behind the `testutil` feature.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::object::Object;
use crate::roots::{RootProvider, ThreadRoots};
use crate::span::{PageHeap, Span, SpanState, SweepResult, TypeTable};

/// Leaks `n` zeroed bytes and returns their address, standing in for a
/// real allocator's freshly-carved block.
pub fn leak_bytes(n: usize) -> usize {
    let buf = vec![0u8; n].into_boxed_slice();
    Box::into_raw(buf) as *mut u8 as usize
}

/// A span table backed by a plain `Vec`, grown by `alloc` as the test
/// mutates it. Mirrors the shape of [`crate::controller`]'s own inline
/// test heap, generalized for reuse across integration tests.
pub struct MockPageHeap {
    spans: Mutex<Vec<Span>>,
    freed_spans: AtomicUsize,
}

impl MockPageHeap {
    pub fn new() -> Self {
        Self {
            spans: Mutex::new(Vec::new()),
            freed_spans: AtomicUsize::new(0),
        }
    }

    /// Leaks `size` bytes and registers them as one in-use span of the
    /// given size class / element size, returning the block's address.
    pub fn alloc(&self, size: usize, sizeclass: usize, elemsize: usize) -> usize {
        let base = leak_bytes(size);
        self.spans.lock().unwrap().push(Span {
            base,
            bytes: size,
            sizeclass,
            elemsize,
            limit: base + size,
            state: SpanState::InUse,
            types: TypeTable::Empty,
        });
        base
    }

    pub fn freed_span_count(&self) -> usize {
        self.freed_spans.load(Ordering::Relaxed)
    }
}

impl Default for MockPageHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl PageHeap for MockPageHeap {
    fn span_count(&self) -> usize {
        self.spans.lock().unwrap().len()
    }

    fn span(&self, idx: usize) -> Span {
        self.spans.lock().unwrap()[idx].clone()
    }

    fn span_index_for(&self, addr: usize) -> Option<usize> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .position(|s| addr >= s.base && addr < s.limit)
    }

    fn free_large_span(&self, idx: usize) {
        self.spans.lock().unwrap()[idx].state = SpanState::Free;
        self.freed_spans.fetch_add(1, Ordering::Relaxed);
    }

    fn return_to_cache(&self, idx: usize, result: SweepResult) {
        if result.local_objects == 0 && result.nfree > 0 {
            self.spans.lock().unwrap()[idx].state = SpanState::Free;
            self.freed_spans.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn arena_start(&self) -> usize {
        self.spans.lock().unwrap().iter().map(|s| s.base).min().unwrap_or(0)
    }

    fn arena_used(&self) -> usize {
        self.spans.lock().unwrap().iter().map(|s| s.limit).max().unwrap_or(0)
    }
}

/// Globals + thread stacks a test can set directly, standing in for the
/// mutator scheduler's root enumeration.
pub struct MockRootProvider {
    globals: Mutex<Vec<Object>>,
    threads: Mutex<Vec<ThreadRoots>>,
}

impl MockRootProvider {
    pub fn new() -> Self {
        Self {
            globals: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn add_global(&self, obj: Object) {
        self.globals.lock().unwrap().push(obj);
    }

    pub fn set_thread_frames(&self, frames: Vec<Object>) {
        self.threads.lock().unwrap().push(ThreadRoots {
            is_gc_helper: false,
            frames,
        });
    }

    /// Drops every previously-added global/thread root, simulating the
    /// mutator releasing its last reference before the next cycle.
    pub fn clear(&self) {
        self.globals.lock().unwrap().clear();
        self.threads.lock().unwrap().clear();
    }
}

impl Default for MockRootProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RootProvider for MockRootProvider {
    fn globals(&self) -> Vec<Object> {
        self.globals.lock().unwrap().clone()
    }

    fn threads(&self) -> Vec<ThreadRoots> {
        std::mem::take(&mut *self.threads.lock().unwrap())
    }
}
