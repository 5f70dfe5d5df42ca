//! The sweeper (spec.md 4.5): walks each in-use span once per cycle,
//! reclaiming every unmarked block and clearing `Marked` off every
//! surviving one. Large and small-object spans take different paths;
//! both detect a pending finalizer via [`FinalizerQueue::handle_special`]
//! before declaring a block garbage.
//!
//! Driving many spans concurrently is [`crate::parfor`]'s job; this
//! module only defines the per-span unit of work.

use crate::bitmap::MarkBitmap;
use crate::finalizer::FinalizerQueue;
use crate::span::{PageHeap, Span, SpanState, SweepResult};
use crate::stats::GcStats;

/// Sweeps one span, returning what survived and what was reclaimed.
/// Does not itself call back into the page heap — callers decide what
/// to do with a fully-freed large span or an assembled small-object
/// free list (spec.md 4.5 steps 4-5).
pub fn sweep_span(span: &Span, bitmap: &MarkBitmap, finalizers: &FinalizerQueue) -> SweepResult {
    let mut result = SweepResult::default();
    if span.state != SpanState::InUse {
        return result;
    }
    if span.is_large() {
        sweep_one_block(span.base, span.bytes, bitmap, finalizers, &mut result);
        return result;
    }
    for i in 0..span.element_count() {
        let header = span.base + i * span.elemsize;
        sweep_one_block(header, span.elemsize, bitmap, finalizers, &mut result);
    }
    result
}

fn sweep_one_block(
    header: usize,
    size: usize,
    bitmap: &MarkBitmap,
    finalizers: &FinalizerQueue,
    result: &mut SweepResult,
) {
    let bits = bitmap.read(header);
    if !bits.allocated {
        return;
    }
    if bits.marked {
        bitmap.clear_marked(header);
        result.local_objects += 1;
        result.local_alloc += size;
        return;
    }
    if bits.special && finalizers.handle_special(header) {
        bitmap.set_block_special(header, false, false);
        result.local_objects += 1;
        result.local_alloc += size;
        return;
    }
    bitmap.mark_freed(header, size, false);
    result.freed.push(header);
    result.nfree += 1;
    result.local_cachealloc += size;
}

/// Sweeps every in-use span in the heap, single-threaded, handing each
/// result back to the page heap as it finishes. Used by the `Finish`
/// phase's final accounting pass and by tests; [`crate::parfor`] fans
/// the same per-span unit of work out across threads for the real
/// background/paced sweep.
pub fn sweep_all(page_heap: &dyn PageHeap, bitmap: &MarkBitmap, finalizers: &FinalizerQueue, stats: &GcStats) {
    for idx in 0..page_heap.span_count() {
        let span = page_heap.span(idx);
        if span.state != SpanState::InUse {
            continue;
        }
        let result = sweep_span(&span, bitmap, finalizers);
        if span.is_large() {
            if result.nfree > 0 {
                page_heap.free_large_span(idx);
            }
        } else {
            page_heap.return_to_cache(idx, result);
        }
    }
    stats.npausesweep.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
}

/// Allocator-callable idle-sweep-on-alloc entry point (SPEC_FULL.md 11):
/// a mutator about to allocate can sweep one not-yet-swept span itself
/// rather than waiting on the next cycle's bulk `parfor` sweep. Distinct
/// from that bulk path, which [`crate::parfor::run_sweep_phase`] drives.
pub struct Sweeper<'a> {
    page_heap: &'a dyn PageHeap,
    bitmap: &'a MarkBitmap,
    finalizers: &'a FinalizerQueue,
    stats: &'a GcStats,
}

impl<'a> Sweeper<'a> {
    pub fn new(page_heap: &'a dyn PageHeap, bitmap: &'a MarkBitmap, finalizers: &'a FinalizerQueue, stats: &'a GcStats) -> Self {
        Self {
            page_heap,
            bitmap,
            finalizers,
            stats,
        }
    }

    /// Sweeps the span at `idx`, returning whether any block in it was
    /// reclaimed. A no-op, `false`-returning call on a span that isn't
    /// `InUse` (already swept, or still free).
    pub fn sweep_one(&self, idx: usize) -> bool {
        let span = self.page_heap.span(idx);
        if span.state != SpanState::InUse {
            return false;
        }
        let result = sweep_span(&span, self.bitmap, self.finalizers);
        let freed = result.nfree > 0;
        if span.is_large() {
            if freed {
                self.page_heap.free_large_span(idx);
            }
        } else {
            self.page_heap.return_to_cache(idx, result);
        }
        self.stats.nbgsweep.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        freed
    }
}
