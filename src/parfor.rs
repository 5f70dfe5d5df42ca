//! Minimal parallel-for driver (spec.md 4.6): fans a unit of work out
//! across `nproc` scoped threads pulling from a shared atomic cursor.
//! The mutator scheduler that would normally own thread lifecycle is an
//! external collaborator (spec.md section 1); this is the collector's
//! own small stand-in, used to drive the mark and sweep phases.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::bitmap::MarkBitmap;
use crate::finalizer::FinalizerQueue;
use crate::object::Object;
use crate::scan::{self, MarkShared};
use crate::span::PageHeap;
use crate::stats::GcStats;
use crate::sweep;
use crate::workbuf::WorkPool;

/// Runs `f(i)` for every `i` in `0..n`, `nproc` threads wide, each thread
/// pulling the next index off a shared cursor rather than owning a fixed
/// static range — so an expensive item doesn't stall threads that
/// finished their share early.
pub fn parallel_for<F>(n: usize, nproc: usize, f: F)
where
    F: Fn(usize) + Sync,
{
    if n == 0 {
        return;
    }
    let nproc = nproc.clamp(1, n);
    let cursor = AtomicUsize::new(0);
    let f = &f;
    let cursor = &cursor;
    std::thread::scope(|scope| {
        for _ in 0..nproc {
            scope.spawn(move || loop {
                let i = cursor.fetch_add(1, Ordering::Relaxed);
                if i >= n {
                    return;
                }
                f(i);
            });
        }
    });
}

/// Splits `roots` into `nproc` contiguous, roughly-equal chunks so each
/// mark worker starts with its own seed instead of contending on a
/// shared queue from the first object.
fn partition(roots: Vec<Object>, nproc: usize) -> Vec<Vec<Object>> {
    let nproc = nproc.max(1);
    if roots.is_empty() {
        return (0..nproc).map(|_| Vec::new()).collect();
    }
    let chunk = (roots.len() + nproc - 1) / nproc;
    let mut chunks: Vec<Vec<Object>> = roots.chunks(chunk.max(1)).map(|c| c.to_vec()).collect();
    while chunks.len() < nproc {
        chunks.push(Vec::new());
    }
    chunks
}

/// Drives the `Mark` phase (spec.md 4.6): seeds `nproc` workers from
/// `roots` and blocks until every worker's pool reports termination.
pub fn run_mark_phase(nproc: usize, pool: &WorkPool, shared: &MarkShared, roots: Vec<Object>) {
    let nproc = nproc.max(1);
    let seeds = partition(roots, nproc);
    std::thread::scope(|scope| {
        for (id, seed) in seeds.into_iter().enumerate() {
            scope.spawn(move || scan::run_worker(id, pool, shared, seed));
        }
    });
}

/// Tally of one `Sweep` phase's work, used by the cycle controller's
/// `Finish` accounting (spec.md section 6 trace line).
#[derive(Debug, Default)]
pub struct SweepTally {
    pub freed_bytes: AtomicUsize,
    pub freed_objects: AtomicUsize,
    pub live_bytes: AtomicUsize,
    pub live_objects: AtomicUsize,
}

/// Drives the `Sweep` phase (spec.md 4.6) in parallel across every
/// in-use span, returning the aggregate reclaimed/surviving counts.
pub fn run_sweep_phase(
    nproc: usize,
    page_heap: &dyn PageHeap,
    bitmap: &MarkBitmap,
    finalizers: &FinalizerQueue,
    stats: &GcStats,
) -> SweepTally {
    let tally = SweepTally::default();
    let n = page_heap.span_count();
    parallel_for(n, nproc, |idx| {
        let span = page_heap.span(idx);
        if span.state != crate::span::SpanState::InUse {
            return;
        }
        let result = sweep::sweep_span(&span, bitmap, finalizers);
        tally.freed_objects.fetch_add(result.nfree, Ordering::Relaxed);
        tally
            .freed_bytes
            .fetch_add(result.local_cachealloc, Ordering::Relaxed);
        tally
            .live_objects
            .fetch_add(result.local_objects, Ordering::Relaxed);
        tally.live_bytes.fetch_add(result.local_alloc, Ordering::Relaxed);
        if span.is_large() {
            if result.nfree > 0 {
                page_heap.free_large_span(idx);
            }
        } else {
            page_heap.return_to_cache(idx, result);
        }
    });
    stats.npausesweep.fetch_add(1, Ordering::Relaxed);
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn parallel_for_visits_every_index_exactly_once() {
        let seen: Vec<AtomicUsize> = (0..37).map(|_| AtomicUsize::new(0)).collect();
        parallel_for(37, 4, |i| {
            seen[i].fetch_add(1, Ordering::Relaxed);
        });
        for s in &seen {
            assert_eq!(s.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn parallel_for_handles_nproc_larger_than_n() {
        let seen = AtomicUsize::new(0);
        parallel_for(3, 8, |_| {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(seen.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn partition_covers_every_root_with_no_duplicates() {
        let roots: Vec<Object> = (0..10).map(|i| Object::new(i, 8, 0)).collect();
        let chunks = partition(roots, 3);
        assert_eq!(chunks.len(), 3);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 10);
    }
}
