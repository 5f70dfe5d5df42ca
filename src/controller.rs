//! The cycle controller (spec.md 4.6): the state machine that drives
//! one collection from `Idle` through `Gate`, `SettleTypes`, `Seed`,
//! `Mark`, `Sweep` and `Finish` back to `Idle`, serialized by
//! `worldsema` so only one cycle runs at a time.
//!
//! Actually stopping mutator threads at a safepoint is the scheduler's
//! job (spec.md section 1, out of scope); [`RootProvider`] standing in
//! for "the world is stopped, here is every live root" is the seam.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::{debug, info, trace};
use parking_lot::Mutex;

use crate::bitmap::MarkBitmap;
use crate::config::config;
use crate::finalizer::{FinalizerQueue, QueuedFinalizer};
use crate::parfor::{run_mark_phase, run_sweep_phase};
use crate::roots::{enumerate_roots, RootProvider};
use crate::scan::{MarkShared, ProgramTable};
use crate::span::{PageHeap, SpanState};
use crate::stats::{CycleReport, GcStats, PauseRing};
use crate::workbuf::WorkPool;

/// `read_mem_stats` snapshot (spec.md section 6 / SPEC_FULL.md 12): the
/// handful of heap-occupancy and cumulative-GC numbers a runtime binding
/// exposes to its own reflection/metrics surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemStats {
    pub heap_alloc: usize,
    pub heap_objects: usize,
    pub next_gc: usize,
    pub num_gc: u64,
    pub pause_total_ns: u64,
    pub last_gc_ns: u64,
}

/// Everything one collection cycle needs, owned for the process
/// lifetime by the runtime binding. Implements `gc(force)`,
/// `read_gc_stats`, and `set_gc_percent` (spec.md section 6).
pub struct Collector<H, R> {
    bitmap: MarkBitmap,
    page_heap: H,
    root_provider: R,
    finalizers: FinalizerQueue,
    programs: ProgramTable,
    stats: GcStats,
    pauses: PauseRing,
    worldsema: Mutex<()>,
    cycle: AtomicU64,
    cum_nfree: AtomicU64,
    cum_nmalloc: AtomicU64,
    last_objects_after: std::sync::atomic::AtomicUsize,
    next_gc_threshold: std::sync::atomic::AtomicUsize,
}

impl<H: PageHeap, R: RootProvider> Collector<H, R> {
    pub fn new(page_heap: H, root_provider: R, programs: ProgramTable) -> Self {
        let arena_start = page_heap.arena_start();
        Self {
            bitmap: MarkBitmap::new(arena_start),
            page_heap,
            root_provider,
            finalizers: FinalizerQueue::new(),
            programs,
            stats: GcStats::default(),
            pauses: PauseRing::new(),
            worldsema: Mutex::new(()),
            cycle: AtomicU64::new(0),
            cum_nfree: AtomicU64::new(0),
            cum_nmalloc: AtomicU64::new(0),
            last_objects_after: std::sync::atomic::AtomicUsize::new(0),
            next_gc_threshold: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn bitmap(&self) -> &MarkBitmap {
        &self.bitmap
    }

    pub fn finalizers(&self) -> &FinalizerQueue {
        &self.finalizers
    }

    pub fn root_provider(&self) -> &R {
        &self.root_provider
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Called by the allocator binding once per successful allocation;
    /// feeds `cum_nmalloc` for the trace line (spec.md section 6).
    pub fn note_alloc(&self) {
        self.cum_nmalloc.fetch_add(1, Ordering::Relaxed);
    }

    /// `gc(force)` (spec.md section 6 / SPEC_FULL.md 12 public entry
    /// points): runs one collection cycle using `GOMAXGCPROCS` workers.
    /// Thin alias over [`Collector::collect`] kept for call-site parity
    /// with the allocator binding's expected name.
    pub fn gc(&self, force: bool) -> bool {
        self.collect(force, config().max_gcproc())
    }

    /// Runs one full collection cycle unconditionally unless `GOGC=off`
    /// and `force` is false, or the heap hasn't grown back up to the
    /// pacing threshold set by the previous cycle's `Finish` step
    /// (spec.md 4.6 `Gate`). Returns whether a cycle actually ran.
    ///
    /// At `GOGCTRACE > 1`, a second forced cycle immediately follows the
    /// first to measure post-GC residency (spec.md 4.6 Pacing) — this
    /// second pass is run with `measure_residency = false` so it can't
    /// recurse again.
    pub fn collect(&self, force: bool, nproc: usize) -> bool {
        self.collect_inner(force, nproc, true)
    }

    fn collect_inner(&self, force: bool, nproc: usize, measure_residency: bool) -> bool {
        if config().gc_disabled() && !force {
            return false;
        }
        let heap_alloc = self.page_heap.arena_used();
        if !force && heap_alloc < self.next_gc_threshold.load(Ordering::Relaxed) {
            return false;
        }
        let _world = self.worldsema.lock();
        let cycle_start = Instant::now();

        debug!("gc: settle_types");
        self.bitmap.map_bits(self.page_heap.arena_used());
        self.stats.reset();

        debug!("gc: seed");
        let roots = enumerate_roots(&self.root_provider, &self.page_heap, &self.finalizers);
        let heap_before = self.page_heap.arena_used();
        let objects_before = roots.len();
        if config().extra_trace() {
            trace!("gc: {} roots enumerated", objects_before);
        }

        debug!("gc: mark");
        let mark_start = Instant::now();
        let pool = WorkPool::new(nproc.max(1));
        let shared = MarkShared::new(
            &self.bitmap,
            &self.page_heap,
            &self.finalizers,
            &self.programs,
            &self.stats,
        );
        run_mark_phase(nproc, &pool, &shared, roots.clone());
        let mark_ms = mark_start.elapsed().as_secs_f64() * 1000.0;

        if config().debug_mark() {
            self.debug_verify(&roots);
        }

        debug!("gc: sweep");
        let sweep_start = Instant::now();
        let tally = run_sweep_phase(nproc, &self.page_heap, &self.bitmap, &self.finalizers, &self.stats);
        let sweep_ms = sweep_start.elapsed().as_secs_f64() * 1000.0;
        self.last_objects_after
            .store(tally.live_objects.load(Ordering::Relaxed), Ordering::Relaxed);

        let stw_ms = cycle_start.elapsed().as_secs_f64() * 1000.0;
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed);
        self.cum_nfree
            .fetch_add(tally.freed_objects.load(Ordering::Relaxed) as u64, Ordering::Relaxed);

        let heap_after = heap_before.saturating_sub(tally.freed_bytes.load(Ordering::Relaxed));
        self.next_gc_threshold
            .store(config().next_gc(heap_after), Ordering::Relaxed);

        let report = CycleReport {
            cycle,
            nproc: nproc.max(1),
            mark_ms,
            sweep_ms,
            stw_ms,
            heap_before,
            heap_after,
            objects_before,
            objects_after: tally.live_objects.load(Ordering::Relaxed),
            cum_nmalloc: self.cum_nmalloc.load(Ordering::Relaxed),
            cum_nfree: self.cum_nfree.load(Ordering::Relaxed),
            nhandoff: self.stats.nhandoff.load(Ordering::Relaxed),
            handoff_objs: self.stats.handoff_objs.load(Ordering::Relaxed),
            nsteal: self.stats.nsteal.load(Ordering::Relaxed),
            steal_objs: self.stats.steal_objs.load(Ordering::Relaxed),
            nprocyield: self.stats.nprocyield.load(Ordering::Relaxed),
            nosyield: self.stats.nosyield.load(Ordering::Relaxed),
            nsleep: self.stats.nsleep.load(Ordering::Relaxed),
            start_ns: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
            pause_ns: (stw_ms * 1_000_000.0) as u64,
        };

        if config().trace_level() >= 1 {
            info!("{report}");
        }
        self.pauses.push(report);
        debug!("gc: finish, running finalizers");
        self.run_finalizers();
        drop(_world);

        if measure_residency && config().trace_level() > 1 {
            debug!("gc: trace level > 1, running a second cycle to measure residency");
            self.collect_inner(true, nproc, false);
        }
        true
    }

    /// Drains the finalizer queue and runs each callback inline. A real
    /// binding would hand these to a dedicated finalizer-runner task
    /// (spec.md section 1); done synchronously here since this crate
    /// owns no scheduler of its own.
    fn run_finalizers(&self) {
        for QueuedFinalizer { func, arg, nret: _ } in self.finalizers.drain() {
            func(arg);
        }
    }

    /// `DebugMark` (SPEC_FULL.md 11): a single-threaded shadow mark pass
    /// run after the real parallel mark phase, gated behind
    /// `GcConfig::debug_mark`. Deliberately independent of
    /// [`crate::scan::scanblock`]'s precise, type-directed walk — a
    /// conservative word-at-a-time pointer chase that does not share code
    /// with the thing it is verifying, so a shared bug can't mask itself.
    /// Aborts via [`crate::error::throw`] on the first block it reaches
    /// that the real mark phase left unmarked.
    fn debug_verify(&self, roots: &[crate::object::Object]) {
        use std::collections::HashSet;
        let mut seen: HashSet<usize> = HashSet::new();
        let mut stack: Vec<usize> = roots.iter().map(|r| r.base).collect();
        while let Some(addr) = stack.pop() {
            let word = crate::util::align_down(addr, crate::bitmap::WORD_BYTES);
            if word < self.bitmap.arena_start() || word >= self.page_heap.arena_used() {
                continue;
            }
            let Some(idx) = self.page_heap.span_index_for(word) else {
                continue;
            };
            let span = self.page_heap.span(idx);
            if span.state != SpanState::InUse {
                continue;
            }
            let Some(header) = span.header_for(word) else {
                continue;
            };
            if !seen.insert(header) {
                continue;
            }
            let bits = self.bitmap.read(header);
            if !bits.allocated {
                continue;
            }
            if !bits.marked {
                crate::error::throw("debug_verify: shadow walk reached a block the mark phase left unmarked");
            }
            if bits.no_pointers() {
                continue;
            }
            let len = if span.is_large() { span.bytes } else { span.elemsize };
            let mut p = header;
            let end = header + len;
            while p + crate::bitmap::WORD_BYTES <= end {
                let candidate = unsafe { *(p as *const usize) };
                if candidate != 0 {
                    stack.push(candidate);
                }
                p += crate::bitmap::WORD_BYTES;
            }
        }
        debug!("gc: debug_mark verified {} reachable blocks", seen.len());
    }

    /// `read_mem_stats` (SPEC_FULL.md 12): snapshots current heap
    /// occupancy and cumulative collection counters.
    pub fn read_mem_stats(&self, out: &mut MemStats) {
        let mut pauses = Vec::with_capacity(crate::stats::RING + 3);
        let (last_gc_ns, num_gc, pause_total_ns) = self.pauses.read_into(&mut pauses);
        let heap_alloc = self.page_heap.arena_used();
        out.heap_alloc = heap_alloc;
        out.heap_objects = self.last_objects_after.load(Ordering::Relaxed);
        out.next_gc = self.next_gc_threshold.load(Ordering::Relaxed);
        out.num_gc = num_gc as u64;
        out.pause_total_ns = pause_total_ns;
        out.last_gc_ns = last_gc_ns;
    }

    /// `read_gc_stats` (spec.md section 6): copies the pause history
    /// into `out`, which must have capacity `>= RING + 3`.
    pub fn read_gc_stats(&self, out: &mut Vec<CycleReport>) -> (u64, usize, u64) {
        self.pauses.read_into(out)
    }

    /// `gc_helper`: an idle worker thread offering itself to the next
    /// mark phase. Our own `run_mark_phase` spawns exactly `nproc`
    /// workers per cycle, so this is a no-op hook kept for API parity
    /// with `mgc0.c`'s `gchelperstart`.
    pub fn gc_helper(&self) {}
}
