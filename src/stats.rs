//! Per-cycle counters and the pause-history ring (spec.md section 6, 11).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Number of most-recent pauses `read_gc_stats` can hand back; callers
/// must supply capacity `>= RING + 3` (spec.md section 6).
pub const RING: usize = 16;

/// Accumulated per-cycle counters, summed across workers at `Finish`.
/// Mirrors the Go collector's `gcstats` block (`mgc0.c`), folded in
/// because the trace line format spec.md 6 specifies needs them.
#[derive(Default)]
pub struct GcStats {
    pub nhandoff: AtomicU64,
    pub handoff_objs: AtomicU64,
    pub nsteal: AtomicU64,
    pub steal_objs: AtomicU64,
    pub nprocyield: AtomicU64,
    pub nosyield: AtomicU64,
    pub nsleep: AtomicU64,
    pub getfull: AtomicU64,
    pub rescan: AtomicU64,
    pub rescanbytes: AtomicU64,
    pub nbgsweep: AtomicU64,
    pub npausesweep: AtomicU64,
    pub notype: AtomicU64,
    pub typelookup: AtomicU64,
}

impl GcStats {
    pub fn reset(&self) {
        self.nhandoff.store(0, Ordering::Relaxed);
        self.handoff_objs.store(0, Ordering::Relaxed);
        self.nsteal.store(0, Ordering::Relaxed);
        self.steal_objs.store(0, Ordering::Relaxed);
        self.nprocyield.store(0, Ordering::Relaxed);
        self.nosyield.store(0, Ordering::Relaxed);
        self.nsleep.store(0, Ordering::Relaxed);
        self.getfull.store(0, Ordering::Relaxed);
        self.rescan.store(0, Ordering::Relaxed);
        self.rescanbytes.store(0, Ordering::Relaxed);
        self.notype.store(0, Ordering::Relaxed);
        self.typelookup.store(0, Ordering::Relaxed);
        // nbgsweep/npausesweep accumulate across cycles, not reset here.
    }
}

/// One completed collection's timing/occupancy, used both for the trace
/// line and for the pause-history ring `read_gc_stats` exposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub nproc: usize,
    pub mark_ms: f64,
    pub sweep_ms: f64,
    pub stw_ms: f64,
    pub heap_before: usize,
    pub heap_after: usize,
    pub objects_before: usize,
    pub objects_after: usize,
    pub cum_nmalloc: u64,
    pub cum_nfree: u64,
    pub nhandoff: u64,
    pub handoff_objs: u64,
    pub nsteal: u64,
    pub steal_objs: u64,
    pub nprocyield: u64,
    pub nosyield: u64,
    pub nsleep: u64,
    pub start_ns: u64,
    pub pause_ns: u64,
}

impl std::fmt::Display for CycleReport {
    /// spec.md section 6 trace line format, printed when `GOGCTRACE >= 1`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gc{}({}): {:.3}+{:.3}+{:.3} ms, \
             {:.1} -> {:.1} MB {} -> {} ({}-{}) objects, \
             {}({}) handoff, {}({}) steal, {}/{}/{} yields",
            self.cycle,
            self.nproc,
            self.mark_ms,
            self.sweep_ms,
            self.stw_ms,
            self.heap_before as f64 / (1024.0 * 1024.0),
            self.heap_after as f64 / (1024.0 * 1024.0),
            self.objects_before,
            self.objects_after,
            self.cum_nmalloc,
            self.cum_nfree,
            self.nhandoff,
            self.handoff_objs,
            self.nsteal,
            self.steal_objs,
            self.nprocyield,
            self.nosyield,
            self.nsleep,
        )
    }
}

/// Fixed-size, most-recent-first ring of completed-cycle reports backing
/// `read_gc_stats`.
pub struct PauseRing {
    entries: parking_lot::Mutex<Vec<CycleReport>>,
    count: AtomicUsize,
    total_pause_ns: AtomicU64,
}

impl PauseRing {
    pub fn new() -> Self {
        Self {
            entries: parking_lot::Mutex::new(Vec::with_capacity(RING)),
            count: AtomicUsize::new(0),
            total_pause_ns: AtomicU64::new(0),
        }
    }

    pub fn push(&self, report: CycleReport) {
        let mut entries = self.entries.lock();
        entries.insert(0, report);
        entries.truncate(RING);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_pause_ns
            .fetch_add(report.pause_ns, Ordering::Relaxed);
    }

    /// Copies up to `RING` most-recent pauses into `out` (capacity
    /// `>= RING + 3` per spec.md section 6) and returns
    /// `(last_gc_ns, count, total_pause_ns)`.
    pub fn read_into(&self, out: &mut Vec<CycleReport>) -> (u64, usize, u64) {
        assert!(
            out.capacity() >= RING + 3 || out.capacity() == 0,
            "read_gc_stats: caller must supply capacity >= RING + 3"
        );
        let entries = self.entries.lock();
        out.clear();
        out.extend_from_slice(&entries);
        let last = entries.first().map(|r| r.start_ns).unwrap_or(0);
        (
            last,
            self.count.load(Ordering::Relaxed),
            self.total_pause_ns.load(Ordering::Relaxed),
        )
    }
}

impl Default for PauseRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_most_recent_first_and_caps_at_ring() {
        let ring = PauseRing::new();
        for i in 0..(RING + 5) {
            ring.push(CycleReport {
                cycle: i as u64,
                start_ns: i as u64,
                pause_ns: 1,
                ..Default::default()
            });
        }
        let mut out = Vec::with_capacity(RING + 3);
        let (last, count, total) = ring.read_into(&mut out);
        assert_eq!(out.len(), RING);
        assert_eq!(out[0].cycle, (RING + 4) as u64);
        assert_eq!(last, (RING + 4) as u64);
        assert_eq!(count, RING + 5);
        assert_eq!(total, (RING + 5) as u64);
    }

    #[test]
    fn trace_line_matches_format() {
        let report = CycleReport {
            cycle: 3,
            nproc: 4,
            mark_ms: 1.5,
            sweep_ms: 0.5,
            stw_ms: 2.0,
            heap_before: 2 * 1024 * 1024,
            heap_after: 1024 * 1024,
            objects_before: 100,
            objects_after: 40,
            cum_nmalloc: 500,
            cum_nfree: 460,
            nhandoff: 2,
            handoff_objs: 8,
            nsteal: 1,
            steal_objs: 3,
            nprocyield: 10,
            nosyield: 2,
            nsleep: 1,
            ..Default::default()
        };
        let line = report.to_string();
        assert!(line.starts_with("gc3(4):"));
        assert!(line.contains("100 -> 40"));
        assert!(line.contains("handoff"));
        assert!(line.contains("steal"));
        assert!(line.contains("yields"));
    }
}
