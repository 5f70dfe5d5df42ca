//! `GOGC` / `GOGCTRACE` / `GOMAXGCPROCS` configuration (spec.md section 6,
//! SPEC_FULL.md 10.3). Read once lazily, with a programmatic override
//! path for `GOGC` matching `set_gc_percent`.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use crate::error::GcError;

/// `gcpercent < 0` disables collection entirely (`GOGC=off`).
pub const GC_PERCENT_DISABLED: i64 = -1;

pub struct GcConfig {
    gcpercent: AtomicI64,
    trace_level: AtomicUsize,
    max_gcproc: AtomicUsize,
    debug_mark: std::sync::atomic::AtomicBool,
    extra_trace: std::sync::atomic::AtomicBool,
}

impl GcConfig {
    fn from_env() -> Result<Self, GcError> {
        let gcpercent = match std::env::var("GOGC") {
            Ok(v) if v == "off" => GC_PERCENT_DISABLED,
            Ok(v) => v
                .parse::<i64>()
                .map_err(|_| GcError::Config(format!("GOGC: not an integer or 'off': {v:?}")))?,
            Err(_) => 100,
        };
        let trace_level = match std::env::var("GOGCTRACE") {
            Ok(v) => v
                .parse::<usize>()
                .map_err(|_| GcError::Config(format!("GOGCTRACE: not an integer: {v:?}")))?,
            Err(_) => 0,
        };
        let max_gcproc = match std::env::var("GOMAXGCPROCS") {
            Ok(v) => v
                .parse::<usize>()
                .map_err(|_| GcError::Config(format!("GOMAXGCPROCS: not an integer: {v:?}")))?
                .max(1),
            Err(_) => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };
        let debug_mark = std::env::var("GODEBUG_MARK").is_ok_and(|v| v == "1");
        let extra_trace = std::env::var("GOGCTRACE").map(|v| v == "2").unwrap_or(false);
        Ok(Self {
            gcpercent: AtomicI64::new(gcpercent),
            trace_level: AtomicUsize::new(trace_level),
            max_gcproc: AtomicUsize::new(max_gcproc),
            debug_mark: std::sync::atomic::AtomicBool::new(debug_mark),
            extra_trace: std::sync::atomic::AtomicBool::new(extra_trace),
        })
    }

    pub fn gcpercent(&self) -> i64 {
        self.gcpercent.load(Ordering::Relaxed)
    }

    pub fn trace_level(&self) -> usize {
        self.trace_level.load(Ordering::Relaxed)
    }

    pub fn max_gcproc(&self) -> usize {
        self.max_gcproc.load(Ordering::Relaxed)
    }

    /// Atomically swaps `gcpercent`, returning the old value
    /// (`set_gc_percent`, spec.md section 6). `new < 0` disables GC.
    pub fn set_gc_percent(&self, new: i64) -> i64 {
        self.gcpercent.swap(new, Ordering::SeqCst)
    }

    pub fn gc_disabled(&self) -> bool {
        self.gcpercent() < 0
    }

    /// Whether a single-threaded shadow-mark verification pass should run
    /// after every cycle's parallel mark phase (SPEC_FULL.md 11
    /// `DebugMark`). Off by default: it re-walks the whole live set.
    pub fn debug_mark(&self) -> bool {
        self.debug_mark.load(Ordering::Relaxed)
    }

    pub fn set_debug_mark(&self, on: bool) -> bool {
        self.debug_mark.swap(on, Ordering::SeqCst)
    }

    /// Whether per-object/per-span `trace!` logging is enabled in
    /// addition to the per-phase `debug!` lines (SPEC_FULL.md 10.1).
    pub fn extra_trace(&self) -> bool {
        self.extra_trace.load(Ordering::Relaxed)
    }

    pub fn set_extra_trace(&self, on: bool) -> bool {
        self.extra_trace.swap(on, Ordering::SeqCst)
    }

    /// Pacing trigger (spec.md 4.6 `Gate`): collect once `heap_alloc`
    /// reaches `next_gc`.
    pub fn next_gc(&self, heap_alloc: usize) -> usize {
        let pct = self.gcpercent().max(0) as u128;
        (heap_alloc as u128 * (100 + pct) / 100) as usize
    }
}

static CONFIG: once_cell::sync::OnceCell<GcConfig> = once_cell::sync::OnceCell::new();

/// Returns the process-wide configuration, parsing environment variables
/// on first access. Panics with a `GcError::Config` message if the
/// environment holds malformed values — this happens at most once, at
/// first use, not mid-cycle.
pub fn config() -> &'static GcConfig {
    CONFIG.get_or_init(|| GcConfig::from_env().unwrap_or_else(|e| panic!("{e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_next_gc_doubles_live_set() {
        let cfg = GcConfig {
            gcpercent: AtomicI64::new(100),
            trace_level: AtomicUsize::new(0),
            max_gcproc: AtomicUsize::new(1),
            debug_mark: std::sync::atomic::AtomicBool::new(false),
            extra_trace: std::sync::atomic::AtomicBool::new(false),
        };
        assert_eq!(cfg.next_gc(1000), 2000);
    }

    #[test]
    fn set_gc_percent_returns_old_value() {
        let cfg = GcConfig {
            gcpercent: AtomicI64::new(100),
            trace_level: AtomicUsize::new(0),
            max_gcproc: AtomicUsize::new(1),
            debug_mark: std::sync::atomic::AtomicBool::new(false),
            extra_trace: std::sync::atomic::AtomicBool::new(false),
        };
        let old = cfg.set_gc_percent(-1);
        assert_eq!(old, 100);
        assert!(cfg.gc_disabled());
    }
}
