//! Finalizer registration and queueing (spec.md section 3 "Finalizer
//! block", 4.5 `handle_special`). Running a queued finalizer is the
//! consuming finalizer-runner task's job (out of scope, spec.md section
//! 1); this module only tracks registrations and hands a drained queue
//! to that task.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A finalizer callback. Boxed/`Arc`'d rather than a bare function
/// pointer so Rust closures over captured state can register directly,
/// unlike the C function pointer `mgc0.c` uses.
pub type FinalizerFn = Arc<dyn Fn(usize) + Send + Sync>;

struct Registration {
    func: FinalizerFn,
    nret: usize,
}

/// One runnable finalizer, as handed to the finalizer-runner task.
#[derive(Clone)]
pub struct QueuedFinalizer {
    pub func: FinalizerFn,
    pub arg: usize,
    pub nret: usize,
}

/// The collector's view of finalizers: `pending` tracks blocks with a
/// live, not-yet-triggered registration (the `Special` bit mirrors
/// membership in this map); `finq` is the to-run queue a sweep appends
/// to and the runner task drains.
pub struct FinalizerQueue {
    pending: Mutex<HashMap<usize, Registration>>,
    finq: Mutex<VecDeque<QueuedFinalizer>>,
    fingwait: AtomicBool,
}

impl FinalizerQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            finq: Mutex::new(VecDeque::new()),
            fingwait: AtomicBool::new(false),
        }
    }

    /// Registers a finalizer for the block at `target`. The caller
    /// (allocator binding) is responsible for also calling
    /// `bitmap.set_block_special(target, true, ..)`.
    pub fn register(&self, target: usize, func: FinalizerFn, nret: usize) {
        self.pending.lock().insert(target, Registration { func, nret });
    }

    pub fn unregister(&self, target: usize) -> bool {
        self.pending.lock().remove(&target).is_some()
    }

    pub fn has_pending(&self, target: usize) -> bool {
        self.pending.lock().contains_key(&target)
    }

    /// All blocks with a still-pending (not yet enqueued) registration:
    /// rooted every cycle so finalization can observe a live object
    /// (spec.md 4.4 "Finalizer targets").
    pub fn pending_targets(&self) -> Vec<usize> {
        self.pending.lock().keys().copied().collect()
    }

    /// `arg` of every finalizer already moved to `finq` but not yet run:
    /// still needs to be kept alive (spec.md 4.4 "Finalizer block
    /// storage").
    pub fn queued_targets(&self) -> Vec<usize> {
        self.finq.lock().iter().map(|q| q.arg).collect()
    }

    /// `handle_special(p, size)` (spec.md 4.5): moves `p`'s registration
    /// (if any) from `pending` into `finq`. Returns whether a finalizer
    /// was enqueued; the sweeper must not free `p` when this is `true`.
    pub fn handle_special(&self, p: usize) -> bool {
        let reg = self.pending.lock().remove(&p);
        match reg {
            Some(reg) => {
                self.finq.lock().push_back(QueuedFinalizer {
                    func: reg.func,
                    arg: p,
                    nret: reg.nret,
                });
                self.fingwait.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.finq.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.finq.lock().len()
    }

    /// Drains the whole to-run queue for the finalizer-runner task.
    pub fn drain(&self) -> Vec<QueuedFinalizer> {
        let mut finq = self.finq.lock();
        self.fingwait.store(false, Ordering::Release);
        finq.drain(..).collect()
    }

    pub fn runner_should_wake(&self) -> bool {
        self.fingwait.load(Ordering::Acquire)
    }
}

impl Default for FinalizerQueue {
    fn default() -> Self {
        Self::new()
    }
}
