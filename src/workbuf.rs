//! Work buffer pool (spec.md 4.2): page-sized arrays of pending
//! [`Object`]s, pooled on two LIFOs (`full`, `empty`) so scanning workers
//! can hand load to and steal load from each other without per-object
//! synchronization.
//!
//! spec.md section 5 and 9 treat the LIFOs' ABA-safe lock-free push/pop
//! as provided by an external `lfstack` primitive. We stand that in with
//! a `parking_lot::Mutex`-guarded `Vec` acting as a Treiber stack: the
//! mutex gives the same linearizable push/pop contract (spec.md P7)
//! without hand-rolled tagged-pointer reclamation, which is out of
//! proportion for this crate's scope (see DESIGN.md).

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::object::Object;
use crate::stats::GcStats;

/// Objects per work buffer. Chosen so one buffer is a page's worth of
/// `Object` entries, matching spec.md's "page-sized capacity".
pub const WORKBUF_CAP: usize = 512;

/// Handoff moves objects once the local buffer holds more than this.
const HANDOFF_THRESHOLD: usize = 4;

pub struct WorkBuf {
    objs: Vec<Object>,
}

impl WorkBuf {
    fn empty() -> Self {
        Self {
            objs: Vec::with_capacity(WORKBUF_CAP),
        }
    }


    pub fn len(&self) -> usize {
        self.objs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.objs.len() >= WORKBUF_CAP
    }

    pub fn push(&mut self, obj: Object) {
        debug_assert!(!self.is_full(), "work buffer overflow");
        self.objs.push(obj);
    }

    pub fn pop(&mut self) -> Option<Object> {
        self.objs.pop()
    }
}

impl Default for WorkBuf {
    fn default() -> Self {
        Self::empty()
    }
}

struct Lifo {
    items: Mutex<Vec<Box<WorkBuf>>>,
}

impl Lifo {
    fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, buf: Box<WorkBuf>) {
        self.items.lock().push(buf);
    }

    fn pop(&self) -> Option<Box<WorkBuf>> {
        self.items.lock().pop()
    }

    fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

/// Backing chunk allocator for fresh buffers: a `1 MiB` arena carved into
/// `WorkBuf`s under a mutex (spec.md 4.2 `get_empty`).
struct ChunkAllocator {
    lock: Mutex<()>,
}

const CHUNK_BYTES: usize = 1 << 20;
#[allow(dead_code)]
const BUFS_PER_CHUNK: usize = CHUNK_BYTES / (WORKBUF_CAP * std::mem::size_of::<Object>());

impl ChunkAllocator {
    fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    /// Carves one fresh buffer "from a chunk". We don't need to actually
    /// track chunk boundaries (the buffers aren't placed in a shared
    /// arena mutators read), only to serialize the (conceptual) carve so
    /// concurrent `get_empty` calls agree on chunk accounting.
    fn carve(&self) -> Box<WorkBuf> {
        let _guard = self.lock.lock();
        Box::new(WorkBuf::empty())
    }
}

/// Coordinates `nproc` scanning workers draining a shared pool of work
/// buffers: two LIFOs (`full`, `empty`), a termination vote (`nwait`),
/// and the three-stage backoff `get_full` uses while waiting for more
/// work to appear.
pub struct WorkPool {
    full: Lifo,
    empty: Lifo,
    chunks: ChunkAllocator,
    nwait: AtomicUsize,
    nproc: usize,
    done_mutex: Mutex<()>,
    done_cv: Condvar,
}

/// Outcome of [`WorkPool::get_full`].
pub enum GetFull {
    Buf(Box<WorkBuf>),
    /// All `nproc` workers are waiting and `full` is empty: the mark
    /// phase has drained completely.
    Done,
}

impl WorkPool {
    pub fn new(nproc: usize) -> Self {
        Self {
            full: Lifo::new(),
            empty: Lifo::new(),
            chunks: ChunkAllocator::new(),
            nwait: AtomicUsize::new(0),
            nproc: nproc.max(1),
            done_mutex: Mutex::new(()),
            done_cv: Condvar::new(),
        }
    }

    pub fn reset(&self) {
        self.nwait.store(0, Ordering::SeqCst);
        while self.full.pop().is_some() {}
        while self.empty.pop().is_some() {}
    }

    /// Pushes `b` onto `full` (if given), pops a buffer from `empty` (or
    /// carves a fresh one from the chunk allocator if `empty` is dry).
    pub fn get_empty(&self, b: Option<Box<WorkBuf>>) -> Box<WorkBuf> {
        if let Some(b) = b {
            self.full.push(b);
            self.wake_waiters();
        }
        self.empty.pop().unwrap_or_else(|| self.chunks.carve())
    }

    /// Pushes `b` onto `empty`, pops a buffer from `full`. If `full` is
    /// dry and other workers remain, spins/yields/sleeps until either
    /// `full` refills or every worker is waiting (termination). A buffer
    /// picked up after this worker had to wait counts as a steal
    /// (`nsteal`/`steal_objs`), distinct from `nhandoff` on the donating
    /// side.
    pub fn get_full(&self, b: Box<WorkBuf>, stats: &GcStats) -> GetFull {
        self.empty.push(b);
        if let Some(buf) = self.full.pop() {
            return GetFull::Buf(buf);
        }
        self.nwait.fetch_add(1, Ordering::SeqCst);
        stats.getfull.fetch_add(1, Ordering::Relaxed);
        loop {
            if let Some(buf) = self.full.pop() {
                self.nwait.fetch_sub(1, Ordering::SeqCst);
                stats.nsteal.fetch_add(1, Ordering::Relaxed);
                stats.steal_objs.fetch_add(buf.len() as u64, Ordering::Relaxed);
                return GetFull::Buf(buf);
            }
            if self.nwait.load(Ordering::SeqCst) == self.nproc {
                self.wake_waiters();
                return GetFull::Done;
            }
            self.backoff(stats);
        }
    }

    /// Three-stage backoff: 20 spin-yields, then an OS yield, then a
    /// short sleep. spec.md P9.
    fn backoff(&self, stats: &GcStats) {
        for _ in 0..20 {
            if !self.full.is_empty() || self.nwait.load(Ordering::SeqCst) == self.nproc {
                return;
            }
            std::hint::spin_loop();
            stats.nprocyield.fetch_add(1, Ordering::Relaxed);
        }
        std::thread::yield_now();
        stats.nosyield.fetch_add(1, Ordering::Relaxed);
        if !self.full.is_empty() || self.nwait.load(Ordering::SeqCst) == self.nproc {
            return;
        }
        let guard = self.done_mutex.lock();
        self.done_cv.wait_for(&mut { guard }, Duration::from_micros(100));
        stats.nsleep.fetch_add(1, Ordering::Relaxed);
    }

    fn wake_waiters(&self) {
        let _guard = self.done_mutex.lock();
        self.done_cv.notify_all();
    }

    pub fn put_empty(&self, b: Box<WorkBuf>) {
        self.empty.push(b);
    }

    /// Moves half (rounded down) of `b`'s objects into a fresh buffer,
    /// pushes `b` (with the remainder) onto `full`, and returns the
    /// fresh buffer for the caller to keep working from. spec.md P8.
    pub fn handoff(&self, mut b: Box<WorkBuf>, stats: &GcStats) -> Box<WorkBuf> {
        let mut fresh = self.get_empty(None);
        let move_count = b.len() / 2;
        for _ in 0..move_count {
            if let Some(obj) = b.objs.pop() {
                fresh.push(obj);
            }
        }
        stats.nhandoff.fetch_add(1, Ordering::Relaxed);
        stats
            .handoff_objs
            .fetch_add(move_count as u64, Ordering::Relaxed);
        self.full.push(b);
        self.wake_waiters();
        fresh
    }

    /// Whether handoff conditions hold for a worker's local buffer
    /// (spec.md 4.2: `nwait > 0 ∧ local_nobj > threshold ∧ full empty`).
    pub fn should_handoff(&self, local_nobj: usize) -> bool {
        self.nwait.load(Ordering::SeqCst) > 0
            && local_nobj > HANDOFF_THRESHOLD
            && self.full.is_empty()
    }

    pub fn nwait(&self) -> usize {
        self.nwait.load(Ordering::SeqCst)
    }

    pub fn full_len(&self) -> usize {
        self.full.len()
    }

    pub fn empty_len(&self) -> usize {
        self.empty.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;

    #[test]
    fn handoff_moves_half_rounded_down() {
        let pool = WorkPool::new(2);
        let stats = GcStats::default();
        let mut buf = Box::new(WorkBuf::empty());
        for i in 0..7 {
            buf.push(Object::new(i, 8, 0));
        }
        let fresh = pool.handoff(buf, &stats);
        assert_eq!(fresh.len(), 3);
    }

    #[test]
    fn get_full_counts_a_steal_after_waiting() {
        let pool = std::sync::Arc::new(WorkPool::new(2));
        let stats = std::sync::Arc::new(GcStats::default());
        let pool2 = pool.clone();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let mut buf = Box::new(WorkBuf::empty());
            buf.push(Object::new(1, 8, 0));
            pool2.get_empty(Some(buf));
        });

        let waiting = Box::new(WorkBuf::empty());
        match pool.get_full(waiting, &stats) {
            GetFull::Buf(buf) => assert_eq!(buf.len(), 1),
            GetFull::Done => panic!("expected a stolen buffer, not termination"),
        }
        producer.join().unwrap();

        assert_eq!(stats.nsteal.load(Ordering::Relaxed), 1);
        assert_eq!(stats.steal_objs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn get_full_reports_done_when_all_wait() {
        let pool = WorkPool::new(1);
        let stats = GcStats::default();
        let buf = Box::new(WorkBuf::empty());
        match pool.get_full(buf, &stats) {
            GetFull::Done => {}
            GetFull::Buf(_) => panic!("expected termination"),
        }
    }

    #[test]
    fn get_empty_carves_fresh_buffer_when_pool_dry() {
        let pool = WorkPool::new(1);
        let buf = pool.get_empty(None);
        assert!(buf.is_empty());
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut buf = WorkBuf::empty();
        buf.push(Object::new(1, 8, 0));
        buf.push(Object::new(2, 8, 0));
        assert_eq!(buf.pop().unwrap().base, 2);
        assert_eq!(buf.pop().unwrap().base, 1);
        assert!(buf.pop().is_none());
    }
}
