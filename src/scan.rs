//! The marking engine (spec.md 4.3): `scanblock`'s opcode interpreter,
//! its intermediate pointer/object buffers, and `markonly`.
//!
//! A worker thread owns a [`ScanWorker`]: a local, in-progress
//! [`WorkBuf`] plus the bounded `ptrbuf`/`objbuf` staging areas
//! `flush_ptrbuf`/`flush_objbuf` drain into it. Cross-worker
//! coordination (handoff, stealing, termination) goes through the
//! [`WorkPool`] shared by every worker.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bitmap::{MarkBitmap, WORD_BYTES};
use crate::error::throw;
use crate::finalizer::FinalizerQueue;
use crate::object::{GcProgram, Object, Op, LOOP_BIT, PRECISE_BIT};
use crate::span::{PageHeap, SpanState};
use crate::stats::GcStats;
use crate::workbuf::{GetFull, WorkBuf, WorkPool};

/// Pointer candidate not yet resolved to a block header (spec.md 4.3.2
/// `ptrbuf`), staged by `Op::Ptr`/`APtr`/`StringPtr`/`EFace`/`IFace`.
const PTRBUF_CAP: usize = 64;
/// Known-live regions staged by `Op::Region`/`MapNext`/`Chan` (spec.md
/// 4.3.4), bypassing bitmap resolution entirely.
const OBJBUF_CAP: usize = 64;

/// One map key or value slot yielded by a [`GcMap`] iterator.
#[derive(Debug, Clone, Copy)]
pub enum MapSlot {
    None,
    /// Out-of-line: `addr` is a pointer to a separately allocated block,
    /// resolved and marked like any other discovered pointer.
    Indirect { addr: usize, ti: usize },
    /// Stored inline in the bucket: a known-live region, not a pointer
    /// needing bitmap resolution.
    Direct { base: usize, size: usize, ti: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct MapEntry {
    pub key: MapSlot,
    pub val: MapSlot,
}

/// A hashmap's bucket layout, external to the collector (spec.md 4.3.5
/// `GC_MAP_PTR`/`GC_MAP_NEXT`): the allocator binding supplies one
/// implementation per map type and registers it under that type's
/// `maptype` id.
pub trait GcMap: Send + Sync {
    fn entries(&self, hmap: usize) -> Vec<MapEntry>;
    /// Sub-tables (overflow buckets) reachable from `hmap` that must be
    /// `markonly`'d but never enqueued for scanning themselves.
    fn subtables(&self, hmap: usize) -> Vec<usize> {
        let _ = hmap;
        Vec::new()
    }
}

/// Fixed layout `MapPtr`/`Chan` read directly off the heap: `(qcount,
/// dataqsiz, buf, elemsize, elem_ti)`, mirroring Go's `Hchan` header
/// closely enough for `GC_CHAN`'s purposes.
#[repr(C)]
pub struct ChanHeader {
    pub qcount: usize,
    pub dataqsiz: usize,
    pub buf: usize,
    pub elemsize: usize,
    pub elem_ti: usize,
}

/// Registry of GC programs (keyed by the `ti` program-ref a pointer
/// carries) and map-type iterators (keyed by `Op::MapPtr`'s `maptype`).
/// Populated once by the runtime binding before a cycle starts.
#[derive(Default)]
pub struct ProgramTable {
    programs: HashMap<usize, GcProgram>,
    maps: HashMap<usize, Arc<dyn GcMap>>,
}

impl ProgramTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: usize, program: GcProgram) {
        self.programs.insert(id, program);
    }

    pub fn register_map(&mut self, maptype: usize, map: Arc<dyn GcMap>) {
        self.maps.insert(maptype, map);
    }

    pub fn resolve(&self, id: usize) -> Option<&GcProgram> {
        if id == 0 {
            None
        } else {
            self.programs.get(&id)
        }
    }

    /// Type lookup fallback (spec.md 4.3.5): when a pointer target has no
    /// type info of its own, ask the span it lives in.
    fn resolve_by_span(&self, addr: usize, page_heap: &dyn PageHeap, stats: &GcStats) -> Option<&GcProgram> {
        stats.typelookup.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let idx = page_heap.span_index_for(addr)?;
        let span = page_heap.span(idx);
        if !span.types.is_rootable() && matches!(span.types, crate::span::TypeTable::Empty) {
            stats.notype.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return None;
        }
        let elem = span.element_index(span.header_for(addr)?);
        let ti = span.types.lookup(elem);
        self.resolve(ti)
    }
}

/// State shared read-only (plus the one mark mutex) across every
/// scanning worker for one cycle.
pub struct MarkShared<'a> {
    pub bitmap: &'a MarkBitmap,
    pub page_heap: &'a dyn PageHeap,
    pub finalizers: &'a FinalizerQueue,
    pub programs: &'a ProgramTable,
    pub stats: &'a GcStats,
    /// Serializes `markonly` calls issued outside the normal
    /// ptrbuf-resolution pipeline (map subtables, spec.md 4.3.6).
    mark_mutex: Mutex<()>,
}

impl<'a> MarkShared<'a> {
    pub fn new(
        bitmap: &'a MarkBitmap,
        page_heap: &'a dyn PageHeap,
        finalizers: &'a FinalizerQueue,
        programs: &'a ProgramTable,
        stats: &'a GcStats,
    ) -> Self {
        Self {
            bitmap,
            page_heap,
            finalizers,
            programs,
            stats,
            mark_mutex: Mutex::new(()),
        }
    }
}

/// Sets `Marked` on the block containing `p` without enqueueing it for
/// further scanning (spec.md 4.3.6). Used for map subtables, which are
/// reachable but contain no pointers worth walking themselves.
pub fn markonly(p: usize, shared: &MarkShared) {
    let _guard = shared.mark_mutex.lock();
    if let Some(header) = resolve_header(p, shared) {
        shared.bitmap.try_mark(header);
    }
}

/// Rounds `addr` down to a word, finds its containing span, and resolves
/// that to the block's header address — the span's own size-class
/// stride stands in for the backward bitmap-boundary scan spec.md 4.3.3
/// describes, since every small-object span already knows its stride.
fn resolve_header(addr: usize, shared: &MarkShared) -> Option<usize> {
    if addr < shared.bitmap.arena_start() || addr >= shared.page_heap.arena_used() {
        return None;
    }
    let word = crate::util::align_down(addr, WORD_BYTES);
    let idx = shared.page_heap.span_index_for(word)?;
    let span = shared.page_heap.span(idx);
    if span.state != SpanState::InUse {
        return None;
    }
    let header = span.header_for(word)?;
    if !shared.bitmap.read(header).allocated {
        return None;
    }
    Some(header)
}

unsafe fn read_word(addr: usize) -> usize {
    *(addr as *const usize)
}

/// Per-worker scanning state: the in-progress local buffer plus the two
/// bounded staging buffers `Op`s append candidates to.
pub struct ScanWorker<'a> {
    id: usize,
    pool: &'a WorkPool,
    local: Box<WorkBuf>,
    ptrbuf: Vec<(usize, usize)>,
    objbuf: Vec<Object>,
    map_iter: Vec<MapEntry>,
}

impl<'a> ScanWorker<'a> {
    pub fn new(id: usize, pool: &'a WorkPool) -> Self {
        Self {
            id,
            local: pool.get_empty(None),
            pool,
            ptrbuf: Vec::with_capacity(PTRBUF_CAP),
            objbuf: Vec::with_capacity(OBJBUF_CAP),
            map_iter: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn enqueue(&mut self, obj: Object, shared: &MarkShared) {
        if self.local.is_full() {
            let full = std::mem::take(&mut self.local);
            self.local = self.pool.get_empty(Some(full));
        }
        self.local.push(obj);
        if self.pool.should_handoff(self.local.len()) {
            self.local = self.pool.handoff(std::mem::take(&mut self.local), shared.stats);
        }
    }

    fn emit_ptr(&mut self, addr: usize, ti: usize, shared: &MarkShared) {
        if addr == 0 {
            return;
        }
        self.ptrbuf.push((addr, ti));
        if self.ptrbuf.len() >= PTRBUF_CAP {
            self.flush_ptrbuf(shared);
        }
    }

    fn emit_region(&mut self, base: usize, size: usize, ti: usize, shared: &MarkShared) {
        if base == 0 || size == 0 {
            return;
        }
        self.objbuf.push(Object::new(base, size, ti));
        if self.objbuf.len() >= OBJBUF_CAP {
            self.flush_objbuf(shared);
        }
    }

    /// Resolves every staged candidate to a block header, marks it, and
    /// enqueues the surviving (pointer-bearing) ones (spec.md 4.3.3).
    fn flush_ptrbuf(&mut self, shared: &MarkShared) {
        for (addr, ti) in self.ptrbuf.drain(..) {
            let Some(header) = resolve_header(addr, shared) else {
                continue;
            };
            if !shared.bitmap.try_mark(header) {
                continue;
            }
            let bits = shared.bitmap.read(header);
            if bits.no_pointers() {
                continue;
            }
            let idx = match shared.page_heap.span_index_for(header) {
                Some(i) => i,
                None => continue,
            };
            let span = shared.page_heap.span(idx);
            let len = if span.is_large() { span.bytes } else { span.elemsize };
            self.enqueue(Object::new(header, len, ti), shared);
        }
    }

    fn flush_objbuf(&mut self, shared: &MarkShared) {
        for obj in self.objbuf.drain(..) {
            self.enqueue(obj, shared);
        }
    }

    fn flush_all(&mut self, shared: &MarkShared) {
        self.flush_ptrbuf(shared);
        self.flush_objbuf(shared);
    }

    /// Seeds the local buffer directly with root objects (spec.md 4.4),
    /// bypassing bitmap resolution since roots are known live by
    /// construction.
    pub fn seed(&mut self, roots: Vec<Object>, shared: &MarkShared) {
        for r in roots {
            self.enqueue(r, shared);
        }
        self.flush_all(shared);
    }
}

#[derive(Debug, Clone, Copy)]
enum FrameKind {
    Call,
    Array {
        loop_pc: usize,
        remaining: usize,
        elemsize: usize,
    },
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    kind: FrameKind,
    ret_pc: usize,
    saved_base: usize,
}

/// Runs one GC program starting at `base`, emitting every pointer and
/// known-live region it names (spec.md 4.3.5). `ops` must end in
/// [`Op::End`]; array bodies loop back via [`Op::ArrayNext`].
fn run_program(ops: &[Op], mut base: usize, worker: &mut ScanWorker, shared: &MarkShared) {
    let mut frames: Vec<Frame> = Vec::new();
    let mut pc = 0usize;
    loop {
        if pc >= ops.len() {
            throw("scan: program ran past its end without End");
        }
        match ops[pc] {
            Op::Ptr { off, ti } => {
                worker.emit_ptr(unsafe { read_word(base + off) }, ti, shared);
                pc += 1;
            }
            Op::APtr { off } => {
                worker.emit_ptr(unsafe { read_word(base + off) }, 0, shared);
                pc += 1;
            }
            Op::StringPtr { off } => {
                let data = unsafe { read_word(base + off) };
                worker.emit_ptr(data, 0, shared);
                pc += 1;
            }
            Op::Slice { off, ti } => {
                let array = unsafe { read_word(base + off) };
                let cap = unsafe { read_word(base + off + 2 * WORD_BYTES) };
                if array != 0 && cap != 0 {
                    worker.emit_ptr(array, ti | PRECISE_BIT | LOOP_BIT, shared);
                }
                pc += 1;
            }
            Op::EFace { off } => {
                scan_eface(base + off, worker, shared);
                pc += 1;
            }
            Op::IFace { off } => {
                scan_iface(base + off, worker, shared);
                pc += 1;
            }
            Op::ArrayStart { off, count, elemsize } => {
                if count == 0 {
                    pc += 1;
                    continue;
                }
                frames.push(Frame {
                    kind: FrameKind::Array {
                        loop_pc: pc + 1,
                        remaining: count,
                        elemsize,
                    },
                    ret_pc: pc + 1,
                    saved_base: base,
                });
                base += off;
                pc += 1;
            }
            Op::ArrayNext => {
                let frame = frames
                    .last_mut()
                    .unwrap_or_else(|| throw("scan: ArrayNext without matching ArrayStart"));
                match &mut frame.kind {
                    FrameKind::Array {
                        loop_pc,
                        remaining,
                        elemsize,
                    } => {
                        *remaining -= 1;
                        if *remaining > 0 {
                            base += *elemsize;
                            pc = *loop_pc;
                        } else {
                            let f = frames.pop().unwrap();
                            base = f.saved_base;
                            pc += 1;
                        }
                    }
                    FrameKind::Call => throw("scan: ArrayNext inside a call frame"),
                }
            }
            Op::Call { off, disp } => {
                frames.push(Frame {
                    kind: FrameKind::Call,
                    ret_pc: pc + 1,
                    saved_base: base,
                });
                base += off;
                pc = (pc as isize + disp) as usize;
            }
            Op::Region { off, size, ti } => {
                worker.emit_region(base + off, size, ti, shared);
                pc += 1;
            }
            Op::MapPtr { off, maptype } => {
                let hmap = unsafe { read_word(base + off) };
                worker.map_iter.clear();
                let header = if hmap != 0 { resolve_header(hmap, shared) } else { None };
                if let Some(header) = header {
                    if shared.bitmap.try_mark(header) {
                        if let Some(map) = shared.programs.maps.get(&maptype) {
                            for sub in map.subtables(hmap) {
                                markonly(sub, shared);
                            }
                            worker.map_iter = map.entries(hmap);
                        }
                    }
                }
                pc += 1;
            }
            Op::MapNext => {
                for entry in std::mem::take(&mut worker.map_iter) {
                    emit_slot(entry.key, worker, shared);
                    emit_slot(entry.val, worker, shared);
                }
                pc += 1;
            }
            Op::Chan => {
                let hdr = unsafe { &*(base as *const ChanHeader) };
                if hdr.elem_ti != 0 && hdr.dataqsiz > 0 && hdr.buf != 0 {
                    worker.emit_region(
                        hdr.buf,
                        hdr.dataqsiz * hdr.elemsize,
                        hdr.elem_ti | PRECISE_BIT | LOOP_BIT,
                        shared,
                    );
                }
                pc += 1;
            }
            Op::DefaultPtr => {
                pc += 1;
            }
            Op::End => match frames.pop() {
                Some(f) => {
                    base = f.saved_base;
                    pc = f.ret_pc;
                }
                None => return,
            },
        }
    }
}

fn emit_slot(slot: MapSlot, worker: &mut ScanWorker, shared: &MarkShared) {
    match slot {
        MapSlot::None => {}
        MapSlot::Indirect { addr, ti } => worker.emit_ptr(addr, ti, shared),
        MapSlot::Direct { base, size, ti } => worker.emit_region(base, size, ti, shared),
    }
}

fn scan_eface(addr: usize, worker: &mut ScanWorker, shared: &MarkShared) {
    let tword = unsafe { read_word(addr) };
    let dword = unsafe { read_word(addr + WORD_BYTES) };
    if tword == 0 || dword == 0 {
        return;
    }
    worker.emit_ptr(dword, 0, shared);
}

fn scan_iface(addr: usize, worker: &mut ScanWorker, shared: &MarkShared) {
    let dword = unsafe { read_word(addr + WORD_BYTES) };
    if dword != 0 {
        worker.emit_ptr(dword, 0, shared);
    }
}

/// Conservative fallback: every word in `[obj.base, obj.base+obj.len)`
/// is a candidate pointer (spec.md 4.3.5, `Op::DefaultPtr`'s whole-block
/// form, used when no type info is available at all). Scanning a block
/// this way means its precise layout wasn't known, so it counts as a
/// rescan (spec.md section 8 scenario 6, `gcstats.rescan`/`rescanbytes`).
fn scan_conservative(obj: Object, worker: &mut ScanWorker, shared: &MarkShared) {
    let mut addr = obj.base;
    let end = obj.base + obj.len;
    while addr + WORD_BYTES <= end {
        worker.emit_ptr(unsafe { read_word(addr) }, 0, shared);
        addr += WORD_BYTES;
    }
    shared.stats.rescan.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    shared
        .stats
        .rescanbytes
        .fetch_add(obj.len as u64, std::sync::atomic::Ordering::Relaxed);
}

/// Scans one object off the work queue (spec.md 4.3.1 `scanblock`'s
/// per-object body): picks the right GC program — the object's own
/// `ti`, a repeated-element program for slice/channel-buffer regions, a
/// span type-table lookup, or full conservative scanning — and runs it.
pub fn scanblock(obj: Object, worker: &mut ScanWorker, shared: &MarkShared) {
    let flags = obj.flags();
    if flags.loop_ {
        let Some(prog) = shared.programs.resolve(obj.program_ref()) else {
            scan_conservative(obj, worker, shared);
            return;
        };
        if prog.elemsize == 0 {
            return;
        }
        let end = obj.base + obj.len;
        let mut base = obj.base;
        while base + prog.elemsize <= end {
            run_program(&prog.ops, base, worker, shared);
            base += prog.elemsize;
        }
        return;
    }

    if obj.ti != 0 {
        if let Some(prog) = shared.programs.resolve(obj.program_ref()) {
            run_program(&prog.ops, obj.base, worker, shared);
            return;
        }
    }

    if let Some(prog) = shared.programs.resolve_by_span(obj.base, shared.page_heap, shared.stats) {
        run_program(&prog.ops, obj.base, worker, shared);
        return;
    }

    scan_conservative(obj, worker, shared);
}

/// Drives one worker's share of the mark phase: pulls buffers from the
/// shared pool and scans every object in them until the pool reports
/// every worker has gone idle (spec.md 4.2/4.6).
pub fn run_worker(id: usize, pool: &WorkPool, shared: &MarkShared, roots: Vec<Object>) {
    let mut worker = ScanWorker::new(id, pool);
    worker.seed(roots, shared);
    loop {
        match worker.local.pop() {
            Some(obj) => scanblock(obj, &mut worker, shared),
            None => {
                worker.flush_all(shared);
                let empty = std::mem::take(&mut worker.local);
                match pool.get_full(empty, shared.stats) {
                    GetFull::Buf(full) => worker.local = full,
                    GetFull::Done => return,
                }
            }
        }
    }
}
