//! End-to-end scenarios (spec.md section 8) exercised against a full
//! `Collector` cycle instead of one subsystem in isolation.

mod support;

use std::sync::atomic::Ordering;

use support::{MockPageHeap, MockRootProvider, WORD_BYTES};
use stw_gc::{scan::ChanHeader, Collector, GcProgram, Object, Op, ProgramTable};

struct Arena {
    heap: MockPageHeap,
    high_water: usize,
}

impl Arena {
    fn new() -> Self {
        Self {
            heap: MockPageHeap::new(),
            high_water: 0,
        }
    }

    fn alloc(&mut self, size: usize) -> usize {
        let base = self.heap.alloc(size, 1, size);
        self.high_water = self.high_water.max(base + size);
        base
    }
}

fn finish<R: stw_gc::RootProvider>(arena: Arena, roots: R, programs: ProgramTable) -> Collector<MockPageHeap, R> {
    let collector = Collector::new(arena.heap, roots, programs);
    collector.bitmap().map_bits(arena.high_water);
    collector
}

#[test]
fn unreachable_linear_chain_is_fully_collected() {
    let mut arena = Arena::new();
    let mut blocks = Vec::new();
    for _ in 0..100 {
        blocks.push(arena.alloc(3 * WORD_BYTES));
    }
    for i in 0..99 {
        unsafe { *(blocks[i] as *mut usize) = blocks[i + 1] };
    }

    let mut programs = ProgramTable::new();
    // Program ids double as the low bits of `ti` alongside the precise/loop
    // flags (object.rs `program_ref` masks off bits 0-1), so ids must be
    // multiples of 4.
    programs.register(4, GcProgram::new(3 * WORD_BYTES, vec![Op::Ptr { off: 0, ti: 4 }, Op::End]));

    // No root is retained: the chain's head was dropped.
    let roots = MockRootProvider::new();
    let collector = finish(arena, roots, programs);
    for b in &blocks {
        collector.bitmap().mark_allocated(*b, 3 * WORD_BYTES, false, true);
    }

    assert!(collector.collect(true, 2));
    for b in &blocks {
        assert!(!collector.bitmap().read(*b).allocated, "block {b:#x} should have been freed");
    }

    let mut stats = stw_gc::controller::MemStats::default();
    collector.read_mem_stats(&mut stats);
    assert_eq!(stats.heap_objects, 0);
}

#[test]
fn reference_cycle_survives_while_rooted_then_collects_once_dropped() {
    let mut arena = Arena::new();
    let a = arena.alloc(WORD_BYTES);
    let b = arena.alloc(WORD_BYTES);
    unsafe {
        *(a as *mut usize) = b;
        *(b as *mut usize) = a;
    }

    let mut programs = ProgramTable::new();
    programs.register(4, GcProgram::new(WORD_BYTES, vec![Op::Ptr { off: 0, ti: 4 }, Op::End]));

    let roots = MockRootProvider::new();
    roots.add_global(Object::new(a, WORD_BYTES, 4));
    let collector = finish(arena, roots, programs);
    collector.bitmap().mark_allocated(a, WORD_BYTES, false, true);
    collector.bitmap().mark_allocated(b, WORD_BYTES, false, true);

    // Both sides of the cycle are reachable through the single root on
    // `a`; the mark-bit fixpoint must terminate instead of looping
    // forever on the a -> b -> a reference.
    assert!(collector.collect(true, 2));
    assert!(collector.bitmap().read(a).allocated);
    assert!(collector.bitmap().read(b).allocated);

    // Drop the root and run again: with nothing left pointing at the
    // cycle, both blocks come down together.
    collector.root_provider().clear();
    assert!(collector.collect(true, 2));
    assert!(!collector.bitmap().read(a).allocated);
    assert!(!collector.bitmap().read(b).allocated);
}

#[test]
fn interior_pointer_keeps_target_block_alive() {
    let mut arena = Arena::new();
    let target = arena.alloc(64 * WORD_BYTES);
    let holder = arena.alloc(WORD_BYTES);
    // A mid-word, unaligned interior pointer 17 bytes into `target`.
    unsafe { *(holder as *mut usize) = target + 17 };

    let mut programs = ProgramTable::new();
    programs.register(4, GcProgram::new(WORD_BYTES, vec![Op::Ptr { off: 0, ti: 0 }, Op::End]));

    let roots = MockRootProvider::new();
    roots.add_global(Object::new(holder, WORD_BYTES, 4));
    let collector = finish(arena, roots, programs);
    collector.bitmap().mark_allocated(target, 64 * WORD_BYTES, false, true);
    collector.bitmap().mark_allocated(holder, WORD_BYTES, false, true);

    assert!(collector.collect(true, 1));
    assert!(collector.bitmap().read(target).allocated, "interior pointer must keep the block alive");
}

#[test]
fn finalizer_resurrects_then_a_later_cycle_frees() {
    let mut arena = Arena::new();
    let target = arena.alloc(WORD_BYTES);
    let ran = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let roots = MockRootProvider::new();
    let collector = finish(arena, roots, ProgramTable::new());
    collector.bitmap().mark_allocated(target, WORD_BYTES, false, true);
    collector.bitmap().set_block_special(target, true, true);
    let ran_clone = ran.clone();
    collector.finalizers().register(
        target,
        std::sync::Arc::new(move |_| {
            ran_clone.fetch_add(1, Ordering::Relaxed);
        }),
        0,
    );

    assert!(collector.collect(true, 1));
    assert_eq!(ran.load(Ordering::Relaxed), 1, "finalizer must run once resurrected");
    assert!(collector.bitmap().read(target).allocated, "B survives the cycle that resurrects it");

    assert!(collector.collect(true, 1));
    assert!(!collector.bitmap().read(target).allocated, "a later cycle frees B once the finalizer has dropped it");
}

#[test]
fn channel_buffer_scan_marks_every_queued_pointer() {
    let mut arena = Arena::new();
    let chan = arena.alloc(std::mem::size_of::<ChanHeader>());
    let targets: Vec<usize> = (0..3).map(|_| arena.alloc(WORD_BYTES)).collect();
    let buf = arena.alloc(8 * WORD_BYTES);
    for (i, t) in targets.iter().enumerate() {
        unsafe { *((buf + i * WORD_BYTES) as *mut usize) = *t };
    }
    unsafe {
        let hdr = chan as *mut ChanHeader;
        (*hdr).qcount = 3;
        (*hdr).dataqsiz = 8;
        (*hdr).buf = buf;
        (*hdr).elemsize = WORD_BYTES;
        (*hdr).elem_ti = 8;
    }

    let mut programs = ProgramTable::new();
    programs.register(4, GcProgram::new(std::mem::size_of::<ChanHeader>(), vec![Op::Chan, Op::End]));
    programs.register(8, GcProgram::new(WORD_BYTES, vec![Op::Ptr { off: 0, ti: 0 }, Op::End]));

    let roots = MockRootProvider::new();
    roots.add_global(Object::new(chan, std::mem::size_of::<ChanHeader>(), 4));
    let collector = finish(arena, roots, programs);
    collector.bitmap().mark_allocated(chan, std::mem::size_of::<ChanHeader>(), false, true);
    for t in &targets {
        collector.bitmap().mark_allocated(*t, WORD_BYTES, false, true);
    }

    assert!(collector.collect(true, 1));
    // Targets must have survived (still allocated); Marked is cleared by sweep.
    for t in &targets {
        assert!(collector.bitmap().read(*t).allocated, "channel-buffer target {t:#x} was not kept alive");
    }
}

#[test]
fn imprecise_block_triggers_rescan_and_marks_its_referent() {
    let mut arena = Arena::new();
    let nominal = 3 * WORD_BYTES;
    let block = arena.alloc(nominal + WORD_BYTES);
    let referent = arena.alloc(WORD_BYTES);
    unsafe { *((block + nominal) as *mut usize) = referent };

    let roots = MockRootProvider::new();
    // ti = 0: no type info at all, forcing the fully conservative path.
    roots.add_global(Object::new(block, nominal + WORD_BYTES, 0));
    let collector = finish(arena, roots, ProgramTable::new());
    collector.bitmap().mark_allocated(block, nominal + WORD_BYTES, false, true);
    collector.bitmap().mark_allocated(referent, WORD_BYTES, false, true);

    assert!(collector.collect(true, 1));
    assert!(collector.bitmap().read(referent).allocated, "conservative scan must find the trailing pointer");
    assert_eq!(collector.stats().rescan.load(Ordering::Relaxed), 1);
    assert_eq!(
        collector.stats().rescanbytes.load(Ordering::Relaxed),
        (nominal + WORD_BYTES) as u64
    );
}
