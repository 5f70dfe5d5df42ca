//! The mark bitmap: a per-heap-word side table encoding allocation,
//! pointer-ness, block boundaries and mark state (spec.md section 3, 4.1).
//!
//! One **bitmap word** (`W` bytes, `8*W` bits) mirrors `K = 2*W` heap
//! words. Each heap word gets one bit in each of four role bands, the
//! bands laid out low-to-high across the bitmap word rather than
//! interleaved per-heap-word:
//!
//! ```text
//! bit index:  0 .. K      K .. 2K        2K .. 3K    3K .. 4K
//!             Allocated   NoPointers/     Marked      Special
//!                         BlockBoundary
//! ```
//!
//! so a single atomic load of one bitmap word yields every role bit for
//! `K` consecutive heap words. The conceptual address of the bitmap word
//! covering heap-word offset `off` is `arena_start - (off/K + 1) * W`
//! (spec.md P4); [`MarkBitmap::bitmap_word_address`] computes that address
//! as a pure function for testing, while the bits themselves live in a
//! growable backing store indexed by `off / K` (see [`map_bits`]).

use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::throw;

/// Native pointer-sized heap word, `W` in spec.md.
pub const WORD_BYTES: usize = std::mem::size_of::<usize>();
/// Heap words mirrored by one bitmap word.
pub const WORDS_PER_BITMAP_WORD: usize = 2 * WORD_BYTES;
/// Bits in one bitmap word (also `4 * WORDS_PER_BITMAP_WORD`).
const BITS_PER_BITMAP_WORD: usize = 8 * WORD_BYTES;

const ALLOCATED_BASE: usize = 0;
const SECOND_BASE: usize = WORDS_PER_BITMAP_WORD;
const MARKED_BASE: usize = 2 * WORDS_PER_BITMAP_WORD;
const SPECIAL_BASE: usize = 3 * WORDS_PER_BITMAP_WORD;

/// How many bitmap words [`MarkBitmap::map_bits`] grows the backing store
/// by at a time: `8192 * W` bytes of bitmap, i.e. 8192 bitmap words.
const MAP_CHUNK_WORDS: usize = 8192;

/// Decoded per-heap-word metadata nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bits {
    pub allocated: bool,
    /// `NoPointers` when `allocated`, `BlockBoundary` when not.
    pub second: bool,
    pub marked: bool,
    pub special: bool,
}

impl Bits {
    #[inline]
    pub fn no_pointers(self) -> bool {
        debug_assert!(self.allocated);
        self.second
    }

    #[inline]
    pub fn block_boundary(self) -> bool {
        debug_assert!(!self.allocated);
        self.second
    }
}

pub struct MarkBitmap {
    arena_start: AtomicUsize,
    words: RwLock<Vec<AtomicUsize>>,
}

impl MarkBitmap {
    pub fn new(arena_start: usize) -> Self {
        Self {
            arena_start: AtomicUsize::new(arena_start),
            words: RwLock::new(Vec::new()),
        }
    }

    pub fn arena_start(&self) -> usize {
        self.arena_start.load(Ordering::Relaxed)
    }

    /// Address a reader would compute for the bitmap word covering heap
    /// word offset `off`. Exercises spec.md P4 directly; the actual bit
    /// storage below is index-addressed, not pointer-addressed, but must
    /// agree on `(bw_index, shift)` with this formula.
    pub fn bitmap_word_address(&self, off: usize) -> usize {
        self.arena_start()
            - (off / WORDS_PER_BITMAP_WORD + 1) * WORD_BYTES
    }

    #[inline]
    fn indices(off: usize) -> (usize, usize) {
        (off / WORDS_PER_BITMAP_WORD, off % WORDS_PER_BITMAP_WORD)
    }

    fn word_offset(&self, addr: usize) -> usize {
        let start = self.arena_start();
        if addr < start {
            throw("bitmap: address before arena_start");
        }
        (addr - start) / WORD_BYTES
    }

    /// Ensures the backing store has room for heap offsets up to
    /// `arena_used`, growing in `MAP_CHUNK_WORDS`-sized steps the way
    /// spec.md 4.1 describes the bitmap's backing memory being mapped in
    /// `8192*W`-byte chunks.
    pub fn map_bits(&self, arena_used: usize) {
        let off = self.word_offset(arena_used.max(self.arena_start()));
        if off == 0 {
            return;
        }
        let needed = Self::indices(off - 1).0 + 1;
        let mut words = self.words.write();
        if words.len() >= needed {
            return;
        }
        let rounded = crate::util::align_up(needed, MAP_CHUNK_WORDS);
        words.resize_with(rounded, || AtomicUsize::new(0));
    }

    fn read_word(&self, bw_index: usize) -> usize {
        let words = self.words.read();
        match words.get(bw_index) {
            Some(w) => w.load(Ordering::Acquire),
            None => 0,
        }
    }

    /// Read-modify-write the bitmap word at `bw_index`. `atomic` selects
    /// between a CAS retry loop (concurrent marking/sweeping contexts)
    /// and a plain store (single-threaded contexts, e.g. inside
    /// `sweepspan`, which owns its span exclusively — spec.md 4.1/4.5).
    fn update_word(&self, bw_index: usize, atomic: bool, f: impl Fn(usize) -> usize) {
        let words = self.words.read();
        let slot = match words.get(bw_index) {
            Some(w) => w,
            None => throw("bitmap: write past mapped range"),
        };
        if !atomic {
            let cur = slot.load(Ordering::Relaxed);
            slot.store(f(cur), Ordering::Relaxed);
            return;
        }
        let mut cur = slot.load(Ordering::Acquire);
        loop {
            let next = f(cur);
            match slot.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    fn decode(word: usize, shift: usize) -> Bits {
        Bits {
            allocated: (word >> (ALLOCATED_BASE + shift)) & 1 != 0,
            second: (word >> (SECOND_BASE + shift)) & 1 != 0,
            marked: (word >> (MARKED_BASE + shift)) & 1 != 0,
            special: (word >> (SPECIAL_BASE + shift)) & 1 != 0,
        }
    }

    pub fn read(&self, addr: usize) -> Bits {
        let off = self.word_offset(addr);
        let (bw, shift) = Self::indices(off);
        Self::decode(self.read_word(bw), shift)
    }

    fn write(&self, addr: usize, atomic: bool, bits: Bits) {
        let off = self.word_offset(addr);
        let (bw, shift) = Self::indices(off);
        let clear_mask = !(1usize << (ALLOCATED_BASE + shift)
            | 1usize << (SECOND_BASE + shift)
            | 1usize << (MARKED_BASE + shift)
            | 1usize << (SPECIAL_BASE + shift));
        self.update_word(bw, atomic, move |cur| {
            let mut next = cur & clear_mask;
            if bits.allocated {
                next |= 1 << (ALLOCATED_BASE + shift);
            }
            if bits.second {
                next |= 1 << (SECOND_BASE + shift);
            }
            if bits.marked {
                next |= 1 << (MARKED_BASE + shift);
            }
            if bits.special {
                next |= 1 << (SPECIAL_BASE + shift);
            }
            next
        });
    }

    /// Marks the block header at `v` (byte length `n`) allocated. If
    /// `noptr`, the block is recorded as containing no pointers.
    pub fn mark_allocated(&self, v: usize, n: usize, noptr: bool, atomic: bool) {
        self.bounds_check(v, n);
        self.write(
            v,
            atomic,
            Bits {
                allocated: true,
                second: noptr,
                marked: false,
                special: false,
            },
        );
    }

    /// Marks the block header at `v` freed: clears every bit, then sets
    /// `BlockBoundary` (spec.md I1).
    pub fn mark_freed(&self, v: usize, n: usize, atomic: bool) {
        self.bounds_check(v, n);
        self.write(
            v,
            atomic,
            Bits {
                allocated: false,
                second: true,
                marked: false,
                special: false,
            },
        );
    }

    /// Returns whether the block header at `v` currently reads as freed
    /// (`Allocated = 0`). spec.md P5.
    pub fn check_freed(&self, v: usize, n: usize) -> bool {
        self.bounds_check(v, n);
        !self.read(v).allocated
    }

    /// Marks `n` block boundaries (`n+1` if `leftover`) at stride `size`
    /// starting at `v`, each written as a fresh `BlockBoundary` marker
    /// (non-atomic: the caller owns the whole span for the duration of
    /// this call). spec.md P6.
    pub fn mark_span(&self, v: usize, size: usize, n: usize, leftover: bool) {
        self.bounds_check(v, size * n);
        let count = if leftover { n + 1 } else { n };
        let mut p = v;
        for _ in 0..count {
            self.write(
                p,
                false,
                Bits {
                    allocated: false,
                    second: true,
                    marked: false,
                    special: false,
                },
            );
            p += size;
        }
    }

    /// Zeroes every bitmap word covering `[v, v+n)`. Requires `v` aligned
    /// to a whole bitmap word and `n` a multiple of one bitmap word's
    /// span, mirroring the original `unmarkspan`'s alignment contract.
    pub fn unmark_span(&self, v: usize, n: usize) {
        let off = self.word_offset(v);
        if off % WORDS_PER_BITMAP_WORD != 0 {
            throw("unmark_span: unaligned pointer");
        }
        let n_words = n / WORD_BYTES;
        if n_words % WORDS_PER_BITMAP_WORD != 0 {
            throw("unmark_span: unaligned length");
        }
        let (start_bw, _) = Self::indices(off);
        let count = n_words / WORDS_PER_BITMAP_WORD;
        let words = self.words.read();
        for i in 0..count {
            if let Some(w) = words.get(start_bw + i) {
                w.store(0, Ordering::Relaxed);
            }
        }
    }

    pub fn block_special(&self, v: usize) -> bool {
        self.read(v).special
    }

    pub fn set_block_special(&self, v: usize, special: bool, atomic: bool) {
        let off = self.word_offset(v);
        let (bw, shift) = Self::indices(off);
        self.update_word(bw, atomic, move |cur| {
            if special {
                cur | (1 << (SPECIAL_BASE + shift))
            } else {
                cur & !(1 << (SPECIAL_BASE + shift))
            }
        });
    }

    /// Clears `Marked` for the block header at `v`, used by the sweeper
    /// once a surviving block has been observed (spec.md 4.5 step 2).
    pub fn clear_marked(&self, v: usize) {
        let off = self.word_offset(v);
        let (bw, shift) = Self::indices(off);
        self.update_word(bw, false, move |cur| cur & !(1 << (MARKED_BASE + shift)));
    }

    /// Attempts to set `Marked` atomically; returns whether *this* call
    /// set the bit (spec.md 4.3.6 `markonly`).
    pub fn try_mark(&self, v: usize) -> bool {
        let off = self.word_offset(v);
        let (bw, shift) = Self::indices(off);
        let words = self.words.read();
        let slot = match words.get(bw) {
            Some(w) => w,
            None => throw("bitmap: try_mark past mapped range"),
        };
        let mask = 1usize << (MARKED_BASE + shift);
        let mut cur = slot.load(Ordering::Acquire);
        loop {
            if cur & mask != 0 {
                return false;
            }
            match slot.compare_exchange_weak(cur, cur | mask, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    fn bounds_check(&self, v: usize, n: usize) {
        // spec.md I4: a pointer outside [arena_start, arena_used) is
        // never a heap reference; here we can only check the lower
        // bound since arena_used is tracked by the page heap collaborator.
        if v < self.arena_start() {
            throw("bitmap: address before arena_start");
        }
        let _ = n;
    }
}
