//! The page heap / size-classed allocator's span table is an external
//! collaborator (spec.md section 1): the collector only needs to look
//! spans up, read their type metadata, and hand reclaimed memory back.
//! This module defines that boundary as a trait plus the plain data the
//! collector reads across it.

/// A span's occupancy state. Only `InUse` spans participate in marking
/// or sweeping (spec.md 3, I5c).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    InUse,
    Free,
}

/// Per-element type metadata attached to a span, used to resolve `ti`
/// when an object's own type info is unknown (spec.md 4.3.5 "Type lookup
/// fallback").
#[derive(Debug, Clone)]
pub enum TypeTable {
    Empty,
    /// Every element in the span shares one type.
    Single(usize),
    /// One `ti` per element, packed as whole words.
    Words(Vec<usize>),
    /// One `ti` per element, packed as bytes (small type-id table).
    Bytes(Vec<u8>),
}

impl TypeTable {
    pub fn is_rootable(&self) -> bool {
        matches!(self, TypeTable::Words(_) | TypeTable::Bytes(_))
    }

    pub fn lookup(&self, elem_index: usize) -> usize {
        match self {
            TypeTable::Empty => 0,
            TypeTable::Single(ti) => *ti,
            TypeTable::Words(v) => v.get(elem_index).copied().unwrap_or(0),
            TypeTable::Bytes(v) => v.get(elem_index).copied().unwrap_or(0) as usize,
        }
    }

    /// A stable address standing in for "the `types.data` pointer cell"
    /// spec.md 4.4 roots as a span-type-metadata root. Any non-zero,
    /// distinguishable value works; callers never dereference it.
    pub fn data_cell_marker(&self, span_base: usize) -> Option<usize> {
        match self {
            TypeTable::Words(_) | TypeTable::Bytes(_) => Some(span_base | 1),
            _ => None,
        }
    }
}

/// A contiguous run of pages of one size-class (spec.md 3 Span).
/// `sizeclass == 0` denotes a single large object spanning the span.
#[derive(Debug, Clone)]
pub struct Span {
    pub base: usize,
    pub bytes: usize,
    pub sizeclass: usize,
    pub elemsize: usize,
    pub limit: usize,
    pub state: SpanState,
    pub types: TypeTable,
}

impl Span {
    pub fn is_large(&self) -> bool {
        self.sizeclass == 0
    }

    pub fn element_count(&self) -> usize {
        if self.elemsize == 0 {
            0
        } else {
            self.bytes / self.elemsize
        }
    }

    /// Header address of the element containing `addr`, or `None` if
    /// `addr` falls past `limit` (spec.md 4.3.3 step 4).
    pub fn header_for(&self, addr: usize) -> Option<usize> {
        if addr < self.base || addr >= self.limit || self.elemsize == 0 {
            return None;
        }
        let off = addr - self.base;
        Some(self.base + (off / self.elemsize) * self.elemsize)
    }

    pub fn element_index(&self, header: usize) -> usize {
        (header - self.base) / self.elemsize.max(1)
    }
}

/// What the sweeper hands back to the allocator for a small-object span:
/// the list of freed block headers plus the counters spec.md 4.5 step 5
/// names.
#[derive(Debug, Default, Clone)]
pub struct SweepResult {
    pub freed: Vec<usize>,
    pub nfree: usize,
    pub local_alloc: usize,
    pub local_cachealloc: usize,
    pub local_objects: usize,
}

/// The page heap / size-classed allocator boundary. Implemented by the
/// runtime's real allocator; tests use an in-process mock
/// ([`crate::testutil::mock::MockPageHeap`] behind the `testutil`
/// feature).
pub trait PageHeap: Send + Sync {
    fn span_count(&self) -> usize;
    fn span(&self, idx: usize) -> Span;
    /// Index of the span containing `addr`, if any (used by interior
    /// pointer resolution's span-table fallback, spec.md 4.3.3 step 4).
    fn span_index_for(&self, addr: usize) -> Option<usize>;

    /// Returns a large-object span's pages to the page heap.
    fn free_large_span(&self, idx: usize);
    /// Returns a small-object span's locally-assembled free list to the
    /// size-class central cache, updating per-cache statistics.
    fn return_to_cache(&self, idx: usize, result: SweepResult);

    fn arena_start(&self) -> usize;
    fn arena_used(&self) -> usize;
}
