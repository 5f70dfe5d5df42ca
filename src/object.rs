//! The object model the marking engine walks: [`Object`] references, their
//! [`TypeInfo`], and the [`Op`] bytecode a GC program is built from
//! (spec.md section 3, 4.3.5).

/// Low two bits of a type-info word, packed alongside the program pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeFlags {
    pub precise: bool,
    pub loop_: bool,
}

/// `(p, n, ti)`: a block base address, its byte length, and type info.
/// `ti == 0` means "unknown", resolved via [`crate::span::SpanTable::type_table_lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Object {
    pub base: usize,
    pub len: usize,
    pub ti: usize,
}

impl Object {
    pub fn new(base: usize, len: usize, ti: usize) -> Self {
        Self { base, len, ti }
    }

    pub fn flags(&self) -> TypeFlags {
        TypeFlags {
            precise: self.ti & PRECISE_BIT != 0,
            loop_: self.ti & LOOP_BIT != 0,
        }
    }

    /// The GC-program index this `ti` points at, with the flag bits
    /// masked off.
    pub fn program_ref(&self) -> usize {
        self.ti & !(PRECISE_BIT | LOOP_BIT)
    }
}

pub const PRECISE_BIT: usize = 1 << 0;
pub const LOOP_BIT: usize = 1 << 1;

/// A candidate pointer discovered in a scanned block, not yet resolved to
/// a block header (spec.md 4.3.2 `ptrbuf`).
#[derive(Debug, Clone, Copy)]
pub struct PtrTarget {
    pub addr: usize,
    pub ti: usize,
}

/// A pointer whose bitmap location has been resolved (spec.md 4.3.2 `bitbuf`).
#[derive(Debug, Clone, Copy)]
pub struct BitTarget {
    pub addr: usize,
    pub ti: usize,
    pub header: usize,
}

/// GC bytecode opcode (spec.md 4.3.5). One `GcProgram` is a `Vec<Op>`
/// interpreted by [`crate::scan::run_program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Pointer at `b+off`, typed.
    Ptr { off: usize, ti: usize },
    /// Pointer at `b+off`, untyped (`ti = 0`).
    APtr { off: usize },
    /// String header's data pointer at `b+off` (untyped).
    StringPtr { off: usize },
    /// Slice header at `b+off`; if `cap != 0`, emit the backing array.
    Slice { off: usize, ti: usize },
    /// `interface{}` at `b+off`.
    EFace { off: usize },
    /// Typed interface at `b+off`.
    IFace { off: usize },
    /// Begin a fixed-size array of `count` elements of `elemsize` bytes
    /// starting at `b+off`.
    ArrayStart {
        off: usize,
        count: usize,
        elemsize: usize,
    },
    /// Advance to the next array element or pop the frame.
    ArrayNext,
    /// Call a sub-program at `pc + disp`, returning to `pc+1` after.
    Call { off: usize, disp: isize },
    /// A known-live sub-region, enqueued directly (spec.md 4.3.4).
    Region { off: usize, size: usize, ti: usize },
    /// Pointer-to-hashmap field.
    MapPtr { off: usize, maptype: usize },
    /// Yield the next key/value pair of the map iteration started by
    /// the preceding `MapPtr`.
    MapNext,
    /// Scan a channel's circular buffer.
    Chan,
    /// Conservative: every word in `[b, b+n)` is a candidate pointer.
    DefaultPtr,
    /// End of program / end of array frame; triggers the imprecise-type
    /// rescan fallback when the frame's type was not `Precise`.
    End,
}

/// A type's GC program: `elemsize` is the program's own stride, used when
/// the referencing `ti` carries [`LOOP_BIT`] (spec.md 4.3.5 — mirrors
/// `mgc0.c`'s `pc[0]` element-size header word).
#[derive(Debug, Clone)]
pub struct GcProgram {
    pub elemsize: usize,
    pub ops: Vec<Op>,
}

impl GcProgram {
    pub fn new(elemsize: usize, ops: Vec<Op>) -> Self {
        Self { elemsize, ops }
    }
}
