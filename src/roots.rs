//! Root enumerator (spec.md 4.4): rebuilds the roots vector from scratch
//! every cycle from globals, span type metadata, mutator stacks, and
//! pending finalizers. The mutator scheduler (stack walking, thread
//! enumeration) is an external collaborator, modeled here as
//! [`RootProvider`].

use crate::finalizer::FinalizerQueue;
use crate::object::Object;
use crate::span::{PageHeap, SpanState};

/// One mutator thread's (or goroutine's) contribution to the roots
/// vector: already-resolved `(sp, len)` regions for each live frame. The
/// scheduler decides *which* `(sp, pc)` to walk from (syscall-saved,
/// live, or scheduled) and whether the thread has even started —
/// spec.md 4.4 leaves all of that to the external scheduler.
pub struct ThreadRoots {
    pub is_gc_helper: bool,
    pub frames: Vec<Object>,
}

/// Globals + per-thread stacks: the two external collaborators the root
/// enumerator pulls from besides the page heap and finalizer queue.
pub trait RootProvider: Send + Sync {
    /// `(data..edata)` and `(bss..ebss)` regions, each already carrying
    /// its `gcdata`/`gcbss` program as `ti`.
    fn globals(&self) -> Vec<Object>;
    fn threads(&self) -> Vec<ThreadRoots>;
}

/// Resolves `addr` to its containing block's `(base, len)` via the span
/// table, used for finalizer-target rooting where only the pointer (not
/// the length) is known.
fn block_extent(page_heap: &dyn PageHeap, addr: usize) -> Option<Object> {
    let idx = page_heap.span_index_for(addr)?;
    let span = page_heap.span(idx);
    if span.state != SpanState::InUse {
        return None;
    }
    let header = span.header_for(addr)?;
    let len = if span.is_large() { span.bytes } else { span.elemsize };
    Some(Object::new(header, len, 0))
}

/// Rebuilds the full roots vector for one cycle (spec.md 4.4).
pub fn enumerate_roots(
    providers: &dyn RootProvider,
    page_heap: &dyn PageHeap,
    finalizers: &FinalizerQueue,
) -> Vec<Object> {
    let mut roots = Vec::new();

    roots.extend(providers.globals());

    for idx in 0..page_heap.span_count() {
        let span = page_heap.span(idx);
        if span.state != SpanState::InUse {
            continue;
        }
        if let Some(marker) = span.types.data_cell_marker(span.base) {
            roots.push(Object::new(marker, crate::bitmap::WORD_BYTES, 0));
        }
    }

    for thread in providers.threads() {
        if thread.is_gc_helper {
            continue;
        }
        roots.extend(thread.frames);
    }

    for target in finalizers.pending_targets() {
        if let Some(obj) = block_extent(page_heap, target) {
            roots.push(obj);
        }
    }
    for target in finalizers.queued_targets() {
        if let Some(obj) = block_extent(page_heap, target) {
            roots.push(obj);
        }
    }

    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{PageHeap, Span, SweepResult, TypeTable};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OneSpanHeap {
        span: Span,
        next_idx: AtomicUsize,
    }

    impl PageHeap for OneSpanHeap {
        fn span_count(&self) -> usize {
            1
        }
        fn span(&self, _idx: usize) -> Span {
            self.span.clone()
        }
        fn span_index_for(&self, addr: usize) -> Option<usize> {
            if addr >= self.span.base && addr < self.span.limit {
                Some(0)
            } else {
                None
            }
        }
        fn free_large_span(&self, _idx: usize) {}
        fn return_to_cache(&self, _idx: usize, _result: SweepResult) {
            self.next_idx.fetch_add(1, Ordering::Relaxed);
        }
        fn arena_start(&self) -> usize {
            self.span.base
        }
        fn arena_used(&self) -> usize {
            self.span.limit
        }
    }

    struct NoProvider;
    impl RootProvider for NoProvider {
        fn globals(&self) -> Vec<Object> {
            vec![]
        }
        fn threads(&self) -> Vec<ThreadRoots> {
            vec![]
        }
    }

    #[test]
    fn pending_finalizer_target_becomes_root() {
        let heap = OneSpanHeap {
            span: Span {
                base: 0x1000,
                bytes: 256,
                sizeclass: 1,
                elemsize: 32,
                limit: 0x1000 + 256,
                state: SpanState::InUse,
                types: TypeTable::Empty,
            },
            next_idx: AtomicUsize::new(0),
        };
        let finalizers = FinalizerQueue::new();
        finalizers.register(0x1000 + 32, std::sync::Arc::new(|_| {}), 0);
        let roots = enumerate_roots(&NoProvider, &heap, &finalizers);
        assert!(roots.iter().any(|o| o.base == 0x1000 + 32 && o.len == 32));
    }

    #[test]
    fn gc_helper_stacks_are_skipped() {
        struct Helper;
        impl RootProvider for Helper {
            fn globals(&self) -> Vec<Object> {
                vec![]
            }
            fn threads(&self) -> Vec<ThreadRoots> {
                vec![ThreadRoots {
                    is_gc_helper: true,
                    frames: vec![Object::new(0x5000, 64, 0)],
                }]
            }
        }
        let heap = OneSpanHeap {
            span: Span {
                base: 0x1000,
                bytes: 256,
                sizeclass: 1,
                elemsize: 32,
                limit: 0x1000 + 256,
                state: SpanState::InUse,
                types: TypeTable::Empty,
            },
            next_idx: AtomicUsize::new(0),
        };
        let roots = enumerate_roots(&Helper, &heap, &FinalizerQueue::new());
        assert!(!roots.iter().any(|o| o.base == 0x5000));
    }
}
