//! The collector's seam to the VM.
//!
//! The collector understands every object shape it can meet on the
//! heap, with one exception: the contents of `ExecStack` chunks, whose
//! pointer slots are only identifiable through per-method stack maps.
//! The VM supplies those roots (and everything else it holds outside
//! the heap: class statics, interned-string records, singletons,
//! pending asynchronous I/O blocks) through this trait.

use crate::compact::BreakTable;
use crate::header::Ptr;
use crate::heap::Heap;

/// Sink for root pointers during the mark phase.
#[derive(Debug, Default)]
pub struct MarkQueue {
    pub(crate) ptrs: Vec<Ptr>,
}

impl MarkQueue {
    /// Report a root. Null pointers are accepted and ignored.
    pub fn push(&mut self, ptr: Ptr) {
        if !ptr.is_null() {
            self.ptrs.push(ptr);
        }
    }
}

/// VM callbacks driven by [`Heap::collect`](crate::Heap::collect).
pub trait CollectorHooks {
    /// Push every VM-level root: global singletons, class static
    /// records' referents, the ROM pointer table, pending async-I/O
    /// control blocks, and - through the stack-map scanner - every
    /// pointer slot of every live thread's stack.
    fn scan_roots(&mut self, heap: &Heap, queue: &mut MarkQueue);

    /// A weak-pointer-list slot with a registered finalizer was
    /// cleared. Called exactly once per cleared slot, after marking
    /// and before sweep; the referent address is an opaque value and
    /// the heap must not be touched.
    fn weak_slot_cleared(&mut self, finalizer: u32, referent: Ptr);

    /// Compaction moved objects; rewrite every VM-side root location
    /// and every interior pointer inside thread stacks by looking old
    /// addresses up in `table`.
    fn update_roots(&mut self, heap: &mut Heap, table: &BreakTable);
}

/// Hooks for a VM with no outside roots; used by heap-level tests.
#[derive(Debug, Default)]
pub struct NoHooks;

impl CollectorHooks for NoHooks {
    fn scan_roots(&mut self, _heap: &Heap, _queue: &mut MarkQueue) {}

    fn weak_slot_cleared(&mut self, _finalizer: u32, _referent: Ptr) {}

    fn update_roots(&mut self, _heap: &mut Heap, _table: &BreakTable) {}
}
