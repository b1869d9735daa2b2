//! The exact mark-sweep-compact collector.
//!
//! Phases, in order: mark roots (VM roots via hooks, temporary roots,
//! thread stacks), mark the transitive closure (depth-bounded recursion
//! with a fixed deferred ring and a whole-heap rescan on ring
//! overflow), process weak referents, dissolve uncontended monitors,
//! sweep with coalescing, and - only when the request still cannot be
//! satisfied - slide-compact and rewrite pointers through the break
//! table.

use crate::compact::{compact, BreakTable};
use crate::error::Error::HeapCorrupt;
use crate::error::Result;
use crate::header::{GcKind, Header, Ptr};
use crate::heap::Heap;
use crate::hooks::{CollectorHooks, MarkQueue};
use crate::layout::{exec_stack, monitor, object, pointer_list, weak_reference};
use crate::lock_word::LockWord;
use crate::roots::{TempRoot, TempRoots};
use tracing::{debug, trace};

/// Marking recursion budget before an object is deferred.
const MAX_GC_DEPTH: usize = 8;

/// Fixed capacity of the deferred-object ring.
const DEFERRED_RING_SIZE: usize = 64;

/// Transient mark-phase state.
struct MarkState {
    deferred: Vec<Ptr>,
    overflowed: bool,
    weak_lists: Vec<Ptr>,
    weak_references: Vec<Ptr>,
}

impl MarkState {
    fn new() -> Self {
        MarkState {
            deferred: Vec::with_capacity(DEFERRED_RING_SIZE),
            overflowed: false,
            weak_lists: Vec::new(),
            weak_references: Vec::new(),
        }
    }

    fn defer(&mut self, ptr: Ptr) {
        if self.deferred.len() < DEFERRED_RING_SIZE {
            self.deferred.push(ptr);
        } else {
            // Ring full: remember that a whole-heap rescan is needed.
            self.overflowed = true;
        }
    }
}

impl Heap {
    /// Run a full collection, aiming to free a chunk of at least
    /// `min_cells` cells. Compaction runs only if the sweep alone does
    /// not produce such a chunk and compaction is enabled.
    ///
    /// Returns the size of the largest free chunk afterwards.
    ///
    /// # Errors
    /// Returns `HeapCorrupt` if heap validation or traversal fails;
    /// this is fatal to the VM.
    pub fn collect(
        &mut self,
        min_cells: usize,
        roots: &TempRoots,
        hooks: &mut dyn CollectorHooks,
    ) -> Result<usize> {
        self.stats.collections += 1;
        debug!(
            "collection {} starting; request {min_cells} cells, {} free",
            self.stats.collections,
            self.free_cells()
        );
        if self.config.debug_sweep {
            self.validate()?;
        }

        // Phase 1: gather roots.
        let mut queue = MarkQueue::default();
        hooks.scan_roots(self, &mut queue);
        for entry in roots.entries() {
            match entry {
                TempRoot::Object(ptr) => queue.push(ptr),
                TempRoot::Interior { base, .. } => queue.push(base),
            }
        }

        // Phase 2: mark the transitive closure.
        let mut state = MarkState::new();
        for ptr in std::mem::take(&mut queue.ptrs) {
            self.mark_object(ptr, MAX_GC_DEPTH, &mut state)?;
        }
        self.drain_deferred(&mut state)?;
        while state.overflowed {
            state.overflowed = false;
            self.rescan_marked(&mut state)?;
        }

        // Phase 3: weak referents.
        self.process_weak_references(&mut state, hooks)?;

        // Phase 4: dissolve monitors whose contention has ended.
        self.dissolve_monitors()?;

        // Phase 5: sweep.
        let mut largest = self.sweep()?;

        // Phase 6: compact when the request still cannot be satisfied.
        if min_cells > largest && self.config.compaction_enabled {
            self.stats.compactions += 1;
            let table = compact(self)?;
            self.update_pointers(&table)?;
            self.update_temp_roots(roots, &table);
            hooks.update_roots(self, &table);
            largest = self.largest_free_chunk();
        }

        if self.config.debug_sweep {
            self.validate()?;
        }
        debug!("collection finished; largest free chunk {largest} cells");
        Ok(largest)
    }

    /// Mark `ptr` and scan its children, deferring when the depth
    /// budget runs out.
    fn mark_object(&mut self, ptr: Ptr, depth: usize, state: &mut MarkState) -> Result<()> {
        if ptr.is_null() || !self.in_collected_heap(ptr) {
            return Ok(());
        }
        let mut header = self.header(ptr)?;
        if header.marked || header.kind == GcKind::Free {
            return Ok(());
        }
        header.marked = true;
        self.write_header(ptr, header);

        match header.kind {
            GcKind::WeakPointerList => {
                // Referents are weak: link into the side chain instead
                // of scanning.
                state.weak_lists.push(ptr);
                Ok(())
            }
            GcKind::WeakReference => {
                state.weak_references.push(ptr);
                // The lock word is still a strong edge.
                let lock = LockWord::from_cell(self.get(ptr, object::MHC));
                if let Some(child) = lock.pointer() {
                    self.mark_child(child, depth, state)?;
                }
                Ok(())
            }
            _ => self.scan_children(ptr, header, depth, state),
        }
    }

    fn mark_child(&mut self, child: Ptr, depth: usize, state: &mut MarkState) -> Result<()> {
        if depth == 0 {
            if !child.is_null() && self.in_collected_heap(child) && !self.header(child)?.marked {
                state.defer(child);
            }
            Ok(())
        } else {
            self.mark_object(child, depth - 1, state)
        }
    }

    /// Scan the pointer slots of a (non-weak) object, marking children.
    fn scan_children(
        &mut self,
        ptr: Ptr,
        header: Header,
        depth: usize,
        state: &mut MarkState,
    ) -> Result<()> {
        let mut children: Vec<Ptr> = Vec::new();
        self.collect_children(ptr, header, |child| children.push(child))?;
        for child in children {
            self.mark_child(child, depth, state)?;
        }
        Ok(())
    }

    /// Enumerate the strong pointer slots of an object by its kind.
    fn collect_children(
        &self,
        ptr: Ptr,
        header: Header,
        mut push: impl FnMut(Ptr),
    ) -> Result<()> {
        match header.kind {
            GcKind::Free | GcKind::NoPointers => {}
            GcKind::Instance => {
                let lock = LockWord::from_cell(self.get(ptr, object::MHC));
                if let Some(child) = lock.pointer() {
                    push(child);
                }
                let class_id = self.get(ptr, object::CLASS);
                let layout = self.layout(class_id).ok_or_else(|| {
                    HeapCorrupt(format!("instance at {ptr} has unregistered class {class_id}"))
                })?;
                for (index, &is_pointer) in layout.pointer_map.iter().enumerate() {
                    if is_pointer {
                        push(Ptr(self.get(ptr, object::FIELDS + index)));
                    }
                }
            }
            GcKind::Array => {
                let lock = LockWord::from_cell(self.get(ptr, object::MHC));
                if let Some(child) = lock.pointer() {
                    push(child);
                }
            }
            GcKind::ObjectArray => {
                let lock = LockWord::from_cell(self.get(ptr, object::MHC));
                if let Some(child) = lock.pointer() {
                    push(child);
                }
                let length = self.get(ptr, object::LENGTH) as usize;
                for index in 0..length {
                    push(Ptr(self.get(ptr, object::DATA + index)));
                }
            }
            GcKind::PointerList | GcKind::MethodTable => {
                let length = self.get(ptr, pointer_list::LENGTH) as usize;
                for index in 0..length {
                    push(Ptr(self.get(ptr, pointer_list::DATA + index)));
                }
            }
            GcKind::ExecStack => {
                // Stack cells are scanned precisely through the VM's
                // stack maps (hook roots); only the chain link is a
                // direct edge.
                push(self.get_ptr(ptr, exec_stack::NEXT));
            }
            GcKind::Thread => {
                for slot in crate::layout::thread::POINTER_SLOTS {
                    push(Ptr(self.get(ptr, slot)));
                }
            }
            GcKind::Monitor => {
                for slot in monitor::POINTER_SLOTS {
                    push(Ptr(self.get(ptr, slot)));
                }
            }
            GcKind::WeakPointerList | GcKind::WeakReference => {
                // Handled by the caller; weak edges are never strong.
            }
        }
        Ok(())
    }

    /// Process the deferred ring until it drains. Each entry gets a
    /// fresh recursion budget.
    fn drain_deferred(&mut self, state: &mut MarkState) -> Result<()> {
        while let Some(ptr) = state.deferred.pop() {
            let mut header = self.header(ptr)?;
            let first_visit = !header.marked;
            if first_visit {
                header.marked = true;
                self.write_header(ptr, header);
            }
            match header.kind {
                GcKind::WeakPointerList => {
                    if first_visit {
                        state.weak_lists.push(ptr);
                    }
                }
                GcKind::WeakReference => {
                    if first_visit {
                        state.weak_references.push(ptr);
                    }
                    let lock = LockWord::from_cell(self.get(ptr, object::MHC));
                    if let Some(child) = lock.pointer() {
                        self.mark_child(child, MAX_GC_DEPTH, state)?;
                    }
                }
                _ => self.scan_children(ptr, header, MAX_GC_DEPTH, state)?,
            }
        }
        Ok(())
    }

    /// Whole-heap rescan after ring overflow: re-scan every marked
    /// object so unmarked children get another chance. Each pass marks
    /// at least one additional object, so the loop terminates.
    fn rescan_marked(&mut self, state: &mut MarkState) -> Result<()> {
        trace!("deferred ring overflowed; rescanning the heap");
        let mut marked: Vec<Ptr> = Vec::new();
        self.for_each_object(|ptr, header| {
            if header.marked
                && !matches!(
                    header.kind,
                    GcKind::WeakPointerList | GcKind::WeakReference
                )
            {
                marked.push(ptr);
            }
        })?;
        for ptr in marked {
            let header = self.header(ptr)?;
            self.scan_children(ptr, header, MAX_GC_DEPTH, state)?;
        }
        self.drain_deferred(state)
    }

    /// Clear weak slots whose referents did not survive marking,
    /// forwarding survivors unchanged and firing registered finalizers
    /// exactly once per cleared weak-pointer-list slot.
    fn process_weak_references(
        &mut self,
        state: &mut MarkState,
        hooks: &mut dyn CollectorHooks,
    ) -> Result<()> {
        for list in std::mem::take(&mut state.weak_lists) {
            let length = self.get(list, crate::layout::weak_pointer_list::LENGTH) as usize;
            let finalizer = self.get(list, crate::layout::weak_pointer_list::FINALIZER);
            for index in 0..length {
                let slot = crate::layout::weak_pointer_list::DATA + index;
                let referent = self.get_ptr(list, slot);
                if self.is_dead_referent(referent)? {
                    if finalizer != 0 {
                        hooks.weak_slot_cleared(finalizer, referent);
                    }
                    self.set_ptr(list, slot, Ptr::NULL);
                    self.stats.weak_slots_cleared += 1;
                }
            }
        }
        for reference in std::mem::take(&mut state.weak_references) {
            let referent = self.get_ptr(reference, weak_reference::REFERENT);
            if self.is_dead_referent(referent)? {
                self.set_ptr(reference, weak_reference::REFERENT, Ptr::NULL);
                self.stats.weak_slots_cleared += 1;
            }
        }
        Ok(())
    }

    fn is_dead_referent(&self, referent: Ptr) -> Result<bool> {
        if referent.is_null() || !self.in_collected_heap(referent) {
            return Ok(false);
        }
        Ok(!self.header(referent)?.marked)
    }

    /// Un-mark live monitors that have no owner and no waiters, and
    /// return their object's MHC word to the unlocked state carrying
    /// the monitor's hashcode. The sweep then reclaims the record.
    fn dissolve_monitors(&mut self) -> Result<()> {
        let mut dissolvable: Vec<Ptr> = Vec::new();
        self.for_each_object(|ptr, header| {
            if header.kind == GcKind::Monitor && header.marked {
                dissolvable.push(ptr);
            }
        })?;
        for ptr in dissolvable {
            let unowned = self.get_ptr(ptr, monitor::OWNER).is_null()
                && self.get_ptr(ptr, monitor::LOCK_QUEUE).is_null()
                && self.get_ptr(ptr, monitor::COND_QUEUE).is_null();
            if !unowned {
                continue;
            }
            let owner_object = self.get_ptr(ptr, monitor::OBJECT);
            if !owner_object.is_null() && self.header(owner_object)?.marked {
                let hash = self.get(ptr, monitor::HASH);
                self.set(
                    owner_object,
                    object::MHC,
                    LockWord::Unlocked { hash }.to_cell(),
                );
            }
            let mut header = self.header(ptr)?;
            header.marked = false;
            self.write_header(ptr, header);
            self.stats.monitors_dissolved += 1;
        }
        Ok(())
    }

    /// Linear sweep: coalesce every run of dead objects and free chunks
    /// into single free chunks, clear mark bits on survivors, rebuild
    /// the free list in address order, and return the largest chunk.
    fn sweep(&mut self) -> Result<usize> {
        let mut free_tail = Ptr::NULL;
        let mut new_free_list = Ptr::NULL;
        let mut largest = 0usize;
        let mut reclaimed_cells = 0u64;
        let mut reclaimed_objects = 0u64;

        let mut index = self.heap_start;
        while index < self.heap_end {
            let ptr = Ptr(index + 1);
            let header = self.header(ptr)?;

            if header.marked {
                let mut cleared = header;
                cleared.marked = false;
                self.write_header(ptr, cleared);
                index += 1 + header.size as u32;
                continue;
            }

            // Dead: extend over every following dead object or free
            // chunk to coalesce.
            let run_start = index;
            let mut run_end = index;
            while run_end < self.heap_end {
                let next_ptr = Ptr(run_end + 1);
                let next_header = self.header(next_ptr)?;
                if next_header.marked {
                    break;
                }
                if next_header.kind != GcKind::Free {
                    reclaimed_cells += next_header.size as u64 + 1;
                    reclaimed_objects += 1;
                }
                run_end += 1 + next_header.size as u32;
            }

            let chunk = Ptr(run_start + 1);
            let payload = (run_end - run_start - 1) as usize;
            self.write_header(chunk, Header::new(payload, GcKind::Free));
            self.set(chunk, 0, 0);
            if free_tail.is_null() {
                new_free_list = chunk;
            } else {
                self.set_ptr(free_tail, 0, chunk);
            }
            free_tail = chunk;
            largest = largest.max(payload);
            index = run_end;
        }

        self.free_list = new_free_list;
        self.stats.cells_reclaimed += reclaimed_cells;
        self.stats.objects_reclaimed += reclaimed_objects;
        trace!("sweep reclaimed {reclaimed_cells} cells in {reclaimed_objects} objects");
        Ok(largest)
    }

    /// Rewrite every pointer slot of every live object through the
    /// break table. `ExecStack` contents and VM-side locations are the
    /// hooks' responsibility.
    fn update_pointers(&mut self, table: &BreakTable) -> Result<()> {
        let mut objects: Vec<(Ptr, Header)> = Vec::new();
        self.for_each_object(|ptr, header| {
            if header.kind != GcKind::Free {
                objects.push((ptr, header));
            }
        })?;

        for (ptr, header) in objects {
            match header.kind {
                GcKind::Free | GcKind::NoPointers => {}
                GcKind::Instance | GcKind::Array | GcKind::ObjectArray | GcKind::WeakReference => {
                    let lock = LockWord::from_cell(self.get(ptr, object::MHC));
                    if let Some(child) = lock.pointer() {
                        let moved = table.relocate(child);
                        self.set(ptr, object::MHC, lock.with_pointer(moved).to_cell());
                    }
                    match header.kind {
                        GcKind::Instance => {
                            let class_id = self.get(ptr, object::CLASS);
                            let pointer_map = self
                                .layout(class_id)
                                .ok_or_else(|| {
                                    HeapCorrupt(format!(
                                        "instance at {ptr} has unregistered class {class_id}"
                                    ))
                                })?
                                .pointer_map
                                .clone();
                            for index in 0..pointer_map.len() {
                                if pointer_map[index] {
                                    let slot = object::FIELDS + index;
                                    let old = self.get_ptr(ptr, slot);
                                    self.set_ptr(ptr, slot, table.relocate(old));
                                }
                            }
                        }
                        GcKind::ObjectArray => {
                            let length = self.get(ptr, object::LENGTH) as usize;
                            for index in 0..length {
                                let slot = object::DATA + index;
                                let old = self.get_ptr(ptr, slot);
                                self.set_ptr(ptr, slot, table.relocate(old));
                            }
                        }
                        GcKind::WeakReference => {
                            let old = self.get_ptr(ptr, weak_reference::REFERENT);
                            self.set_ptr(ptr, weak_reference::REFERENT, table.relocate(old));
                        }
                        _ => {}
                    }
                }
                GcKind::PointerList | GcKind::MethodTable => {
                    let length = self.get(ptr, pointer_list::LENGTH) as usize;
                    for index in 0..length {
                        let slot = pointer_list::DATA + index;
                        let old = self.get_ptr(ptr, slot);
                        self.set_ptr(ptr, slot, table.relocate(old));
                    }
                }
                GcKind::WeakPointerList => {
                    let length = self.get(ptr, crate::layout::weak_pointer_list::LENGTH) as usize;
                    for index in 0..length {
                        let slot = crate::layout::weak_pointer_list::DATA + index;
                        let old = self.get_ptr(ptr, slot);
                        self.set_ptr(ptr, slot, table.relocate(old));
                    }
                }
                GcKind::ExecStack => {
                    let old = self.get_ptr(ptr, exec_stack::NEXT);
                    self.set_ptr(ptr, exec_stack::NEXT, table.relocate(old));
                }
                GcKind::Thread => {
                    for slot in crate::layout::thread::POINTER_SLOTS {
                        let old = self.get_ptr(ptr, slot);
                        self.set_ptr(ptr, slot, table.relocate(old));
                    }
                    for slot in crate::layout::thread::INTERIOR_SLOTS {
                        let old = self.get(ptr, slot);
                        if old != 0 {
                            self.set(ptr, slot, table.relocate_address(old));
                        }
                    }
                }
                GcKind::Monitor => {
                    for slot in monitor::POINTER_SLOTS {
                        let old = self.get_ptr(ptr, slot);
                        self.set_ptr(ptr, slot, table.relocate(old));
                    }
                }
            }
        }
        Ok(())
    }

    /// Rewrite the temporary-root stack through the break table.
    fn update_temp_roots(&mut self, roots: &TempRoots, table: &BreakTable) {
        let mut entries = roots.entries();
        for entry in &mut entries {
            match entry {
                TempRoot::Object(ptr) => *ptr = table.relocate(*ptr),
                TempRoot::Interior { address, base } => {
                    *address = table.relocate_address(*address);
                    *base = table.relocate(*base);
                }
            }
        }
        roots.replace_entries(entries);
    }
}
