//! The VM side of the collector seam.
//!
//! The bridge supplies the collector with every root the heap cannot
//! see on its own - scheduler globals, class statics, class-init locks,
//! pending asynchronous-I/O control blocks, and above all the contents
//! of thread stacks, which are only interpretable through per-method
//! stack maps - and rewrites the same locations after compaction.

use crate::error::Error::{self, Fatal};
use crate::error::Result;
use crate::frame::{FRAME_CELLS, FRAME_CHUNK, FRAME_METHOD, FRAME_PREV_FP, FRAME_PREV_IP, FRAME_PREV_SP, FRAME_SYNC};
use crate::klass::MethodId;
use crate::registry::ClassRegistry;
use crate::stackmap::{mask_bit, register_mask};
use crate::string_table::StringTable;
use crate::vm::{Globals, Vm};
use kelvin_gc::layout::thread as thread_layout;
use kelvin_gc::{BreakTable, CollectorHooks, Heap, MarkQueue, Ptr};
use tracing::error;

pub(crate) struct GcBridge<'a> {
    pub registry: &'a mut ClassRegistry,
    pub strings: &'a StringTable,
    pub globals: &'a mut Globals,
    pub custom_code: MethodId,
    /// First fatal condition met while scanning; checked after the
    /// collection returns.
    pub failure: Option<Error>,
}

impl GcBridge<'_> {
    fn fail(&mut self, error: Error) {
        error!("stack scan failed during collection: {error}");
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    /// Walk one thread's frames, reporting every pointer-holding cell
    /// to `visit` as an absolute cell index: the identified locals and
    /// operand slots, and each frame's sync-object cell.
    fn walk_thread(
        &mut self,
        heap: &Heap,
        thread: Ptr,
        visit: &mut dyn FnMut(&Heap, u32),
    ) {
        let mut fp = heap.get(thread, thread_layout::FP);
        if fp == 0 {
            return;
        }
        let mut method = MethodId(heap.get(thread, thread_layout::IP_METHOD));
        let mut ip = heap.get(thread, thread_layout::IP_OFFSET) as usize;
        let mut sp = heap.get(thread, thread_layout::SP);
        let mut map: Vec<u8> = Vec::new();

        loop {
            visit(heap, fp + FRAME_SYNC as u32);

            let Some(body) = self.registry.method(method).java_body() else {
                self.fail(Fatal("frame for a method without bytecode".to_string()));
                return;
            };
            let locals = u32::from(body.frame_size);
            let locals_base = fp - locals;
            let stack_base = fp + FRAME_CELLS as u32;
            let real_depth = (sp + 1).saturating_sub(stack_base) as usize;

            if method == self.custom_code {
                // Custom-code frames hold only discriminants; nothing
                // in their locals or stack is a pointer.
            } else {
                let expected = match register_mask(self.registry, self.strings, method, ip, &mut map)
                {
                    Ok(depth) => depth,
                    Err(failure) => {
                        self.fail(failure);
                        return;
                    }
                };
                // A caller frame paused at a return address may hold
                // fewer live slots than the map expects (the return
                // value is not pushed yet); scan what exists.
                let depth = real_depth.min(expected);
                for index in 0..locals {
                    if mask_bit(&map, index as usize) {
                        visit(heap, locals_base + index);
                    }
                }
                for index in 0..depth {
                    if mask_bit(&map, locals as usize + index) {
                        visit(heap, stack_base + index as u32);
                    }
                }
            }

            let prev_fp = heap.cell_at(fp + FRAME_PREV_FP as u32);
            if prev_fp == 0 {
                return;
            }
            ip = heap.cell_at(fp + FRAME_PREV_IP as u32) as usize;
            sp = heap.cell_at(fp + FRAME_PREV_SP as u32);
            fp = prev_fp;
            method = MethodId(heap.cell_at(fp + FRAME_METHOD as u32));
        }
    }

    fn each_alive_thread(&self, heap: &Heap) -> Vec<Ptr> {
        let mut threads = Vec::new();
        let mut cursor = self.globals.alive_threads;
        while !cursor.is_null() {
            threads.push(cursor);
            cursor = heap.get_ptr(cursor, thread_layout::NEXT_ALIVE);
        }
        threads
    }
}

impl CollectorHooks for GcBridge<'_> {
    fn scan_roots(&mut self, heap: &Heap, queue: &mut MarkQueue) {
        // Scheduler globals.
        queue.push(self.globals.current_thread);
        queue.push(self.globals.alive_threads);
        queue.push(self.globals.runnable_tail);
        queue.push(self.globals.timer_queue);
        queue.push(self.globals.memory_error_singleton);
        for &block in &self.globals.async_io_blocks {
            queue.push(block);
        }

        // Class statics and initialisation state. The statics records
        // themselves are permanent; their referents are not.
        for class in self.registry.classes() {
            if !class.statics.is_null() {
                for (slot, &is_pointer) in class.static_pointer_map.iter().enumerate() {
                    if is_pointer {
                        queue.push(heap.get_ptr(class.statics, slot));
                    }
                }
            }
            queue.push(class.init_lock);
            queue.push(class.init_thread);
        }

        // Thread stacks, precisely through the stack maps.
        for thread in self.each_alive_thread(heap) {
            self.walk_thread(heap, thread, &mut |heap, cell_index| {
                queue.push(Ptr(heap.cell_at(cell_index)));
            });
        }
    }

    fn weak_slot_cleared(&mut self, finalizer: u32, referent: Ptr) {
        let index = finalizer as usize;
        if let Some(callback) = self.globals.weak_finalizers.get(index).copied() {
            callback(referent);
        }
    }

    fn update_roots(&mut self, heap: &mut Heap, table: &BreakTable) {
        self.globals.current_thread = table.relocate(self.globals.current_thread);
        self.globals.alive_threads = table.relocate(self.globals.alive_threads);
        self.globals.runnable_tail = table.relocate(self.globals.runnable_tail);
        self.globals.timer_queue = table.relocate(self.globals.timer_queue);
        self.globals.entry_thread = table.relocate(self.globals.entry_thread);
        for block in &mut self.globals.async_io_blocks {
            *block = table.relocate(*block);
        }

        // Statics records are permanent (they do not move) but their
        // referents did; the per-class init bookkeeping moves too.
        let class_ids: Vec<_> = self.registry.class_ids().collect();
        for class_id in class_ids {
            let class = self.registry.class_mut(class_id);
            class.init_lock = table.relocate(class.init_lock);
            class.init_thread = table.relocate(class.init_thread);
            if !class.statics.is_null() {
                let statics = class.statics;
                let map = class.static_pointer_map.clone();
                for (slot, is_pointer) in map.into_iter().enumerate() {
                    if is_pointer {
                        let old = heap.get_ptr(statics, slot);
                        heap.set_ptr(statics, slot, table.relocate(old));
                    }
                }
            }
        }

        // Thread stacks: frame links, sync objects, and every pointer
        // slot the maps identify. Thread records themselves (fp/sp and
        // their pointer slots) were already rewritten by the collector.
        for thread in self.each_alive_thread(heap) {
            // Fix the frame headers first: the thread's fp slot is
            // already relocated, but each frame's saved links still
            // hold pre-compaction addresses, so every link must be
            // relocated before it is followed.
            let mut fp = heap.get(thread, thread_layout::FP);
            while fp != 0 {
                let old_prev_sp = heap.cell_at(fp + FRAME_PREV_SP as u32);
                if old_prev_sp != 0 {
                    heap.set_cell_at(
                        fp + FRAME_PREV_SP as u32,
                        table.relocate_address(old_prev_sp),
                    );
                }
                let old_prev_fp = heap.cell_at(fp + FRAME_PREV_FP as u32);
                let new_prev_fp = if old_prev_fp == 0 {
                    0
                } else {
                    table.relocate_address(old_prev_fp)
                };
                heap.set_cell_at(fp + FRAME_PREV_FP as u32, new_prev_fp);
                // The sync-object cell is rewritten by the map walk
                // below; only the chunk link is fixed here.
                let old_chunk = heap.cell_at(fp + FRAME_CHUNK as u32);
                heap.set_cell_at(fp + FRAME_CHUNK as u32, table.relocate(Ptr(old_chunk)).0);
                fp = new_prev_fp;
            }

            // Now the chain is consistent; walk with the stack maps
            // and rewrite the identified value slots.
            let mut slots: Vec<u32> = Vec::new();
            self.walk_thread(heap, thread, &mut |_heap, cell_index| {
                slots.push(cell_index);
            });
            for cell_index in slots {
                let old = heap.cell_at(cell_index);
                heap.set_cell_at(cell_index, table.relocate(Ptr(old)).0);
            }
        }
    }
}

impl Vm {
    /// Run a full collection aiming for `min_cells`, wiring the VM's
    /// roots through the bridge. Returns the largest free chunk.
    ///
    /// # Errors
    /// Fatal on heap corruption or stack-map inconsistency.
    pub fn gc(&mut self, min_cells: usize) -> Result<usize> {
        let Vm {
            heap,
            roots,
            registry,
            strings,
            globals,
            well_known,
            ..
        } = self;
        let mut bridge = GcBridge {
            registry,
            strings,
            globals,
            custom_code: well_known.custom_code,
            failure: None,
        };
        let largest = heap.collect(min_cells, roots, &mut bridge)?;
        if let Some(failure) = bridge.failure {
            return Err(failure);
        }
        Ok(largest)
    }
}
