//! Activation records and chunked thread stacks.
//!
//! A thread's stack is a chain of fixed-size `ExecStack` chunks. Within
//! a chunk, each activation record is laid out as
//! `[locals... | frame header | operand stack...]`; the frame pointer
//! addresses the header, locals sit below it, and the operand stack
//! grows upward above it. All frame addresses are absolute cell
//! indices, which the collector relocates by address when chunks move.

use crate::configuration::STACK_CHUNK_CELLS;
use crate::error::Error::Internal;
use crate::error::Result;
use crate::klass::MethodId;
use crate::vm::Vm;
use kelvin_gc::layout::{exec_stack, thread as thread_layout};
use kelvin_gc::{GcKind, Ptr};
use tracing::trace;

/// Frame header cell offsets relative to `fp`.
pub const FRAME_PREV_SP: usize = 0;
pub const FRAME_PREV_FP: usize = 1;
pub const FRAME_PREV_IP: usize = 2;
pub const FRAME_METHOD: usize = 3;
pub const FRAME_SYNC: usize = 4;
pub const FRAME_CHUNK: usize = 5;
/// Cells in a frame header.
pub const FRAME_CELLS: usize = 6;

/// Headroom kept above `max_stack` for native and custom-code frames.
pub const RESERVED_CELLS: usize = 4;

/// The VM registers of the executing thread. Saved to and restored from
/// the thread record on every switch; `fp`, `sp` and `lp` are absolute
/// cell indices.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Registers {
    pub method: MethodId,
    pub ip: u32,
    pub fp: u32,
    pub sp: u32,
    pub lp: u32,
}

impl Default for MethodId {
    fn default() -> Self {
        MethodId(u32::MAX)
    }
}

impl Vm {
    /// Absolute end (exclusive) of a chunk's stack area.
    #[must_use]
    pub(crate) fn chunk_limit(&self, chunk: Ptr) -> u32 {
        let size = self.heap.get(chunk, exec_stack::SIZE);
        chunk.0 + exec_stack::CELLS as u32 + size
    }

    /// First stack cell of a chunk.
    #[must_use]
    pub(crate) fn chunk_base(&self, chunk: Ptr) -> u32 {
        chunk.0 + exec_stack::CELLS as u32
    }

    /// Push an activation record for `method_id`, whose `argc` argument
    /// slots end at `regs.sp`. The arguments become the first locals;
    /// if the current chunk cannot hold the new frame, they are copied
    /// into a reused or freshly allocated chunk.
    ///
    /// `regs.ip` must already address the instruction after the call.
    ///
    /// # Errors
    /// `JavaThrow` of the shared memory-error singleton on stack
    /// exhaustion.
    pub(crate) fn push_frame(
        &mut self,
        regs: &mut Registers,
        method_id: MethodId,
        sync_object: Ptr,
    ) -> Result<()> {
        let method = self.registry.method(method_id);
        let argc = u32::from(method.arg_slots);
        let body = method
            .java_body()
            .ok_or_else(|| Internal("push_frame on a non-Java method".to_string()))?;
        let frame_size = u32::from(body.frame_size);
        let need = frame_size as usize + FRAME_CELLS + body.max_stack as usize + RESERVED_CELLS;

        let mut sync_object = sync_object;
        let arg_start = regs.sp + 1 - argc;
        let caller_sp = arg_start - 1;
        let current_chunk = self.current_chunk(regs);

        let (locals_base, chunk) = if !current_chunk.is_null()
            && arg_start as usize + need <= self.chunk_limit(current_chunk) as usize
        {
            (arg_start, current_chunk)
        } else {
            // Acquiring a chunk may collect; the synchronization object
            // must survive and follow any move.
            let roots = std::rc::Rc::clone(&self.roots);
            let scope = kelvin_gc::RootScope::new(&roots);
            let sync_root = scope.roots().push(sync_object);
            let chunk = self.acquire_chunk(regs, need)?;
            sync_object = scope.roots().get(sync_root);
            // The collector may have moved everything; recompute the
            // argument window from the reloaded registers.
            let arg_start = regs.sp + 1 - argc;
            let base = self.chunk_base(chunk);
            for offset in 0..argc {
                let value = self.heap.cell_at(arg_start + offset);
                self.heap.set_cell_at(base + offset, value);
            }
            (base, chunk)
        };

        let fp = locals_base + frame_size;
        for index in argc..frame_size {
            self.heap.set_cell_at(locals_base + index, 0);
        }
        self.heap.set_cell_at(fp + FRAME_PREV_SP as u32, caller_sp);
        self.heap.set_cell_at(fp + FRAME_PREV_FP as u32, regs.fp);
        self.heap.set_cell_at(fp + FRAME_PREV_IP as u32, regs.ip);
        self.heap.set_cell_at(fp + FRAME_METHOD as u32, method_id.0);
        self.heap.set_cell_at(fp + FRAME_SYNC as u32, sync_object.0);
        self.heap.set_cell_at(fp + FRAME_CHUNK as u32, chunk.0);

        regs.method = method_id;
        regs.ip = 0;
        regs.lp = locals_base;
        regs.fp = fp;
        regs.sp = fp + FRAME_CELLS as u32 - 1;
        trace!("pushed frame for method {method_id:?} at fp {fp}");
        Ok(())
    }

    /// The chunk holding the current frame, or null with no frame.
    #[must_use]
    pub(crate) fn current_chunk(&self, regs: &Registers) -> Ptr {
        if regs.fp == 0 {
            return Ptr::NULL;
        }
        Ptr(self.heap.cell_at(regs.fp + FRAME_CHUNK as u32))
    }

    /// Reuse the thread's spare chunk or allocate a new one whose stack
    /// area holds at least `need` cells. Registers are stored and
    /// reloaded around the allocation so a collection cannot leave them
    /// stale.
    fn acquire_chunk(&mut self, regs: &mut Registers, need: usize) -> Result<Ptr> {
        let thread = self.globals.current_thread;
        let spare = Ptr(self.heap.get(thread, thread_layout::SPARE_CHUNK));
        if !spare.is_null() && self.heap.get(spare, exec_stack::SIZE) as usize >= need {
            self.heap.set(thread, thread_layout::SPARE_CHUNK, 0);
            self.heap
                .set_ptr(spare, exec_stack::NEXT, Ptr(self.heap.get(thread, thread_layout::STACK)));
            self.heap.set_ptr(thread, thread_layout::STACK, spare);
            return Ok(spare);
        }

        let area = need.max(STACK_CHUNK_CELLS);
        self.store_registers(regs);
        let chunk = self.allocate_cells(exec_stack::OVERHEAD + area, GcKind::ExecStack)?;
        self.load_registers(regs);

        let thread = self.globals.current_thread;
        self.heap.set(chunk, exec_stack::SIZE, area as u32);
        self.heap
            .set_ptr(chunk, exec_stack::NEXT, Ptr(self.heap.get(thread, thread_layout::STACK)));
        self.heap.set_ptr(thread, thread_layout::STACK, chunk);
        Ok(chunk)
    }

    /// Pop the current frame. Returns `false` when the popped frame was
    /// the thread's last (the thread terminates). Return values are the
    /// caller's concern: it reads them off the dying frame's stack
    /// before calling this and pushes them after.
    pub(crate) fn pop_frame(&mut self, regs: &mut Registers) -> bool {
        let fp = regs.fp;
        let prev_sp = self.heap.cell_at(fp + FRAME_PREV_SP as u32);
        let prev_fp = self.heap.cell_at(fp + FRAME_PREV_FP as u32);
        let prev_ip = self.heap.cell_at(fp + FRAME_PREV_IP as u32);
        let chunk = Ptr(self.heap.cell_at(fp + FRAME_CHUNK as u32));

        if prev_fp == 0 {
            return false;
        }

        let caller_chunk = Ptr(self.heap.cell_at(prev_fp + FRAME_CHUNK as u32));
        if caller_chunk != chunk {
            // Crossing back out of an overflow chunk: keep it as the
            // thread's spare for the next deep call.
            let thread = self.globals.current_thread;
            self.heap.set_ptr(thread, thread_layout::STACK, caller_chunk);
            self.heap.set_ptr(chunk, exec_stack::NEXT, Ptr::NULL);
            self.heap.set_ptr(thread, thread_layout::SPARE_CHUNK, chunk);
        }

        let caller_method = MethodId(self.heap.cell_at(prev_fp + FRAME_METHOD as u32));
        let caller_frame_size = self
            .registry
            .method(caller_method)
            .java_body()
            .map_or(0, |body| u32::from(body.frame_size));

        regs.method = caller_method;
        regs.ip = prev_ip;
        regs.fp = prev_fp;
        regs.lp = prev_fp - caller_frame_size;
        regs.sp = prev_sp;
        true
    }

    /// The synchronization object of the current frame (null if the
    /// method is not synchronized).
    #[must_use]
    pub(crate) fn frame_sync_object(&self, fp: u32) -> Ptr {
        Ptr(self.heap.cell_at(fp + FRAME_SYNC as u32))
    }
}
