//! Green threads, the cooperative scheduler, and the alarm queue.
//!
//! Exactly one thread executes at a time. Runnable threads sit in a
//! circular queue threaded through their `NEXT_READY` slots; the
//! scheduler rotates the current thread to the back when its time
//! slice expires, and priority pushes a resumed thread to the front.
//! Sleeping and timed-wait threads live on a sorted alarm queue keyed
//! by absolute wake time.

use crate::configuration::{STACK_CHUNK_CELLS, TIMESLICE_FACTOR};
use crate::error::Error::Internal;
use crate::error::Result;
use crate::frame::{Registers, FRAME_CELLS, FRAME_CHUNK, FRAME_METHOD, FRAME_PREV_FP, FRAME_PREV_IP, FRAME_PREV_SP, FRAME_SYNC, RESERVED_CELLS};
use crate::klass::MethodId;
use crate::vm::Vm;
use kelvin_gc::layout::{exec_stack, thread as layout};
use kelvin_gc::{GcKind, Ptr, RootScope};
use tracing::{debug, trace};

/// Thread scheduler states (the `STATE` slot).
pub mod state {
    /// Created but never resumed.
    pub const BORN: u32 = 0;
    /// Running or on the runnable queue.
    pub const ACTIVE: u32 = 1;
    /// Suspended: sleeping, waiting, or explicitly stopped.
    pub const SUSPENDED: u32 = 2;
    /// Terminated; off the alive list.
    pub const DEAD: u32 = 3;
}

/// Alarm actions (the `ALARM_ACTION` slot).
pub mod alarm {
    pub const NONE: u32 = 0;
    /// Resume the thread (sleep expiry).
    pub const RESUME: u32 = 1;
    /// Wait timeout: leave the condition queue and reacquire.
    pub const WAIT_TIMEOUT: u32 = 2;
}

/// Interrupt markers (the `PENDING_INTERRUPT` slot).
pub mod interrupt {
    pub const NONE: u32 = 0;
    /// Level-triggered flag; the next sleep/wait throws.
    pub const PENDING: u32 = 1;
    /// The thread was woken out of a sleep/wait by an interrupt;
    /// deliver `InterruptedException` at the next opcode boundary.
    pub const DELIVER: u32 = 2;
}

impl Vm {
    // ----- thread records -------------------------------------------------

    /// Create a thread record: alive but suspended, with no stack.
    ///
    /// # Errors
    /// `JavaThrow` on heap exhaustion.
    pub fn create_thread(&mut self, priority: u32) -> Result<Ptr> {
        let thread = self.allocate_cells(layout::CELLS, GcKind::Thread)?;
        let priority = priority.clamp(1, 10);
        self.heap.set(thread, layout::PRIORITY, priority);
        self.heap
            .set(thread, layout::TIMESLICE, priority * TIMESLICE_FACTOR);
        self.heap.set(thread, layout::STATE, state::BORN);
        // Insert on the alive list.
        let head = self.globals.alive_threads;
        self.heap.set_ptr(thread, layout::NEXT_ALIVE, head);
        self.globals.alive_threads = thread;
        self.globals.alive_count += 1;
        debug!("created thread {thread} with priority {priority}");
        Ok(thread)
    }

    /// Give a born thread its first stack chunk and activation record
    /// for `method_id`. The leading locals (entry arguments) are read
    /// from `arg_roots` *after* the stack chunk is allocated, because
    /// that allocation may move them.
    ///
    /// # Errors
    /// `JavaThrow` on heap exhaustion, `Internal` on a non-Java entry.
    pub fn attach_entry_frame(
        &mut self,
        thread: Ptr,
        method_id: MethodId,
        arg_roots: &[kelvin_gc::RootId],
    ) -> Result<()> {
        let body = self
            .registry
            .method(method_id)
            .java_body()
            .ok_or_else(|| Internal("thread entry method has no bytecode".to_string()))?;
        let frame_size = u32::from(body.frame_size);
        let need =
            frame_size as usize + FRAME_CELLS + body.max_stack as usize + RESERVED_CELLS;
        let area = need.max(STACK_CHUNK_CELLS);

        let roots = std::rc::Rc::clone(&self.roots);
        let scope = RootScope::new(&roots);
        let thread_root = scope.roots().push(thread);
        let chunk = self.allocate_cells(exec_stack::OVERHEAD + area, GcKind::ExecStack)?;
        let thread = scope.roots().get(thread_root);

        self.heap.set(chunk, exec_stack::SIZE, area as u32);
        self.heap.set_ptr(thread, layout::STACK, chunk);

        let base = self.chunk_base(chunk);
        for (index, &root) in arg_roots.iter().enumerate() {
            let value = roots.get(root);
            self.heap.set_cell_at(base + index as u32, value.0);
        }
        for index in arg_roots.len() as u32..frame_size {
            self.heap.set_cell_at(base + index, 0);
        }

        let fp = base + frame_size;
        self.heap.set_cell_at(fp + FRAME_PREV_SP as u32, base - 1);
        self.heap.set_cell_at(fp + FRAME_PREV_FP as u32, 0);
        self.heap.set_cell_at(fp + FRAME_PREV_IP as u32, 0);
        self.heap.set_cell_at(fp + FRAME_METHOD as u32, method_id.0);
        self.heap.set_cell_at(fp + FRAME_SYNC as u32, 0);
        self.heap.set_cell_at(fp + FRAME_CHUNK as u32, chunk.0);

        self.heap.set(thread, layout::FP, fp);
        self.heap.set(thread, layout::SP, fp + FRAME_CELLS as u32 - 1);
        self.heap.set(thread, layout::IP_METHOD, method_id.0);
        self.heap.set(thread, layout::IP_OFFSET, 0);
        Ok(())
    }

    /// Write the active registers into the current thread record.
    pub(crate) fn store_registers(&mut self, regs: &Registers) {
        let thread = self.globals.current_thread;
        if thread.is_null() {
            return;
        }
        self.heap.set(thread, layout::IP_METHOD, regs.method.0);
        self.heap.set(thread, layout::IP_OFFSET, regs.ip);
        self.heap.set(thread, layout::FP, regs.fp);
        self.heap.set(thread, layout::SP, regs.sp);
    }

    /// Reload the active registers from the current thread record
    /// (after any operation that may have moved the stack).
    pub(crate) fn load_registers(&self, regs: &mut Registers) {
        let thread = self.globals.current_thread;
        if thread.is_null() {
            return;
        }
        regs.fp = self.heap.get(thread, layout::FP);
        regs.sp = self.heap.get(thread, layout::SP);
        if regs.fp == 0 {
            // No activation record yet (a thread without a stack).
            regs.lp = 0;
            return;
        }
        regs.method = MethodId(self.heap.get(thread, layout::IP_METHOD));
        regs.ip = self.heap.get(thread, layout::IP_OFFSET);
        regs.lp = regs.fp
            - self
                .registry
                .method(regs.method)
                .java_body()
                .map_or(0, |body| u32::from(body.frame_size));
    }

    // ----- the runnable queue ---------------------------------------------

    /// Append to the back of the circular runnable queue (or the front
    /// for high-priority resumes).
    pub(crate) fn enqueue_runnable(&mut self, thread: Ptr, at_front: bool) {
        let tail = self.globals.runnable_tail;
        if tail.is_null() {
            self.heap.set_ptr(thread, layout::NEXT_READY, thread);
            self.globals.runnable_tail = thread;
        } else {
            let head = self.heap.get_ptr(tail, layout::NEXT_READY);
            self.heap.set_ptr(tail, layout::NEXT_READY, thread);
            self.heap.set_ptr(thread, layout::NEXT_READY, head);
            if !at_front {
                self.globals.runnable_tail = thread;
            }
        }
    }

    /// Pop the head of the runnable queue.
    pub(crate) fn dequeue_runnable(&mut self) -> Option<Ptr> {
        let tail = self.globals.runnable_tail;
        if tail.is_null() {
            return None;
        }
        let head = self.heap.get_ptr(tail, layout::NEXT_READY);
        if head == tail {
            self.globals.runnable_tail = Ptr::NULL;
        } else {
            let next = self.heap.get_ptr(head, layout::NEXT_READY);
            self.heap.set_ptr(tail, layout::NEXT_READY, next);
        }
        self.heap.set_ptr(head, layout::NEXT_READY, Ptr::NULL);
        Some(head)
    }

    /// Make a suspended or newborn thread runnable. Threads above
    /// normal priority go to the front of the queue so they run first.
    pub fn resume_thread(&mut self, thread: Ptr) {
        let current_state = self.heap.get(thread, layout::STATE);
        if current_state == state::ACTIVE || current_state == state::DEAD {
            return;
        }
        self.heap.set(thread, layout::STATE, state::ACTIVE);
        let priority = self.heap.get(thread, layout::PRIORITY);
        self.enqueue_runnable(thread, priority > 5);
        trace!("resumed thread {thread}");
    }

    /// Suspend the current thread: save registers and mark it; the
    /// caller has already parked it on whatever queue will wake it.
    pub(crate) fn suspend_current(&mut self, regs: &Registers) {
        let thread = self.globals.current_thread;
        self.store_registers(regs);
        self.heap.set(thread, layout::STATE, state::SUSPENDED);
        trace!("suspended thread {thread}");
    }

    /// Reset the current thread's time slice from its priority.
    pub(crate) fn refill_timeslice(&mut self, thread: Ptr) {
        let priority = self.heap.get(thread, layout::PRIORITY);
        self.heap
            .set(thread, layout::TIMESLICE, priority * TIMESLICE_FACTOR);
    }

    /// Remove a dead thread from the alive list; returns whether any
    /// alive threads remain.
    pub(crate) fn retire_thread(&mut self, thread: Ptr) -> bool {
        self.heap.set(thread, layout::STATE, state::DEAD);
        self.remove_alarm(thread);
        let mut previous = Ptr::NULL;
        let mut cursor = self.globals.alive_threads;
        while !cursor.is_null() {
            let next = self.heap.get_ptr(cursor, layout::NEXT_ALIVE);
            if cursor == thread {
                if previous.is_null() {
                    self.globals.alive_threads = next;
                } else {
                    self.heap.set_ptr(previous, layout::NEXT_ALIVE, next);
                }
                self.globals.alive_count -= 1;
                break;
            }
            previous = cursor;
            cursor = next;
        }
        debug!("thread {thread} terminated; {} alive", self.globals.alive_count);
        self.globals.alive_count > 0
    }

    // ----- the alarm queue ------------------------------------------------

    /// Register (or re-register) an alarm for `thread`, `delta_ms`
    /// from now, with the given wake action.
    pub(crate) fn register_alarm(&mut self, thread: Ptr, delta_ms: u64, action: u32) {
        self.remove_alarm(thread);
        let wake = self.host.current_time_millis().saturating_add(delta_ms);
        self.heap.set(thread, layout::ALARM_LO, wake as u32);
        self.heap.set(thread, layout::ALARM_HI, (wake >> 32) as u32);
        self.heap.set(thread, layout::ALARM_ACTION, action);

        // Sorted insert by absolute wake time.
        let mut previous = Ptr::NULL;
        let mut cursor = self.globals.timer_queue;
        while !cursor.is_null() && self.wake_time(cursor) <= wake {
            previous = cursor;
            cursor = self.heap.get_ptr(cursor, layout::NEXT_ALARM);
        }
        self.heap.set_ptr(thread, layout::NEXT_ALARM, cursor);
        if previous.is_null() {
            self.globals.timer_queue = thread;
        } else {
            self.heap.set_ptr(previous, layout::NEXT_ALARM, thread);
        }
        trace!("alarm for {thread} at {wake}ms (action {action})");
    }

    /// Remove a thread from the alarm queue, if present.
    pub(crate) fn remove_alarm(&mut self, thread: Ptr) {
        let mut previous = Ptr::NULL;
        let mut cursor = self.globals.timer_queue;
        while !cursor.is_null() {
            let next = self.heap.get_ptr(cursor, layout::NEXT_ALARM);
            if cursor == thread {
                if previous.is_null() {
                    self.globals.timer_queue = next;
                } else {
                    self.heap.set_ptr(previous, layout::NEXT_ALARM, next);
                }
                self.heap.set_ptr(thread, layout::NEXT_ALARM, Ptr::NULL);
                self.heap.set(thread, layout::ALARM_ACTION, alarm::NONE);
                return;
            }
            previous = cursor;
            cursor = next;
        }
    }

    fn wake_time(&self, thread: Ptr) -> u64 {
        let low = u64::from(self.heap.get(thread, layout::ALARM_LO));
        let high = u64::from(self.heap.get(thread, layout::ALARM_HI));
        (high << 32) | low
    }

    /// Fire every due alarm and report the delay until the next one
    /// (`None` when the queue is empty).
    pub fn check_timer_queue(&mut self) -> Option<u64> {
        let now = self.host.current_time_millis();
        loop {
            let head = self.globals.timer_queue;
            if head.is_null() {
                return None;
            }
            let wake = self.wake_time(head);
            if wake > now {
                return Some(wake - now);
            }
            self.globals.timer_queue = self.heap.get_ptr(head, layout::NEXT_ALARM);
            self.heap.set_ptr(head, layout::NEXT_ALARM, Ptr::NULL);
            let action = self.heap.get(head, layout::ALARM_ACTION);
            self.heap.set(head, layout::ALARM_ACTION, alarm::NONE);
            match action {
                alarm::WAIT_TIMEOUT => self.wake_from_wait_timeout(head),
                _ => self.resume_thread(head),
            }
        }
    }

    // ----- interrupts -----------------------------------------------------

    /// Level-triggered interrupt: set the flag; a sleeping or waiting
    /// target is woken immediately and will have
    /// `InterruptedException` delivered at its next opcode boundary.
    pub fn interrupt_thread(&mut self, thread: Ptr) {
        let thread_state = self.heap.get(thread, layout::STATE);
        let sleeping = self.heap.get(thread, layout::ALARM_ACTION) == alarm::RESUME;
        let in_wait = !self.heap.get_ptr(thread, layout::WAITING_ON).is_null()
            && self.heap.get(thread, layout::WAIT_DEPTH) > 0;

        if thread_state == state::SUSPENDED && in_wait {
            // Interrupted out of Object.wait: the thread reacquires
            // the monitor first, then the exception is delivered.
            self.remove_alarm(thread);
            self.abandon_wait(thread);
            self.heap
                .set(thread, layout::PENDING_INTERRUPT, interrupt::DELIVER);
        } else if thread_state == state::SUSPENDED && sleeping {
            self.remove_alarm(thread);
            self.heap
                .set(thread, layout::PENDING_INTERRUPT, interrupt::DELIVER);
            self.resume_thread(thread);
        } else {
            self.heap
                .set(thread, layout::PENDING_INTERRUPT, interrupt::PENDING);
        }
        debug!("interrupted thread {thread}");
    }

    /// Count of alive threads.
    #[must_use]
    pub fn active_count(&self) -> u32 {
        self.globals.alive_count
    }
}
