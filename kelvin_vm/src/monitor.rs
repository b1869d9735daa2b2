//! Object locking: the four-state lock word protocol.
//!
//! An unlocked object's MHC word carries its hashcode. The first
//! acquisition takes the cheap `SimpleLock` state; re-entry or a
//! hashcode promotes to `ExtendedLock`, whose depth and hashcode live
//! in the owner thread's extended-lock slots; contention, `wait`, or a
//! second extended lock inflates to a heap `Monitor` record with lock
//! and condition queues. The collector dissolves a monitor back to the
//! unlocked state once it has no owner and no waiters.

use crate::error::Result;
use crate::frame::Registers;
use crate::thread::alarm;
use crate::vm::Vm;
use kelvin_gc::layout::{monitor as mon, object, thread as layout};
use kelvin_gc::{LockWord, Ptr, RootScope};
use tracing::trace;

/// Results of the monitor operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MonitorStatus {
    /// The current thread owns the monitor.
    Own,
    /// The current thread released the monitor.
    Released,
    /// The current thread is suspended waiting for the monitor.
    Waiting,
    /// The operation was illegal (`IllegalMonitorStateException`).
    Error,
}

impl Vm {
    /// Acquire `object`'s lock for the current thread, suspending on
    /// contention.
    ///
    /// # Errors
    /// `JavaThrow` on heap exhaustion while inflating.
    pub fn monitor_enter(&mut self, regs: &mut Registers, object: Ptr) -> Result<MonitorStatus> {
        let current = self.globals.current_thread;
        let lock = LockWord::from_cell(self.heap.get(object, object::MHC));
        let status = match lock {
            LockWord::Unlocked { hash } => {
                if hash == 0 {
                    self.heap.set(
                        object,
                        object::MHC,
                        LockWord::SimpleLock { owner: current }.to_cell(),
                    );
                    MonitorStatus::Own
                } else if self.extended_slots_free(current) {
                    // The hashcode must survive, so the lock goes
                    // straight to the extended state.
                    self.claim_extended(current, object, 1, hash);
                    MonitorStatus::Own
                } else {
                    // Inflation may collect and move the thread record.
                    let monitor = self.inflate_lock(regs, object)?;
                    let current = self.globals.current_thread;
                    self.heap.set_ptr(monitor, mon::OWNER, current);
                    self.heap.set(monitor, mon::DEPTH, 1);
                    MonitorStatus::Own
                }
            }
            LockWord::SimpleLock { owner } if owner == current => {
                if self.extended_slots_free(current) {
                    self.claim_extended(current, object, 2, 0);
                    MonitorStatus::Own
                } else {
                    let monitor = self.inflate_lock(regs, object)?;
                    let depth = self.heap.get(monitor, mon::DEPTH);
                    self.heap.set(monitor, mon::DEPTH, depth + 1);
                    MonitorStatus::Own
                }
            }
            LockWord::ExtendedLock { owner } if owner == current => {
                let depth = self.heap.get(current, layout::EXT_DEPTH);
                self.heap.set(current, layout::EXT_DEPTH, depth + 1);
                MonitorStatus::Own
            }
            LockWord::SimpleLock { .. } | LockWord::ExtendedLock { .. } => {
                // Contention: inflate, queue, suspend. Inflation may
                // collect and move the thread record.
                let monitor = self.inflate_lock(regs, object)?;
                let current = self.globals.current_thread;
                self.enqueue_waiter(monitor, mon::LOCK_QUEUE, current);
                self.heap.set_ptr(current, layout::WAITING_ON, monitor);
                self.suspend_current(regs);
                MonitorStatus::Waiting
            }
            LockWord::Monitor { monitor } => {
                let owner = self.heap.get_ptr(monitor, mon::OWNER);
                if owner == current {
                    let depth = self.heap.get(monitor, mon::DEPTH);
                    self.heap.set(monitor, mon::DEPTH, depth + 1);
                    MonitorStatus::Own
                } else if owner.is_null() {
                    self.heap.set_ptr(monitor, mon::OWNER, current);
                    self.heap.set(monitor, mon::DEPTH, 1);
                    MonitorStatus::Own
                } else {
                    self.enqueue_waiter(monitor, mon::LOCK_QUEUE, current);
                    self.heap.set_ptr(current, layout::WAITING_ON, monitor);
                    self.suspend_current(regs);
                    MonitorStatus::Waiting
                }
            }
        };
        trace!("monitor_enter {object}: {status:?}");
        Ok(status)
    }

    /// Release one nesting level of `object`'s lock. `Error` means the
    /// current thread does not own it.
    pub fn monitor_exit(&mut self, object: Ptr) -> MonitorStatus {
        let current = self.globals.current_thread;
        let lock = LockWord::from_cell(self.heap.get(object, object::MHC));
        match lock {
            LockWord::Unlocked { .. } => MonitorStatus::Error,
            LockWord::SimpleLock { owner } => {
                if owner != current {
                    return MonitorStatus::Error;
                }
                self.heap
                    .set(object, object::MHC, LockWord::Unlocked { hash: 0 }.to_cell());
                MonitorStatus::Released
            }
            LockWord::ExtendedLock { owner } => {
                if owner != current {
                    return MonitorStatus::Error;
                }
                let depth = self.heap.get(current, layout::EXT_DEPTH);
                if depth > 1 {
                    self.heap.set(current, layout::EXT_DEPTH, depth - 1);
                    MonitorStatus::Own
                } else {
                    let hash = self.heap.get(current, layout::EXT_HASH);
                    self.release_extended(current);
                    self.heap
                        .set(object, object::MHC, LockWord::Unlocked { hash }.to_cell());
                    MonitorStatus::Released
                }
            }
            LockWord::Monitor { monitor } => {
                if self.heap.get_ptr(monitor, mon::OWNER) != current {
                    return MonitorStatus::Error;
                }
                let depth = self.heap.get(monitor, mon::DEPTH);
                if depth > 1 {
                    self.heap.set(monitor, mon::DEPTH, depth - 1);
                    MonitorStatus::Own
                } else {
                    self.release_monitor_ownership(monitor);
                    MonitorStatus::Released
                }
            }
        }
    }

    /// `Object.wait`: fully release (remembering the depth), join the
    /// condition queue, optionally arm a timeout alarm, and suspend.
    ///
    /// # Errors
    /// `JavaThrow` on heap exhaustion while inflating.
    pub fn monitor_wait(
        &mut self,
        regs: &mut Registers,
        object: Ptr,
        timeout_ms: u64,
    ) -> Result<MonitorStatus> {
        let current = self.globals.current_thread;
        if !self.owns_lock(current, object) {
            return Ok(MonitorStatus::Error);
        }
        // Waiting always needs the condition queue, hence a monitor.
        // Inflation may collect and move the thread record.
        let monitor = self.inflate_lock(regs, object)?;
        let current = self.globals.current_thread;

        let depth = self.heap.get(monitor, mon::DEPTH);
        self.heap.set(current, layout::WAIT_DEPTH, depth);
        self.release_monitor_ownership(monitor);

        self.enqueue_waiter(monitor, mon::COND_QUEUE, current);
        self.heap.set_ptr(current, layout::WAITING_ON, monitor);
        if timeout_ms > 0 {
            self.register_alarm(current, timeout_ms, alarm::WAIT_TIMEOUT);
        }
        self.suspend_current(regs);
        Ok(MonitorStatus::Waiting)
    }

    /// `Object.notify` / `notifyAll`: move waiters from the condition
    /// queue to the lock queue; they reacquire normally.
    pub fn monitor_notify(&mut self, object: Ptr, all: bool) -> MonitorStatus {
        let current = self.globals.current_thread;
        if !self.owns_lock(current, object) {
            return MonitorStatus::Error;
        }
        let LockWord::Monitor { monitor } = LockWord::from_cell(self.heap.get(object, object::MHC))
        else {
            // Simple or extended lock: nothing can be waiting.
            return MonitorStatus::Own;
        };
        loop {
            let Some(waiter) = self.dequeue_waiter(monitor, mon::COND_QUEUE) else {
                break;
            };
            self.remove_alarm(waiter);
            self.enqueue_waiter(monitor, mon::LOCK_QUEUE, waiter);
            if !all {
                break;
            }
        }
        MonitorStatus::Own
    }

    /// Whether `thread` owns `object`'s lock in any state.
    #[must_use]
    pub fn owns_lock(&self, thread: Ptr, object: Ptr) -> bool {
        match LockWord::from_cell(self.heap.get(object, object::MHC)) {
            LockWord::Unlocked { .. } => false,
            LockWord::SimpleLock { owner } | LockWord::ExtendedLock { owner } => owner == thread,
            LockWord::Monitor { monitor } => self.heap.get_ptr(monitor, mon::OWNER) == thread,
        }
    }

    // ----- inflation ------------------------------------------------------

    /// Convert `object`'s lock to the inflated state, preserving owner,
    /// depth and hashcode. Allocates, so `object` is protected by a
    /// temporary root and re-read afterwards; the (possibly moved)
    /// monitor pointer is returned.
    ///
    /// # Errors
    /// `JavaThrow` on heap exhaustion.
    pub(crate) fn inflate_lock(&mut self, regs: &mut Registers, object: Ptr) -> Result<Ptr> {
        if let LockWord::Monitor { monitor } = LockWord::from_cell(self.heap.get(object, object::MHC))
        {
            return Ok(monitor);
        }

        let roots = std::rc::Rc::clone(&self.roots);
        let scope = RootScope::new(&roots);
        let object_root = scope.roots().push(object);
        self.store_registers(regs);
        let monitor = self.allocate_cells(mon::CELLS, kelvin_gc::GcKind::Monitor)?;
        self.load_registers(regs);
        let object = scope.roots().get(object_root);

        let (owner, depth, hash) = match LockWord::from_cell(self.heap.get(object, object::MHC)) {
            LockWord::Unlocked { hash } => (Ptr::NULL, 0, hash),
            LockWord::SimpleLock { owner } => (owner, 1, 0),
            LockWord::ExtendedLock { owner } => {
                let depth = self.heap.get(owner, layout::EXT_DEPTH);
                let hash = self.heap.get(owner, layout::EXT_HASH);
                self.release_extended(owner);
                (owner, depth, hash)
            }
            LockWord::Monitor { monitor } => return Ok(monitor),
        };

        self.heap.set_ptr(monitor, mon::OWNER, owner);
        self.heap.set(monitor, mon::DEPTH, depth);
        self.heap.set(monitor, mon::HASH, hash);
        self.heap.set_ptr(monitor, mon::OBJECT, object);
        self.heap
            .set(object, object::MHC, LockWord::Monitor { monitor }.to_cell());
        trace!("inflated lock on {object} -> monitor {monitor}");
        Ok(monitor)
    }

    pub(crate) fn extended_slots_free(&self, thread: Ptr) -> bool {
        self.heap.get_ptr(thread, layout::EXT_OBJECT).is_null()
    }

    /// Take the thread's single extended-lock slot for `object`. All
    /// three slots (object, depth, hashcode) move together; the slot
    /// must currently be free.
    pub(crate) fn claim_extended(&mut self, thread: Ptr, object: Ptr, depth: u32, hash: u32) {
        self.heap.set_ptr(thread, layout::EXT_OBJECT, object);
        self.heap.set(thread, layout::EXT_DEPTH, depth);
        self.heap.set(thread, layout::EXT_HASH, hash);
        self.heap.set(
            object,
            object::MHC,
            LockWord::ExtendedLock { owner: thread }.to_cell(),
        );
    }

    fn release_extended(&mut self, thread: Ptr) {
        self.heap.set_ptr(thread, layout::EXT_OBJECT, Ptr::NULL);
        self.heap.set(thread, layout::EXT_DEPTH, 0);
        self.heap.set(thread, layout::EXT_HASH, 0);
    }

    /// Drop ownership of an inflated monitor entirely and hand it to
    /// the head of the lock queue, if any.
    fn release_monitor_ownership(&mut self, monitor: Ptr) {
        self.heap.set_ptr(monitor, mon::OWNER, Ptr::NULL);
        self.heap.set(monitor, mon::DEPTH, 0);
        if let Some(next) = self.dequeue_waiter(monitor, mon::LOCK_QUEUE) {
            self.grant_monitor(monitor, next);
        }
    }

    /// Transfer ownership to a thread popped off the lock queue,
    /// restoring a saved wait depth if it was waiting.
    fn grant_monitor(&mut self, monitor: Ptr, thread: Ptr) {
        let saved = self.heap.get(thread, layout::WAIT_DEPTH);
        let depth = if saved > 0 { saved } else { 1 };
        self.heap.set(thread, layout::WAIT_DEPTH, 0);
        self.heap.set_ptr(monitor, mon::OWNER, thread);
        self.heap.set(monitor, mon::DEPTH, depth);
        self.heap.set_ptr(thread, layout::WAITING_ON, Ptr::NULL);
        self.resume_thread(thread);
    }

    // ----- wait queues ----------------------------------------------------

    fn enqueue_waiter(&mut self, monitor: Ptr, queue_slot: usize, thread: Ptr) {
        self.heap.set_ptr(thread, layout::NEXT_WAITER, Ptr::NULL);
        let head = self.heap.get_ptr(monitor, queue_slot);
        if head.is_null() {
            self.heap.set_ptr(monitor, queue_slot, thread);
            return;
        }
        let mut cursor = head;
        loop {
            let next = self.heap.get_ptr(cursor, layout::NEXT_WAITER);
            if next.is_null() {
                self.heap.set_ptr(cursor, layout::NEXT_WAITER, thread);
                return;
            }
            cursor = next;
        }
    }

    fn dequeue_waiter(&mut self, monitor: Ptr, queue_slot: usize) -> Option<Ptr> {
        let head = self.heap.get_ptr(monitor, queue_slot);
        if head.is_null() {
            return None;
        }
        let next = self.heap.get_ptr(head, layout::NEXT_WAITER);
        self.heap.set_ptr(monitor, queue_slot, next);
        self.heap.set_ptr(head, layout::NEXT_WAITER, Ptr::NULL);
        Some(head)
    }

    fn remove_waiter(&mut self, monitor: Ptr, queue_slot: usize, thread: Ptr) -> bool {
        let mut previous = Ptr::NULL;
        let mut cursor = self.heap.get_ptr(monitor, queue_slot);
        while !cursor.is_null() {
            let next = self.heap.get_ptr(cursor, layout::NEXT_WAITER);
            if cursor == thread {
                if previous.is_null() {
                    self.heap.set_ptr(monitor, queue_slot, next);
                } else {
                    self.heap.set_ptr(previous, layout::NEXT_WAITER, next);
                }
                self.heap.set_ptr(thread, layout::NEXT_WAITER, Ptr::NULL);
                return true;
            }
            previous = cursor;
            cursor = next;
        }
        false
    }

    // ----- scheduler callbacks --------------------------------------------

    /// A `wait(timeout)` alarm fired: leave the condition queue and
    /// queue for reacquisition, taking the monitor at once if it is
    /// free.
    pub(crate) fn wake_from_wait_timeout(&mut self, thread: Ptr) {
        let monitor = self.heap.get_ptr(thread, layout::WAITING_ON);
        if monitor.is_null() {
            self.resume_thread(thread);
            return;
        }
        if self.remove_waiter(monitor, mon::COND_QUEUE, thread) {
            if self.heap.get_ptr(monitor, mon::OWNER).is_null() {
                self.grant_monitor(monitor, thread);
            } else {
                self.enqueue_waiter(monitor, mon::LOCK_QUEUE, thread);
            }
        }
    }

    /// An interrupt hit a thread waiting on a monitor: it must
    /// reacquire before `InterruptedException` is delivered, so it
    /// moves to the front of the lock queue (or takes the monitor at
    /// once).
    pub(crate) fn abandon_wait(&mut self, thread: Ptr) {
        let monitor = self.heap.get_ptr(thread, layout::WAITING_ON);
        if monitor.is_null() {
            return;
        }
        if self.remove_waiter(monitor, mon::COND_QUEUE, thread) {
            if self.heap.get_ptr(monitor, mon::OWNER).is_null() {
                self.grant_monitor(monitor, thread);
            } else {
                // Front of the queue: the interrupt should win the
                // next release.
                let head = self.heap.get_ptr(monitor, mon::LOCK_QUEUE);
                self.heap.set_ptr(thread, layout::NEXT_WAITER, head);
                self.heap.set_ptr(monitor, mon::LOCK_QUEUE, thread);
            }
        }
    }
}
