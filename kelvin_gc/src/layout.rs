//! Fixed payload layouts of collector-known object shapes.
//!
//! These offsets are shared between the collector (which must know
//! which cells are pointers) and the VM (which reads and writes the
//! records). All offsets are in payload cells.

/// Instances and arrays: class id, then the MHC word.
pub mod object {
    /// Class id (a registry index, not a heap pointer).
    pub const CLASS: usize = 0;
    /// The monitor-or-hashcode word.
    pub const MHC: usize = 1;
    /// First field of an instance.
    pub const FIELDS: usize = 2;
    /// Array length.
    pub const LENGTH: usize = 2;
    /// First array element cell.
    pub const DATA: usize = 3;
    /// Payload cells before instance fields.
    pub const INSTANCE_OVERHEAD: usize = 2;
    /// Payload cells before array elements.
    pub const ARRAY_OVERHEAD: usize = 3;
}

/// `PointerList` / `MethodTable`: `[length, pointer...]`.
pub mod pointer_list {
    pub const LENGTH: usize = 0;
    pub const DATA: usize = 1;
}

/// `WeakPointerList`: `[length, finalizer, weak pointer...]`.
///
/// `finalizer` is a key into the VM's native-finalizer table; 0 means
/// none. Cleared slots with a finalizer invoke it exactly once.
pub mod weak_pointer_list {
    pub const LENGTH: usize = 0;
    pub const FINALIZER: usize = 1;
    pub const DATA: usize = 2;
}

/// `WeakReference`: `[class, mhc, referent]`.
pub mod weak_reference {
    pub const REFERENT: usize = 2;
    pub const CELLS: usize = 3;
}

/// `ExecStack`: one chunk of a thread's segmented stack.
pub mod exec_stack {
    /// Next chunk in the thread's chain (older direction).
    pub const NEXT: usize = 0;
    /// Usable stack cells in this chunk.
    pub const SIZE: usize = 1;
    /// First stack cell.
    pub const CELLS: usize = 2;
    /// Payload cells before the stack area.
    pub const OVERHEAD: usize = 2;
}

/// The VM thread record.
///
/// Slots 4 and 5 are interior cell addresses into one of the thread's
/// stack chunks; the collector relocates them by address, it does not
/// mark through them.
pub mod thread {
    /// Next thread on the global alive list.
    pub const NEXT_ALIVE: usize = 0;
    /// Next thread in the runnable queue.
    pub const NEXT_READY: usize = 1;
    /// The `java/lang/Thread` instance, if materialised.
    pub const JAVA_THREAD: usize = 2;
    /// Newest stack chunk.
    pub const STACK: usize = 3;
    /// Saved frame pointer (interior address).
    pub const FP: usize = 4;
    /// Saved stack pointer (interior address).
    pub const SP: usize = 5;
    /// Saved instruction pointer: method id.
    pub const IP_METHOD: usize = 6;
    /// Saved instruction pointer: bytecode offset.
    pub const IP_OFFSET: usize = 7;
    /// Remaining time slice, in bytecodes.
    pub const TIMESLICE: usize = 8;
    /// Java priority, 1..=10.
    pub const PRIORITY: usize = 9;
    /// Scheduler state discriminant.
    pub const STATE: usize = 10;
    /// Monitor this thread is queued on, if suspended on one.
    pub const WAITING_ON: usize = 11;
    /// Next thread in a monitor queue.
    pub const NEXT_WAITER: usize = 12;
    /// Lock depth while the owned lock is in the extended state.
    pub const EXT_DEPTH: usize = 13;
    /// Hashcode carried while the owned lock is in the extended state.
    pub const EXT_HASH: usize = 14;
    /// Level-triggered interrupt flag.
    pub const PENDING_INTERRUPT: usize = 15;
    /// Exception to deliver at the next opcode boundary.
    pub const PENDING_EXCEPTION: usize = 16;
    /// Monitor depth saved across `wait`.
    pub const WAIT_DEPTH: usize = 17;
    /// Absolute wake time, low word.
    pub const ALARM_LO: usize = 18;
    /// Absolute wake time, high word.
    pub const ALARM_HI: usize = 19;
    /// Next thread on the sorted alarm queue.
    pub const NEXT_ALARM: usize = 20;
    /// What to do when the alarm fires (scheduler discriminant).
    pub const ALARM_ACTION: usize = 21;
    /// A popped stack chunk kept for reuse by the next deep call.
    pub const SPARE_CHUNK: usize = 22;
    /// The object whose lock occupies the extended-lock slots; the
    /// slots hold at most one lock at a time.
    pub const EXT_OBJECT: usize = 23;
    /// Total record size.
    pub const CELLS: usize = 24;
    /// Slots holding ordinary heap pointers.
    pub const POINTER_SLOTS: [usize; 10] = [
        NEXT_ALIVE,
        NEXT_READY,
        JAVA_THREAD,
        STACK,
        WAITING_ON,
        NEXT_WAITER,
        PENDING_EXCEPTION,
        NEXT_ALARM,
        SPARE_CHUNK,
        EXT_OBJECT,
    ];
    /// Slots holding interior stack addresses.
    pub const INTERIOR_SLOTS: [usize; 2] = [FP, SP];
}

/// The inflated monitor record.
pub mod monitor {
    /// Owning thread, null when unowned.
    pub const OWNER: usize = 0;
    /// Nesting depth of the owner.
    pub const DEPTH: usize = 1;
    /// Identity hashcode of the locked object, 0 if unassigned.
    pub const HASH: usize = 2;
    /// Head of the lock-acquire queue (chained via thread NEXT_WAITER).
    pub const LOCK_QUEUE: usize = 3;
    /// Head of the condition-variable queue.
    pub const COND_QUEUE: usize = 4;
    /// The object this monitor inflates.
    pub const OBJECT: usize = 5;
    /// Total record size.
    pub const CELLS: usize = 6;
    /// Slots holding ordinary heap pointers.
    pub const POINTER_SLOTS: [usize; 4] = [OWNER, LOCK_QUEUE, COND_QUEUE, OBJECT];
}
