//! The native method interface and the built-in natives.
//!
//! A native is found by `(class name, method name, signature)` and
//! called with a [`NativeCtx`]: arguments are read by slot index,
//! return values are pushed back onto the operand stack, and exceptions
//! are raised through a pending slot that unwinds at the next opcode
//! boundary. Natives that block park the current thread through the
//! scheduler and mark the context suspended; the interpreter switches
//! threads when the call returns.

use crate::error::Result;
use crate::frame::Registers;
use crate::klass::{ArrayElement, ClassId, MethodId};
use crate::object::{self, STRING_COUNT, STRING_OFFSET, STRING_VALUE};
use crate::string_table::StringKey;
use crate::throw::names;
use crate::thread::{interrupt, state};
use crate::vm::Vm;
use ahash::AHashMap;
use kelvin_gc::layout::{object as obj, thread as thread_layout};
use kelvin_gc::{GcKind, Ptr, RootScope};
use tracing::trace;

/// A native method implementation.
pub type NativeFn = fn(&mut NativeCtx<'_>) -> Result<()>;

/// The registry of natives, keyed by interned
/// `(class, name, signature)`.
#[derive(Debug, Default)]
pub struct NativeTable {
    entries: Vec<NativeFn>,
    index: AHashMap<(StringKey, StringKey, StringKey), usize>,
}

impl NativeTable {
    /// Register an implementation; later registrations shadow earlier
    /// ones (hosts may override built-ins).
    pub fn register(
        &mut self,
        class: StringKey,
        name: StringKey,
        signature: StringKey,
        function: NativeFn,
    ) {
        let index = self.entries.len();
        self.entries.push(function);
        self.index.insert((class, name, signature), index);
    }

    /// Find a native's table index.
    #[must_use]
    pub fn find(&self, class: StringKey, name: StringKey, signature: StringKey) -> Option<usize> {
        self.index.get(&(class, name, signature)).copied()
    }

    /// Fetch by table index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<NativeFn> {
        self.entries.get(index).copied()
    }
}

/// Invocation context handed to a native.
pub struct NativeCtx<'a> {
    pub vm: &'a mut Vm,
    pub regs: &'a mut Registers,
    /// Argument cells, copied out before the stack was popped.
    args: Vec<u32>,
    /// Buffered return cells, pushed after the call.
    returns: Vec<u32>,
    /// Exception to raise at the next opcode boundary.
    pending: Option<(&'static str, String)>,
    /// The native parked the current thread.
    suspended: bool,
    /// The native requested a voluntary reschedule.
    yielded: bool,
}

impl<'a> NativeCtx<'a> {
    pub(crate) fn new(vm: &'a mut Vm, regs: &'a mut Registers, args: Vec<u32>) -> Self {
        NativeCtx {
            vm,
            regs,
            args,
            returns: Vec::new(),
            pending: None,
            suspended: false,
            yielded: false,
        }
    }

    /// Argument slot `index` as a raw cell.
    #[must_use]
    pub fn parameter(&self, index: usize) -> u32 {
        self.args[index]
    }

    /// Argument slot `index` as an object pointer.
    #[must_use]
    pub fn parameter_ptr(&self, index: usize) -> Ptr {
        Ptr(self.args[index])
    }

    /// Argument slots `index`/`index + 1` as a long (high word first).
    #[must_use]
    pub fn parameter_long(&self, index: usize) -> i64 {
        let high = u64::from(self.args[index]);
        let low = u64::from(self.args[index + 1]);
        ((high << 32) | low) as i64
    }

    /// Push a one-cell return value.
    pub fn push(&mut self, value: u32) {
        self.returns.push(value);
    }

    /// Push an object return value.
    pub fn push_ptr(&mut self, value: Ptr) {
        self.returns.push(value.0);
    }

    /// Push a two-cell return value (high word first).
    pub fn push_long(&mut self, value: i64) {
        self.returns.push((value as u64 >> 32) as u32);
        self.returns.push(value as u32);
    }

    /// Raise `class_name` when the native returns.
    pub fn set_pending(&mut self, class_name: &'static str, message: &str) {
        self.pending = Some((class_name, message.to_string()));
    }

    /// Mark the thread as parked; the interpreter switches away.
    pub fn mark_suspended(&mut self) {
        self.suspended = true;
    }

    /// Request a voluntary reschedule.
    pub fn mark_yielded(&mut self) {
        self.yielded = true;
    }

    pub(crate) fn into_outcome(self) -> NativeOutcome {
        NativeOutcome {
            returns: self.returns,
            pending: self.pending,
            suspended: self.suspended,
            yielded: self.yielded,
        }
    }
}

/// What a native call left behind.
pub(crate) struct NativeOutcome {
    pub returns: Vec<u32>,
    pub pending: Option<(&'static str, String)>,
    pub suspended: bool,
    pub yielded: bool,
}

impl Vm {
    /// Bind a method to its native implementation, caching the table
    /// index on the method body.
    pub(crate) fn bind_native(&mut self, method_id: MethodId) -> Option<NativeFn> {
        let method = self.registry.method(method_id);
        let crate::klass::MethodBody::Native { table_index } = &method.body else {
            return None;
        };
        if let Some(index) = table_index.get() {
            return self.natives.get(index);
        }
        let class_key = self.registry.class(method.class_id).name_key;
        let index = self
            .natives
            .find(class_key, method.name_key, method.type_key)?;
        table_index.set(Some(index));
        self.natives.get(index)
    }

    /// Register the built-in native set. Runs once at construction,
    /// after [`Vm::bootstrap`].
    pub(crate) fn register_builtin_natives(&mut self) -> Result<()> {
        let entries: &[(&str, &str, &str, NativeFn)] = &[
            ("java/lang/Object", "hashCode", "()I", object_hash_code),
            ("java/lang/Object", "equals", "(Ljava/lang/Object;)Z", object_equals),
            ("java/lang/Object", "notify", "()V", object_notify),
            ("java/lang/Object", "notifyAll", "()V", object_notify_all),
            ("java/lang/Object", "wait", "()V", object_wait_untimed),
            ("java/lang/Object", "wait", "(J)V", object_wait),
            ("java/lang/String", "length", "()I", string_length),
            ("java/lang/String", "charAt", "(I)C", string_char_at),
            ("java/lang/String", "intern", "()Ljava/lang/String;", string_intern),
            ("java/lang/Throwable", "<init>", "()V", throwable_init),
            (
                "java/lang/Throwable",
                "<init>",
                "(Ljava/lang/String;)V",
                throwable_init_message,
            ),
            (
                "java/lang/Throwable",
                "getMessage",
                "()Ljava/lang/String;",
                throwable_get_message,
            ),
            ("java/lang/Thread", "<init>", "()V", thread_init),
            (
                "java/lang/Thread",
                "<init>",
                "(Ljava/lang/Runnable;)V",
                thread_init_runnable,
            ),
            ("java/lang/Thread", "start", "()V", thread_start),
            ("java/lang/Thread", "run", "()V", thread_run),
            ("java/lang/Thread", "interrupt", "()V", thread_interrupt),
            ("java/lang/Thread", "setPriority", "(I)V", thread_set_priority),
            ("java/lang/Thread", "getPriority", "()I", thread_get_priority),
            ("java/lang/Thread", "isAlive", "()Z", thread_is_alive),
            ("java/lang/Thread", "sleep", "(J)V", thread_sleep),
            ("java/lang/Thread", "yield", "()V", thread_yield),
            (
                "java/lang/Thread",
                "currentThread",
                "()Ljava/lang/Thread;",
                thread_current,
            ),
            ("java/lang/Thread", "activeCount", "()I", thread_active_count),
            (
                "java/lang/System",
                "currentTimeMillis",
                "()J",
                system_current_time_millis,
            ),
            (
                "java/lang/System",
                "arraycopy",
                "(Ljava/lang/Object;ILjava/lang/Object;II)V",
                system_arraycopy,
            ),
            (
                "java/lang/System",
                "identityHashCode",
                "(Ljava/lang/Object;)I",
                system_identity_hash_code,
            ),
            ("java/lang/System", "exit", "(I)V", system_exit),
            ("java/lang/System", "gc", "()V", system_gc),
            ("java/lang/System", "print", "(Ljava/lang/String;)V", system_print_string),
            ("java/lang/System", "print", "(I)V", system_print_int),
            (
                "java/lang/System",
                "println",
                "(Ljava/lang/String;)V",
                system_println_string,
            ),
            ("java/lang/System", "println", "(I)V", system_println_int),
            ("java/lang/System", "println", "()V", system_println),
        ];
        for (class, name, descriptor, function) in entries {
            let class_key = self.strings.intern(class)?;
            let name_key = self.strings.intern(name)?;
            let parsed = kelvin_classfile::MethodDescriptor::parse(descriptor)
                .map_err(|error| crate::error::Error::Internal(error.to_string()))?;
            let type_key =
                crate::string_table::compress_method_descriptor(&parsed, &mut self.strings)?;
            self.natives.register(class_key, name_key, type_key, *function);
        }
        Ok(())
    }
}

// ----- java/lang/Object --------------------------------------------------

fn object_hash_code(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    let hash = ctx.vm.identity_hash(ctx.regs, receiver)?;
    ctx.push(hash);
    Ok(())
}

fn object_equals(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let same = ctx.parameter(0) == ctx.parameter(1);
    ctx.push(u32::from(same));
    Ok(())
}

fn object_notify(ctx: &mut NativeCtx<'_>) -> Result<()> {
    notify_common(ctx, false)
}

fn object_notify_all(ctx: &mut NativeCtx<'_>) -> Result<()> {
    notify_common(ctx, true)
}

fn notify_common(ctx: &mut NativeCtx<'_>, all: bool) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    if ctx.vm.monitor_notify(receiver, all) == crate::monitor::MonitorStatus::Error {
        ctx.set_pending(names::ILLEGAL_MONITOR_STATE, "");
    }
    Ok(())
}

fn object_wait_untimed(ctx: &mut NativeCtx<'_>) -> Result<()> {
    wait_common(ctx, 0)
}

fn object_wait(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let timeout = ctx.parameter_long(1);
    if timeout < 0 {
        ctx.set_pending(names::ILLEGAL_ARGUMENT, "negative timeout");
        return Ok(());
    }
    wait_common(ctx, timeout as u64)
}

fn wait_common(ctx: &mut NativeCtx<'_>, timeout_ms: u64) -> Result<()> {
    let current = ctx.vm.globals.current_thread;
    if ctx.vm.heap.get(current, thread_layout::PENDING_INTERRUPT) == interrupt::PENDING {
        ctx.vm
            .heap
            .set(current, thread_layout::PENDING_INTERRUPT, interrupt::NONE);
        ctx.set_pending(names::INTERRUPTED, "");
        return Ok(());
    }
    let receiver = ctx.parameter_ptr(0);
    match ctx.vm.monitor_wait(ctx.regs, receiver, timeout_ms)? {
        crate::monitor::MonitorStatus::Error => {
            ctx.set_pending(names::ILLEGAL_MONITOR_STATE, "");
        }
        crate::monitor::MonitorStatus::Waiting => ctx.mark_suspended(),
        _ => {}
    }
    Ok(())
}

// ----- java/lang/String --------------------------------------------------

fn string_length(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    let count = ctx.vm.heap.get(receiver, obj::FIELDS + STRING_COUNT);
    ctx.push(count);
    Ok(())
}

fn string_char_at(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    let index = ctx.parameter(1) as i32;
    let count = ctx.vm.heap.get(receiver, obj::FIELDS + STRING_COUNT) as i32;
    if index < 0 || index >= count {
        ctx.set_pending(names::INDEX_OUT_OF_BOUNDS, "");
        return Ok(());
    }
    let value = ctx.vm.heap.get_ptr(receiver, obj::FIELDS + STRING_VALUE);
    let offset = ctx.vm.heap.get(receiver, obj::FIELDS + STRING_OFFSET) as usize;
    let unit = object::char_array_get(&ctx.vm.heap, value, offset + index as usize);
    ctx.push(u32::from(unit));
    Ok(())
}

fn string_intern(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    let value = object::string_value(&ctx.vm.heap, receiver);
    let interned = ctx.vm.intern_string_object(&value)?;
    ctx.push_ptr(interned);
    Ok(())
}

// ----- java/lang/Throwable -----------------------------------------------

fn throwable_init(_ctx: &mut NativeCtx<'_>) -> Result<()> {
    Ok(())
}

fn throwable_init_message(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    let message = ctx.parameter_ptr(1);
    ctx.vm.heap.set_ptr(
        receiver,
        obj::FIELDS + object::THROWABLE_MESSAGE_OFFSET,
        message,
    );
    Ok(())
}

fn throwable_get_message(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    let message = ctx
        .vm
        .heap
        .get_ptr(receiver, obj::FIELDS + object::THROWABLE_MESSAGE_OFFSET);
    ctx.push_ptr(message);
    Ok(())
}

// ----- java/lang/Thread --------------------------------------------------

/// Field offsets of `java/lang/Thread` (bootstrap declaration order).
const THREAD_VM_THREAD: usize = 0;
const THREAD_TARGET: usize = 1;
const THREAD_PRIORITY: usize = 2;

fn thread_init(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    ctx.vm.heap.set(receiver, obj::FIELDS + THREAD_PRIORITY, 5);
    Ok(())
}

fn thread_init_runnable(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    let target = ctx.parameter_ptr(1);
    ctx.vm.heap.set(receiver, obj::FIELDS + THREAD_PRIORITY, 5);
    ctx.vm.heap.set_ptr(receiver, obj::FIELDS + THREAD_TARGET, target);
    Ok(())
}

fn thread_start(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    if !ctx.vm.heap.get_ptr(receiver, obj::FIELDS + THREAD_VM_THREAD).is_null() {
        ctx.set_pending(names::ILLEGAL_ARGUMENT, "thread already started");
        return Ok(());
    }
    let priority = ctx.vm.heap.get(receiver, obj::FIELDS + THREAD_PRIORITY).clamp(1, 10);

    // Creating the record and its stack allocates; keep the Thread
    // object rooted and re-read it afterwards.
    let roots = std::rc::Rc::clone(&ctx.vm.roots);
    let scope = RootScope::new(&roots);
    let receiver_root = scope.roots().push(receiver);

    // Pick the entry: an overridden run(), or the target's run().
    let receiver_class = ctx.vm.class_of(receiver);
    let run_key = run_method_key(ctx.vm)?;
    let mut entry = ctx.vm.registry.lookup_method(receiver_class, run_key);
    let mut use_target = false;
    if let Some(found) = entry {
        if ctx.vm.registry.method(found).is_native() {
            // The default Thread.run: delegate to the target.
            let target = ctx.vm.heap.get_ptr(receiver, obj::FIELDS + THREAD_TARGET);
            if target.is_null() {
                entry = None;
            } else {
                entry = ctx
                    .vm
                    .registry
                    .lookup_method(ctx.vm.class_of(target), run_key)
                    .filter(|&found| !ctx.vm.registry.method(found).is_native());
                use_target = true;
            }
        }
    }

    let record = ctx.vm.create_thread(priority)?;
    let receiver = scope.roots().get(receiver_root);
    ctx.vm
        .heap
        .set_ptr(receiver, obj::FIELDS + THREAD_VM_THREAD, record);
    ctx.vm
        .heap
        .set_ptr(record, thread_layout::JAVA_THREAD, receiver);

    if let Some(entry) = entry {
        let record_root = scope.roots().push(record);
        let entry_receiver = if use_target {
            ctx.vm.heap.get_ptr(receiver, obj::FIELDS + THREAD_TARGET)
        } else {
            receiver
        };
        let entry_receiver_root = scope.roots().push(entry_receiver);
        ctx.vm
            .attach_entry_frame(record, entry, &[entry_receiver_root])?;
        let record = scope.roots().get(record_root);
        ctx.vm.resume_thread(record);
    } else {
        // Nothing to run; the thread is born dead.
        ctx.vm.retire_thread(record);
    }
    trace!("started thread object {receiver}");
    Ok(())
}

fn run_method_key(vm: &mut Vm) -> Result<u32> {
    let name = vm.strings.intern("run")?;
    let descriptor = kelvin_classfile::MethodDescriptor::parse("()V")
        .map_err(|error| crate::error::Error::Internal(error.to_string()))?;
    let type_key = crate::string_table::compress_method_descriptor(&descriptor, &mut vm.strings)?;
    Ok(crate::string_table::name_type_key(name, type_key))
}

fn thread_run(_ctx: &mut NativeCtx<'_>) -> Result<()> {
    // The default run() does nothing; started threads with a target
    // never reach it.
    Ok(())
}

fn thread_interrupt(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    let record = ctx.vm.heap.get_ptr(receiver, obj::FIELDS + THREAD_VM_THREAD);
    if !record.is_null() {
        ctx.vm.interrupt_thread(record);
    }
    Ok(())
}

fn thread_set_priority(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    let priority = (ctx.parameter(1) as i32).clamp(1, 10) as u32;
    ctx.vm.heap.set(receiver, obj::FIELDS + THREAD_PRIORITY, priority);
    let record = ctx.vm.heap.get_ptr(receiver, obj::FIELDS + THREAD_VM_THREAD);
    if !record.is_null() {
        ctx.vm.heap.set(record, thread_layout::PRIORITY, priority);
        ctx.vm.refill_timeslice(record);
    }
    Ok(())
}

fn thread_get_priority(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    ctx.push(ctx.vm.heap.get(receiver, obj::FIELDS + THREAD_PRIORITY));
    Ok(())
}

fn thread_is_alive(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let receiver = ctx.parameter_ptr(0);
    let record = ctx.vm.heap.get_ptr(receiver, obj::FIELDS + THREAD_VM_THREAD);
    let alive = !record.is_null()
        && matches!(
            ctx.vm.heap.get(record, thread_layout::STATE),
            state::ACTIVE | state::SUSPENDED
        );
    ctx.push(u32::from(alive));
    Ok(())
}

fn thread_sleep(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let millis = ctx.parameter_long(0);
    if millis < 0 {
        ctx.set_pending(names::ILLEGAL_ARGUMENT, "negative sleep");
        return Ok(());
    }
    let current = ctx.vm.globals.current_thread;
    if ctx.vm.heap.get(current, thread_layout::PENDING_INTERRUPT) == interrupt::PENDING {
        ctx.vm
            .heap
            .set(current, thread_layout::PENDING_INTERRUPT, interrupt::NONE);
        ctx.set_pending(names::INTERRUPTED, "");
        return Ok(());
    }
    if millis == 0 {
        // Sleeping zero milliseconds is an immediate yield.
        ctx.mark_yielded();
        return Ok(());
    }
    ctx.vm
        .register_alarm(current, millis as u64, crate::thread::alarm::RESUME);
    ctx.vm.suspend_current(ctx.regs);
    ctx.mark_suspended();
    Ok(())
}

fn thread_yield(ctx: &mut NativeCtx<'_>) -> Result<()> {
    ctx.mark_yielded();
    Ok(())
}

fn thread_current(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let current = ctx.vm.globals.current_thread;
    let mut java_thread = ctx.vm.heap.get_ptr(current, thread_layout::JAVA_THREAD);
    if java_thread.is_null() {
        // The primordial thread gets its Thread object lazily.
        let thread_class = ctx.vm.well_known.thread;
        java_thread = ctx.vm.allocate_instance(thread_class)?;
        let current = ctx.vm.globals.current_thread;
        ctx.vm.heap.set(java_thread, obj::FIELDS + THREAD_PRIORITY, 5);
        ctx.vm
            .heap
            .set_ptr(java_thread, obj::FIELDS + THREAD_VM_THREAD, current);
        ctx.vm
            .heap
            .set_ptr(current, thread_layout::JAVA_THREAD, java_thread);
    }
    ctx.push_ptr(java_thread);
    Ok(())
}

fn thread_active_count(ctx: &mut NativeCtx<'_>) -> Result<()> {
    ctx.push(ctx.vm.active_count());
    Ok(())
}

// ----- java/lang/System --------------------------------------------------

fn system_current_time_millis(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let now = ctx.vm.host.current_time_millis();
    ctx.push_long(now as i64);
    Ok(())
}

fn system_arraycopy(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let source = ctx.parameter_ptr(0);
    let source_position = ctx.parameter(1) as i32;
    let destination = ctx.parameter_ptr(2);
    let destination_position = ctx.parameter(3) as i32;
    let length = ctx.parameter(4) as i32;

    if source.is_null() || destination.is_null() {
        ctx.set_pending(names::NULL_POINTER, "");
        return Ok(());
    }
    let source_kind = ctx.vm.heap.kind(source)?;
    let destination_kind = ctx.vm.heap.kind(destination)?;
    let arrays = matches!(source_kind, GcKind::Array | GcKind::ObjectArray)
        && source_kind == destination_kind;
    let compatible = arrays
        && (source_kind == GcKind::ObjectArray
            || ctx.vm.class_of(source) == ctx.vm.class_of(destination));
    if !compatible {
        ctx.set_pending(names::ARRAY_STORE, "");
        return Ok(());
    }

    let source_length = object::array_length(&ctx.vm.heap, source) as i32;
    let destination_length = object::array_length(&ctx.vm.heap, destination) as i32;
    if source_position < 0
        || destination_position < 0
        || length < 0
        || source_position
            .checked_add(length)
            .map_or(true, |end| end > source_length)
        || destination_position
            .checked_add(length)
            .map_or(true, |end| end > destination_length)
    {
        ctx.set_pending(names::ARRAY_INDEX, "");
        return Ok(());
    }

    if source_kind == GcKind::ObjectArray {
        let source_element = element_class(ctx.vm, source);
        let destination_element = element_class(ctx.vm, destination);
        let check_each = !ctx
            .vm
            .registry
            .is_assignable(source_element, destination_element);
        // Copy through a buffer: the ranges may overlap.
        let values: Vec<u32> = (0..length as usize)
            .map(|index| {
                object::int_array_get(&ctx.vm.heap, source, source_position as usize + index)
            })
            .collect();
        for (index, &value) in values.iter().enumerate() {
            let element = Ptr(value);
            if check_each && !element.is_null() {
                let actual = ctx.vm.class_of(element);
                if !ctx.vm.registry.is_assignable(actual, destination_element) {
                    ctx.set_pending(names::ARRAY_STORE, "");
                    return Ok(());
                }
            }
            object::int_array_set(
                &mut ctx.vm.heap,
                destination,
                destination_position as usize + index,
                value,
            );
        }
        return Ok(());
    }

    // Primitive arrays share an element class, so a cell-exact copy by
    // element width is safe.
    let element = match ctx.vm.registry.class(ctx.vm.class_of(source)).array_element {
        Some(ArrayElement::Primitive(base_type)) => base_type,
        _ => return Ok(()),
    };
    use kelvin_classfile::BaseType;
    match element {
        BaseType::Boolean | BaseType::Byte => {
            let values: Vec<u8> = (0..length as usize)
                .map(|index| {
                    object::byte_array_get(&ctx.vm.heap, source, source_position as usize + index)
                })
                .collect();
            for (index, &value) in values.iter().enumerate() {
                object::byte_array_set(
                    &mut ctx.vm.heap,
                    destination,
                    destination_position as usize + index,
                    value,
                );
            }
        }
        BaseType::Char | BaseType::Short => {
            let values: Vec<u16> = (0..length as usize)
                .map(|index| {
                    object::char_array_get(&ctx.vm.heap, source, source_position as usize + index)
                })
                .collect();
            for (index, &value) in values.iter().enumerate() {
                object::char_array_set(
                    &mut ctx.vm.heap,
                    destination,
                    destination_position as usize + index,
                    value,
                );
            }
        }
        BaseType::Int | BaseType::Float => {
            let values: Vec<u32> = (0..length as usize)
                .map(|index| {
                    object::int_array_get(&ctx.vm.heap, source, source_position as usize + index)
                })
                .collect();
            for (index, &value) in values.iter().enumerate() {
                object::int_array_set(
                    &mut ctx.vm.heap,
                    destination,
                    destination_position as usize + index,
                    value,
                );
            }
        }
        BaseType::Long | BaseType::Double => {
            let values: Vec<u64> = (0..length as usize)
                .map(|index| {
                    object::long_array_get(&ctx.vm.heap, source, source_position as usize + index)
                })
                .collect();
            for (index, &value) in values.iter().enumerate() {
                object::long_array_set(
                    &mut ctx.vm.heap,
                    destination,
                    destination_position as usize + index,
                    value,
                );
            }
        }
    }
    Ok(())
}

fn element_class(vm: &Vm, array: Ptr) -> ClassId {
    match vm.registry.class(vm.class_of(array)).array_element {
        Some(ArrayElement::Reference(class_id)) => class_id,
        _ => vm.well_known.object,
    }
}

fn system_identity_hash_code(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let target = ctx.parameter_ptr(0);
    if target.is_null() {
        ctx.push(0);
        return Ok(());
    }
    let hash = ctx.vm.identity_hash(ctx.regs, target)?;
    ctx.push(hash);
    Ok(())
}

fn system_exit(ctx: &mut NativeCtx<'_>) -> Result<()> {
    ctx.vm.globals.exit_code = Some(ctx.parameter(0) as i32);
    Ok(())
}

fn system_gc(ctx: &mut NativeCtx<'_>) -> Result<()> {
    // Ask for the largest possible chunk so the collector also
    // compacts; an explicit gc() request means "free as much as you
    // can".
    let heap_cells = ctx.vm.heap.config().heap_cells;
    ctx.vm.store_registers(ctx.regs);
    ctx.vm.gc(heap_cells)?;
    ctx.vm.load_registers(ctx.regs);
    Ok(())
}

fn system_print_string(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let string = ctx.parameter_ptr(0);
    let value = if string.is_null() {
        "null".to_string()
    } else {
        object::string_value(&ctx.vm.heap, string)
    };
    for byte in value.bytes() {
        ctx.vm.host.write_byte(byte);
    }
    Ok(())
}

fn system_print_int(ctx: &mut NativeCtx<'_>) -> Result<()> {
    let value = ctx.parameter(0) as i32;
    for byte in value.to_string().bytes() {
        ctx.vm.host.write_byte(byte);
    }
    Ok(())
}

fn system_println_string(ctx: &mut NativeCtx<'_>) -> Result<()> {
    system_print_string(ctx)?;
    ctx.vm.host.write_byte(b'\n');
    Ok(())
}

fn system_println_int(ctx: &mut NativeCtx<'_>) -> Result<()> {
    system_print_int(ctx)?;
    ctx.vm.host.write_byte(b'\n');
    Ok(())
}

fn system_println(ctx: &mut NativeCtx<'_>) -> Result<()> {
    ctx.vm.host.write_byte(b'\n');
    Ok(())
}
