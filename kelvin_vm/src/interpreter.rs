//! The bytecode interpreter.
//!
//! A single threaded switch over the opcode at `ip`. The five VM
//! registers (`method`/`ip`, `sp`, `fp`, `lp`) live in a [`Registers`]
//! value that is written to the current thread record at the top of
//! every dispatch - that stored copy is what the collector's stack
//! scanner reads, so it is always consistent with the stack map at the
//! paused instruction. Helpers that can allocate reload the registers
//! afterwards, because compaction may have moved the stack.
//!
//! The timeslice check at the top of the loop is the only preemption
//! point.

use crate::error::Error::{Fatal, JavaThrow};
use crate::error::Result;
use crate::frame::{Registers, FRAME_CELLS};
use crate::initialize::CLINIT_CALLBACK;
use crate::klass::{ArrayElement, ClassId, InlineCache, MethodId};
use crate::monitor::MonitorStatus;
use crate::native::NativeCtx;
use crate::object;
use crate::pool::RtConstant;
use crate::throw::names;
use crate::thread::interrupt;
use crate::vm::Vm;
use kelvin_classfile::bytecode::opcode::*;
use kelvin_classfile::BaseType;
use kelvin_gc::layout::{object as obj, thread as thread_layout};
use kelvin_gc::{LockWord, Ptr};
use tracing::trace;

/// Why the interpreter returned control to the scheduler loop.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Signal {
    /// Time slice expired or the thread yielded; requeue it.
    Switch,
    /// The thread parked itself; something else will wake it.
    Suspended,
    /// The thread ran off the bottom of its stack.
    ThreadExit,
    /// `System.exit` or equivalent.
    VmExit,
}

/// Intra-thread control flow after one instruction.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Flow {
    Continue,
    Yield,
    Suspend,
    ThreadExit,
    VmExit,
}

enum Unwound {
    Handled,
    ThreadDead,
}

// ----- operand stack helpers ---------------------------------------------

fn push(vm: &mut Vm, regs: &mut Registers, value: u32) {
    regs.sp += 1;
    vm.heap.set_cell_at(regs.sp, value);
}

fn pop(vm: &Vm, regs: &mut Registers) -> u32 {
    let value = vm.heap.cell_at(regs.sp);
    regs.sp -= 1;
    value
}

fn peek(vm: &Vm, regs: &Registers, depth: u32) -> u32 {
    vm.heap.cell_at(regs.sp - depth)
}

fn push_long(vm: &mut Vm, regs: &mut Registers, value: u64) {
    push(vm, regs, (value >> 32) as u32);
    push(vm, regs, value as u32);
}

fn pop_long(vm: &Vm, regs: &mut Registers) -> u64 {
    let low = u64::from(pop(vm, regs));
    let high = u64::from(pop(vm, regs));
    (high << 32) | low
}

fn local(vm: &Vm, regs: &Registers, index: u32) -> u32 {
    vm.heap.cell_at(regs.lp + index)
}

fn set_local(vm: &mut Vm, regs: &Registers, index: u32, value: u32) {
    vm.heap.set_cell_at(regs.lp + index, value);
}

// ----- code access -------------------------------------------------------

fn code_u8(vm: &Vm, regs: &Registers, offset: u32) -> u8 {
    vm.registry
        .method(regs.method)
        .java_body()
        .map_or(0, |body| body.code[(regs.ip + offset) as usize])
}

fn code_u16(vm: &Vm, regs: &Registers, offset: u32) -> u16 {
    (u16::from(code_u8(vm, regs, offset)) << 8) | u16::from(code_u8(vm, regs, offset + 1))
}

fn code_i16(vm: &Vm, regs: &Registers, offset: u32) -> i32 {
    i32::from(code_u16(vm, regs, offset) as i16)
}

fn code_i32(vm: &Vm, regs: &Registers, offset: u32) -> i32 {
    ((u32::from(code_u16(vm, regs, offset)) << 16) | u32::from(code_u16(vm, regs, offset + 2)))
        as i32
}

/// Patch an opcode to its fast variant, replacing the operand and
/// invalidating any inline-cache entries derived from the old form.
fn patch_opcode(vm: &mut Vm, method: MethodId, at: usize, opcode: u8, operand: u16) {
    if let Some(body) = vm.registry.method_mut(method).java_body_mut() {
        body.code[at] = opcode;
        body.code[at + 1] = (operand >> 8) as u8;
        body.code[at + 2] = operand as u8;
    }
}

// ----- the dispatch loop -------------------------------------------------

impl Vm {
    /// Run the current thread until it switches, parks, or dies.
    pub(crate) fn run_thread(&mut self) -> Result<Signal> {
        let mut regs = Registers::default();
        self.load_registers(&mut regs);
        let thread = self.globals.current_thread;
        let mut timeslice = i64::from(self.heap.get(thread, thread_layout::TIMESLICE));

        loop {
            if self.globals.exit_code.is_some() {
                self.store_registers(&regs);
                return Ok(Signal::VmExit);
            }

            // The only preemption point.
            timeslice -= 1;
            if timeslice <= 0 {
                self.store_registers(&regs);
                return Ok(Signal::Switch);
            }

            // Keep the thread record consistent with the stack map at
            // the instruction about to execute; the collector reads it.
            self.store_registers(&regs);

            // A woken sleep or wait delivers its interrupt here. The
            // registers already point past the call that parked the
            // thread, so the handler search backs up into it.
            let thread = self.globals.current_thread;
            if self.heap.get(thread, thread_layout::PENDING_INTERRUPT) == interrupt::DELIVER {
                self.heap
                    .set(thread, thread_layout::PENDING_INTERRUPT, interrupt::NONE);
                let error = self.raise(names::INTERRUPTED, "");
                self.load_registers(&mut regs);
                match self.handle_error(&mut regs, error, 1)? {
                    Unwound::Handled => continue,
                    Unwound::ThreadDead => return Ok(Signal::ThreadExit),
                }
            }

            match execute_one(self, &mut regs) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Yield) => {
                    self.store_registers(&regs);
                    return Ok(Signal::Switch);
                }
                Ok(Flow::Suspend) => return Ok(Signal::Suspended),
                Ok(Flow::ThreadExit) => return Ok(Signal::ThreadExit),
                Ok(Flow::VmExit) => {
                    self.store_registers(&regs);
                    return Ok(Signal::VmExit);
                }
                Err(error) => match self.handle_error(&mut regs, error, 0)? {
                    Unwound::Handled => {}
                    Unwound::ThreadDead => return Ok(Signal::ThreadExit),
                },
            }
        }
    }

    fn handle_error(
        &mut self,
        regs: &mut Registers,
        error: crate::error::Error,
        ip_correction: u32,
    ) -> Result<Unwound> {
        match error {
            JavaThrow(thrown) => self.unwind(regs, thrown, ip_correction),
            other => Err(other),
        }
    }

    /// Walk frames upward looking for a handler whose range covers the
    /// faulting instruction and whose catch type is assignable from the
    /// thrown class. Custom-code frames get first right of refusal;
    /// synchronized frames release their monitor on the way out. An
    /// empty stack terminates the thread.
    ///
    /// `ip_correction` backs the range check into the instruction when
    /// the saved pc already points past it: 1 for throws that surface
    /// between instructions, and for every caller frame, whose saved pc
    /// is the return address; 0 under a custom-code frame, whose saved
    /// pc is the (unadvanced) triggering instruction.
    fn unwind(&mut self, regs: &mut Registers, thrown: Ptr, ip_correction: u32) -> Result<Unwound> {
        let mut thrown = thrown;
        let mut ip_correction = ip_correction;
        loop {
            if regs.method == self.well_known.custom_code {
                thrown = self.clinit_unwind(regs, thrown)?;
                let sync = self.frame_sync_object(regs.fp);
                if !sync.is_null() {
                    self.monitor_exit(sync);
                }
                if !self.pop_frame(regs) {
                    return self.thread_died_uncaught(thrown);
                }
                ip_correction = 0;
                continue;
            }

            if let Some(handler_pc) = self.find_handler(regs, thrown, ip_correction)? {
                // Stack collapses to the single slot holding the
                // throwable.
                regs.sp = regs.fp + FRAME_CELLS as u32;
                self.heap.set_cell_at(regs.sp, thrown.0);
                regs.ip = handler_pc;
                self.store_registers(regs);
                return Ok(Unwound::Handled);
            }

            let sync = self.frame_sync_object(regs.fp);
            if !sync.is_null() {
                self.monitor_exit(sync);
            }
            if !self.pop_frame(regs) {
                return self.thread_died_uncaught(thrown);
            }
            // Caller frames saved the return address.
            ip_correction = 1;
        }
    }

    fn thread_died_uncaught(&mut self, thrown: Ptr) -> Result<Unwound> {
        let class_name = self.throwable_class_name(thrown);
        let message = self.throwable_message(thrown);
        let mut line = class_name;
        if let Some(message) = message {
            line.push_str(": ");
            line.push_str(&message);
        }
        line.push('\n');
        for byte in line.bytes() {
            self.host.write_byte(byte);
        }
        self.globals.saw_uncaught_exception = true;
        Ok(Unwound::ThreadDead)
    }

    /// Search the current frame's handler table. Resolving a catch type
    /// may allocate; the thrown object is rooted across it.
    fn find_handler(
        &mut self,
        regs: &mut Registers,
        thrown: Ptr,
        ip_correction: u32,
    ) -> Result<Option<u32>> {
        let method = regs.method;
        let handlers = match self.registry.method(method).java_body() {
            Some(body) => body.handlers.clone(),
            None => return Ok(None),
        };
        let faulting = regs.ip.saturating_sub(ip_correction) as u16;
        let thrown_class = self.class_of(thrown);
        let holder = self.registry.method(method).class_id;

        for handler in handlers {
            if faulting < handler.start_pc || faulting >= handler.end_pc {
                continue;
            }
            if handler.catch_type == 0 {
                return Ok(Some(u32::from(handler.handler_pc)));
            }
            let roots = std::rc::Rc::clone(&self.roots);
            let scope = kelvin_gc::RootScope::new(&roots);
            let thrown_root = scope.roots().push(thrown);
            self.store_registers(regs);
            let resolved = self.resolve_class_at(holder, handler.catch_type);
            self.load_registers(regs);
            let _thrown = scope.roots().get(thrown_root);
            match resolved {
                Ok(catch_class) => {
                    if self.registry.is_assignable(thrown_class, catch_class) {
                        return Ok(Some(u32::from(handler.handler_pc)));
                    }
                }
                Err(JavaThrow(_)) => {
                    // An unresolvable catch type cannot match; keep
                    // searching.
                }
                Err(other) => return Err(other),
            }
        }
        Ok(None)
    }
}

// ----- invocation --------------------------------------------------------

/// Finish an invoke once the target method is known: native calls run
/// in place; Java calls push a frame (acquiring the synchronization
/// object first when the method is synchronized).
fn invoke(vm: &mut Vm, regs: &mut Registers, target: MethodId, next_ip: u32) -> Result<Flow> {
    let method = vm.registry.method(target);
    let argc = u32::from(method.arg_slots);
    let is_static = method.is_static();
    let is_synchronized = method.is_synchronized();
    let is_native = method.is_native();
    let is_abstract = matches!(method.body, crate::klass::MethodBody::Abstract);
    let holder = method.class_id;

    if is_abstract {
        let name = vm.strings.get(vm.registry.method(target).name_key).to_string();
        return Err(vm.raise(names::ABSTRACT_METHOD_ERROR, &name));
    }

    // The synchronization object: receiver, or the class lock for
    // static methods.
    let sync = if !is_synchronized {
        Ptr::NULL
    } else if is_static {
        if vm.registry.class(holder).init_lock.is_null() {
            let object_class = vm.well_known.object;
            let lock = vm.allocate_instance(object_class)?;
            vm.load_registers(regs);
            vm.registry.class_mut(holder).init_lock = lock;
        }
        vm.registry.class(holder).init_lock
    } else {
        Ptr(peek(vm, regs, argc - 1))
    };

    if is_native {
        return invoke_native(vm, regs, target, next_ip, sync);
    }

    let call_ip = regs.ip;
    regs.ip = next_ip;
    if let Err(error) = vm.push_frame(regs, target, sync) {
        // Unwind at the call site.
        regs.ip = call_ip;
        return Err(error);
    }
    if is_synchronized {
        // Pushing the frame may have moved the heap; the frame header
        // holds the relocated synchronization object. Contention parks
        // the thread at the method entry; ownership arrives with the
        // wakeup.
        let sync = vm.frame_sync_object(regs.fp);
        if vm.monitor_enter(regs, sync)? == MonitorStatus::Waiting {
            return Ok(Flow::Suspend);
        }
    }
    Ok(Flow::Continue)
}

fn invoke_native(
    vm: &mut Vm,
    regs: &mut Registers,
    target: MethodId,
    next_ip: u32,
    sync: Ptr,
) -> Result<Flow> {
    let Some(function) = vm.bind_native(target) else {
        let name = vm.strings.get(vm.registry.method(target).name_key).to_string();
        return Err(vm.raise(names::UNSATISFIED_LINK_ERROR, &name));
    };
    let argc = u32::from(vm.registry.method(target).arg_slots);

    // Synchronized natives take the monitor around the call. A
    // contended enter would hand ownership over before this
    // instruction re-executes, and the re-executed enter would nest a
    // second level that the single exit below never unwinds; retrying
    // from the scheduler avoids that. No built-in native is
    // synchronized, so this path only serves host extensions.
    // The native (and monitor inflation) can collect; keep the
    // synchronization object rooted across the whole call.
    let roots = std::rc::Rc::clone(&vm.roots);
    let scope = kelvin_gc::RootScope::new(&roots);
    let sync_root = scope.roots().push(sync);

    if !sync.is_null() {
        if !vm.owns_lock(vm.globals.current_thread, sync) && lock_is_held(vm, sync) {
            return Ok(Flow::Yield);
        }
        if vm.monitor_enter(regs, sync)? == MonitorStatus::Waiting {
            return Ok(Flow::Suspend);
        }
    }

    let call_ip = regs.ip;
    let arg_base = regs.sp + 1 - argc;
    let args: Vec<u32> = (0..argc)
        .map(|index| vm.heap.cell_at(arg_base + index))
        .collect();
    regs.sp = arg_base - 1;
    regs.ip = next_ip;
    vm.store_registers(regs);

    let outcome = {
        let mut ctx = NativeCtx::new(vm, regs, args);
        function(&mut ctx)?;
        ctx.into_outcome()
    };
    vm.load_registers(regs);

    for value in &outcome.returns {
        push(vm, regs, *value);
    }
    let sync = scope.roots().get(sync_root);
    if !sync.is_null() {
        vm.monitor_exit(sync);
    }
    if let Some((class_name, message)) = outcome.pending {
        // Unwind at the call site, not the return address, so a
        // handler wrapped around the call matches.
        regs.ip = call_ip;
        vm.store_registers(regs);
        let error = vm.raise(class_name, &message);
        vm.load_registers(regs);
        return Err(error);
    }
    if outcome.suspended {
        return Ok(Flow::Suspend);
    }
    if outcome.yielded {
        vm.store_registers(regs);
        return Ok(Flow::Yield);
    }
    Ok(Flow::Continue)
}

/// Virtual dispatch with a monomorphic inline cache.
fn dispatch_virtual(
    vm: &mut Vm,
    regs: &Registers,
    cache_index: u16,
    receiver: Ptr,
) -> Result<MethodId> {
    let receiver_class = vm.class_of(receiver);
    let method = regs.method;
    let cache = vm
        .registry
        .method(method)
        .java_body()
        .and_then(|body| body.inline_caches.get(usize::from(cache_index)).copied())
        .ok_or_else(|| Fatal("invoke site has no inline cache".to_string()))?;

    if cache.receiver == Some(receiver_class) {
        if let Some(cached) = cache.cached_target {
            return Ok(cached);
        }
    }

    let key = vm.registry.method(cache.target).name_type();
    let Some(actual) = vm.registry.lookup_method(receiver_class, key) else {
        let name = vm.strings.get(vm.registry.method(cache.target).name_key).to_string();
        return Err(vm.raise(names::NO_SUCH_METHOD_ERROR, &name));
    };

    if let Some(body) = vm.registry.method_mut(method).java_body_mut() {
        if let Some(slot) = body.inline_caches.get_mut(usize::from(cache_index)) {
            slot.receiver = Some(receiver_class);
            slot.cached_target = Some(actual);
        }
    }
    Ok(actual)
}

/// Allocate an inline cache for a freshly rewritten invoke site.
fn new_inline_cache(vm: &mut Vm, method: MethodId, target: MethodId) -> Result<u16> {
    let body = vm
        .registry
        .method_mut(method)
        .java_body_mut()
        .ok_or_else(|| Fatal("rewriting a method without bytecode".to_string()))?;
    let index = u16::try_from(body.inline_caches.len())
        .map_err(|_| Fatal("inline cache table overflow".to_string()))?;
    body.inline_caches.push(InlineCache {
        target,
        receiver: None,
        cached_target: None,
    });
    Ok(index)
}

// ----- one instruction ---------------------------------------------------

#[allow(clippy::too_many_lines)]
fn execute_one(vm: &mut Vm, regs: &mut Registers) -> Result<Flow> {
    let op = code_u8(vm, regs, 0);
    trace!("ip {} op {op:#04x}", regs.ip);

    match op {
        NOP => regs.ip += 1,

        // ----- constants -------------------------------------------------
        ACONST_NULL => {
            push(vm, regs, 0);
            regs.ip += 1;
        }
        ICONST_M1..=ICONST_5 => {
            push(vm, regs, (i32::from(op) - i32::from(ICONST_0)) as u32);
            regs.ip += 1;
        }
        LCONST_0 | LCONST_1 => {
            push_long(vm, regs, u64::from(op - LCONST_0));
            regs.ip += 1;
        }
        FCONST_0 | FCONST_1 | FCONST_2 => {
            push(vm, regs, (f32::from(op - FCONST_0)).to_bits());
            regs.ip += 1;
        }
        DCONST_0 | DCONST_1 => {
            push_long(vm, regs, f64::from(op - DCONST_0).to_bits());
            regs.ip += 1;
        }
        BIPUSH => {
            push(vm, regs, i32::from(code_u8(vm, regs, 1) as i8) as u32);
            regs.ip += 2;
        }
        SIPUSH => {
            push(vm, regs, code_i16(vm, regs, 1) as u32);
            regs.ip += 3;
        }
        LDC | LDC_W => {
            let (index, length) = if op == LDC {
                (u16::from(code_u8(vm, regs, 1)), 2)
            } else {
                (code_u16(vm, regs, 1), 3)
            };
            let holder = vm.registry.method(regs.method).class_id;
            match vm.registry.class(holder).pool.get(index) {
                RtConstant::Integer(value) => push(vm, regs, value as u32),
                RtConstant::Float(value) => push(vm, regs, value.to_bits()),
                RtConstant::StringResolved(ptr) => push(vm, regs, ptr.0),
                RtConstant::String { .. } => {
                    let interned = vm.resolve_string_at(holder, index)?;
                    vm.load_registers(regs);
                    push(vm, regs, interned.0);
                }
                _ => return Err(vm.raise(names::CLASS_FORMAT_ERROR, "bad ldc operand")),
            }
            regs.ip += length;
        }
        LDC2_W => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            match vm.registry.class(holder).pool.get(index) {
                RtConstant::Long(value) => push_long(vm, regs, value as u64),
                RtConstant::Double(value) => push_long(vm, regs, value.to_bits()),
                _ => return Err(vm.raise(names::CLASS_FORMAT_ERROR, "bad ldc2_w operand")),
            }
            regs.ip += 3;
        }

        // ----- loads -----------------------------------------------------
        ILOAD | FLOAD | ALOAD => {
            let index = u32::from(code_u8(vm, regs, 1));
            let value = local(vm, regs, index);
            push(vm, regs, value);
            regs.ip += 2;
        }
        LLOAD | DLOAD => {
            let index = u32::from(code_u8(vm, regs, 1));
            let high = local(vm, regs, index);
            let low = local(vm, regs, index + 1);
            push(vm, regs, high);
            push(vm, regs, low);
            regs.ip += 2;
        }
        ILOAD_0..=ILOAD_3 => {
            let value = local(vm, regs, u32::from(op - ILOAD_0));
            push(vm, regs, value);
            regs.ip += 1;
        }
        LLOAD_0..=LLOAD_3 => {
            let index = u32::from(op - LLOAD_0);
            let high = local(vm, regs, index);
            let low = local(vm, regs, index + 1);
            push(vm, regs, high);
            push(vm, regs, low);
            regs.ip += 1;
        }
        FLOAD_0..=FLOAD_3 => {
            let value = local(vm, regs, u32::from(op - FLOAD_0));
            push(vm, regs, value);
            regs.ip += 1;
        }
        DLOAD_0..=DLOAD_3 => {
            let index = u32::from(op - DLOAD_0);
            let high = local(vm, regs, index);
            let low = local(vm, regs, index + 1);
            push(vm, regs, high);
            push(vm, regs, low);
            regs.ip += 1;
        }
        ALOAD_0..=ALOAD_3 => {
            let value = local(vm, regs, u32::from(op - ALOAD_0));
            push(vm, regs, value);
            regs.ip += 1;
        }

        // ----- array loads -----------------------------------------------
        IALOAD | FALOAD | AALOAD | BALOAD | CALOAD | SALOAD | LALOAD | DALOAD => {
            let index = pop(vm, regs) as i32;
            let array = Ptr(pop(vm, regs));
            if array.is_null() {
                return Err(vm.raise(names::NULL_POINTER, ""));
            }
            let length = object::array_length(&vm.heap, array) as i32;
            if index < 0 || index >= length {
                return Err(vm.raise(names::ARRAY_INDEX, &index.to_string()));
            }
            let index = index as usize;
            match op {
                IALOAD | FALOAD | AALOAD => {
                    let value = object::int_array_get(&vm.heap, array, index);
                    push(vm, regs, value);
                }
                BALOAD => {
                    let value = object::byte_array_get(&vm.heap, array, index);
                    push(vm, regs, i32::from(value as i8) as u32);
                }
                CALOAD => {
                    let value = object::char_array_get(&vm.heap, array, index);
                    push(vm, regs, u32::from(value));
                }
                SALOAD => {
                    let value = object::char_array_get(&vm.heap, array, index);
                    push(vm, regs, i32::from(value as i16) as u32);
                }
                _ => {
                    let value = object::long_array_get(&vm.heap, array, index);
                    push_long(vm, regs, value);
                }
            }
            regs.ip += 1;
        }

        // ----- stores ----------------------------------------------------
        ISTORE | FSTORE | ASTORE => {
            let index = u32::from(code_u8(vm, regs, 1));
            let value = pop(vm, regs);
            set_local(vm, regs, index, value);
            regs.ip += 2;
        }
        LSTORE | DSTORE => {
            let index = u32::from(code_u8(vm, regs, 1));
            let low = pop(vm, regs);
            let high = pop(vm, regs);
            set_local(vm, regs, index, high);
            set_local(vm, regs, index + 1, low);
            regs.ip += 2;
        }
        ISTORE_0..=ISTORE_3 => {
            let value = pop(vm, regs);
            set_local(vm, regs, u32::from(op - ISTORE_0), value);
            regs.ip += 1;
        }
        LSTORE_0..=LSTORE_3 => {
            let index = u32::from(op - LSTORE_0);
            let low = pop(vm, regs);
            let high = pop(vm, regs);
            set_local(vm, regs, index, high);
            set_local(vm, regs, index + 1, low);
            regs.ip += 1;
        }
        FSTORE_0..=FSTORE_3 => {
            let value = pop(vm, regs);
            set_local(vm, regs, u32::from(op - FSTORE_0), value);
            regs.ip += 1;
        }
        DSTORE_0..=DSTORE_3 => {
            let index = u32::from(op - DSTORE_0);
            let low = pop(vm, regs);
            let high = pop(vm, regs);
            set_local(vm, regs, index, high);
            set_local(vm, regs, index + 1, low);
            regs.ip += 1;
        }
        ASTORE_0..=ASTORE_3 => {
            let value = pop(vm, regs);
            set_local(vm, regs, u32::from(op - ASTORE_0), value);
            regs.ip += 1;
        }

        // ----- array stores ----------------------------------------------
        IASTORE | FASTORE | BASTORE | CASTORE | SASTORE | AASTORE | LASTORE | DASTORE => {
            let wide = matches!(op, LASTORE | DASTORE);
            let value_low = pop(vm, regs);
            let value_high = if wide { pop(vm, regs) } else { 0 };
            let index = pop(vm, regs) as i32;
            let array = Ptr(pop(vm, regs));
            if array.is_null() {
                return Err(vm.raise(names::NULL_POINTER, ""));
            }
            let length = object::array_length(&vm.heap, array) as i32;
            if index < 0 || index >= length {
                return Err(vm.raise(names::ARRAY_INDEX, &index.to_string()));
            }
            let index = index as usize;
            match op {
                IASTORE | FASTORE => object::int_array_set(&mut vm.heap, array, index, value_low),
                BASTORE => object::byte_array_set(&mut vm.heap, array, index, value_low as u8),
                CASTORE | SASTORE => {
                    object::char_array_set(&mut vm.heap, array, index, value_low as u16);
                }
                AASTORE => {
                    let element = Ptr(value_low);
                    if !element.is_null() {
                        let element_class = match vm
                            .registry
                            .class(vm.class_of(array))
                            .array_element
                        {
                            Some(ArrayElement::Reference(class_id)) => class_id,
                            _ => vm.well_known.object,
                        };
                        if !vm.registry.is_assignable(vm.class_of(element), element_class) {
                            return Err(vm.raise(names::ARRAY_STORE, ""));
                        }
                    }
                    object::int_array_set(&mut vm.heap, array, index, value_low);
                }
                _ => {
                    let value = (u64::from(value_high) << 32) | u64::from(value_low);
                    object::long_array_set(&mut vm.heap, array, index, value);
                }
            }
            regs.ip += 1;
        }

        // ----- stack shuffling -------------------------------------------
        POP => {
            regs.sp -= 1;
            regs.ip += 1;
        }
        POP2 => {
            regs.sp -= 2;
            regs.ip += 1;
        }
        DUP => {
            let value = peek(vm, regs, 0);
            push(vm, regs, value);
            regs.ip += 1;
        }
        DUP_X1 => {
            let top = pop(vm, regs);
            let below = pop(vm, regs);
            push(vm, regs, top);
            push(vm, regs, below);
            push(vm, regs, top);
            regs.ip += 1;
        }
        DUP_X2 => {
            let top = pop(vm, regs);
            let second = pop(vm, regs);
            let third = pop(vm, regs);
            push(vm, regs, top);
            push(vm, regs, third);
            push(vm, regs, second);
            push(vm, regs, top);
            regs.ip += 1;
        }
        DUP2 => {
            let top = peek(vm, regs, 0);
            let below = peek(vm, regs, 1);
            push(vm, regs, below);
            push(vm, regs, top);
            regs.ip += 1;
        }
        DUP2_X1 => {
            let first = pop(vm, regs);
            let second = pop(vm, regs);
            let third = pop(vm, regs);
            push(vm, regs, second);
            push(vm, regs, first);
            push(vm, regs, third);
            push(vm, regs, second);
            push(vm, regs, first);
            regs.ip += 1;
        }
        DUP2_X2 => {
            let first = pop(vm, regs);
            let second = pop(vm, regs);
            let third = pop(vm, regs);
            let fourth = pop(vm, regs);
            push(vm, regs, second);
            push(vm, regs, first);
            push(vm, regs, fourth);
            push(vm, regs, third);
            push(vm, regs, second);
            push(vm, regs, first);
            regs.ip += 1;
        }
        SWAP => {
            let top = pop(vm, regs);
            let below = pop(vm, regs);
            push(vm, regs, top);
            push(vm, regs, below);
            regs.ip += 1;
        }

        // ----- integer arithmetic ----------------------------------------
        IADD | ISUB | IMUL | IAND | IOR | IXOR | ISHL | ISHR | IUSHR => {
            let right = pop(vm, regs) as i32;
            let left = pop(vm, regs) as i32;
            let result = match op {
                IADD => left.wrapping_add(right),
                ISUB => left.wrapping_sub(right),
                IMUL => left.wrapping_mul(right),
                IAND => left & right,
                IOR => left | right,
                IXOR => left ^ right,
                ISHL => left.wrapping_shl(right as u32 & 31),
                ISHR => left.wrapping_shr(right as u32 & 31),
                _ => ((left as u32).wrapping_shr(right as u32 & 31)) as i32,
            };
            push(vm, regs, result as u32);
            regs.ip += 1;
        }
        IDIV | IREM => {
            let right = pop(vm, regs) as i32;
            let left = pop(vm, regs) as i32;
            if right == 0 {
                return Err(vm.raise(names::ARITHMETIC, "/ by zero"));
            }
            let result = if op == IDIV {
                left.wrapping_div(right)
            } else {
                left.wrapping_rem(right)
            };
            push(vm, regs, result as u32);
            regs.ip += 1;
        }
        INEG => {
            let value = pop(vm, regs) as i32;
            push(vm, regs, value.wrapping_neg() as u32);
            regs.ip += 1;
        }
        IINC => {
            let index = u32::from(code_u8(vm, regs, 1));
            let delta = i32::from(code_u8(vm, regs, 2) as i8);
            let value = local(vm, regs, index) as i32;
            set_local(vm, regs, index, value.wrapping_add(delta) as u32);
            regs.ip += 3;
        }

        // ----- long arithmetic -------------------------------------------
        LADD | LSUB | LMUL | LAND | LOR | LXOR => {
            let right = pop_long(vm, regs) as i64;
            let left = pop_long(vm, regs) as i64;
            let result = match op {
                LADD => left.wrapping_add(right),
                LSUB => left.wrapping_sub(right),
                LMUL => left.wrapping_mul(right),
                LAND => left & right,
                LOR => left | right,
                _ => left ^ right,
            };
            push_long(vm, regs, result as u64);
            regs.ip += 1;
        }
        LDIV | LREM => {
            let right = pop_long(vm, regs) as i64;
            let left = pop_long(vm, regs) as i64;
            if right == 0 {
                return Err(vm.raise(names::ARITHMETIC, "/ by zero"));
            }
            let result = if op == LDIV {
                left.wrapping_div(right)
            } else {
                left.wrapping_rem(right)
            };
            push_long(vm, regs, result as u64);
            regs.ip += 1;
        }
        LNEG => {
            let value = pop_long(vm, regs) as i64;
            push_long(vm, regs, value.wrapping_neg() as u64);
            regs.ip += 1;
        }
        LSHL | LSHR | LUSHR => {
            let shift = pop(vm, regs) & 63;
            let value = pop_long(vm, regs) as i64;
            let result = match op {
                LSHL => value.wrapping_shl(shift),
                LSHR => value.wrapping_shr(shift),
                _ => ((value as u64).wrapping_shr(shift)) as i64,
            };
            push_long(vm, regs, result as u64);
            regs.ip += 1;
        }

        // ----- float arithmetic ------------------------------------------
        FADD | FSUB | FMUL | FDIV | FREM => {
            let right = f32::from_bits(pop(vm, regs));
            let left = f32::from_bits(pop(vm, regs));
            let result = match op {
                FADD => left + right,
                FSUB => left - right,
                FMUL => left * right,
                FDIV => left / right,
                _ => left % right,
            };
            push(vm, regs, result.to_bits());
            regs.ip += 1;
        }
        FNEG => {
            let value = f32::from_bits(pop(vm, regs));
            push(vm, regs, (-value).to_bits());
            regs.ip += 1;
        }
        DADD | DSUB | DMUL | DDIV | DREM => {
            let right = f64::from_bits(pop_long(vm, regs));
            let left = f64::from_bits(pop_long(vm, regs));
            let result = match op {
                DADD => left + right,
                DSUB => left - right,
                DMUL => left * right,
                DDIV => left / right,
                _ => left % right,
            };
            push_long(vm, regs, result.to_bits());
            regs.ip += 1;
        }
        DNEG => {
            let value = f64::from_bits(pop_long(vm, regs));
            push_long(vm, regs, (-value).to_bits());
            regs.ip += 1;
        }

        // ----- conversions -----------------------------------------------
        I2L => {
            let value = pop(vm, regs) as i32;
            push_long(vm, regs, value as i64 as u64);
            regs.ip += 1;
        }
        I2F => {
            let value = pop(vm, regs) as i32;
            push(vm, regs, (value as f32).to_bits());
            regs.ip += 1;
        }
        I2D => {
            let value = pop(vm, regs) as i32;
            push_long(vm, regs, f64::from(value).to_bits());
            regs.ip += 1;
        }
        L2I => {
            let value = pop_long(vm, regs) as i64;
            push(vm, regs, value as i32 as u32);
            regs.ip += 1;
        }
        L2F => {
            let value = pop_long(vm, regs) as i64;
            push(vm, regs, (value as f32).to_bits());
            regs.ip += 1;
        }
        L2D => {
            let value = pop_long(vm, regs) as i64;
            push_long(vm, regs, (value as f64).to_bits());
            regs.ip += 1;
        }
        F2I => {
            let value = f32::from_bits(pop(vm, regs));
            push(vm, regs, (value as i32) as u32);
            regs.ip += 1;
        }
        F2L => {
            let value = f32::from_bits(pop(vm, regs));
            push_long(vm, regs, (value as i64) as u64);
            regs.ip += 1;
        }
        F2D => {
            let value = f32::from_bits(pop(vm, regs));
            push_long(vm, regs, f64::from(value).to_bits());
            regs.ip += 1;
        }
        D2I => {
            let value = f64::from_bits(pop_long(vm, regs));
            push(vm, regs, (value as i32) as u32);
            regs.ip += 1;
        }
        D2L => {
            let value = f64::from_bits(pop_long(vm, regs));
            push_long(vm, regs, (value as i64) as u64);
            regs.ip += 1;
        }
        D2F => {
            let value = f64::from_bits(pop_long(vm, regs));
            push(vm, regs, (value as f32).to_bits());
            regs.ip += 1;
        }
        I2B => {
            let value = pop(vm, regs) as i32;
            push(vm, regs, (value as i8 as i32) as u32);
            regs.ip += 1;
        }
        I2C => {
            let value = pop(vm, regs);
            push(vm, regs, value & 0xFFFF);
            regs.ip += 1;
        }
        I2S => {
            let value = pop(vm, regs) as i32;
            push(vm, regs, (value as i16 as i32) as u32);
            regs.ip += 1;
        }

        // ----- comparisons -----------------------------------------------
        LCMP => {
            let right = pop_long(vm, regs) as i64;
            let left = pop_long(vm, regs) as i64;
            push(vm, regs, compare(left, right) as u32);
            regs.ip += 1;
        }
        FCMPL | FCMPG => {
            let right = f32::from_bits(pop(vm, regs));
            let left = f32::from_bits(pop(vm, regs));
            push(vm, regs, float_compare(left.partial_cmp(&right), op == FCMPG) as u32);
            regs.ip += 1;
        }
        DCMPL | DCMPG => {
            let right = f64::from_bits(pop_long(vm, regs));
            let left = f64::from_bits(pop_long(vm, regs));
            push(vm, regs, float_compare(left.partial_cmp(&right), op == DCMPG) as u32);
            regs.ip += 1;
        }

        // ----- branches --------------------------------------------------
        IFEQ..=IFLE => {
            let value = pop(vm, regs) as i32;
            let taken = match op {
                IFEQ => value == 0,
                IFNE => value != 0,
                IFLT => value < 0,
                IFGE => value >= 0,
                IFGT => value > 0,
                _ => value <= 0,
            };
            branch(vm, regs, taken);
        }
        IF_ICMPEQ..=IF_ICMPLE => {
            let right = pop(vm, regs) as i32;
            let left = pop(vm, regs) as i32;
            let taken = match op {
                IF_ICMPEQ => left == right,
                IF_ICMPNE => left != right,
                IF_ICMPLT => left < right,
                IF_ICMPGE => left >= right,
                IF_ICMPGT => left > right,
                _ => left <= right,
            };
            branch(vm, regs, taken);
        }
        IF_ACMPEQ | IF_ACMPNE => {
            let right = pop(vm, regs);
            let left = pop(vm, regs);
            branch(vm, regs, (left == right) == (op == IF_ACMPEQ));
        }
        IFNULL | IFNONNULL => {
            let value = pop(vm, regs);
            branch(vm, regs, (value == 0) == (op == IFNULL));
        }
        GOTO => {
            let offset = code_i16(vm, regs, 1);
            regs.ip = regs.ip.wrapping_add(offset as u32);
        }
        GOTO_W => {
            let offset = code_i32(vm, regs, 1);
            regs.ip = regs.ip.wrapping_add(offset as u32);
        }
        TABLESWITCH => {
            let base = (regs.ip + 4) & !3;
            let default = read_switch_i32(vm, regs, base);
            let low = read_switch_i32(vm, regs, base + 4);
            let high = read_switch_i32(vm, regs, base + 8);
            let key = pop(vm, regs) as i32;
            let offset = if key < low || key > high {
                default
            } else {
                let entry = base + 12 + 4 * (key - low) as u32;
                read_switch_i32(vm, regs, entry)
            };
            regs.ip = regs.ip.wrapping_add(offset as u32);
        }
        LOOKUPSWITCH => {
            let base = (regs.ip + 4) & !3;
            let default = read_switch_i32(vm, regs, base);
            let pairs = read_switch_i32(vm, regs, base + 4).max(0) as u32;
            let key = pop(vm, regs) as i32;
            let mut offset = default;
            for pair in 0..pairs {
                let entry = base + 8 + pair * 8;
                if read_switch_i32(vm, regs, entry) == key {
                    offset = read_switch_i32(vm, regs, entry + 4);
                    break;
                }
            }
            regs.ip = regs.ip.wrapping_add(offset as u32);
        }

        // ----- returns ---------------------------------------------------
        IRETURN | FRETURN | ARETURN => {
            let value = pop(vm, regs);
            if let Some(flow) = method_return(vm, regs, &[value])? {
                return Ok(flow);
            }
        }
        LRETURN | DRETURN => {
            let low = pop(vm, regs);
            let high = pop(vm, regs);
            if let Some(flow) = method_return(vm, regs, &[high, low])? {
                return Ok(flow);
            }
        }
        RETURN => {
            if let Some(flow) = method_return(vm, regs, &[])? {
                return Ok(flow);
            }
        }

        // ----- field access ----------------------------------------------
        GETSTATIC => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            let field_id = vm.resolve_field_at(holder, index, true, false)?;
            vm.load_registers(regs);
            let class_id = vm.registry.field(field_id).class_id;
            if vm.ensure_initialized(regs, class_id)? {
                return Ok(Flow::Continue);
            }
            let field = vm.registry.field(field_id);
            let fast = if field.is_pointer {
                GETSTATICP_FAST
            } else if field.is_double {
                GETSTATIC2_FAST
            } else {
                GETSTATIC_FAST
            };
            patch_opcode(vm, regs.method, regs.ip as usize, fast, index);
            // Fall through to the fast path by re-executing.
        }
        GETSTATIC_FAST | GETSTATICP_FAST | GETSTATIC2_FAST => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            let RtConstant::FieldResolved(field_id) = vm.registry.class(holder).pool.get(index)
            else {
                return Err(Fatal("fast getstatic without resolution".to_string()));
            };
            let field = vm.registry.field(field_id);
            let offset = usize::from(field.offset);
            let wide = field.is_double;
            let statics = vm.registry.class(field.class_id).statics;
            if wide {
                let high = vm.heap.get(statics, offset);
                let low = vm.heap.get(statics, offset + 1);
                push(vm, regs, high);
                push(vm, regs, low);
            } else {
                let value = vm.heap.get(statics, offset);
                push(vm, regs, value);
            }
            regs.ip += 3;
        }
        PUTSTATIC => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            let field_id = vm.resolve_field_at(holder, index, true, true)?;
            vm.load_registers(regs);
            let class_id = vm.registry.field(field_id).class_id;
            if vm.ensure_initialized(regs, class_id)? {
                return Ok(Flow::Continue);
            }
            let field = vm.registry.field(field_id);
            let fast = if field.is_double {
                PUTSTATIC2_FAST
            } else {
                PUTSTATIC_FAST
            };
            patch_opcode(vm, regs.method, regs.ip as usize, fast, index);
        }
        PUTSTATIC_FAST | PUTSTATIC2_FAST => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            let RtConstant::FieldResolved(field_id) = vm.registry.class(holder).pool.get(index)
            else {
                return Err(Fatal("fast putstatic without resolution".to_string()));
            };
            let field = vm.registry.field(field_id);
            let offset = usize::from(field.offset);
            let wide = field.is_double;
            let statics = vm.registry.class(field.class_id).statics;
            if wide {
                let low = pop(vm, regs);
                let high = pop(vm, regs);
                vm.heap.set(statics, offset, high);
                vm.heap.set(statics, offset + 1, low);
            } else {
                let value = pop(vm, regs);
                vm.heap.set(statics, offset, value);
            }
            regs.ip += 3;
        }
        GETFIELD => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            let field_id = vm.resolve_field_at(holder, index, false, false)?;
            vm.load_registers(regs);
            let field = vm.registry.field(field_id);
            let fast = if field.is_pointer {
                GETFIELDP_FAST
            } else if field.is_double {
                GETFIELD2_FAST
            } else {
                GETFIELD_FAST
            };
            patch_opcode(vm, regs.method, regs.ip as usize, fast, index);
        }
        GETFIELD_FAST | GETFIELDP_FAST | GETFIELD2_FAST => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            let RtConstant::FieldResolved(field_id) = vm.registry.class(holder).pool.get(index)
            else {
                return Err(Fatal("fast getfield without resolution".to_string()));
            };
            let offset = usize::from(vm.registry.field(field_id).offset);
            let wide = vm.registry.field(field_id).is_double;
            let receiver = Ptr(pop(vm, regs));
            if receiver.is_null() {
                return Err(vm.raise(names::NULL_POINTER, ""));
            }
            if wide {
                let high = vm.heap.get(receiver, obj::FIELDS + offset);
                let low = vm.heap.get(receiver, obj::FIELDS + offset + 1);
                push(vm, regs, high);
                push(vm, regs, low);
            } else {
                let value = vm.heap.get(receiver, obj::FIELDS + offset);
                push(vm, regs, value);
            }
            regs.ip += 3;
        }
        PUTFIELD => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            let field_id = vm.resolve_field_at(holder, index, false, true)?;
            vm.load_registers(regs);
            let field = vm.registry.field(field_id);
            let fast = if field.is_double {
                PUTFIELD2_FAST
            } else {
                PUTFIELD_FAST
            };
            patch_opcode(vm, regs.method, regs.ip as usize, fast, index);
        }
        PUTFIELD_FAST | PUTFIELD2_FAST => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            let RtConstant::FieldResolved(field_id) = vm.registry.class(holder).pool.get(index)
            else {
                return Err(Fatal("fast putfield without resolution".to_string()));
            };
            let offset = usize::from(vm.registry.field(field_id).offset);
            let wide = vm.registry.field(field_id).is_double;
            if wide {
                let low = pop(vm, regs);
                let high = pop(vm, regs);
                let receiver = Ptr(pop(vm, regs));
                if receiver.is_null() {
                    return Err(vm.raise(names::NULL_POINTER, ""));
                }
                vm.heap.set(receiver, obj::FIELDS + offset, high);
                vm.heap.set(receiver, obj::FIELDS + offset + 1, low);
            } else {
                let value = pop(vm, regs);
                let receiver = Ptr(pop(vm, regs));
                if receiver.is_null() {
                    return Err(vm.raise(names::NULL_POINTER, ""));
                }
                vm.heap.set(receiver, obj::FIELDS + offset, value);
            }
            regs.ip += 3;
        }

        // ----- invokes ---------------------------------------------------
        INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            let is_static = op == INVOKESTATIC;
            let target = vm.resolve_method_at(holder, index, is_static)?;
            vm.load_registers(regs);
            if is_static {
                let class_id = vm.registry.method(target).class_id;
                if vm.ensure_initialized(regs, class_id)? {
                    return Ok(Flow::Continue);
                }
            }
            match op {
                INVOKEVIRTUAL | INVOKEINTERFACE => {
                    let cache = new_inline_cache(vm, regs.method, target)?;
                    let fast = if op == INVOKEVIRTUAL {
                        INVOKEVIRTUAL_FAST
                    } else {
                        INVOKEINTERFACE_FAST
                    };
                    patch_opcode(vm, regs.method, regs.ip as usize, fast, cache);
                }
                INVOKESPECIAL => {
                    patch_opcode(vm, regs.method, regs.ip as usize, INVOKESPECIAL_FAST, index);
                }
                _ => {
                    patch_opcode(vm, regs.method, regs.ip as usize, INVOKESTATIC_FAST, index);
                }
            }
            // Re-execute through the fast form.
        }
        INVOKEVIRTUAL_FAST | INVOKEINTERFACE_FAST => {
            let cache_index = code_u16(vm, regs, 1);
            let next_ip = regs.ip + if op == INVOKEINTERFACE_FAST { 5 } else { 3 };
            let cache = vm
                .registry
                .method(regs.method)
                .java_body()
                .and_then(|body| body.inline_caches.get(usize::from(cache_index)).copied())
                .ok_or_else(|| Fatal("invoke site has no inline cache".to_string()))?;
            let argc = u32::from(vm.registry.method(cache.target).arg_slots);
            let receiver = Ptr(peek(vm, regs, argc - 1));
            if receiver.is_null() {
                return Err(vm.raise(names::NULL_POINTER, ""));
            }
            let target = dispatch_virtual(vm, regs, cache_index, receiver)?;
            return invoke(vm, regs, target, next_ip);
        }
        INVOKESPECIAL_FAST | INVOKESTATIC_FAST => {
            let index = code_u16(vm, regs, 1);
            let next_ip = regs.ip + 3;
            let holder = vm.registry.method(regs.method).class_id;
            let RtConstant::MethodResolved(target) = vm.registry.class(holder).pool.get(index)
            else {
                return Err(Fatal("fast invoke without resolution".to_string()));
            };
            if op == INVOKESPECIAL_FAST {
                let argc = u32::from(vm.registry.method(target).arg_slots);
                if Ptr(peek(vm, regs, argc - 1)).is_null() {
                    return Err(vm.raise(names::NULL_POINTER, ""));
                }
            }
            return invoke(vm, regs, target, next_ip);
        }

        // ----- object creation -------------------------------------------
        NEW => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            let class_id = vm.resolve_class_at(holder, index)?;
            vm.load_registers(regs);
            let class = vm.registry.class(class_id);
            if class.is_interface()
                || class
                    .access
                    .contains(kelvin_classfile::ClassAccessFlags::ABSTRACT)
            {
                let name = vm.strings.get(vm.registry.class(class_id).name_key).to_string();
                return Err(vm.raise(names::INSTANTIATION_ERROR, &name));
            }
            if vm.ensure_initialized(regs, class_id)? {
                return Ok(Flow::Continue);
            }
            patch_opcode(vm, regs.method, regs.ip as usize, NEW_FAST, index);
        }
        NEW_FAST => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            let RtConstant::ClassResolved(class_id) = vm.registry.class(holder).pool.get(index)
            else {
                return Err(Fatal("fast new without resolution".to_string()));
            };
            let instance = vm.allocate_instance(class_id)?;
            vm.load_registers(regs);
            push(vm, regs, instance.0);
            regs.ip += 3;
        }
        NEWARRAY => {
            let element = BaseType::from_array_type_code(code_u8(vm, regs, 1))
                .map_err(|_| vm.raise(names::CLASS_FORMAT_ERROR, "bad newarray type"))?;
            let length = peek(vm, regs, 0) as i32;
            let array = vm.allocate_array(element, length)?;
            vm.load_registers(regs);
            pop(vm, regs);
            push(vm, regs, array.0);
            regs.ip += 2;
        }
        ANEWARRAY | ANEWARRAY_FAST => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            let element_class = if op == ANEWARRAY {
                let resolved = vm.resolve_class_at(holder, index)?;
                vm.load_registers(regs);
                patch_opcode(vm, regs.method, regs.ip as usize, ANEWARRAY_FAST, index);
                resolved
            } else {
                let RtConstant::ClassResolved(class_id) = vm.registry.class(holder).pool.get(index)
                else {
                    return Err(Fatal("fast anewarray without resolution".to_string()));
                };
                class_id
            };
            let length = peek(vm, regs, 0) as i32;
            let array = vm.allocate_object_array(element_class, length)?;
            vm.load_registers(regs);
            pop(vm, regs);
            push(vm, regs, array.0);
            regs.ip += 3;
        }
        MULTIANEWARRAY | MULTIANEWARRAY_FAST => {
            let index = code_u16(vm, regs, 1);
            let dimensions = u32::from(code_u8(vm, regs, 3));
            let holder = vm.registry.method(regs.method).class_id;
            let array_class = if op == MULTIANEWARRAY {
                let resolved = vm.resolve_class_at(holder, index)?;
                vm.load_registers(regs);
                patch_opcode(vm, regs.method, regs.ip as usize, MULTIANEWARRAY_FAST, index);
                resolved
            } else {
                let RtConstant::ClassResolved(class_id) = vm.registry.class(holder).pool.get(index)
                else {
                    return Err(Fatal("fast multianewarray without resolution".to_string()));
                };
                class_id
            };
            // Dimension counts sit on the stack, outermost deepest.
            let counts: Vec<i32> = (0..dimensions)
                .map(|dimension| peek(vm, regs, dimensions - 1 - dimension) as i32)
                .collect();
            let array = allocate_multi_array(vm, regs, array_class, &counts)?;
            vm.load_registers(regs);
            for _ in 0..dimensions {
                pop(vm, regs);
            }
            push(vm, regs, array.0);
            regs.ip += 4;
        }
        ARRAYLENGTH => {
            let array = Ptr(pop(vm, regs));
            if array.is_null() {
                return Err(vm.raise(names::NULL_POINTER, ""));
            }
            push(vm, regs, object::array_length(&vm.heap, array));
            regs.ip += 1;
        }

        // ----- casts and type tests --------------------------------------
        CHECKCAST | CHECKCAST_FAST | INSTANCEOF | INSTANCEOF_FAST => {
            let index = code_u16(vm, regs, 1);
            let holder = vm.registry.method(regs.method).class_id;
            let target_class = if op == CHECKCAST || op == INSTANCEOF {
                let resolved = vm.resolve_class_at(holder, index)?;
                vm.load_registers(regs);
                let fast = if op == CHECKCAST {
                    CHECKCAST_FAST
                } else {
                    INSTANCEOF_FAST
                };
                patch_opcode(vm, regs.method, regs.ip as usize, fast, index);
                resolved
            } else {
                let RtConstant::ClassResolved(class_id) = vm.registry.class(holder).pool.get(index)
                else {
                    return Err(Fatal("fast type test without resolution".to_string()));
                };
                class_id
            };
            let is_instance_of = op == INSTANCEOF || op == INSTANCEOF_FAST;
            let value = Ptr(peek(vm, regs, 0));
            let assignable =
                value.is_null() || vm.registry.is_assignable(vm.class_of(value), target_class);
            if is_instance_of {
                pop(vm, regs);
                push(vm, regs, u32::from(!value.is_null() && assignable));
            } else if !assignable {
                let name = vm
                    .strings
                    .get(vm.registry.class(vm.class_of(value)).name_key)
                    .to_string();
                return Err(vm.raise(names::CLASS_CAST, &name));
            }
            regs.ip += 3;
        }

        // ----- throw -----------------------------------------------------
        ATHROW => {
            let thrown = Ptr(pop(vm, regs));
            if thrown.is_null() {
                // Throwing with a null cause is a VM-level failure, not
                // a runtime exception.
                return Err(Fatal("athrow with a null throwable".to_string()));
            }
            return Err(JavaThrow(thrown));
        }

        // ----- monitors --------------------------------------------------
        MONITORENTER => {
            let target = Ptr(peek(vm, regs, 0));
            if target.is_null() {
                return Err(vm.raise(names::NULL_POINTER, ""));
            }
            pop(vm, regs);
            regs.ip += 1;
            if vm.monitor_enter(regs, target)? == MonitorStatus::Waiting {
                return Ok(Flow::Suspend);
            }
        }
        MONITOREXIT => {
            let target = Ptr(pop(vm, regs));
            if target.is_null() {
                return Err(vm.raise(names::NULL_POINTER, ""));
            }
            regs.ip += 1;
            if vm.monitor_exit(target) == MonitorStatus::Error {
                return Err(vm.raise(names::ILLEGAL_MONITOR_STATE, ""));
            }
        }

        // ----- wide ------------------------------------------------------
        WIDE => {
            let wide_op = code_u8(vm, regs, 1);
            let index = u32::from(code_u16(vm, regs, 2));
            match wide_op {
                ILOAD | FLOAD | ALOAD => {
                    let value = local(vm, regs, index);
                    push(vm, regs, value);
                    regs.ip += 4;
                }
                LLOAD | DLOAD => {
                    let high = local(vm, regs, index);
                    let low = local(vm, regs, index + 1);
                    push(vm, regs, high);
                    push(vm, regs, low);
                    regs.ip += 4;
                }
                ISTORE | FSTORE | ASTORE => {
                    let value = pop(vm, regs);
                    set_local(vm, regs, index, value);
                    regs.ip += 4;
                }
                LSTORE | DSTORE => {
                    let low = pop(vm, regs);
                    let high = pop(vm, regs);
                    set_local(vm, regs, index, high);
                    set_local(vm, regs, index + 1, low);
                    regs.ip += 4;
                }
                IINC => {
                    let delta = i32::from(code_u16(vm, regs, 4) as i16);
                    let value = local(vm, regs, index) as i32;
                    set_local(vm, regs, index, value.wrapping_add(delta) as u32);
                    regs.ip += 6;
                }
                _ => return Err(vm.raise(names::VERIFY_ERROR, "bad wide form")),
            }
        }

        // ----- the custom-code opcode ------------------------------------
        CUSTOMCODE => {
            let callback = vm.heap.cell_at(regs.lp);
            return match callback {
                CLINIT_CALLBACK => vm.clinit_step(regs),
                other => Err(Fatal(format!("unknown custom-code callback {other}"))),
            };
        }

        JSR | JSR_W | RET => {
            // Preverified code never contains the subroutine opcodes.
            return Err(vm.raise(names::VERIFY_ERROR, "subroutine bytecodes unsupported"));
        }
        BREAKPOINT => {
            return Err(Fatal("breakpoint with no debugger attached".to_string()));
        }
        other => {
            return Err(Fatal(format!("undefined opcode {other:#04x}")));
        }
    }
    Ok(Flow::Continue)
}

// ----- helpers -----------------------------------------------------------

fn compare<T: Ord>(left: T, right: T) -> i32 {
    match left.cmp(&right) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

fn float_compare(ordering: Option<std::cmp::Ordering>, greater_on_nan: bool) -> i32 {
    match ordering {
        Some(std::cmp::Ordering::Less) => -1,
        Some(std::cmp::Ordering::Equal) => 0,
        Some(std::cmp::Ordering::Greater) => 1,
        None => {
            if greater_on_nan {
                1
            } else {
                -1
            }
        }
    }
}

fn branch(vm: &Vm, regs: &mut Registers, taken: bool) {
    if taken {
        let offset = code_i16(vm, regs, 1);
        regs.ip = regs.ip.wrapping_add(offset as u32);
    } else {
        regs.ip += 3;
    }
}

/// Read a 32-bit switch operand at an absolute code offset.
fn read_switch_i32(vm: &Vm, regs: &Registers, at: u32) -> i32 {
    let body = vm.registry.method(regs.method).java_body();
    body.map_or(0, |body| {
        let at = at as usize;
        i32::from_be_bytes([
            body.code[at],
            body.code[at + 1],
            body.code[at + 2],
            body.code[at + 3],
        ])
    })
}

/// Return from the current method: release the monitor, pop the frame,
/// and deliver the return value to the caller. `None` means execution
/// continues in the caller; `Some` carries a thread-exit flow.
fn method_return(vm: &mut Vm, regs: &mut Registers, value: &[u32]) -> Result<Option<Flow>> {
    let sync = vm.frame_sync_object(regs.fp);
    if !sync.is_null() && vm.monitor_exit(sync) == MonitorStatus::Error {
        return Err(vm.raise(names::ILLEGAL_MONITOR_STATE, ""));
    }
    if vm.pop_frame(regs) {
        for &cell in value {
            push(vm, regs, cell);
        }
        vm.store_registers(regs);
        Ok(None)
    } else {
        if vm.globals.current_thread == vm.globals.entry_thread {
            vm.globals.entry_thread_result = value.to_vec();
        }
        Ok(Some(Flow::ThreadExit))
    }
}

/// Build a rectangular multi-dimensional array, recursing per
/// dimension. Every allocation can move previously built layers, so
/// each layer is rooted while its elements are filled.
fn allocate_multi_array(
    vm: &mut Vm,
    regs: &mut Registers,
    array_class: ClassId,
    counts: &[i32],
) -> Result<Ptr> {
    let (&count, rest) = counts
        .split_first()
        .ok_or_else(|| Fatal("multianewarray with zero dimensions".to_string()))?;
    let element = vm
        .registry
        .class(array_class)
        .array_element
        .ok_or_else(|| Fatal("multianewarray on a non-array class".to_string()))?;

    match element {
        ArrayElement::Primitive(base_type) => {
            debug_assert!(rest.is_empty());
            vm.allocate_array(base_type, count)
        }
        ArrayElement::Reference(element_class) => {
            let array = vm.allocate_object_array(element_class, count)?;
            if rest.is_empty() || count <= 0 {
                return Ok(array);
            }
            let roots = std::rc::Rc::clone(&vm.roots);
            let scope = kelvin_gc::RootScope::new(&roots);
            let array_root = scope.roots().push(array);
            for index in 0..count as usize {
                let inner = allocate_multi_array(vm, regs, element_class, rest)?;
                let array = scope.roots().get(array_root);
                object::int_array_set(&mut vm.heap, array, index, inner.0);
            }
            Ok(scope.roots().get(array_root))
        }
    }
}

/// Whether any thread holds `target`'s lock right now.
fn lock_is_held(vm: &Vm, target: Ptr) -> bool {
    match LockWord::from_cell(vm.heap.get(target, obj::MHC)) {
        LockWord::Unlocked { .. } => false,
        LockWord::SimpleLock { .. } | LockWord::ExtendedLock { .. } => true,
        LockWord::Monitor { monitor } => !vm
            .heap
            .get_ptr(monitor, kelvin_gc::layout::monitor::OWNER)
            .is_null(),
    }
}
