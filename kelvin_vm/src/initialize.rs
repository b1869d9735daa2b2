//! Static initialisation via custom-code continuation frames.
//!
//! Running `<clinit>` needs to acquire the class's init lock, run the
//! superclass initialiser, run its own initialiser, and release the
//! lock - with GC-safe suspension possible between every step. Each
//! step lives in a state word in a custom-code frame: the frame's only
//! "bytecode" re-invokes the callback until the state machine pops the
//! frame, and because the frame's return address is the triggering
//! instruction, that instruction re-executes once the class is ready.

use crate::error::Result;
use crate::frame::Registers;
use crate::interpreter::Flow;
use crate::klass::{ClassId, ClassState};
use crate::monitor::MonitorStatus;
use crate::throw::names;
use crate::vm::Vm;
use kelvin_gc::Ptr;
use tracing::debug;

/// Custom-code callback index of the class initialiser.
pub const CLINIT_CALLBACK: u32 = 0;

/// Custom frame local slots.
const LOCAL_CALLBACK: usize = 0;
const LOCAL_STATE: usize = 1;
const LOCAL_CLASS: usize = 2;

/// Initialiser states.
const STATE_ACQUIRE: u32 = 0;
const STATE_SUPER: u32 = 1;
const STATE_RUN_CLINIT: u32 = 2;
const STATE_FINISH: u32 = 3;

impl Vm {
    /// Ensure `class_id` is `Ready` before an active use. Returns
    /// `true` when an initialiser frame was pushed: the caller must
    /// return to the dispatch loop *without* advancing `ip`, so the
    /// triggering instruction re-executes afterwards.
    ///
    /// # Errors
    /// `JavaThrow` of `NoClassDefFoundError` for poisoned classes.
    pub(crate) fn ensure_initialized(
        &mut self,
        regs: &mut Registers,
        class_id: ClassId,
    ) -> Result<bool> {
        match self.registry.class(class_id).state {
            ClassState::Ready => return Ok(false),
            ClassState::Error => {
                let name = self.strings.get(self.registry.class(class_id).name_key).to_string();
                return Err(self.raise(names::NO_CLASS_DEF_FOUND_ERROR, &name));
            }
            _ => {}
        }
        // Re-entrancy: the initialising thread may use the class.
        if self.registry.class(class_id).init_thread == self.globals.current_thread
            && !self.globals.current_thread.is_null()
        {
            return Ok(false);
        }

        let custom = self.well_known.custom_code;
        self.push_frame(regs, custom, Ptr::NULL)?;
        self.heap.set_cell_at(regs.lp + LOCAL_CALLBACK as u32, CLINIT_CALLBACK);
        self.heap.set_cell_at(regs.lp + LOCAL_STATE as u32, STATE_ACQUIRE);
        self.heap.set_cell_at(regs.lp + LOCAL_CLASS as u32, class_id.0);
        debug!("initialising class {class_id:?}");
        Ok(true)
    }

    /// One step of the initialiser state machine; invoked by the
    /// custom-code opcode while its frame is on top.
    pub(crate) fn clinit_step(&mut self, regs: &mut Registers) -> Result<Flow> {
        let class_id = ClassId(self.heap.cell_at(regs.lp + LOCAL_CLASS as u32));
        let state = self.heap.cell_at(regs.lp + LOCAL_STATE as u32);

        match state {
            STATE_ACQUIRE => {
                // The init lock object is created lazily; the class
                // id in the frame keeps everything else stable across
                // the allocation.
                if self.registry.class(class_id).init_lock.is_null() {
                    let object_class = self.well_known.object;
                    let lock = self.allocate_instance(object_class)?;
                    self.load_registers(regs);
                    self.registry.class_mut(class_id).init_lock = lock;
                }
                let lock = self.registry.class(class_id).init_lock;
                match self.monitor_enter(regs, lock)? {
                    MonitorStatus::Waiting => return Ok(Flow::Suspend),
                    _ => {}
                }

                if self.registry.class(class_id).state == ClassState::Ready {
                    // Someone else finished while we queued.
                    let lock = self.registry.class(class_id).init_lock;
                    self.monitor_exit(lock);
                    self.pop_frame(regs);
                    return Ok(Flow::Continue);
                }
                let init_thread = self.registry.class(class_id).init_thread;
                if !init_thread.is_null() && init_thread != self.globals.current_thread {
                    // Another thread is initialising; wait for its
                    // notify and retry from the top.
                    let lock = self.registry.class(class_id).init_lock;
                    self.monitor_wait(regs, lock, 0)?;
                    return Ok(Flow::Suspend);
                }
                self.registry.class_mut(class_id).init_thread = self.globals.current_thread;
                self.heap.set_cell_at(regs.lp + LOCAL_STATE as u32, STATE_SUPER);
                Ok(Flow::Continue)
            }

            STATE_SUPER => {
                self.heap
                    .set_cell_at(regs.lp + LOCAL_STATE as u32, STATE_RUN_CLINIT);
                if let Some(super_id) = self.registry.class(class_id).super_class {
                    if self.registry.class(super_id).state != ClassState::Ready {
                        // Pushes a nested initialiser frame; this frame
                        // resumes in the next state when it pops.
                        self.ensure_initialized(regs, super_id)?;
                    }
                }
                Ok(Flow::Continue)
            }

            STATE_RUN_CLINIT => {
                self.heap.set_cell_at(regs.lp + LOCAL_STATE as u32, STATE_FINISH);
                if let Some(clinit) = self.find_clinit(class_id)? {
                    self.push_frame(regs, clinit, Ptr::NULL)?;
                }
                Ok(Flow::Continue)
            }

            _ => {
                let class = self.registry.class_mut(class_id);
                class.state = ClassState::Ready;
                class.init_thread = Ptr::NULL;
                let lock = self.registry.class(class_id).init_lock;
                self.monitor_notify(lock, true);
                self.monitor_exit(lock);
                self.pop_frame(regs);
                debug!("class {class_id:?} ready");
                Ok(Flow::Continue)
            }
        }
    }

    /// The custom frame sits in an unwinding throw's path: mark the
    /// class failed, release the lock, wake waiters, and hand back the
    /// throwable wrapped in a generic `Error` whose message names the
    /// class (the CLDC library has no `ExceptionInInitializerError`).
    pub(crate) fn clinit_unwind(&mut self, regs: &mut Registers, thrown: Ptr) -> Result<Ptr> {
        let class_id = ClassId(self.heap.cell_at(regs.lp + LOCAL_CLASS as u32));
        {
            let class = self.registry.class_mut(class_id);
            class.state = ClassState::Error;
            class.init_thread = Ptr::NULL;
        }
        let lock = self.registry.class(class_id).init_lock;
        if !lock.is_null() {
            self.monitor_notify(lock, true);
            self.monitor_exit(lock);
        }

        let class_name = self.strings.get(self.registry.class(class_id).name_key).to_string();
        let detail = self
            .throwable_message(thrown)
            .map_or_else(String::new, |message| format!(": {message}"));
        let wrapped_message = format!(
            "Static initializer: {}{detail}",
            class_name.replace('/', ".")
        );
        // Building the replacement may collect; the original throwable
        // is no longer needed once its message is captured.
        self.store_registers(regs);
        let error = self.raise(names::ERROR, &wrapped_message);
        self.load_registers(regs);
        match error {
            crate::error::Error::JavaThrow(wrapped) => Ok(wrapped),
            other => Err(other),
        }
    }

    fn find_clinit(&mut self, class_id: ClassId) -> Result<Option<crate::klass::MethodId>> {
        let name = self.strings.intern("<clinit>")?;
        let descriptor = kelvin_classfile::MethodDescriptor::parse("()V")
            .map_err(|error| crate::error::Error::Internal(error.to_string()))?;
        let type_key = crate::string_table::compress_method_descriptor(&descriptor, &mut self.strings)?;
        let key = crate::string_table::name_type_key(name, type_key);
        // Only the class's own initialiser runs here; superclasses run
        // through the state machine.
        let found = self
            .registry
            .class(class_id)
            .methods
            .iter()
            .copied()
            .find(|&method_id| self.registry.method(method_id).name_type() == key);
        Ok(found)
    }
}
