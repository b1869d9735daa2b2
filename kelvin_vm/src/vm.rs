//! The virtual machine: ties the heap, registry, scheduler and
//! interpreter together and drives the outer run loop.

use crate::configuration::Configuration;
use crate::error::Error::{Fatal, Internal};
use crate::error::Result;
use crate::frame::Registers;
use crate::host::{Host, SystemHost};
use crate::interpreter::Signal;
use crate::klass::{ClassId, MethodId};
use crate::native::NativeTable;
use crate::registry::ClassRegistry;
use crate::string_table::{compress_method_descriptor, name_type_key, StringKey, StringTable};
use kelvin_gc::{Heap, Ptr, RootScope, TempRoots};
use std::rc::Rc;
use tracing::{debug, info};

/// Exit code for a normal termination.
pub const EXIT_OK: i32 = 0;
/// Exit code for a fatal internal error.
pub const EXIT_FATAL: i32 = 127;
/// Exit code when an uncaught exception ends the program.
pub const EXIT_UNCAUGHT: i32 = 128;

/// VM-global mutable state the collector treats as roots.
#[derive(Debug)]
pub struct Globals {
    /// The one executing thread; null between time slices.
    pub current_thread: Ptr,
    /// Head of the alive-thread list.
    pub alive_threads: Ptr,
    pub alive_count: u32,
    /// Tail of the circular runnable queue.
    pub runnable_tail: Ptr,
    /// Head of the sorted alarm queue.
    pub timer_queue: Ptr,
    /// Pre-allocated, permanent out-of-memory/stack-overflow error.
    pub memory_error_singleton: Ptr,
    /// Interned string instances by UTF-8 key (all permanent).
    pub interned_strings: ahash::AHashMap<StringKey, Ptr>,
    /// Native weak-pointer-list finalizers; index 0 is reserved so a
    /// zero finalizer key means none.
    pub weak_finalizers: Vec<fn(Ptr)>,
    /// Pending asynchronous-I/O control blocks (roots while inflight).
    pub async_io_blocks: Vec<Ptr>,
    /// Seed of the identity-hash LCG.
    pub hash_seed: u32,
    /// Set by `System.exit`.
    pub exit_code: Option<i32>,
    /// An uncaught exception terminated some thread.
    pub saw_uncaught_exception: bool,
    /// Thread whose final return value should be captured (embedder
    /// entry points); null when unused.
    pub entry_thread: Ptr,
    /// The captured return cells of the entry thread.
    pub entry_thread_result: Vec<u32>,
}

/// Classes and methods the core addresses directly.
#[derive(Clone, Copy, Debug)]
pub struct WellKnown {
    pub object: ClassId,
    pub string: ClassId,
    pub thread: ClassId,
    pub runnable: ClassId,
    pub throwable: ClassId,
    pub custom_code: MethodId,
}

impl Default for WellKnown {
    fn default() -> Self {
        WellKnown {
            object: ClassId(0),
            string: ClassId(0),
            thread: ClassId(0),
            runnable: ClassId(0),
            throwable: ClassId(0),
            custom_code: MethodId(u32::MAX),
        }
    }
}

/// The Kelvin virtual machine.
#[derive(Debug)]
pub struct Vm {
    pub heap: Heap,
    pub roots: Rc<TempRoots>,
    pub registry: ClassRegistry,
    pub strings: StringTable,
    pub globals: Globals,
    pub well_known: WellKnown,
    pub natives: NativeTable,
    pub host: Box<dyn Host>,
    pub config: Configuration,
}

impl Vm {
    /// Create a VM over the default system host.
    ///
    /// # Errors
    /// Fatal if the bootstrap image cannot be built.
    pub fn new(config: Configuration) -> Result<Vm> {
        Vm::with_host(config, Box::new(SystemHost))
    }

    /// Create a VM over a caller-supplied host.
    ///
    /// # Errors
    /// Fatal if the bootstrap image cannot be built.
    pub fn with_host(config: Configuration, host: Box<dyn Host>) -> Result<Vm> {
        let heap = Heap::new(config.heap.clone());
        let hash_seed = host.random_int() as u32 | 1;
        let mut vm = Vm {
            heap,
            roots: Rc::new(TempRoots::new()),
            registry: ClassRegistry::new(),
            strings: StringTable::new(),
            globals: Globals {
                current_thread: Ptr::NULL,
                alive_threads: Ptr::NULL,
                alive_count: 0,
                runnable_tail: Ptr::NULL,
                timer_queue: Ptr::NULL,
                memory_error_singleton: Ptr::NULL,
                interned_strings: ahash::AHashMap::new(),
                weak_finalizers: vec![|_| {}],
                async_io_blocks: Vec::new(),
                hash_seed,
                exit_code: None,
                saw_uncaught_exception: false,
                entry_thread: Ptr::NULL,
                entry_thread_result: Vec::new(),
            },
            well_known: WellKnown::default(),
            natives: NativeTable::default(),
            host,
            config,
        };
        vm.bootstrap()?;
        vm.register_builtin_natives()?;
        info!(
            "vm ready: {} system classes, {} heap cells",
            vm.registry.class_count(),
            vm.config.heap.heap_cells
        );
        Ok(vm)
    }

    /// Register a native weak-list finalizer and return its key.
    pub fn register_weak_finalizer(&mut self, finalizer: fn(Ptr)) -> u32 {
        self.globals.weak_finalizers.push(finalizer);
        (self.globals.weak_finalizers.len() - 1) as u32
    }

    /// Whether a class came from the built-in system image.
    #[must_use]
    pub fn is_rom_class(&self, class_id: ClassId) -> bool {
        self.registry.class(class_id).is_rom
    }

    /// Load the configured main class, spawn the primordial thread on
    /// its `main(String[])`, and run to completion. Returns the process
    /// exit code.
    ///
    /// # Errors
    /// Fatal errors only; uncaught exceptions map to exit code 128.
    pub fn invoke_main(&mut self, arguments: &[String]) -> Result<i32> {
        let main_class_name = self
            .config
            .main_class
            .clone()
            .ok_or_else(|| Internal("no main class configured".to_string()))?
            .replace('.', "/");

        let class_id = match self.load_class(&main_class_name) {
            Ok(class_id) => class_id,
            Err(crate::error::Error::JavaThrow(thrown)) => {
                let name = self.throwable_class_name(thrown);
                let mut line = name;
                line.push('\n');
                for byte in line.bytes() {
                    self.host.write_byte(byte);
                }
                return Ok(EXIT_UNCAUGHT);
            }
            Err(error) => return Err(error),
        };

        let main_method = self.find_main_method(class_id)?;

        // Build the String[] argument, rooting each layer while the
        // next allocates.
        let roots = Rc::clone(&self.roots);
        let scope = RootScope::new(&roots);
        let string_class = self.well_known.string;
        let array = self.allocate_object_array(string_class, arguments.len() as i32)?;
        let array_root = scope.roots().push(array);
        for (index, argument) in arguments.iter().enumerate() {
            let string = self.allocate_string(argument)?;
            let array = scope.roots().get(array_root);
            crate::object::int_array_set(&mut self.heap, array, index, string.0);
        }

        let thread = self.create_thread(5)?;
        let thread_root = scope.roots().push(thread);
        self.attach_entry_frame(thread, main_method, &[array_root])?;
        let thread = scope.roots().get(thread_root);

        // The main class may still need its static initialiser; push
        // the continuation on the fresh thread so it runs first.
        self.globals.current_thread = thread;
        let mut regs = Registers::default();
        self.load_registers(&mut regs);
        self.ensure_initialized(&mut regs, class_id)?;
        self.store_registers(&regs);
        self.globals.current_thread = Ptr::NULL;

        self.resume_thread(thread);
        drop(scope);
        self.run()
    }

    fn find_main_method(&mut self, class_id: ClassId) -> Result<MethodId> {
        let name = self.strings.intern("main")?;
        let descriptor = kelvin_classfile::MethodDescriptor::parse("([Ljava/lang/String;)V")
            .map_err(|error| Internal(error.to_string()))?;
        let type_key = compress_method_descriptor(&descriptor, &mut self.strings)?;
        let key = name_type_key(name, type_key);
        let Some(found) = self.registry.lookup_method(class_id, key) else {
            return Err(Fatal("main method not found".to_string()));
        };
        if !self.registry.method(found).is_static() {
            return Err(Fatal("main method is not static".to_string()));
        }
        Ok(found)
    }

    /// The outer scheduler loop: pick a runnable thread, interpret
    /// until it switches or dies, fire due alarms, idle when everything
    /// sleeps, and stop when no thread is alive.
    ///
    /// # Errors
    /// Fatal errors only.
    pub fn run(&mut self) -> Result<i32> {
        loop {
            if let Some(code) = self.globals.exit_code {
                return Ok(code);
            }

            if self.globals.current_thread.is_null() {
                self.check_timer_queue();
                match self.dequeue_runnable() {
                    Some(thread) => {
                        self.refill_timeslice(thread);
                        self.globals.current_thread = thread;
                    }
                    None => {
                        if self.globals.alive_count == 0 {
                            break;
                        }
                        // Everything is parked; idle until the next
                        // alarm can fire.
                        match self.check_timer_queue() {
                            Some(delay) => {
                                self.host.idle(delay.max(1));
                            }
                            None => {
                                return Err(Fatal(
                                    "all threads are blocked with no alarms pending".to_string(),
                                ));
                            }
                        }
                        continue;
                    }
                }
            }

            let signal = self.run_thread()?;
            let thread = self.globals.current_thread;
            self.globals.current_thread = Ptr::NULL;
            match signal {
                Signal::Switch => {
                    // Rotate to the back of the queue.
                    self.enqueue_runnable(thread, false);
                }
                Signal::Suspended => {}
                Signal::ThreadExit => {
                    debug!("thread {thread} finished");
                    if !self.retire_thread(thread) {
                        break;
                    }
                }
                Signal::VmExit => {
                    return Ok(self.globals.exit_code.unwrap_or(EXIT_OK));
                }
            }
        }

        if let Some(code) = self.globals.exit_code {
            return Ok(code);
        }
        if self.globals.saw_uncaught_exception {
            return Ok(EXIT_UNCAUGHT);
        }
        Ok(EXIT_OK)
    }

    /// Run a single `(static, no-argument)` method to completion on a
    /// fresh thread and return the raw cells it left on the operand
    /// stack (the return value). Embedders and tests use this to poke
    /// at loaded code without a `main`.
    ///
    /// # Errors
    /// Fatal errors only; an uncaught exception yields `Err`-free exit
    /// state queryable via [`Vm::saw_uncaught_exception`].
    pub fn invoke_static(&mut self, class_id: ClassId, method_id: MethodId) -> Result<Vec<u32>> {
        let thread = self.create_thread(5)?;
        let roots = Rc::clone(&self.roots);
        let scope = RootScope::new(&roots);
        let thread_root = scope.roots().push(thread);
        self.attach_entry_frame(thread, method_id, &[])?;
        let thread = scope.roots().get(thread_root);

        self.globals.current_thread = thread;
        let mut regs = Registers::default();
        self.load_registers(&mut regs);
        self.ensure_initialized(&mut regs, class_id)?;
        self.store_registers(&regs);
        self.globals.current_thread = Ptr::NULL;
        self.resume_thread(thread);

        // Run the scheduler, remembering the entry thread so its final
        // return value is captured when its last frame pops.
        self.globals.entry_thread_result.clear();
        self.globals.entry_thread = thread;
        drop(scope);
        self.run()?;
        self.globals.entry_thread = Ptr::NULL;
        Ok(std::mem::take(&mut self.globals.entry_thread_result))
    }

    /// Whether any thread died to an uncaught exception.
    #[must_use]
    pub fn saw_uncaught_exception(&self) -> bool {
        self.globals.saw_uncaught_exception
    }
}
