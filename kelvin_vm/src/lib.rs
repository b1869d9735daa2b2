//! # Kelvin VM
//!
//! The core runtime of a small bytecode virtual machine for a strict
//! subset of the Java language, sized for devices with tens to hundreds
//! of kilobytes of RAM.
//!
//! The crate ties together four tightly coupled subsystems:
//!
//! - the cell-addressed heap and exact compacting collector (from
//!   `kelvin_gc`), wired to the VM through precise stack-map scanning;
//! - the bytecode interpreter and its activation-record machinery:
//!   chunked thread stacks, frame push/pop, exception unwinding, and
//!   run-time rewriting of resolved instructions to fast variants;
//! - the cooperative green-thread scheduler with the four-state object
//!   lock word, inflated monitors, the sorted alarm queue, and
//!   level-triggered interrupts;
//! - the class loader: classpath and JAR input (from `kelvin_jar`),
//!   classfile materialisation (from `kelvin_classfile`), interned
//!   16-bit name keys with compressed signatures, lazy constant-pool
//!   resolution with the standard access checks, and the
//!   verifier-map-to-pointer-map rewrite.
//!
//! Execution is single-threaded and cooperative: the interpreter is the
//! scheduler, and the per-opcode time-slice check is the only
//! preemption point.

mod bootstrap;
mod class_path;
mod configuration;
mod error;
mod frame;
mod gc_bridge;
mod host;
mod initialize;
mod interpreter;
mod klass;
mod loader;
mod monitor;
mod native;
pub mod object;
mod pool;
mod registry;
pub mod stackmap;
mod string_table;
mod thread;
mod throw;
mod vm;

pub use class_path::ClassPath;
pub use configuration::{Configuration, ConfigurationBuilder, STACK_CHUNK_CELLS, TIMESLICE_FACTOR};
pub use error::{Error, Result};
pub use frame::Registers;
pub use host::{CaptureHost, Host, SystemHost};
pub use klass::{Class, ClassId, ClassState, Field, FieldId, Method, MethodId};
pub use monitor::MonitorStatus;
pub use native::{NativeCtx, NativeFn, NativeTable};
pub use registry::ClassRegistry;
pub use string_table::{compress_method_descriptor, name_type_key, NameTypeKey, StringKey, StringTable};
pub use throw::names;
pub use vm::{Globals, Vm, WellKnown, EXIT_FATAL, EXIT_OK, EXIT_UNCAUGHT};
