//! # Kelvin Classfile
//!
//! Reader and writer for the Java classfile subset executed by the Kelvin
//! virtual machine (classfile versions 45.3 through 46.0, the range
//! produced by CLDC-era compilers and the preverifier).
//!
//! The crate parses classfile bytes into a [`ClassFile`] structure and can
//! serialise a structure back to bytes, which is how the VM's own tests
//! synthesise classes without shipping `.class` fixtures.
//!
//! Bytecode-level definitions (opcode constants, operand lengths, the
//! reserved fast-variant range) live in [`bytecode`]; the interpreter and
//! the stack-map scanner share them.

mod attributes;
mod base_type;
pub mod bytecode;
mod class_access_flags;
mod class_file;
mod constant;
mod constant_pool;
mod descriptor;
mod error;
mod field;
mod field_access_flags;
mod method;
mod method_access_flags;
pub mod mutf8;
mod version;

pub use attributes::{Attribute, ExceptionTableEntry, StackMapFrame, VerificationType};
pub use base_type::BaseType;
pub use class_access_flags::ClassAccessFlags;
pub use class_file::ClassFile;
pub use constant::Constant;
pub use constant_pool::ConstantPool;
pub use descriptor::{FieldType, MethodDescriptor};
pub use error::{Error, Result};
pub use field::Field;
pub use field_access_flags::FieldAccessFlags;
pub use method::Method;
pub use method_access_flags::MethodAccessFlags;
pub use version::Version;
