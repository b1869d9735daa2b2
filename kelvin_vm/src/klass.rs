//! Runtime class, field and method descriptors.
//!
//! Descriptors live in the registry arena on the Rust side of the
//! fence; bytecode addresses them through `ClassId` / `MethodId` /
//! `FieldId` indices. What running Java code can reach immortally
//! (interned strings, static-field records) lives in the permanent
//! sub-heap instead.

use crate::string_table::{NameTypeKey, StringKey};
use kelvin_classfile::{BaseType, ClassAccessFlags, FieldAccessFlags, MethodAccessFlags};
use kelvin_gc::Ptr;

/// Index of a class in the registry arena.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ClassId(pub u32);

/// Index of a method in the registry arena.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MethodId(pub u32);

/// Index of a field in the registry arena.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FieldId(pub u32);

/// Class resolution states form a monotonic chain; `Error` is a sink.
/// Only `Ready` classes are usable by running code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClassState {
    /// Name registered, nothing loaded.
    Raw,
    /// Classfile bytes are being materialised (guards cycles).
    Loading,
    /// Members materialised.
    Loaded,
    /// Field layout and statics record built.
    Linked,
    /// Stack maps rewritten to pointer maps.
    Verified,
    /// Static initialisation completed.
    Ready,
    /// A prior load or initialisation attempt failed; subsequent
    /// lookups raise `NoClassDefFoundError`.
    Error,
}

/// Element type of an array class.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArrayElement {
    Primitive(BaseType),
    Reference(ClassId),
}

/// A loaded class.
#[derive(Debug)]
pub struct Class {
    pub id: ClassId,
    pub name_key: StringKey,
    pub access: ClassAccessFlags,
    pub state: ClassState,
    pub super_class: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    /// Declared members.
    pub fields: Vec<FieldId>,
    pub methods: Vec<MethodId>,
    /// Instance field cells including inherited ones.
    pub instance_cells: u16,
    /// Runtime constant pool.
    pub pool: crate::pool::RuntimeConstantPool,
    /// Permanent record holding static field slots; null if none.
    pub statics: Ptr,
    /// Which static slots hold pointers.
    pub static_pointer_map: Vec<bool>,
    /// For array classes, the element type.
    pub array_element: Option<ArrayElement>,
    /// Part of the pre-linked system image.
    pub is_rom: bool,
    /// Thread currently running `<clinit>`, for re-entrancy; null
    /// otherwise.
    pub init_thread: Ptr,
    /// Lazily created object whose monitor guards initialisation.
    pub init_lock: Ptr,
}

impl Class {
    /// Whether this class is an interface.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.access.contains(ClassAccessFlags::INTERFACE)
    }

    /// Whether this is an array class.
    #[must_use]
    pub fn is_array(&self) -> bool {
        self.array_element.is_some()
    }
}

/// A field descriptor.
#[derive(Debug)]
pub struct Field {
    pub id: FieldId,
    pub class_id: ClassId,
    pub name_key: StringKey,
    pub type_key: StringKey,
    pub access: FieldAccessFlags,
    /// Whether values are heap references.
    pub is_pointer: bool,
    /// Whether values take two cells (long/double).
    pub is_double: bool,
    /// Cell offset within the instance fields area, or within the
    /// statics record for static fields.
    pub offset: u16,
    /// `ConstantValue` initialiser for static fields, already decoded.
    pub constant_value: Option<ConstantValue>,
}

impl Field {
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.access.contains(FieldAccessFlags::STATIC)
    }

    #[must_use]
    pub fn name_type(&self) -> NameTypeKey {
        crate::string_table::name_type_key(self.name_key, self.type_key)
    }
}

/// A decoded `ConstantValue` attribute.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConstantValue {
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    /// Interned string constant (by UTF-8 key; materialised at link).
    String(StringKey),
}

/// A method descriptor.
#[derive(Debug)]
pub struct Method {
    pub id: MethodId,
    pub class_id: ClassId,
    pub name_key: StringKey,
    /// Compressed-signature key.
    pub type_key: StringKey,
    pub access: MethodAccessFlags,
    /// Argument slots including any receiver.
    pub arg_slots: u16,
    /// Return width in slots (0, 1 or 2).
    pub return_slots: u8,
    /// Whether the return value is a heap reference.
    pub return_is_pointer: bool,
    pub body: MethodBody,
}

impl Method {
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.access.contains(MethodAccessFlags::STATIC)
    }

    #[must_use]
    pub fn is_native(&self) -> bool {
        self.access.contains(MethodAccessFlags::NATIVE)
    }

    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.access.contains(MethodAccessFlags::SYNCHRONIZED)
    }

    #[must_use]
    pub fn name_type(&self) -> NameTypeKey {
        crate::string_table::name_type_key(self.name_key, self.type_key)
    }

    /// The bytecode body; `None` for native and abstract methods.
    #[must_use]
    pub fn java_body(&self) -> Option<&JavaBody> {
        match &self.body {
            MethodBody::Java(body) => Some(body),
            _ => None,
        }
    }

    #[must_use]
    pub fn java_body_mut(&mut self) -> Option<&mut JavaBody> {
        match &mut self.body {
            MethodBody::Java(body) => Some(body),
            _ => None,
        }
    }
}

/// How a method executes.
#[derive(Debug)]
pub enum MethodBody {
    Java(JavaBody),
    /// Bound lazily against the native table by `(class, name, sig)`.
    Native { table_index: std::cell::Cell<Option<usize>> },
    Abstract,
}

/// An exception handler table entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Handler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Constant-pool index of the catch class; 0 catches anything.
    pub catch_type: u16,
}

/// The bytecode body of a method. The code buffer is owned and mutable:
/// the interpreter patches opcodes to their fast variants through
/// [`JavaBody::patch_opcode`]-style operations on the registry.
#[derive(Debug)]
pub struct JavaBody {
    pub code: Vec<u8>,
    pub max_stack: u16,
    /// Local slots (the `frameSize` of an activation record).
    pub frame_size: u16,
    pub handlers: Vec<Handler>,
    pub stack_maps: StackMaps,
    /// Inline caches for rewritten invoke sites; `_FAST` operands index
    /// this list.
    pub inline_caches: Vec<InlineCache>,
}

/// Stack-map storage states: the verifier form arrives with the
/// classfile and is rewritten exactly once into the pointer form as the
/// final step of verification.
#[derive(Debug)]
pub enum StackMaps {
    None,
    Verifier(Vec<kelvin_classfile::StackMapFrame>),
    Pointer(PointerMap),
}

/// The compressed pointer map: `(offset, bitmap)` entries sorted by
/// offset.
#[derive(Debug, Default)]
pub struct PointerMap {
    pub entries: Vec<PointerMapEntry>,
}

/// One pointer-map entry. The short form packs offset, stack size and a
/// bitmap of at most 16 slots into two words; larger frames key their
/// map bytes into the string table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PointerMapEntry {
    Short {
        offset: u16,
        stack_size: u8,
        bits: u16,
    },
    Long {
        offset: u16,
        stack_size: u8,
        /// String-table key of the bitmap bytes.
        map_key: StringKey,
    },
}

impl PointerMapEntry {
    #[must_use]
    pub fn offset(&self) -> u16 {
        match self {
            PointerMapEntry::Short { offset, .. } | PointerMapEntry::Long { offset, .. } => *offset,
        }
    }
}

/// An inline cache entry for a rewritten invoke site.
#[derive(Clone, Copy, Debug)]
pub struct InlineCache {
    /// The statically resolved target.
    pub target: MethodId,
    /// Receiver class of the last successful virtual dispatch, for the
    /// monomorphic fast path; `None` until the first dispatch.
    pub receiver: Option<ClassId>,
    /// Method the cached target was found in for that receiver.
    pub cached_target: Option<MethodId>,
}
