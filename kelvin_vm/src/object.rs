//! Object and array allocation, string materialisation, and identity
//! hashcodes.

use crate::error::Result;
use crate::klass::{ArrayElement, ClassId, ClassState};
use crate::string_table::StringKey;
use crate::vm::Vm;
use kelvin_classfile::BaseType;
use kelvin_classfile::ClassAccessFlags;
use kelvin_gc::layout::{object, thread as thread_layout};
use kelvin_gc::{GcKind, Heap, LockWord, Ptr, RootScope, MAX_OBJECT_CELLS};

/// Field offset of `Throwable.message` (the first declared field).
pub const THROWABLE_MESSAGE_OFFSET: usize = 0;

/// Cell offsets of `java/lang/String`'s fields.
pub const STRING_VALUE: usize = 0;
pub const STRING_OFFSET: usize = 1;
pub const STRING_COUNT: usize = 2;
pub const STRING_CELLS: u16 = 3;

impl Vm {
    /// Allocate in the collected heap, collecting and retrying once on
    /// exhaustion. Failure raises the pre-allocated out-of-memory
    /// singleton.
    ///
    /// # Errors
    /// `JavaThrow` of the out-of-memory singleton, or a fatal error.
    pub fn allocate_cells(&mut self, size: usize, kind: GcKind) -> Result<Ptr> {
        if self.heap.config().collect_on_every_allocation {
            self.gc(size)?;
        }
        let ptr = self.heap.allocate(size, kind);
        if !ptr.is_null() {
            return Ok(ptr);
        }
        self.gc(size)?;
        let ptr = self.heap.allocate(size, kind);
        if ptr.is_null() {
            return Err(self.raise_out_of_memory());
        }
        Ok(ptr)
    }

    /// Allocate an instance of `class_id` with zeroed fields.
    ///
    /// # Errors
    /// `JavaThrow` on exhaustion.
    pub fn allocate_instance(&mut self, class_id: ClassId) -> Result<Ptr> {
        let instance_cells = usize::from(self.registry.class(class_id).instance_cells);
        let ptr = self.allocate_cells(object::INSTANCE_OVERHEAD + instance_cells, GcKind::Instance)?;
        self.heap.set(ptr, object::CLASS, class_id.0);
        self.heap.set(ptr, object::MHC, LockWord::UNLOCKED.to_cell());
        Ok(ptr)
    }

    /// Allocate a primitive array. A negative length raises
    /// `NegativeArraySizeException`; a length at or above 2^24 elements
    /// is rejected as out-of-memory without overflowing the size
    /// computation.
    ///
    /// # Errors
    /// `JavaThrow` on bad length or exhaustion.
    pub fn allocate_array(&mut self, element: BaseType, length: i32) -> Result<Ptr> {
        if length < 0 {
            return Err(self.raise(crate::throw::names::NEGATIVE_ARRAY_SIZE, ""));
        }
        let length = length as u64;
        let data_cells = match element {
            BaseType::Boolean | BaseType::Byte => length.div_ceil(4),
            BaseType::Char | BaseType::Short => length.div_ceil(2),
            BaseType::Int | BaseType::Float => length,
            BaseType::Long | BaseType::Double => length * 2,
        };
        let total = data_cells + object::ARRAY_OVERHEAD as u64;
        if total > MAX_OBJECT_CELLS as u64 {
            return Err(self.raise_out_of_memory());
        }

        let class_id = self.array_class(ArrayElement::Primitive(element))?;
        let ptr = self.allocate_cells(total as usize, GcKind::Array)?;
        self.heap.set(ptr, object::CLASS, class_id.0);
        self.heap.set(ptr, object::MHC, LockWord::UNLOCKED.to_cell());
        self.heap.set(ptr, object::LENGTH, length as u32);
        Ok(ptr)
    }

    /// Allocate an array of references to `element_class`.
    ///
    /// # Errors
    /// `JavaThrow` on bad length or exhaustion.
    pub fn allocate_object_array(&mut self, element_class: ClassId, length: i32) -> Result<Ptr> {
        if length < 0 {
            return Err(self.raise(crate::throw::names::NEGATIVE_ARRAY_SIZE, ""));
        }
        let length = length as u64;
        let total = length + object::ARRAY_OVERHEAD as u64;
        if total > MAX_OBJECT_CELLS as u64 {
            return Err(self.raise_out_of_memory());
        }

        let class_id = self.array_class(ArrayElement::Reference(element_class))?;
        let ptr = self.allocate_cells(total as usize, GcKind::ObjectArray)?;
        self.heap.set(ptr, object::CLASS, class_id.0);
        self.heap.set(ptr, object::MHC, LockWord::UNLOCKED.to_cell());
        self.heap.set(ptr, object::LENGTH, length as u32);
        Ok(ptr)
    }

    /// Find or create the array class for an element type.
    ///
    /// # Errors
    /// Fatal on registry overflow.
    pub fn array_class(&mut self, element: ArrayElement) -> Result<ClassId> {
        let name = match element {
            ArrayElement::Primitive(base_type) => format!("[{}", base_type.code()),
            ArrayElement::Reference(class_id) => {
                let element_name = self.strings.get(self.registry.class(class_id).name_key);
                if element_name.starts_with('[') {
                    format!("[{element_name}")
                } else {
                    format!("[L{element_name};")
                }
            }
        };
        let name_key = self.strings.intern(&name)?;
        if let Some(existing) = self.registry.find(name_key) {
            return Ok(existing);
        }

        let object_class = self.well_known.object;
        let class = crate::klass::Class {
            id: ClassId(0),
            name_key,
            access: ClassAccessFlags::PUBLIC | ClassAccessFlags::FINAL,
            state: ClassState::Ready,
            super_class: Some(object_class),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            instance_cells: 0,
            pool: crate::pool::RuntimeConstantPool::default(),
            statics: Ptr::NULL,
            static_pointer_map: Vec::new(),
            array_element: Some(element),
            is_rom: true,
            init_thread: Ptr::NULL,
            init_lock: Ptr::NULL,
        };
        self.registry.register_class(class)
    }

    /// Allocate an ordinary (collected) string over `value`.
    ///
    /// # Errors
    /// `JavaThrow` on exhaustion.
    pub fn allocate_string(&mut self, value: &str) -> Result<Ptr> {
        let units: Vec<u16> = value.encode_utf16().collect();
        let length = i32::try_from(units.len()).unwrap_or(i32::MAX);
        let chars = self.allocate_array(BaseType::Char, length)?;
        for (index, &unit) in units.iter().enumerate() {
            char_array_set(&mut self.heap, chars, index, unit);
        }

        let roots = std::rc::Rc::clone(&self.roots);
        let scope = RootScope::new(&roots);
        let chars_root = scope.roots().push(chars);
        let string_class = self.well_known.string;
        let string = self.allocate_instance(string_class)?;
        let chars = scope.roots().get(chars_root);
        self.heap.set_ptr(string, object::FIELDS + STRING_VALUE, chars);
        self.heap.set(string, object::FIELDS + STRING_OFFSET, 0);
        self.heap
            .set(string, object::FIELDS + STRING_COUNT, units.len() as u32);
        Ok(string)
    }

    /// Allocate permanent space, running a full (compacting)
    /// collection first when the permanent bound cannot move; permanent
    /// growth consumes the free tail of the collected heap, which only
    /// compaction can guarantee.
    ///
    /// # Errors
    /// Fatal on permanent-space exhaustion.
    pub fn allocate_permanent_cells(&mut self, size: usize) -> Result<Ptr> {
        if let Ok(ptr) = self.heap.allocate_permanent(size) {
            return Ok(ptr);
        }
        let heap_cells = self.heap.config().heap_cells;
        self.gc(heap_cells)?;
        Ok(self.heap.allocate_permanent(size)?)
    }

    /// Intern a string: the instance and its character array live in
    /// permanent memory and are returned for every equal value.
    ///
    /// # Errors
    /// Fatal on permanent-space exhaustion.
    pub fn intern_string_object(&mut self, value: &str) -> Result<Ptr> {
        let key = self.strings.intern(value)?;
        if let Some(&existing) = self.globals.interned_strings.get(&key) {
            return Ok(existing);
        }

        let units: Vec<u16> = value.encode_utf16().collect();
        let char_class = self.array_class(ArrayElement::Primitive(BaseType::Char))?;
        let data_cells = units.len().div_ceil(2);
        let chars = self.allocate_permanent_cells(object::ARRAY_OVERHEAD + data_cells)?;
        self.heap.set_permanent_kind(chars, GcKind::Array)?;
        self.heap.set(chars, object::CLASS, char_class.0);
        self.heap.set(chars, object::MHC, LockWord::UNLOCKED.to_cell());
        self.heap.set(chars, object::LENGTH, units.len() as u32);
        for (index, &unit) in units.iter().enumerate() {
            char_array_set(&mut self.heap, chars, index, unit);
        }

        let string_class = self.well_known.string;
        let string =
            self.allocate_permanent_cells(object::INSTANCE_OVERHEAD + usize::from(STRING_CELLS))?;
        self.heap.set_permanent_kind(string, GcKind::Instance)?;
        self.heap.set(string, object::CLASS, string_class.0);
        self.heap.set(string, object::MHC, LockWord::UNLOCKED.to_cell());
        self.heap.set_ptr(string, object::FIELDS + STRING_VALUE, chars);
        self.heap.set(string, object::FIELDS + STRING_OFFSET, 0);
        self.heap
            .set(string, object::FIELDS + STRING_COUNT, units.len() as u32);

        self.globals.interned_strings.insert(key, string);
        Ok(string)
    }

    /// The identity hashcode: always nonzero, stable across moves
    /// because it lives in the object (or its lock owner's extended
    /// slots, or its monitor) rather than deriving from the address.
    ///
    /// A simple-locked object promotes to the extended state so the
    /// hashcode can ride alongside the owner; when the owner's single
    /// extended slot is already claimed by another lock, the lock
    /// inflates instead and the hashcode lives in the monitor record.
    /// Inflation allocates (hence may collect); callers protect their
    /// inputs.
    ///
    /// # Errors
    /// `JavaThrow` on heap exhaustion while inflating.
    pub fn identity_hash(&mut self, regs: &mut crate::frame::Registers, ptr: Ptr) -> Result<u32> {
        let lock = LockWord::from_cell(self.heap.get(ptr, object::MHC));
        let hash = match lock {
            LockWord::Unlocked { hash } => {
                if hash != 0 {
                    return Ok(hash);
                }
                let hash = self.next_hash();
                self.heap
                    .set(ptr, object::MHC, LockWord::Unlocked { hash }.to_cell());
                hash
            }
            LockWord::SimpleLock { owner } => {
                let hash = self.next_hash();
                if self.extended_slots_free(owner) {
                    self.claim_extended(owner, ptr, 1, hash);
                } else {
                    let monitor = self.inflate_lock(regs, ptr)?;
                    self.heap.set(monitor, kelvin_gc::layout::monitor::HASH, hash);
                }
                hash
            }
            LockWord::ExtendedLock { owner } => {
                let existing = self.heap.get(owner, thread_layout::EXT_HASH);
                if existing != 0 {
                    return Ok(existing);
                }
                let hash = self.next_hash();
                self.heap.set(owner, thread_layout::EXT_HASH, hash);
                hash
            }
            LockWord::Monitor { monitor } => {
                let existing = self.heap.get(monitor, kelvin_gc::layout::monitor::HASH);
                if existing != 0 {
                    return Ok(existing);
                }
                let hash = self.next_hash();
                self.heap.set(monitor, kelvin_gc::layout::monitor::HASH, hash);
                hash
            }
        };
        Ok(hash)
    }

    /// Advance the global LCG and produce a nonzero 30-bit hash.
    fn next_hash(&mut self) -> u32 {
        let seed = self
            .globals
            .hash_seed
            .wrapping_mul(1_103_515_245)
            .wrapping_add(12_345);
        self.globals.hash_seed = seed;
        let hash = (seed >> 2) & 0x3FFF_FFFF;
        if hash == 0 { 1 } else { hash }
    }

    /// The class id stored in an instance or array header area.
    #[must_use]
    pub fn class_of(&self, ptr: Ptr) -> ClassId {
        ClassId(self.heap.get(ptr, object::CLASS))
    }

    /// The interned-string key backing an interned instance, if this
    /// exact instance was produced by [`Vm::intern_string_object`].
    #[must_use]
    pub fn interned_key_of(&self, string: Ptr) -> Option<StringKey> {
        self.globals
            .interned_strings
            .iter()
            .find_map(|(&key, &ptr)| (ptr == string).then_some(key))
    }
}

// ----- array element access ----------------------------------------------

/// Array length.
#[must_use]
pub fn array_length(heap: &Heap, array: Ptr) -> u32 {
    heap.get(array, object::LENGTH)
}

/// Read a byte/boolean element (sign-extended by the caller as needed).
#[must_use]
pub fn byte_array_get(heap: &Heap, array: Ptr, index: usize) -> u8 {
    let cell = heap.get(array, object::DATA + index / 4);
    (cell >> ((index % 4) * 8)) as u8
}

pub fn byte_array_set(heap: &mut Heap, array: Ptr, index: usize, value: u8) {
    let cell_offset = object::DATA + index / 4;
    let shift = (index % 4) * 8;
    let cell = heap.get(array, cell_offset) & !(0xFF << shift);
    heap.set(array, cell_offset, cell | (u32::from(value) << shift));
}

/// Read a char/short element.
#[must_use]
pub fn char_array_get(heap: &Heap, array: Ptr, index: usize) -> u16 {
    let cell = heap.get(array, object::DATA + index / 2);
    (cell >> ((index % 2) * 16)) as u16
}

pub fn char_array_set(heap: &mut Heap, array: Ptr, index: usize, value: u16) {
    let cell_offset = object::DATA + index / 2;
    let shift = (index % 2) * 16;
    let cell = heap.get(array, cell_offset) & !(0xFFFF << shift);
    heap.set(array, cell_offset, cell | (u32::from(value) << shift));
}

/// Read an int/float element.
#[must_use]
pub fn int_array_get(heap: &Heap, array: Ptr, index: usize) -> u32 {
    heap.get(array, object::DATA + index)
}

pub fn int_array_set(heap: &mut Heap, array: Ptr, index: usize, value: u32) {
    heap.set(array, object::DATA + index, value);
}

/// Read a long/double element (stored high word first).
#[must_use]
pub fn long_array_get(heap: &Heap, array: Ptr, index: usize) -> u64 {
    let high = heap.get(array, object::DATA + index * 2);
    let low = heap.get(array, object::DATA + index * 2 + 1);
    (u64::from(high) << 32) | u64::from(low)
}

pub fn long_array_set(heap: &mut Heap, array: Ptr, index: usize, value: u64) {
    heap.set(array, object::DATA + index * 2, (value >> 32) as u32);
    heap.set(array, object::DATA + index * 2 + 1, value as u32);
}

/// Decode a `java/lang/String` instance to a Rust string.
#[must_use]
pub fn string_value(heap: &Heap, string: Ptr) -> String {
    let value = heap.get_ptr(string, object::FIELDS + STRING_VALUE);
    let offset = heap.get(string, object::FIELDS + STRING_OFFSET) as usize;
    let count = heap.get(string, object::FIELDS + STRING_COUNT) as usize;
    if value.is_null() {
        return String::new();
    }
    let units: Vec<u16> = (0..count)
        .map(|index| char_array_get(heap, value, offset + index))
        .collect();
    String::from_utf16_lossy(&units)
}
