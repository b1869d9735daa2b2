//! Class loading, linking and verification.
//!
//! Loading materialises a classfile into registry descriptors
//! (`Raw -> Loading -> Loaded`), linking lays out instance fields with
//! their inherited pointer maps and builds the permanent statics record
//! (`-> Linked`), and verification - whose bytecode-checking half is an
//! ahead-of-time collaborator - finishes by rewriting the verifier
//! stack maps into pointer maps (`-> Verified`). `Ready` is reached at
//! first active use, when static initialisation runs.

use crate::error::Error::{ClassNotFound, Internal};
use crate::error::Result;
use crate::klass::{
    Class, ClassId, ClassState, ConstantValue, Field, FieldId, JavaBody, Method, MethodBody,
    MethodId, StackMaps,
};
use crate::pool::RuntimeConstantPool;
use crate::stackmap::rewrite_verifier_maps;
use crate::string_table::{compress_method_descriptor, StringKey};
use crate::throw::names;
use crate::vm::Vm;
use kelvin_classfile::{
    Attribute, ClassFile, Constant, FieldType, MethodAccessFlags, MethodDescriptor,
};
use kelvin_gc::{InstanceLayout, Ptr};
use std::io::Cursor;
use tracing::{debug, instrument};

impl Vm {
    /// Resolve a class by internal name, loading and linking it if
    /// necessary. Classes whose earlier load failed raise
    /// `NoClassDefFoundError`.
    ///
    /// # Errors
    /// `JavaThrow` with the appropriate linkage error.
    pub fn load_class(&mut self, name: &str) -> Result<ClassId> {
        if let Some(name_key) = self.strings.lookup(name) {
            if let Some(existing) = self.registry.find(name_key) {
                return match self.registry.class(existing).state {
                    ClassState::Error => Err(self.raise(names::NO_CLASS_DEF_FOUND_ERROR, name)),
                    ClassState::Loading => {
                        Err(self.raise(names::CLASS_FORMAT_ERROR, "circular superclass chain"))
                    }
                    _ => Ok(existing),
                };
            }
        }

        // Array classes are synthesized, never read from the path.
        if let Some(element_descriptor) = name.strip_prefix('[') {
            return self.load_array_class(name, element_descriptor);
        }

        let bytes = match self.config.class_path.open_class(name) {
            Ok(bytes) => bytes,
            Err(ClassNotFound(_)) => {
                return Err(self.raise(names::NO_CLASS_DEF_FOUND_ERROR, name));
            }
            Err(error) => return Err(error),
        };
        self.define_class(name, bytes)
    }

    /// Resolve a class whose name is already interned.
    ///
    /// # Errors
    /// `JavaThrow` with the appropriate linkage error.
    pub fn load_class_by_key(&mut self, name_key: StringKey) -> Result<ClassId> {
        let name = self.strings.get(name_key).to_string();
        self.load_class(&name)
    }

    /// Synthesize an array class from its descriptor-style name.
    fn load_array_class(&mut self, name: &str, element_descriptor: &str) -> Result<ClassId> {
        let element = match FieldType::parse(element_descriptor) {
            Ok(FieldType::Base(base_type)) => crate::klass::ArrayElement::Primitive(base_type),
            Ok(FieldType::Object(element_name)) => {
                let element_class = self.load_class(&element_name)?;
                crate::klass::ArrayElement::Reference(element_class)
            }
            Ok(FieldType::Array(_)) => {
                let element_class = self.load_class(element_descriptor)?;
                crate::klass::ArrayElement::Reference(element_class)
            }
            Err(_) => return Err(self.raise(names::NO_CLASS_DEF_FOUND_ERROR, name)),
        };
        self.array_class(element)
    }

    /// Define a class from classfile bytes (the classpath loader and
    /// tests both land here).
    ///
    /// # Errors
    /// `JavaThrow` with the appropriate linkage error.
    #[instrument(level = "debug", skip(self, bytes))]
    pub fn define_class(&mut self, name: &str, bytes: Vec<u8>) -> Result<ClassId> {
        let class_file = match ClassFile::from_bytes(&mut Cursor::new(bytes)) {
            Ok(class_file) => class_file,
            Err(error) => {
                let message = format!("{name}: {error}");
                return Err(self.raise(names::CLASS_FORMAT_ERROR, &message));
            }
        };
        let declared_name = match class_file.class_name() {
            Ok(declared) => declared.to_string(),
            Err(error) => {
                let message = format!("{name}: {error}");
                return Err(self.raise(names::CLASS_FORMAT_ERROR, &message));
            }
        };
        if declared_name != name {
            let message = format!("{name} declares itself as {declared_name}");
            return Err(self.raise(names::NO_CLASS_DEF_FOUND_ERROR, &message));
        }

        let class_id = self.materialize(&class_file)?;
        match self.link_class(class_id).and_then(|()| self.verify_class(class_id)) {
            Ok(()) => {
                debug!("loaded class {name} as {class_id:?}");
                Ok(class_id)
            }
            Err(error) => {
                self.registry.poison(class_id);
                Err(error)
            }
        }
    }

    /// Materialise descriptors from a parsed classfile; leaves the
    /// class `Loaded`.
    fn materialize(&mut self, class_file: &ClassFile) -> Result<ClassId> {
        let name = class_file
            .class_name()
            .map_err(|error| Internal(error.to_string()))?
            .to_string();
        let name_key = self.strings.intern(&name)?;

        // Register in the Loading state before touching the superclass
        // so circular chains are caught instead of recursing forever.
        let class_id = self.registry.register_class(Class {
            id: ClassId(0),
            name_key,
            access: class_file.access_flags,
            state: ClassState::Loading,
            super_class: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            instance_cells: 0,
            pool: RuntimeConstantPool::default(),
            statics: Ptr::NULL,
            static_pointer_map: Vec::new(),
            array_element: None,
            is_rom: false,
            init_thread: Ptr::NULL,
            init_lock: Ptr::NULL,
        })?;

        let result = self.materialize_members(class_id, class_file);
        match result {
            Ok(()) => {
                self.registry.class_mut(class_id).state = ClassState::Loaded;
                Ok(class_id)
            }
            Err(error) => {
                self.registry.poison(class_id);
                Err(error)
            }
        }
    }

    fn materialize_members(&mut self, class_id: ClassId, class_file: &ClassFile) -> Result<()> {
        // Superclass and interfaces first.
        let super_class = match class_file
            .super_class_name()
            .map_err(|error| Internal(error.to_string()))?
        {
            Some(super_name) => {
                let super_name = super_name.to_string();
                Some(self.load_class(&super_name)?)
            }
            None => None,
        };
        let mut interfaces = Vec::with_capacity(class_file.interfaces.len());
        for &interface_index in &class_file.interfaces {
            let interface_name = class_file
                .constant_pool
                .try_get_class_name(interface_index)
                .map_err(|error| Internal(error.to_string()))?
                .to_string();
            interfaces.push(self.load_class(&interface_name)?);
        }

        let pool = RuntimeConstantPool::from_classfile(&class_file.constant_pool, &mut self.strings)?;
        {
            let class = self.registry.class_mut(class_id);
            class.super_class = super_class;
            class.interfaces = interfaces;
            class.pool = pool;
        }

        // Fields. Offsets are assigned at link time; here the
        // descriptors and constant values are captured.
        for field in &class_file.fields {
            let name = class_file
                .constant_pool
                .try_get_utf8(field.name_index)
                .map_err(|error| Internal(error.to_string()))?
                .to_string();
            let descriptor = class_file
                .constant_pool
                .try_get_utf8(field.descriptor_index)
                .map_err(|error| Internal(error.to_string()))?
                .to_string();
            let field_type = FieldType::parse(&descriptor)
                .map_err(|error| Internal(error.to_string()))?;
            let constant_value = match field.constant_value_index() {
                Some(index) => Some(self.decode_constant_value(class_file, index)?),
                None => None,
            };
            let name_key = self.strings.intern(&name)?;
            let type_key = self.strings.intern(&descriptor)?;
            self.registry.register_field(Field {
                id: FieldId(0),
                class_id,
                name_key,
                type_key,
                access: field.access_flags,
                is_pointer: field_type.is_reference(),
                is_double: field_type.slots() == 2,
                offset: 0,
                constant_value,
            })?;
        }

        // Methods.
        for method in &class_file.methods {
            let name = class_file
                .constant_pool
                .try_get_utf8(method.name_index)
                .map_err(|error| Internal(error.to_string()))?
                .to_string();
            let descriptor = class_file
                .constant_pool
                .try_get_utf8(method.descriptor_index)
                .map_err(|error| Internal(error.to_string()))?
                .to_string();
            let parsed = MethodDescriptor::parse(&descriptor)
                .map_err(|error| Internal(error.to_string()))?;

            let receiver_slots = usize::from(!method.access_flags.contains(MethodAccessFlags::STATIC));
            let arg_slots = u16::try_from(parsed.parameter_slots() + receiver_slots)
                .map_err(|_| Internal("method argument slots overflow".to_string()))?;
            let return_slots = parsed.return_slots() as u8;
            let return_is_pointer = parsed
                .return_type
                .as_ref()
                .is_some_and(FieldType::is_reference);

            let body = if method.access_flags.contains(MethodAccessFlags::NATIVE) {
                MethodBody::Native {
                    table_index: std::cell::Cell::new(None),
                }
            } else if method.access_flags.contains(MethodAccessFlags::ABSTRACT) {
                MethodBody::Abstract
            } else {
                let Some(Attribute::Code {
                    max_stack,
                    max_locals,
                    code,
                    exception_table,
                    attributes,
                    ..
                }) = method.code()
                else {
                    return Err(Internal(format!("method {name} has no Code attribute")));
                };
                let stack_maps = attributes
                    .iter()
                    .find_map(|attribute| match attribute {
                        Attribute::StackMap { frames, .. } => {
                            Some(StackMaps::Verifier(frames.clone()))
                        }
                        _ => None,
                    })
                    .unwrap_or(StackMaps::None);
                MethodBody::Java(JavaBody {
                    code: code.clone(),
                    max_stack: *max_stack,
                    frame_size: *max_locals,
                    handlers: exception_table
                        .iter()
                        .map(|entry| crate::klass::Handler {
                            start_pc: entry.start_pc,
                            end_pc: entry.end_pc,
                            handler_pc: entry.handler_pc,
                            catch_type: entry.catch_type,
                        })
                        .collect(),
                    stack_maps,
                    inline_caches: Vec::new(),
                })
            };

            let name_key = self.strings.intern(&name)?;
            let type_key = compress_method_descriptor(&parsed, &mut self.strings)?;
            self.registry.register_method(Method {
                id: MethodId(u32::MAX),
                class_id,
                name_key,
                type_key,
                access: method.access_flags,
                arg_slots,
                return_slots,
                return_is_pointer,
                body,
            })?;
        }
        Ok(())
    }

    fn decode_constant_value(
        &mut self,
        class_file: &ClassFile,
        index: u16,
    ) -> Result<ConstantValue> {
        let constant = class_file
            .constant_pool
            .try_get(index)
            .map_err(|error| Internal(error.to_string()))?;
        let value = match constant {
            Constant::Integer(value) => ConstantValue::Integer(*value),
            Constant::Float(value) => ConstantValue::Float(*value),
            Constant::Long(value) => ConstantValue::Long(*value),
            Constant::Double(value) => ConstantValue::Double(*value),
            Constant::String { string_index } => {
                let value = class_file
                    .constant_pool
                    .try_get_utf8(*string_index)
                    .map_err(|error| Internal(error.to_string()))?;
                ConstantValue::String(self.strings.intern(value)?)
            }
            _ => return Err(Internal("unusable ConstantValue entry".to_string())),
        };
        Ok(value)
    }

    /// Link: lay out instance fields (inheriting the superclass map),
    /// register the pointer layout with the collector, build the
    /// permanent statics record, and apply `ConstantValue`
    /// initialisers.
    pub(crate) fn link_class(&mut self, class_id: ClassId) -> Result<()> {
        let super_cells = match self.registry.class(class_id).super_class {
            Some(super_id) => self.registry.class(super_id).instance_cells,
            None => 0,
        };

        // Instance layout.
        let mut instance_offset = super_cells;
        let field_ids: Vec<FieldId> = self.registry.class(class_id).fields.clone();
        for &field_id in &field_ids {
            let field = self.registry.field(field_id);
            if field.is_static() {
                continue;
            }
            let cells = if field.is_double { 2 } else { 1 };
            self.registry.field_mut(field_id).offset = instance_offset;
            instance_offset += cells;
        }
        self.registry.class_mut(class_id).instance_cells = instance_offset;

        let mut pointer_map = vec![false; usize::from(instance_offset)];
        self.collect_pointer_map(class_id, &mut pointer_map);
        self.heap.define_layout(
            class_id.0,
            InstanceLayout {
                field_cells: usize::from(instance_offset),
                pointer_map,
            },
        );

        // Statics record.
        let mut static_offset: u16 = 0;
        let mut static_pointer_map = Vec::new();
        for &field_id in &field_ids {
            let field = self.registry.field(field_id);
            if !field.is_static() {
                continue;
            }
            let cells = if field.is_double { 2 } else { 1 };
            let is_pointer = field.is_pointer;
            self.registry.field_mut(field_id).offset = static_offset;
            static_offset += cells;
            static_pointer_map.push(is_pointer);
            if cells == 2 {
                static_pointer_map.push(false);
            }
        }
        if static_offset > 0 {
            let statics = self.allocate_permanent_cells(usize::from(static_offset))?;
            let class = self.registry.class_mut(class_id);
            class.statics = statics;
            class.static_pointer_map = static_pointer_map;
            self.apply_constant_values(class_id, &field_ids)?;
        }

        self.registry.class_mut(class_id).state = ClassState::Linked;
        Ok(())
    }

    /// Fill `map` with the pointer-ness of every instance field cell,
    /// inherited through the superclass chain.
    fn collect_pointer_map(&self, class_id: ClassId, map: &mut [bool]) {
        let class = self.registry.class(class_id);
        if let Some(super_id) = class.super_class {
            self.collect_pointer_map(super_id, map);
        }
        for &field_id in &class.fields {
            let field = self.registry.field(field_id);
            if !field.is_static() && field.is_pointer {
                map[usize::from(field.offset)] = true;
            }
        }
    }

    fn apply_constant_values(&mut self, class_id: ClassId, field_ids: &[FieldId]) -> Result<()> {
        for &field_id in field_ids {
            let field = self.registry.field(field_id);
            if !field.is_static() {
                continue;
            }
            let offset = usize::from(field.offset);
            let Some(constant_value) = field.constant_value else {
                continue;
            };
            let statics = self.registry.class(class_id).statics;
            match constant_value {
                ConstantValue::Integer(value) => self.heap.set(statics, offset, value as u32),
                ConstantValue::Float(value) => self.heap.set(statics, offset, value.to_bits()),
                ConstantValue::Long(value) => {
                    self.heap.set(statics, offset, (value as u64 >> 32) as u32);
                    self.heap.set(statics, offset + 1, value as u32);
                }
                ConstantValue::Double(value) => {
                    let bits = value.to_bits();
                    self.heap.set(statics, offset, (bits >> 32) as u32);
                    self.heap.set(statics, offset + 1, bits as u32);
                }
                ConstantValue::String(key) => {
                    let value = self.strings.get(key).to_string();
                    let interned = self.intern_string_object(&value)?;
                    let statics = self.registry.class(class_id).statics;
                    self.heap.set_ptr(statics, offset, interned);
                }
            }
        }
        Ok(())
    }

    /// Verification: the bytecode checks proper are an ahead-of-time
    /// collaborator; the core's part is the one-time rewrite of
    /// verifier stack maps into pointer maps.
    pub(crate) fn verify_class(&mut self, class_id: ClassId) -> Result<()> {
        let method_ids: Vec<MethodId> = self.registry.class(class_id).methods.clone();
        for method_id in method_ids {
            rewrite_verifier_maps(&mut self.registry, &mut self.strings, method_id)?;
        }
        self.registry.class_mut(class_id).state = ClassState::Verified;
        Ok(())
    }
}
