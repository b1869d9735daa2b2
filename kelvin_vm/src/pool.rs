//! Runtime constant pools and lazy resolution.
//!
//! Each pool entry starts in an unresolved state carrying interned
//! keys; the first use resolves it and replaces the payload with the
//! resolved descriptor id (the enum-variant rendition of the original's
//! cache bit). Resolution enforces class access, member access
//! including the protected-outside-package subclass rule, the
//! static/instance agreement of the referencing opcode, and the
//! final-field write restriction.

use crate::error::Error::Internal;
use crate::error::Result;
use crate::klass::{ClassId, FieldId, MethodId};
use crate::string_table::{compress_method_descriptor, name_type_key, StringKey};
use crate::throw::names;
use crate::vm::Vm;
use kelvin_classfile::{Constant, ConstantPool, FieldAccessFlags, MethodDescriptor};
use kelvin_gc::Ptr;
use tracing::trace;

/// What kind of member a reference entry names.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemberKind {
    Field,
    Method,
    InterfaceMethod,
}

/// A runtime constant-pool entry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RtConstant {
    /// Index 0, second halves of wide constants, and tags the subset
    /// does not use.
    Unused,
    Utf8(StringKey),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String { utf8: StringKey },
    /// Resolved to an interned (permanent) string instance.
    StringResolved(Ptr),
    Class { name: StringKey },
    ClassResolved(ClassId),
    Member {
        class_cp: u16,
        name: StringKey,
        /// Raw descriptor key for fields; compressed-signature key for
        /// methods.
        descriptor: StringKey,
        kind: MemberKind,
    },
    FieldResolved(FieldId),
    MethodResolved(MethodId),
    NameAndType { name: StringKey, descriptor: StringKey },
}

/// A class's runtime constant pool.
#[derive(Debug, Default)]
pub struct RuntimeConstantPool {
    entries: Vec<RtConstant>,
}

impl RuntimeConstantPool {
    /// Build the runtime pool from a parsed classfile pool, interning
    /// every name and compressing method signatures.
    ///
    /// # Errors
    /// Returns an error on malformed descriptors or intern overflow.
    pub fn from_classfile(
        pool: &ConstantPool,
        strings: &mut crate::string_table::StringTable,
    ) -> Result<Self> {
        let mut entries = vec![RtConstant::Unused; pool.len() + 1];
        for (index, constant) in pool.iter() {
            let entry = match constant {
                Constant::Utf8(value) => RtConstant::Utf8(strings.intern(value)?),
                Constant::Integer(value) => RtConstant::Integer(*value),
                Constant::Float(value) => RtConstant::Float(*value),
                Constant::Long(value) => RtConstant::Long(*value),
                Constant::Double(value) => RtConstant::Double(*value),
                Constant::String { string_index } => RtConstant::String {
                    utf8: strings.intern(pool.try_get_utf8(*string_index).map_err(|error| {
                        Internal(error.to_string())
                    })?)?,
                },
                Constant::Class { name_index } => RtConstant::Class {
                    name: strings.intern(pool.try_get_utf8(*name_index).map_err(|error| {
                        Internal(error.to_string())
                    })?)?,
                },
                Constant::NameAndType {
                    name_index,
                    descriptor_index,
                } => RtConstant::NameAndType {
                    name: strings.intern(pool.try_get_utf8(*name_index).map_err(|error| {
                        Internal(error.to_string())
                    })?)?,
                    descriptor: strings.intern(pool.try_get_utf8(*descriptor_index).map_err(
                        |error| Internal(error.to_string()),
                    )?)?,
                },
                Constant::FieldRef {
                    class_index,
                    name_and_type_index,
                }
                | Constant::MethodRef {
                    class_index,
                    name_and_type_index,
                }
                | Constant::InterfaceMethodRef {
                    class_index,
                    name_and_type_index,
                } => {
                    let kind = match constant {
                        Constant::FieldRef { .. } => MemberKind::Field,
                        Constant::MethodRef { .. } => MemberKind::Method,
                        _ => MemberKind::InterfaceMethod,
                    };
                    let (name, raw_descriptor) = pool
                        .try_get_name_and_type(*name_and_type_index)
                        .map_err(|error| Internal(error.to_string()))?;
                    let descriptor = if kind == MemberKind::Field {
                        strings.intern(raw_descriptor)?
                    } else {
                        let parsed = MethodDescriptor::parse(raw_descriptor)
                            .map_err(|error| Internal(error.to_string()))?;
                        compress_method_descriptor(&parsed, strings)?
                    };
                    RtConstant::Member {
                        class_cp: *class_index,
                        name: strings.intern(name)?,
                        descriptor,
                        kind,
                    }
                }
            };
            entries[index as usize] = entry;
        }
        Ok(RuntimeConstantPool { entries })
    }

    /// Get an entry; out-of-range indexes read as `Unused`.
    #[must_use]
    pub fn get(&self, index: u16) -> RtConstant {
        self.entries
            .get(index as usize)
            .copied()
            .unwrap_or(RtConstant::Unused)
    }

    /// Replace an entry with its resolved form. Resolution is
    /// monotonic: entries only move from unresolved to resolved.
    pub fn cache(&mut self, index: u16, resolved: RtConstant) {
        if let Some(entry) = self.entries.get_mut(index as usize) {
            *entry = resolved;
        }
    }

    /// Number of entries including index 0.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool has no usable entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }
}

impl Vm {
    /// Resolve a Class entry of `class_id`'s pool, enforcing class
    /// access (public or same runtime package).
    ///
    /// # Errors
    /// `JavaThrow` with a linkage error on failure.
    pub(crate) fn resolve_class_at(&mut self, class_id: ClassId, index: u16) -> Result<ClassId> {
        match self.registry.class(class_id).pool.get(index) {
            RtConstant::ClassResolved(resolved) => Ok(resolved),
            RtConstant::Class { name } => {
                let resolved = self.load_class_by_key(name)?;
                let target = self.registry.class(resolved);
                if !target
                    .access
                    .contains(kelvin_classfile::ClassAccessFlags::PUBLIC)
                    && !self.registry.same_package(class_id, resolved, &self.strings)
                {
                    let message = self.strings.get(name).to_string();
                    return Err(self.raise(names::ILLEGAL_ACCESS_ERROR, &message));
                }
                self.registry
                    .class_mut(class_id)
                    .pool
                    .cache(index, RtConstant::ClassResolved(resolved));
                trace!("resolved class entry {index} -> {resolved:?}");
                Ok(resolved)
            }
            _ => Err(self.raise(names::CLASS_FORMAT_ERROR, "expected a class entry")),
        }
    }

    /// Resolve a Fieldref entry, checking member access, the
    /// static/instance agreement of the referencing opcode, and the
    /// final-write restriction.
    ///
    /// # Errors
    /// `JavaThrow` with the appropriate linkage error.
    pub(crate) fn resolve_field_at(
        &mut self,
        class_id: ClassId,
        index: u16,
        expect_static: bool,
        is_put: bool,
    ) -> Result<FieldId> {
        let entry = self.registry.class(class_id).pool.get(index);
        let field_id = match entry {
            RtConstant::FieldResolved(resolved) => resolved,
            RtConstant::Member {
                class_cp,
                name,
                descriptor,
                kind: MemberKind::Field,
            } => {
                let holder = self.resolve_class_at(class_id, class_cp)?;
                let key = name_type_key(name, descriptor);
                let Some(found) = self.registry.lookup_field(holder, key) else {
                    let message = self.strings.get(name).to_string();
                    return Err(self.raise(names::NO_SUCH_FIELD_ERROR, &message));
                };
                self.check_member_access(
                    class_id,
                    self.registry.field(found).class_id,
                    holder,
                    self.registry.field(found).access.bits(),
                )?;
                self.registry
                    .class_mut(class_id)
                    .pool
                    .cache(index, RtConstant::FieldResolved(found));
                found
            }
            _ => return Err(self.raise(names::CLASS_FORMAT_ERROR, "expected a field entry")),
        };

        let field = self.registry.field(field_id);
        let is_static = field.is_static();
        let is_final = field.access.contains(FieldAccessFlags::FINAL);
        let declaring = field.class_id;
        let field_name = field.name_key;

        if is_static != expect_static {
            let message = self.strings.get(field_name).to_string();
            return Err(self.raise(names::INCOMPATIBLE_CLASS_CHANGE_ERROR, &message));
        }
        if is_put && is_final && declaring != class_id {
            let message = self.strings.get(field_name).to_string();
            return Err(self.raise(names::ILLEGAL_ACCESS_ERROR, &message));
        }
        Ok(field_id)
    }

    /// Resolve a Methodref or InterfaceMethodref entry.
    ///
    /// # Errors
    /// `JavaThrow` with the appropriate linkage error.
    pub(crate) fn resolve_method_at(
        &mut self,
        class_id: ClassId,
        index: u16,
        expect_static: bool,
    ) -> Result<MethodId> {
        let entry = self.registry.class(class_id).pool.get(index);
        let method_id = match entry {
            RtConstant::MethodResolved(resolved) => resolved,
            RtConstant::Member {
                class_cp,
                name,
                descriptor,
                kind,
            } if kind != MemberKind::Field => {
                let holder = self.resolve_class_at(class_id, class_cp)?;
                let key = name_type_key(name, descriptor);
                let found = if kind == MemberKind::InterfaceMethod {
                    self.registry.lookup_interface_method(holder, key)
                } else {
                    self.registry.lookup_method(holder, key)
                };
                let Some(found) = found else {
                    let message = self.strings.get(name).to_string();
                    return Err(self.raise(names::NO_SUCH_METHOD_ERROR, &message));
                };
                self.check_member_access(
                    class_id,
                    self.registry.method(found).class_id,
                    holder,
                    self.registry.method(found).access.bits(),
                )?;
                self.registry
                    .class_mut(class_id)
                    .pool
                    .cache(index, RtConstant::MethodResolved(found));
                found
            }
            _ => return Err(self.raise(names::CLASS_FORMAT_ERROR, "expected a method entry")),
        };

        let method = self.registry.method(method_id);
        let is_static = method.is_static();
        let method_name = method.name_key;
        if is_static != expect_static {
            let message = self.strings.get(method_name).to_string();
            return Err(self.raise(names::INCOMPATIBLE_CLASS_CHANGE_ERROR, &message));
        }
        Ok(method_id)
    }

    /// Resolve a String entry to an interned (permanent) instance.
    ///
    /// # Errors
    /// `JavaThrow` on allocation failure.
    pub(crate) fn resolve_string_at(&mut self, class_id: ClassId, index: u16) -> Result<Ptr> {
        match self.registry.class(class_id).pool.get(index) {
            RtConstant::StringResolved(resolved) => Ok(resolved),
            RtConstant::String { utf8 } => {
                let value = self.strings.get(utf8).to_string();
                let interned = self.intern_string_object(&value)?;
                self.registry
                    .class_mut(class_id)
                    .pool
                    .cache(index, RtConstant::StringResolved(interned));
                Ok(interned)
            }
            _ => Err(self.raise(names::CLASS_FORMAT_ERROR, "expected a string entry")),
        }
    }

    /// The standard member access rules: public always; private only
    /// within the declaring class; default and protected within the
    /// package. Protected outside the package additionally requires the
    /// accessor to be a subclass of the declaring class *and* the class
    /// named at the call site (`resolved_class`) to be the accessor
    /// itself, one of its superclasses, or one of its subclasses -
    /// otherwise protected access through an unrelated static type
    /// would slip through.
    fn check_member_access(
        &mut self,
        accessor: ClassId,
        declaring: ClassId,
        resolved_class: ClassId,
        access_bits: u16,
    ) -> Result<()> {
        const PUBLIC: u16 = 0x0001;
        const PRIVATE: u16 = 0x0002;
        const PROTECTED: u16 = 0x0004;

        let allowed = if accessor == declaring || access_bits & PUBLIC != 0 {
            true
        } else if access_bits & PRIVATE != 0 {
            false
        } else if self.registry.same_package(accessor, declaring, &self.strings) {
            true
        } else if access_bits & PROTECTED != 0 {
            self.registry.is_subclass(accessor, declaring)
                && (self.registry.is_subclass(accessor, resolved_class)
                    || self.registry.is_subclass(resolved_class, accessor))
        } else {
            false
        };
        if allowed {
            Ok(())
        } else {
            let name = self.strings.get(self.registry.class(declaring).name_key).to_string();
            Err(self.raise(names::ILLEGAL_ACCESS_ERROR, &name))
        }
    }
}
