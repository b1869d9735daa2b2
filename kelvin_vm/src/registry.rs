//! The class registry: an arena of class, method and field descriptors
//! addressed by index. Descriptors are created by the loader, promoted
//! logically to permanent metadata, and never reclaimed.

use crate::error::Error::Internal;
use crate::error::Result;
use crate::klass::{ArrayElement, Class, ClassId, ClassState, Field, FieldId, Method, MethodId};
use crate::string_table::{NameTypeKey, StringKey};
use ahash::AHashMap;

/// The arena of loaded classes and their members.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: Vec<Class>,
    methods: Vec<Method>,
    fields: Vec<Field>,
    by_name: AHashMap<StringKey, ClassId>,
}

impl ClassRegistry {
    #[must_use]
    pub fn new() -> Self {
        ClassRegistry::default()
    }

    // ----- registration --------------------------------------------------

    /// Add a class; its `id` field is filled in.
    pub fn register_class(&mut self, mut class: Class) -> Result<ClassId> {
        let id = ClassId(
            u32::try_from(self.classes.len())
                .map_err(|_| Internal("class arena overflow".to_string()))?,
        );
        class.id = id;
        self.by_name.insert(class.name_key, id);
        self.classes.push(class);
        Ok(id)
    }

    /// Add a method; its `id` field is filled in and it is appended to
    /// its class's method list.
    pub fn register_method(&mut self, mut method: Method) -> Result<MethodId> {
        let id = MethodId(
            u32::try_from(self.methods.len())
                .map_err(|_| Internal("method arena overflow".to_string()))?,
        );
        method.id = id;
        let class_id = method.class_id;
        self.methods.push(method);
        self.class_mut(class_id).methods.push(id);
        Ok(id)
    }

    /// Add a field; its `id` field is filled in and it is appended to
    /// its class's field list.
    pub fn register_field(&mut self, mut field: Field) -> Result<FieldId> {
        let id = FieldId(
            u32::try_from(self.fields.len())
                .map_err(|_| Internal("field arena overflow".to_string()))?,
        );
        field.id = id;
        let class_id = field.class_id;
        self.fields.push(field);
        self.class_mut(class_id).fields.push(id);
        Ok(id)
    }

    // ----- access --------------------------------------------------------

    #[must_use]
    pub fn class(&self, id: ClassId) -> &Class {
        &self.classes[id.0 as usize]
    }

    #[must_use]
    pub fn class_mut(&mut self, id: ClassId) -> &mut Class {
        &mut self.classes[id.0 as usize]
    }

    #[must_use]
    pub fn method(&self, id: MethodId) -> &Method {
        &self.methods[id.0 as usize]
    }

    #[must_use]
    pub fn method_mut(&mut self, id: MethodId) -> &mut Method {
        &mut self.methods[id.0 as usize]
    }

    #[must_use]
    pub fn field(&self, id: FieldId) -> &Field {
        &self.fields[id.0 as usize]
    }

    #[must_use]
    pub fn field_mut(&mut self, id: FieldId) -> &mut Field {
        &mut self.fields[id.0 as usize]
    }

    /// Find a class by interned name key.
    #[must_use]
    pub fn find(&self, name_key: StringKey) -> Option<ClassId> {
        self.by_name.get(&name_key).copied()
    }

    /// Iterate all registered classes.
    pub fn classes(&self) -> impl Iterator<Item = &Class> {
        self.classes.iter()
    }

    /// Iterate all registered class ids.
    pub fn class_ids(&self) -> impl Iterator<Item = ClassId> {
        (0..self.classes.len() as u32).map(ClassId)
    }

    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    // ----- member lookup -------------------------------------------------

    /// Find a method by `(name, type)` key, walking the superclass
    /// chain from `class_id` upward.
    #[must_use]
    pub fn lookup_method(&self, class_id: ClassId, key: NameTypeKey) -> Option<MethodId> {
        let mut current = Some(class_id);
        while let Some(id) = current {
            let class = self.class(id);
            for &method_id in &class.methods {
                if self.method(method_id).name_type() == key {
                    return Some(method_id);
                }
            }
            current = class.super_class;
        }
        None
    }

    /// Find a method in a class, its superclasses, or any implemented
    /// interface (for `invokeinterface` resolution).
    #[must_use]
    pub fn lookup_interface_method(&self, class_id: ClassId, key: NameTypeKey) -> Option<MethodId> {
        if let Some(found) = self.lookup_method(class_id, key) {
            return Some(found);
        }
        let mut current = Some(class_id);
        while let Some(id) = current {
            let class = self.class(id);
            for &interface in &class.interfaces {
                if let Some(found) = self.lookup_interface_method(interface, key) {
                    return Some(found);
                }
            }
            current = class.super_class;
        }
        None
    }

    /// Find a field by `(name, type)` key, walking the superclass chain.
    #[must_use]
    pub fn lookup_field(&self, class_id: ClassId, key: NameTypeKey) -> Option<FieldId> {
        let mut current = Some(class_id);
        while let Some(id) = current {
            let class = self.class(id);
            for &field_id in &class.fields {
                if self.field(field_id).name_type() == key {
                    return Some(field_id);
                }
            }
            current = class.super_class;
        }
        None
    }

    // ----- assignability -------------------------------------------------

    /// Whether `sub` is `sup` or a subclass of it.
    #[must_use]
    pub fn is_subclass(&self, sub: ClassId, sup: ClassId) -> bool {
        let mut current = Some(sub);
        while let Some(id) = current {
            if id == sup {
                return true;
            }
            current = self.class(id).super_class;
        }
        false
    }

    /// Whether `class_id` implements `interface` (directly, through a
    /// superinterface, or through a superclass).
    #[must_use]
    pub fn implements(&self, class_id: ClassId, interface: ClassId) -> bool {
        let mut current = Some(class_id);
        while let Some(id) = current {
            let class = self.class(id);
            for &implemented in &class.interfaces {
                if implemented == interface || self.implements(implemented, interface) {
                    return true;
                }
            }
            current = class.super_class;
        }
        false
    }

    /// The `checkcast`/`instanceof`/`aastore` assignability relation.
    #[must_use]
    pub fn is_assignable(&self, sub: ClassId, sup: ClassId) -> bool {
        if sub == sup {
            return true;
        }
        let sup_class = self.class(sup);
        match (self.class(sub).array_element, sup_class.array_element) {
            (Some(_), None) => {
                // Arrays are assignable to Object and to interfaces
                // they implement (none in this subset).
                sup_class.super_class.is_none() && !sup_class.is_interface()
            }
            (Some(sub_element), Some(sup_element)) => match (sub_element, sup_element) {
                (ArrayElement::Primitive(a), ArrayElement::Primitive(b)) => a == b,
                (ArrayElement::Reference(a), ArrayElement::Reference(b)) => {
                    self.is_assignable(a, b)
                }
                _ => false,
            },
            (None, _) => {
                if sup_class.is_interface() {
                    self.implements(sub, sup)
                } else {
                    self.is_subclass(sub, sup)
                }
            }
        }
    }

    /// Whether two classes share a runtime package (same name prefix up
    /// to the final separator; single class loader).
    #[must_use]
    pub fn same_package(
        &self,
        first: ClassId,
        second: ClassId,
        strings: &crate::string_table::StringTable,
    ) -> bool {
        let first_name = strings.get_bytes(self.class(first).name_key);
        let second_name = strings.get_bytes(self.class(second).name_key);
        package_of(first_name) == package_of(second_name)
    }

    /// Mark a failed class so later lookups raise
    /// `NoClassDefFoundError`.
    pub fn poison(&mut self, class_id: ClassId) {
        self.class_mut(class_id).state = ClassState::Error;
    }
}

fn package_of(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&byte| byte == b'/') {
        Some(position) => &name[..position],
        None => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_of() {
        assert_eq!(package_of(b"java/lang/Object"), b"java/lang");
        assert_eq!(package_of(b"Main"), b"");
    }
}
