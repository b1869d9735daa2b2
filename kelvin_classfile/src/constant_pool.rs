use crate::constant::Constant;
use crate::error::Error::{InvalidConstantPoolIndex, InvalidConstantPoolIndexType};
use crate::error::Result;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;

/// Constant pool.
///
/// A table of structures representing string constants, class and
/// interface names, field names, and other constants referred to within
/// the `ClassFile` structure. The pool is 1-based; `Long` and `Double`
/// entries occupy two indices.
///
/// # Examples
///
/// ```rust
/// use kelvin_classfile::{Constant, ConstantPool};
///
/// let mut constant_pool = ConstantPool::new();
/// let utf8 = constant_pool.add_utf8("Hello")?;
/// let class = constant_pool.add_class("java/lang/Object")?;
/// assert!(utf8 > 0 && class > 0);
/// # Ok::<(), kelvin_classfile::Error>(())
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConstantPool {
    constants: Vec<ConstantEntry>,
}

/// A placeholder fills index 0 and the second slot of Long/Double entries.
#[derive(Clone, Debug, PartialEq)]
enum ConstantEntry {
    Constant(Constant),
    Placeholder,
}

impl ConstantPool {
    /// Create a new constant pool with the index-0 placeholder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            constants: vec![ConstantEntry::Placeholder],
        }
    }

    /// Push a constant to the pool. For Long and Double constants an
    /// additional placeholder entry is added.
    pub fn push(&mut self, constant: Constant) {
        let add_placeholder = matches!(constant, Constant::Long(_) | Constant::Double(_));
        self.constants.push(ConstantEntry::Constant(constant));
        if add_placeholder {
            self.constants.push(ConstantEntry::Placeholder);
        }
    }

    /// Add a constant to the pool and return its index.
    ///
    /// # Errors
    /// If there are more than 65,534 constants in the pool.
    pub fn add(&mut self, constant: Constant) -> Result<u16> {
        let index = u16::try_from(self.constants.len())?;
        self.push(constant);
        Ok(index)
    }

    /// Add a UTF-8 constant, reusing an existing identical entry.
    ///
    /// # Errors
    /// If the pool overflows.
    pub fn add_utf8<S: AsRef<str>>(&mut self, value: S) -> Result<u16> {
        let value = value.as_ref();
        for (index, entry) in self.constants.iter().enumerate() {
            if let ConstantEntry::Constant(Constant::Utf8(existing)) = entry {
                if existing == value {
                    return Ok(u16::try_from(index)?);
                }
            }
        }
        self.add(Constant::Utf8(value.to_string()))
    }

    /// Add a Class constant (and its name), reusing existing entries.
    ///
    /// # Errors
    /// If the pool overflows.
    pub fn add_class<S: AsRef<str>>(&mut self, name: S) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        for (index, entry) in self.constants.iter().enumerate() {
            if let ConstantEntry::Constant(Constant::Class { name_index: existing }) = entry {
                if *existing == name_index {
                    return Ok(u16::try_from(index)?);
                }
            }
        }
        self.add(Constant::Class { name_index })
    }

    /// Add a String constant over a new or existing UTF-8 entry.
    ///
    /// # Errors
    /// If the pool overflows.
    pub fn add_string<S: AsRef<str>>(&mut self, value: S) -> Result<u16> {
        let string_index = self.add_utf8(value)?;
        self.add(Constant::String { string_index })
    }

    /// Add a NameAndType constant.
    ///
    /// # Errors
    /// If the pool overflows.
    pub fn add_name_and_type<S: AsRef<str>>(&mut self, name: S, descriptor: S) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.add(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    /// Add a Fieldref constant.
    ///
    /// # Errors
    /// If the pool overflows.
    pub fn add_field_ref<S: AsRef<str>>(&mut self, class: S, name: S, descriptor: S) -> Result<u16> {
        let class_index = self.add_class(class)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::FieldRef {
            class_index,
            name_and_type_index,
        })
    }

    /// Add a Methodref constant.
    ///
    /// # Errors
    /// If the pool overflows.
    pub fn add_method_ref<S: AsRef<str>>(
        &mut self,
        class: S,
        name: S,
        descriptor: S,
    ) -> Result<u16> {
        let class_index = self.add_class(class)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::MethodRef {
            class_index,
            name_and_type_index,
        })
    }

    /// Get a constant by 1-based index; `None` if out of bounds or a
    /// placeholder slot.
    #[must_use]
    pub fn get(&self, index: u16) -> Option<&Constant> {
        self.try_get(index).ok()
    }

    /// Get a constant by 1-based index.
    ///
    /// # Errors
    /// Returns `InvalidConstantPoolIndex` if the index is out of bounds or
    /// addresses a placeholder slot.
    pub fn try_get(&self, index: u16) -> Result<&Constant> {
        match self.constants.get(index as usize) {
            Some(ConstantEntry::Constant(constant)) => Ok(constant),
            _ => Err(InvalidConstantPoolIndex(index)),
        }
    }

    /// Get a UTF-8 constant's value by index.
    ///
    /// # Errors
    /// Returns `InvalidConstantPoolIndexType` if the entry is not UTF-8.
    pub fn try_get_utf8(&self, index: u16) -> Result<&str> {
        match self.try_get(index)? {
            Constant::Utf8(value) => Ok(value),
            _ => Err(InvalidConstantPoolIndexType(index)),
        }
    }

    /// Get a Class constant's name by index.
    ///
    /// # Errors
    /// Returns `InvalidConstantPoolIndexType` if the entry is not a Class.
    pub fn try_get_class_name(&self, index: u16) -> Result<&str> {
        match self.try_get(index)? {
            Constant::Class { name_index } => self.try_get_utf8(*name_index),
            _ => Err(InvalidConstantPoolIndexType(index)),
        }
    }

    /// Resolve a NameAndType entry to `(name, descriptor)`.
    ///
    /// # Errors
    /// Returns `InvalidConstantPoolIndexType` on a tag mismatch.
    pub fn try_get_name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.try_get(index)? {
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((
                self.try_get_utf8(*name_index)?,
                self.try_get_utf8(*descriptor_index)?,
            )),
            _ => Err(InvalidConstantPoolIndexType(index)),
        }
    }

    /// Number of slots in the pool, excluding the index-0 placeholder.
    #[must_use]
    pub fn len(&self) -> usize {
        self.constants.len() - 1
    }

    /// Check if the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over `(index, constant)` pairs, skipping placeholders.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.constants.iter().enumerate().filter_map(|(index, entry)| {
            match entry {
                ConstantEntry::Constant(constant) => {
                    u16::try_from(index).ok().map(|index| (index, constant))
                }
                ConstantEntry::Placeholder => None,
            }
        })
    }

    /// Deserialize the constant pool from bytes.
    ///
    /// # Errors
    /// Returns an error if the bytes do not represent a valid pool.
    pub fn from_bytes(bytes: &mut Cursor<Vec<u8>>) -> Result<ConstantPool> {
        let count = bytes.read_u16::<BigEndian>()?;
        let mut constant_pool = ConstantPool::new();
        while constant_pool.constants.len() < count as usize {
            let constant = Constant::from_bytes(bytes)?;
            constant_pool.push(constant);
        }
        Ok(constant_pool)
    }

    /// Serialize the constant pool to bytes.
    ///
    /// # Errors
    /// If the pool overflows a `u16` count.
    pub fn to_bytes(&self, bytes: &mut Vec<u8>) -> Result<()> {
        bytes.write_u16::<BigEndian>(u16::try_from(self.constants.len())?)?;
        for entry in &self.constants {
            if let ConstantEntry::Constant(constant) = entry {
                constant.to_bytes(bytes)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for ConstantPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, constant) in self.iter() {
            writeln!(f, "  #{index} = {constant}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_based_indexing() -> Result<()> {
        let mut constant_pool = ConstantPool::new();
        constant_pool.push(Constant::Integer(42));
        assert_eq!(constant_pool.try_get(1)?, &Constant::Integer(42));
        assert_eq!(
            constant_pool.try_get(0),
            Err(InvalidConstantPoolIndex(0))
        );
        Ok(())
    }

    #[test]
    fn test_long_takes_two_slots() -> Result<()> {
        let mut constant_pool = ConstantPool::new();
        let long_index = constant_pool.add(Constant::Long(7))?;
        let next_index = constant_pool.add(Constant::Integer(1))?;
        assert_eq!(long_index + 2, next_index);
        assert_eq!(
            constant_pool.try_get(long_index + 1),
            Err(InvalidConstantPoolIndex(long_index + 1))
        );
        Ok(())
    }

    #[test]
    fn test_add_utf8_interned() -> Result<()> {
        let mut constant_pool = ConstantPool::new();
        let first = constant_pool.add_utf8("same")?;
        let second = constant_pool.add_utf8("same")?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_member_helpers() -> Result<()> {
        let mut constant_pool = ConstantPool::new();
        let method_ref = constant_pool.add_method_ref("Fact", "fact", "(I)J")?;
        let Constant::MethodRef {
            class_index,
            name_and_type_index,
        } = *constant_pool.try_get(method_ref)?
        else {
            panic!("expected Methodref");
        };
        assert_eq!(constant_pool.try_get_class_name(class_index)?, "Fact");
        assert_eq!(
            constant_pool.try_get_name_and_type(name_and_type_index)?,
            ("fact", "(I)J")
        );
        Ok(())
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let mut constant_pool = ConstantPool::new();
        constant_pool.add_utf8("alpha")?;
        constant_pool.add(Constant::Long(-1))?;
        constant_pool.add_class("Beta")?;
        constant_pool.add_string("gamma")?;

        let mut bytes = Vec::new();
        constant_pool.to_bytes(&mut bytes)?;
        let mut cursor = Cursor::new(bytes);
        assert_eq!(ConstantPool::from_bytes(&mut cursor)?, constant_pool);
        Ok(())
    }
}
