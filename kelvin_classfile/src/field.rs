use crate::attributes::Attribute;
use crate::constant_pool::ConstantPool;
use crate::error::Result;
use crate::field_access_flags::FieldAccessFlags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// A field declaration in a classfile.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Field {
    pub access_flags: FieldAccessFlags,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

impl Field {
    /// Deserialize a `Field` from bytes.
    ///
    /// # Errors
    /// Returns an error if the bytes do not represent a valid field.
    pub fn from_bytes(constant_pool: &ConstantPool, bytes: &mut Cursor<Vec<u8>>) -> Result<Field> {
        let access_flags = FieldAccessFlags::from_bytes(bytes)?;
        let name_index = bytes.read_u16::<BigEndian>()?;
        let descriptor_index = bytes.read_u16::<BigEndian>()?;

        let attribute_count = bytes.read_u16::<BigEndian>()?;
        let mut attributes = Vec::with_capacity(attribute_count as usize);
        for _ in 0..attribute_count {
            attributes.push(Attribute::from_bytes(constant_pool, bytes)?);
        }

        Ok(Field {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        })
    }

    /// Serialize the `Field` to bytes.
    ///
    /// # Errors
    /// If there are more than 65,535 attributes.
    pub fn to_bytes(&self, bytes: &mut Vec<u8>) -> Result<()> {
        self.access_flags.to_bytes(bytes)?;
        bytes.write_u16::<BigEndian>(self.name_index)?;
        bytes.write_u16::<BigEndian>(self.descriptor_index)?;
        bytes.write_u16::<BigEndian>(u16::try_from(self.attributes.len())?)?;
        for attribute in &self.attributes {
            attribute.to_bytes(bytes)?;
        }
        Ok(())
    }

    /// The `ConstantValue` attribute index, if this field carries one.
    #[must_use]
    pub fn constant_value_index(&self) -> Option<u16> {
        self.attributes.iter().find_map(|attribute| match attribute {
            Attribute::ConstantValue {
                constant_value_index,
                ..
            } => Some(*constant_value_index),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() -> Result<()> {
        let mut constant_pool = ConstantPool::new();
        let name_index = constant_pool.add_utf8("counter")?;
        let descriptor_index = constant_pool.add_utf8("I")?;
        let field = Field {
            access_flags: FieldAccessFlags::PRIVATE,
            name_index,
            descriptor_index,
            attributes: vec![],
        };
        let mut bytes = Vec::new();
        field.to_bytes(&mut bytes)?;
        let mut cursor = Cursor::new(bytes);
        assert_eq!(Field::from_bytes(&constant_pool, &mut cursor)?, field);
        Ok(())
    }
}
