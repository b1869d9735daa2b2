use crate::attributes::Attribute;
use crate::constant_pool::ConstantPool;
use crate::error::Result;
use crate::method_access_flags::MethodAccessFlags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// A method declaration in a classfile.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Method {
    pub access_flags: MethodAccessFlags,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

impl Method {
    /// Deserialize a `Method` from bytes.
    ///
    /// # Errors
    /// Returns an error if the bytes do not represent a valid method.
    pub fn from_bytes(constant_pool: &ConstantPool, bytes: &mut Cursor<Vec<u8>>) -> Result<Method> {
        let access_flags = MethodAccessFlags::from_bytes(bytes)?;
        let name_index = bytes.read_u16::<BigEndian>()?;
        let descriptor_index = bytes.read_u16::<BigEndian>()?;

        let attribute_count = bytes.read_u16::<BigEndian>()?;
        let mut attributes = Vec::with_capacity(attribute_count as usize);
        for _ in 0..attribute_count {
            attributes.push(Attribute::from_bytes(constant_pool, bytes)?);
        }

        Ok(Method {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        })
    }

    /// Serialize the `Method` to bytes.
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

    /// The method's `Code` attribute, if present.
    #[must_use]
    pub fn code(&self) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|attribute| matches!(attribute, Attribute::Code { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode;

    #[test]
    fn test_round_trip() -> Result<()> {
        let mut constant_pool = ConstantPool::new();
        let code_name = constant_pool.add_utf8("Code")?;
        let name_index = constant_pool.add_utf8("main")?;
        let descriptor_index = constant_pool.add_utf8("([Ljava/lang/String;)V")?;
        let method = Method {
            access_flags: MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            name_index,
            descriptor_index,
            attributes: vec![Attribute::Code {
                name_index: code_name,
                max_stack: 0,
                max_locals: 1,
                code: vec![opcode::RETURN],
                exception_table: vec![],
                attributes: vec![],
            }],
        };
        let mut bytes = Vec::new();
        method.to_bytes(&mut bytes)?;
        let mut cursor = Cursor::new(bytes);
        let parsed = Method::from_bytes(&constant_pool, &mut cursor)?;
        assert_eq!(parsed, method);
        assert!(parsed.code().is_some());
        Ok(())
    }
}
