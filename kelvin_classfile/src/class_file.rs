use crate::attributes::Attribute;
use crate::class_access_flags::ClassAccessFlags;
use crate::constant::Constant;
use crate::constant_pool::ConstantPool;
use crate::error::Error::{InvalidConstantPoolIndexType, InvalidMagicNumber};
use crate::error::Result;
use crate::field::Field;
use crate::method::Method;
use crate::version::Version;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

const MAGIC: u32 = 0xCAFE_BABE;

/// `ClassFile` represents the content of a Java `.class` file.
///
/// # Examples
///
/// ```rust
/// use kelvin_classfile::{ClassAccessFlags, ClassFile, ConstantPool};
/// use std::io::Cursor;
///
/// let mut constant_pool = ConstantPool::new();
/// let this_class = constant_pool.add_class("Hello")?;
/// let super_class = constant_pool.add_class("java/lang/Object")?;
/// let class_file = ClassFile {
///     constant_pool,
///     access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
///     this_class,
///     super_class,
///     ..Default::default()
/// };
///
/// let mut bytes = Vec::new();
/// class_file.to_bytes(&mut bytes)?;
/// let parsed = ClassFile::from_bytes(&mut Cursor::new(bytes))?;
/// assert_eq!("Hello", parsed.class_name()?);
/// # Ok::<(), kelvin_classfile::Error>(())
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassFile {
    pub version: Version,
    pub constant_pool: ConstantPool,
    pub access_flags: ClassAccessFlags,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Get the class name.
    ///
    /// # Errors
    /// Returns an error if `this_class` is not a valid Class constant.
    pub fn class_name(&self) -> Result<&str> {
        let class_constant = self.constant_pool.try_get(self.this_class)?;
        let Constant::Class { name_index } = class_constant else {
            return Err(InvalidConstantPoolIndexType(self.this_class));
        };
        self.constant_pool.try_get_utf8(*name_index)
    }

    /// Get the superclass name; `None` for `java/lang/Object`.
    ///
    /// # Errors
    /// Returns an error if `super_class` is not a valid Class constant.
    pub fn super_class_name(&self) -> Result<Option<&str>> {
        if self.super_class == 0 {
            return Ok(None);
        }
        Ok(Some(self.constant_pool.try_get_class_name(self.super_class)?))
    }

    /// Deserialize the `ClassFile` from bytes.
    ///
    /// # Errors
    /// Returns an error if the bytes are not a valid class file.
    pub fn from_bytes(bytes: &mut Cursor<Vec<u8>>) -> Result<ClassFile> {
        let magic = bytes.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(InvalidMagicNumber(magic));
        }

        let version = Version::from_bytes(bytes)?;
        let constant_pool = ConstantPool::from_bytes(bytes)?;
        let access_flags = ClassAccessFlags::from_bytes(bytes)?;
        let this_class = bytes.read_u16::<BigEndian>()?;
        let super_class = bytes.read_u16::<BigEndian>()?;

        let interfaces_count = bytes.read_u16::<BigEndian>()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(bytes.read_u16::<BigEndian>()?);
        }

        let field_count = bytes.read_u16::<BigEndian>()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            fields.push(Field::from_bytes(&constant_pool, bytes)?);
        }

        let method_count = bytes.read_u16::<BigEndian>()?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            methods.push(Method::from_bytes(&constant_pool, bytes)?);
        }

        let attribute_count = bytes.read_u16::<BigEndian>()?;
        let mut attributes = Vec::with_capacity(attribute_count as usize);
        for _ in 0..attribute_count {
            attributes.push(Attribute::from_bytes(&constant_pool, bytes)?);
        }

        Ok(ClassFile {
            version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    /// Serialize the `ClassFile` to bytes.
    ///
    /// # Errors
    /// If there are more than 65,535 interfaces, fields, methods, or
    /// attributes.
    pub fn to_bytes(&self, bytes: &mut Vec<u8>) -> Result<()> {
        bytes.write_u32::<BigEndian>(MAGIC)?;
        self.version.to_bytes(bytes)?;
        self.constant_pool.to_bytes(bytes)?;
        self.access_flags.to_bytes(bytes)?;
        bytes.write_u16::<BigEndian>(self.this_class)?;
        bytes.write_u16::<BigEndian>(self.super_class)?;

        bytes.write_u16::<BigEndian>(u16::try_from(self.interfaces.len())?)?;
        for interface in &self.interfaces {
            bytes.write_u16::<BigEndian>(*interface)?;
        }

        bytes.write_u16::<BigEndian>(u16::try_from(self.fields.len())?)?;
        for field in &self.fields {
            field.to_bytes(bytes)?;
        }

        bytes.write_u16::<BigEndian>(u16::try_from(self.methods.len())?)?;
        for method in &self.methods {
            method.to_bytes(bytes)?;
        }

        bytes.write_u16::<BigEndian>(u16::try_from(self.attributes.len())?)?;
        for attribute in &self.attributes {
            attribute.to_bytes(bytes)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode;
    use crate::method_access_flags::MethodAccessFlags;

    fn sample_class() -> Result<ClassFile> {
        let mut constant_pool = ConstantPool::new();
        let this_class = constant_pool.add_class("Sample")?;
        let super_class = constant_pool.add_class("java/lang/Object")?;
        let code_name = constant_pool.add_utf8("Code")?;
        let name_index = constant_pool.add_utf8("answer")?;
        let descriptor_index = constant_pool.add_utf8("()I")?;
        Ok(ClassFile {
            constant_pool,
            access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
            this_class,
            super_class,
            methods: vec![Method {
                access_flags: MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                name_index,
                descriptor_index,
                attributes: vec![Attribute::Code {
                    name_index: code_name,
                    max_stack: 1,
                    max_locals: 0,
                    code: vec![opcode::BIPUSH, 42, opcode::IRETURN],
                    exception_table: vec![],
                    attributes: vec![],
                }],
            }],
            ..Default::default()
        })
    }

    #[test]
    fn test_invalid_magic() {
        let invalid_magic: u32 = 0x0102_0304;
        let mut bytes = Cursor::new(invalid_magic.to_be_bytes().to_vec());
        assert_eq!(
            Err(InvalidMagicNumber(invalid_magic)),
            ClassFile::from_bytes(&mut bytes)
        );
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let class_file = sample_class()?;
        let mut bytes = Vec::new();
        class_file.to_bytes(&mut bytes)?;
        let parsed = ClassFile::from_bytes(&mut Cursor::new(bytes))?;
        assert_eq!(parsed, class_file);
        assert_eq!(parsed.class_name()?, "Sample");
        assert_eq!(parsed.super_class_name()?, Some("java/lang/Object"));
        Ok(())
    }

    #[test]
    fn test_newer_version_rejected() -> Result<()> {
        let class_file = sample_class()?;
        let mut bytes = Vec::new();
        class_file.to_bytes(&mut bytes)?;
        // Patch the major version to 52 (Java 8).
        bytes[6] = 0x00;
        bytes[7] = 52;
        let result = ClassFile::from_bytes(&mut Cursor::new(bytes));
        assert!(matches!(
            result,
            Err(crate::Error::UnsupportedVersion { major: 52, .. })
        ));
        Ok(())
    }
}
