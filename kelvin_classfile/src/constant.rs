use crate::error::Error::InvalidConstantTag;
use crate::error::Result;
use crate::mutf8;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;

/// A constant pool entry.
///
/// The CLDC classfile subset uses tags 1 and 3 through 12; the
/// invokedynamic-era tags do not occur in the supported version window.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    FieldRef { class_index: u16, name_and_type_index: u16 },
    MethodRef { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodRef { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
}

pub(crate) const TAG_UTF8: u8 = 1;
pub(crate) const TAG_INTEGER: u8 = 3;
pub(crate) const TAG_FLOAT: u8 = 4;
pub(crate) const TAG_LONG: u8 = 5;
pub(crate) const TAG_DOUBLE: u8 = 6;
pub(crate) const TAG_CLASS: u8 = 7;
pub(crate) const TAG_STRING: u8 = 8;
pub(crate) const TAG_FIELD_REF: u8 = 9;
pub(crate) const TAG_METHOD_REF: u8 = 10;
pub(crate) const TAG_INTERFACE_METHOD_REF: u8 = 11;
pub(crate) const TAG_NAME_AND_TYPE: u8 = 12;

impl Constant {
    /// The classfile tag byte of this constant.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Utf8(_) => TAG_UTF8,
            Constant::Integer(_) => TAG_INTEGER,
            Constant::Float(_) => TAG_FLOAT,
            Constant::Long(_) => TAG_LONG,
            Constant::Double(_) => TAG_DOUBLE,
            Constant::Class { .. } => TAG_CLASS,
            Constant::String { .. } => TAG_STRING,
            Constant::FieldRef { .. } => TAG_FIELD_REF,
            Constant::MethodRef { .. } => TAG_METHOD_REF,
            Constant::InterfaceMethodRef { .. } => TAG_INTERFACE_METHOD_REF,
            Constant::NameAndType { .. } => TAG_NAME_AND_TYPE,
        }
    }

    /// Deserialize a constant from bytes.
    ///
    /// # Errors
    /// Returns `InvalidConstantTag` on an unknown or unsupported tag.
    pub fn from_bytes(bytes: &mut Cursor<Vec<u8>>) -> Result<Constant> {
        let tag = bytes.read_u8()?;
        let constant = match tag {
            TAG_UTF8 => {
                let length = bytes.read_u16::<BigEndian>()? as usize;
                let mut utf8 = vec![0u8; length];
                std::io::Read::read_exact(bytes, &mut utf8)?;
                Constant::Utf8(mutf8::from_bytes(&utf8)?)
            }
            TAG_INTEGER => Constant::Integer(bytes.read_i32::<BigEndian>()?),
            TAG_FLOAT => Constant::Float(bytes.read_f32::<BigEndian>()?),
            TAG_LONG => Constant::Long(bytes.read_i64::<BigEndian>()?),
            TAG_DOUBLE => Constant::Double(bytes.read_f64::<BigEndian>()?),
            TAG_CLASS => Constant::Class {
                name_index: bytes.read_u16::<BigEndian>()?,
            },
            TAG_STRING => Constant::String {
                string_index: bytes.read_u16::<BigEndian>()?,
            },
            TAG_FIELD_REF => Constant::FieldRef {
                class_index: bytes.read_u16::<BigEndian>()?,
                name_and_type_index: bytes.read_u16::<BigEndian>()?,
            },
            TAG_METHOD_REF => Constant::MethodRef {
                class_index: bytes.read_u16::<BigEndian>()?,
                name_and_type_index: bytes.read_u16::<BigEndian>()?,
            },
            TAG_INTERFACE_METHOD_REF => Constant::InterfaceMethodRef {
                class_index: bytes.read_u16::<BigEndian>()?,
                name_and_type_index: bytes.read_u16::<BigEndian>()?,
            },
            TAG_NAME_AND_TYPE => Constant::NameAndType {
                name_index: bytes.read_u16::<BigEndian>()?,
                descriptor_index: bytes.read_u16::<BigEndian>()?,
            },
            tag => return Err(InvalidConstantTag(tag)),
        };
        Ok(constant)
    }

    /// Serialize the constant to bytes.
    ///
    /// # Errors
    /// If a UTF-8 string is longer than 65,535 bytes.
    pub fn to_bytes(&self, bytes: &mut Vec<u8>) -> Result<()> {
        bytes.write_u8(self.tag())?;
        match self {
            Constant::Utf8(value) => {
                let encoded = mutf8::to_bytes(value)?;
                bytes.write_u16::<BigEndian>(u16::try_from(encoded.len())?)?;
                bytes.extend_from_slice(&encoded);
            }
            Constant::Integer(value) => bytes.write_i32::<BigEndian>(*value)?,
            Constant::Float(value) => bytes.write_f32::<BigEndian>(*value)?,
            Constant::Long(value) => bytes.write_i64::<BigEndian>(*value)?,
            Constant::Double(value) => bytes.write_f64::<BigEndian>(*value)?,
            Constant::Class { name_index } => bytes.write_u16::<BigEndian>(*name_index)?,
            Constant::String { string_index } => bytes.write_u16::<BigEndian>(*string_index)?,
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
                bytes.write_u16::<BigEndian>(*class_index)?;
                bytes.write_u16::<BigEndian>(*name_and_type_index)?;
            }
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => {
                bytes.write_u16::<BigEndian>(*name_index)?;
                bytes.write_u16::<BigEndian>(*descriptor_index)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Utf8(value) => write!(f, "Utf8 {value}"),
            Constant::Integer(value) => write!(f, "Integer {value}"),
            Constant::Float(value) => write!(f, "Float {value}"),
            Constant::Long(value) => write!(f, "Long {value}"),
            Constant::Double(value) => write!(f, "Double {value}"),
            Constant::Class { name_index } => write!(f, "Class #{name_index}"),
            Constant::String { string_index } => write!(f, "String #{string_index}"),
            Constant::FieldRef {
                class_index,
                name_and_type_index,
            } => write!(f, "Fieldref #{class_index}.#{name_and_type_index}"),
            Constant::MethodRef {
                class_index,
                name_and_type_index,
            } => write!(f, "Methodref #{class_index}.#{name_and_type_index}"),
            Constant::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => write!(f, "InterfaceMethodref #{class_index}.#{name_and_type_index}"),
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => write!(f, "NameAndType #{name_index}:#{descriptor_index}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(constant: Constant) -> Result<()> {
        let mut bytes = Vec::new();
        constant.to_bytes(&mut bytes)?;
        let mut cursor = Cursor::new(bytes);
        assert_eq!(Constant::from_bytes(&mut cursor)?, constant);
        Ok(())
    }

    #[test]
    fn test_round_trips() -> Result<()> {
        round_trip(Constant::Utf8("fact".to_string()))?;
        round_trip(Constant::Integer(-42))?;
        round_trip(Constant::Float(2.5))?;
        round_trip(Constant::Long(0x1234_5678_9ABC_DEF0))?;
        round_trip(Constant::Double(-0.25))?;
        round_trip(Constant::Class { name_index: 3 })?;
        round_trip(Constant::String { string_index: 4 })?;
        round_trip(Constant::FieldRef {
            class_index: 1,
            name_and_type_index: 2,
        })?;
        round_trip(Constant::MethodRef {
            class_index: 1,
            name_and_type_index: 2,
        })?;
        round_trip(Constant::InterfaceMethodRef {
            class_index: 1,
            name_and_type_index: 2,
        })?;
        round_trip(Constant::NameAndType {
            name_index: 5,
            descriptor_index: 6,
        })?;
        Ok(())
    }

    #[test]
    fn test_invalid_tag() {
        // Tag 18 (InvokeDynamic) is outside the CLDC subset.
        let mut cursor = Cursor::new(vec![18, 0, 0, 0, 0]);
        assert_eq!(
            Constant::from_bytes(&mut cursor),
            Err(InvalidConstantTag(18))
        );
    }
}
