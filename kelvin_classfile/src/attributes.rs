//! Classfile attributes.
//!
//! Only the attributes the VM consumes are modelled structurally: `Code`,
//! `ConstantValue`, `Exceptions`, and the CLDC `StackMap` form emitted by
//! the preverifier. Anything else is kept as an opaque byte blob so a
//! parsed classfile can be written back without loss.

use crate::bytecode;
use crate::constant_pool::ConstantPool;
use crate::error::Error::{InvalidVerificationTypeTag, ReservedOpcode};
use crate::error::Result;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// An entry in a `Code` attribute's exception handler table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Constant-pool index of the catch class; 0 catches anything.
    pub catch_type: u16,
}

impl ExceptionTableEntry {
    fn from_bytes(bytes: &mut Cursor<Vec<u8>>) -> Result<Self> {
        Ok(ExceptionTableEntry {
            start_pc: bytes.read_u16::<BigEndian>()?,
            end_pc: bytes.read_u16::<BigEndian>()?,
            handler_pc: bytes.read_u16::<BigEndian>()?,
            catch_type: bytes.read_u16::<BigEndian>()?,
        })
    }

    fn to_bytes(&self, bytes: &mut Vec<u8>) -> Result<()> {
        bytes.write_u16::<BigEndian>(self.start_pc)?;
        bytes.write_u16::<BigEndian>(self.end_pc)?;
        bytes.write_u16::<BigEndian>(self.handler_pc)?;
        bytes.write_u16::<BigEndian>(self.catch_type)?;
        Ok(())
    }
}

/// A verification type in a `StackMap` frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object { class_index: u16 },
    Uninitialized { offset: u16 },
}

impl VerificationType {
    /// Whether a slot of this type holds a heap reference.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            VerificationType::Object { .. }
                | VerificationType::Null
                | VerificationType::UninitializedThis
                | VerificationType::Uninitialized { .. }
        )
    }

    /// Number of 32-bit slots this type occupies.
    #[must_use]
    pub fn slots(&self) -> usize {
        match self {
            VerificationType::Double | VerificationType::Long => 2,
            _ => 1,
        }
    }

    fn from_bytes(bytes: &mut Cursor<Vec<u8>>) -> Result<Self> {
        let tag = bytes.read_u8()?;
        let verification_type = match tag {
            0 => VerificationType::Top,
            1 => VerificationType::Integer,
            2 => VerificationType::Float,
            3 => VerificationType::Double,
            4 => VerificationType::Long,
            5 => VerificationType::Null,
            6 => VerificationType::UninitializedThis,
            7 => VerificationType::Object {
                class_index: bytes.read_u16::<BigEndian>()?,
            },
            8 => VerificationType::Uninitialized {
                offset: bytes.read_u16::<BigEndian>()?,
            },
            tag => return Err(InvalidVerificationTypeTag(tag)),
        };
        Ok(verification_type)
    }

    fn to_bytes(&self, bytes: &mut Vec<u8>) -> Result<()> {
        match self {
            VerificationType::Top => bytes.write_u8(0)?,
            VerificationType::Integer => bytes.write_u8(1)?,
            VerificationType::Float => bytes.write_u8(2)?,
            VerificationType::Double => bytes.write_u8(3)?,
            VerificationType::Long => bytes.write_u8(4)?,
            VerificationType::Null => bytes.write_u8(5)?,
            VerificationType::UninitializedThis => bytes.write_u8(6)?,
            VerificationType::Object { class_index } => {
                bytes.write_u8(7)?;
                bytes.write_u16::<BigEndian>(*class_index)?;
            }
            VerificationType::Uninitialized { offset } => {
                bytes.write_u8(8)?;
                bytes.write_u16::<BigEndian>(*offset)?;
            }
        }
        Ok(())
    }
}

/// One frame of a CLDC `StackMap` attribute: the full verification state
/// at a basic-block entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackMapFrame {
    pub offset: u16,
    pub locals: Vec<VerificationType>,
    pub stack: Vec<VerificationType>,
}

impl StackMapFrame {
    fn from_bytes(bytes: &mut Cursor<Vec<u8>>) -> Result<Self> {
        let offset = bytes.read_u16::<BigEndian>()?;
        let locals_count = bytes.read_u16::<BigEndian>()?;
        let mut locals = Vec::with_capacity(locals_count as usize);
        for _ in 0..locals_count {
            locals.push(VerificationType::from_bytes(bytes)?);
        }
        let stack_count = bytes.read_u16::<BigEndian>()?;
        let mut stack = Vec::with_capacity(stack_count as usize);
        for _ in 0..stack_count {
            stack.push(VerificationType::from_bytes(bytes)?);
        }
        Ok(StackMapFrame {
            offset,
            locals,
            stack,
        })
    }

    fn to_bytes(&self, bytes: &mut Vec<u8>) -> Result<()> {
        bytes.write_u16::<BigEndian>(self.offset)?;
        bytes.write_u16::<BigEndian>(u16::try_from(self.locals.len())?)?;
        for local in &self.locals {
            local.to_bytes(bytes)?;
        }
        bytes.write_u16::<BigEndian>(u16::try_from(self.stack.len())?)?;
        for entry in &self.stack {
            entry.to_bytes(bytes)?;
        }
        Ok(())
    }
}

/// Attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum Attribute {
    ConstantValue {
        name_index: u16,
        constant_value_index: u16,
    },
    Code {
        name_index: u16,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        exception_table: Vec<ExceptionTableEntry>,
        attributes: Vec<Attribute>,
    },
    Exceptions {
        name_index: u16,
        exception_indexes: Vec<u16>,
    },
    StackMap {
        name_index: u16,
        frames: Vec<StackMapFrame>,
    },
    /// Any attribute the VM does not interpret, kept verbatim.
    Unknown {
        name_index: u16,
        info: Vec<u8>,
    },
}

impl Attribute {
    /// Deserialize an attribute from bytes, using the constant pool to
    /// recognise the attribute name.
    ///
    /// Rejects code attributes containing opcodes from the reserved
    /// internal range (0xCB-0xDF); those never appear in valid
    /// classfiles on disk and indicate corruption.
    ///
    /// # Errors
    /// Returns an error if the bytes do not represent a valid attribute.
    pub fn from_bytes(constant_pool: &ConstantPool, bytes: &mut Cursor<Vec<u8>>) -> Result<Attribute> {
        let name_index = bytes.read_u16::<BigEndian>()?;
        let length = bytes.read_u32::<BigEndian>()? as usize;
        let name = constant_pool.try_get_utf8(name_index).unwrap_or_default();

        let attribute = match name {
            "ConstantValue" => Attribute::ConstantValue {
                name_index,
                constant_value_index: bytes.read_u16::<BigEndian>()?,
            },
            "Code" => {
                let max_stack = bytes.read_u16::<BigEndian>()?;
                let max_locals = bytes.read_u16::<BigEndian>()?;
                let code_length = bytes.read_u32::<BigEndian>()? as usize;
                let mut code = vec![0u8; code_length];
                bytes.read_exact(&mut code)?;
                check_no_reserved_opcodes(&code)?;

                let exception_count = bytes.read_u16::<BigEndian>()?;
                let mut exception_table = Vec::with_capacity(exception_count as usize);
                for _ in 0..exception_count {
                    exception_table.push(ExceptionTableEntry::from_bytes(bytes)?);
                }

                let attribute_count = bytes.read_u16::<BigEndian>()?;
                let mut attributes = Vec::with_capacity(attribute_count as usize);
                for _ in 0..attribute_count {
                    attributes.push(Attribute::from_bytes(constant_pool, bytes)?);
                }

                Attribute::Code {
                    name_index,
                    max_stack,
                    max_locals,
                    code,
                    exception_table,
                    attributes,
                }
            }
            "Exceptions" => {
                let count = bytes.read_u16::<BigEndian>()?;
                let mut exception_indexes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    exception_indexes.push(bytes.read_u16::<BigEndian>()?);
                }
                Attribute::Exceptions {
                    name_index,
                    exception_indexes,
                }
            }
            "StackMap" => {
                let count = bytes.read_u16::<BigEndian>()?;
                let mut frames = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    frames.push(StackMapFrame::from_bytes(bytes)?);
                }
                Attribute::StackMap { name_index, frames }
            }
            _ => {
                let mut info = vec![0u8; length];
                bytes.read_exact(&mut info)?;
                Attribute::Unknown { name_index, info }
            }
        };
        Ok(attribute)
    }

    /// Serialize the attribute to bytes.
    ///
    /// # Errors
    /// If any contained table overflows its classfile count field.
    pub fn to_bytes(&self, bytes: &mut Vec<u8>) -> Result<()> {
        let (name_index, body) = match self {
            Attribute::ConstantValue {
                name_index,
                constant_value_index,
            } => {
                let mut body = Vec::new();
                body.write_u16::<BigEndian>(*constant_value_index)?;
                (*name_index, body)
            }
            Attribute::Code {
                name_index,
                max_stack,
                max_locals,
                code,
                exception_table,
                attributes,
            } => {
                let mut body = Vec::new();
                body.write_u16::<BigEndian>(*max_stack)?;
                body.write_u16::<BigEndian>(*max_locals)?;
                body.write_u32::<BigEndian>(u32::try_from(code.len()).map_err(|_| {
                    crate::Error::IoError("code attribute too large".to_string())
                })?)?;
                body.extend_from_slice(code);
                body.write_u16::<BigEndian>(u16::try_from(exception_table.len())?)?;
                for entry in exception_table {
                    entry.to_bytes(&mut body)?;
                }
                body.write_u16::<BigEndian>(u16::try_from(attributes.len())?)?;
                for attribute in attributes {
                    attribute.to_bytes(&mut body)?;
                }
                (*name_index, body)
            }
            Attribute::Exceptions {
                name_index,
                exception_indexes,
            } => {
                let mut body = Vec::new();
                body.write_u16::<BigEndian>(u16::try_from(exception_indexes.len())?)?;
                for index in exception_indexes {
                    body.write_u16::<BigEndian>(*index)?;
                }
                (*name_index, body)
            }
            Attribute::StackMap { name_index, frames } => {
                let mut body = Vec::new();
                body.write_u16::<BigEndian>(u16::try_from(frames.len())?)?;
                for frame in frames {
                    frame.to_bytes(&mut body)?;
                }
                (*name_index, body)
            }
            Attribute::Unknown { name_index, info } => (*name_index, info.clone()),
        };

        bytes.write_u16::<BigEndian>(name_index)?;
        bytes.write_u32::<BigEndian>(u32::try_from(body.len()).map_err(|_| {
            crate::Error::IoError("attribute too large".to_string())
        })?)?;
        bytes.extend_from_slice(&body);
        Ok(())
    }
}

/// Walk a code array opcode by opcode, rejecting reserved internal
/// opcodes. Operand lengths come from the shared bytecode tables;
/// variable-length instructions (switches, wide) are skipped structurally.
fn check_no_reserved_opcodes(code: &[u8]) -> Result<()> {
    let mut offset = 0;
    while offset < code.len() {
        let opcode = code[offset];
        if bytecode::is_reserved(opcode) {
            return Err(ReservedOpcode { opcode, offset });
        }
        offset += bytecode::instruction_length(code, offset);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode;

    fn code_pool() -> Result<(ConstantPool, u16)> {
        let mut constant_pool = ConstantPool::new();
        let code_name = constant_pool.add_utf8("Code")?;
        Ok((constant_pool, code_name))
    }

    #[test]
    fn test_code_round_trip() -> Result<()> {
        let (constant_pool, name_index) = code_pool()?;
        let attribute = Attribute::Code {
            name_index,
            max_stack: 2,
            max_locals: 1,
            code: vec![opcode::ICONST_0, opcode::IRETURN],
            exception_table: vec![ExceptionTableEntry {
                start_pc: 0,
                end_pc: 2,
                handler_pc: 2,
                catch_type: 0,
            }],
            attributes: vec![],
        };
        let mut bytes = Vec::new();
        attribute.to_bytes(&mut bytes)?;
        let mut cursor = Cursor::new(bytes);
        assert_eq!(Attribute::from_bytes(&constant_pool, &mut cursor)?, attribute);
        Ok(())
    }

    #[test]
    fn test_reserved_opcode_rejected() -> Result<()> {
        let (constant_pool, name_index) = code_pool()?;
        let attribute = Attribute::Code {
            name_index,
            max_stack: 1,
            max_locals: 0,
            code: vec![0xDA, 0x00, 0x01], // NEW_FAST must never be on disk
            exception_table: vec![],
            attributes: vec![],
        };
        let mut bytes = Vec::new();
        attribute.to_bytes(&mut bytes)?;
        let mut cursor = Cursor::new(bytes);
        let result = Attribute::from_bytes(&constant_pool, &mut cursor);
        assert_eq!(
            result,
            Err(ReservedOpcode {
                opcode: 0xDA,
                offset: 0
            })
        );
        Ok(())
    }

    #[test]
    fn test_stack_map_round_trip() -> Result<()> {
        let mut constant_pool = ConstantPool::new();
        let name_index = constant_pool.add_utf8("StackMap")?;
        let class_index = constant_pool.add_class("java/lang/Object")?;
        let attribute = Attribute::StackMap {
            name_index,
            frames: vec![StackMapFrame {
                offset: 8,
                locals: vec![
                    VerificationType::Object { class_index },
                    VerificationType::Integer,
                    VerificationType::Long,
                ],
                stack: vec![VerificationType::Null],
            }],
        };
        let mut bytes = Vec::new();
        attribute.to_bytes(&mut bytes)?;
        let mut cursor = Cursor::new(bytes);
        assert_eq!(Attribute::from_bytes(&constant_pool, &mut cursor)?, attribute);
        Ok(())
    }

    #[test]
    fn test_unknown_preserved() -> Result<()> {
        let mut constant_pool = ConstantPool::new();
        let name_index = constant_pool.add_utf8("SourceFile")?;
        let attribute = Attribute::Unknown {
            name_index,
            info: vec![0x00, 0x07],
        };
        let mut bytes = Vec::new();
        attribute.to_bytes(&mut bytes)?;
        let mut cursor = Cursor::new(bytes);
        assert_eq!(Attribute::from_bytes(&constant_pool, &mut cursor)?, attribute);
        Ok(())
    }
}
