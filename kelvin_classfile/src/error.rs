//! Error types for the Kelvin classfile parser.

use std::num::TryFromIntError;
use std::string::FromUtf8Error;

/// A specialized Result type for classfile operations.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur when reading, writing or checking classfiles.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// Invalid array type code in a `newarray` operand
    #[error("Invalid array type code {0}")]
    InvalidArrayTypeCode(u8),
    /// Invalid base type code in a descriptor
    #[error("Invalid base type code {0}")]
    InvalidBaseTypeCode(char),
    /// Invalid constant pool index
    #[error("Invalid constant pool index {0}")]
    InvalidConstantPoolIndex(u16),
    /// Invalid constant pool index type
    #[error("Invalid constant pool index type {0}")]
    InvalidConstantPoolIndexType(u16),
    /// Invalid constant tag
    #[error("Invalid constant tag: {0}")]
    InvalidConstantTag(u8),
    /// Invalid field type descriptor
    #[error("Invalid field type descriptor {0}")]
    InvalidFieldTypeDescriptor(String),
    /// Invalid magic number when reading a class file
    #[error("Invalid magic number: {0}")]
    InvalidMagicNumber(u32),
    /// An error occurred while parsing a method descriptor
    #[error("Invalid method descriptor: {0}")]
    InvalidMethodDescriptor(String),
    /// Invalid stack map verification type tag
    #[error("Invalid verification type tag: {0}")]
    InvalidVerificationTypeTag(u8),
    /// Classfile version outside the supported 45.3 - 46.0 window
    #[error("Unsupported version: major={major}; minor={minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    /// A reserved internal opcode (0xCB-0xDF) appeared in a code attribute
    /// on disk, which indicates a corrupt or hostile classfile
    #[error("Reserved opcode {opcode:#04x} at offset {offset} in code attribute")]
    ReservedOpcode { opcode: u8, offset: usize },
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
    /// Error when attempting to create a UTF-8 string from bytes
    #[error("Invalid UTF-8 sequence: {0}")]
    FromUtf8Error(String),
    /// Error when attempting to convert a numeric value to a different type
    #[error(transparent)]
    TryFromIntError(#[from] TryFromIntError),
}

impl From<FromUtf8Error> for Error {
    fn from(error: FromUtf8Error) -> Self {
        Error::FromUtf8Error(error.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IoError(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_utf8_error() {
        let invalid_utf8: Vec<u8> = vec![0, 159, 146, 150];
        let utf8_error = String::from_utf8(invalid_utf8).expect_err("expected FromUtf8Error");
        let error = Error::from(utf8_error);
        assert!(matches!(error, Error::FromUtf8Error(_)));
    }

    #[test]
    fn test_io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error);
        assert_eq!(error.to_string(), "IO error: file not found");
    }
}
