use crate::error::Result;
use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

bitflags! {
    /// Class access and property flags.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ClassAccessFlags: u16 {
        /// Declared public; may be accessed from outside its package.
        const PUBLIC = 0x0001;
        /// Declared final; no subclasses allowed.
        const FINAL = 0x0010;
        /// Treat superclass methods specially when invoked by the
        /// invokespecial instruction.
        const SUPER = 0x0020;
        /// Is an interface, not a class.
        const INTERFACE = 0x0200;
        /// Declared abstract; must not be instantiated.
        const ABSTRACT = 0x0400;
    }
}

impl Default for ClassAccessFlags {
    fn default() -> ClassAccessFlags {
        ClassAccessFlags::empty()
    }
}

impl ClassAccessFlags {
    /// Deserialize the flags from bytes; unknown bits are dropped.
    ///
    /// # Errors
    /// Should not occur; reserved for future use.
    pub fn from_bytes(bytes: &mut Cursor<Vec<u8>>) -> Result<ClassAccessFlags> {
        let access_flags = bytes.read_u16::<BigEndian>()?;
        Ok(ClassAccessFlags::from_bits_truncate(access_flags))
    }

    /// Serialize the flags to bytes.
    ///
    /// # Errors
    /// Should not occur; reserved for future use.
    pub fn to_bytes(&self, bytes: &mut Vec<u8>) -> Result<()> {
        bytes.write_u16::<BigEndian>(self.bits())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() -> Result<()> {
        let flags = ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER;
        let mut bytes = Vec::new();
        flags.to_bytes(&mut bytes)?;
        assert_eq!(bytes, vec![0x00, 0x21]);
        let mut cursor = Cursor::new(bytes);
        assert_eq!(ClassAccessFlags::from_bytes(&mut cursor)?, flags);
        Ok(())
    }

    #[test]
    fn test_unknown_bits_dropped() -> Result<()> {
        let mut cursor = Cursor::new(vec![0x80, 0x01]);
        let flags = ClassAccessFlags::from_bytes(&mut cursor)?;
        assert_eq!(flags, ClassAccessFlags::PUBLIC);
        Ok(())
    }
}
