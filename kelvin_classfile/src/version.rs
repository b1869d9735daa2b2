use crate::error::Error::UnsupportedVersion;
use crate::error::Result;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;

/// Classfile version.
///
/// Kelvin executes the classfile range emitted by CLDC-era compilers:
/// 45.3 (JDK 1.0.2/1.1) through 46.0 (Java 2). Anything newer is rejected
/// at load time rather than partially interpreted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

const MIN_MAJOR: u16 = 45;
const MIN_MINOR: u16 = 3;
const MAX_MAJOR: u16 = 46;

impl Default for Version {
    fn default() -> Self {
        Version {
            major: MIN_MAJOR,
            minor: MIN_MINOR,
        }
    }
}

impl Version {
    /// Create a version, validating it falls inside the supported window.
    ///
    /// # Errors
    /// Returns `UnsupportedVersion` outside 45.3 - 46.0.
    pub fn new(major: u16, minor: u16) -> Result<Self> {
        let supported = match major {
            MIN_MAJOR => minor >= MIN_MINOR,
            MAX_MAJOR => true,
            _ => false,
        };
        if !supported {
            return Err(UnsupportedVersion { major, minor });
        }
        Ok(Version { major, minor })
    }

    /// Deserialize the version from bytes.
    ///
    /// # Errors
    /// Returns an error if the version is outside the supported window.
    pub fn from_bytes(bytes: &mut Cursor<Vec<u8>>) -> Result<Version> {
        let minor = bytes.read_u16::<BigEndian>()?;
        let major = bytes.read_u16::<BigEndian>()?;
        Version::new(major, minor)
    }

    /// Serialize the version to bytes.
    ///
    /// # Errors
    /// Should not occur; reserved for future use.
    pub fn to_bytes(&self, bytes: &mut Vec<u8>) -> Result<()> {
        bytes.write_u16::<BigEndian>(self.minor)?;
        bytes.write_u16::<BigEndian>(self.major)?;
        Ok(())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_versions() -> Result<()> {
        assert_eq!(Version::new(45, 3)?, Version { major: 45, minor: 3 });
        assert_eq!(Version::new(45, 65535)?.major, 45);
        assert_eq!(Version::new(46, 0)?.major, 46);
        Ok(())
    }

    #[test]
    fn test_unsupported_versions() {
        assert!(matches!(
            Version::new(45, 0),
            Err(UnsupportedVersion { major: 45, minor: 0 })
        ));
        assert!(matches!(Version::new(47, 0), Err(UnsupportedVersion { .. })));
        assert!(matches!(Version::new(52, 0), Err(UnsupportedVersion { .. })));
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let version = Version::new(46, 0)?;
        let mut bytes = Vec::new();
        version.to_bytes(&mut bytes)?;
        assert_eq!(bytes, vec![0x00, 0x00, 0x00, 0x2E]);
        let mut cursor = Cursor::new(bytes);
        assert_eq!(Version::from_bytes(&mut cursor)?, version);
        Ok(())
    }

    #[test]
    fn test_display() -> Result<()> {
        assert_eq!("45.3", Version::new(45, 3)?.to_string());
        Ok(())
    }
}
