//! Error types for JAR reading and inflation.

/// A specialized Result type for JAR operations.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur while reading a JAR archive or inflating an
/// entry.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The end-of-central-directory record could not be located
    #[error("Not a zip archive: no end-of-central-directory record")]
    MissingEndRecord,
    /// The archive directory is inconsistent with the file contents
    #[error("Corrupt zip archive: {0}")]
    CorruptArchive(String),
    /// The named entry does not exist in the archive
    #[error("Entry not found: {0}")]
    EntryNotFound(String),
    /// The entry uses an unsupported compression method
    #[error("Unsupported compression method {0}")]
    UnsupportedMethod(u16),
    /// The entry is encrypted
    #[error("Encrypted entries are not supported")]
    EncryptedEntry,
    /// The inflated data does not match the stored CRC-32
    #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },
    /// The compressed stream is malformed
    #[error("Invalid compressed data: {0}")]
    InvalidData(String),
    /// The compressed stream ended prematurely
    #[error("Unexpected end of compressed data")]
    UnexpectedEof,
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
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
    fn test_crc_mismatch_display() {
        let error = Error::CrcMismatch {
            stored: 0xDEAD_BEEF,
            computed: 0x0BAD_F00D,
        };
        assert_eq!(
            error.to_string(),
            "CRC mismatch: stored 0xdeadbeef, computed 0x0badf00d"
        );
    }
}
