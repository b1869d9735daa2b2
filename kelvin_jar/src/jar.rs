//! JAR (zip archive) reading.
//!
//! Opening an archive locates the end-of-central-directory record by
//! scanning backward from the end of the file (bounded by the maximum
//! 65,535-byte comment), validates it against the first local header,
//! and caches the central directory offset. Entries are then found by a
//! linear walk of central-directory headers.

use crate::crc32::crc32;
use crate::error::Error::{
    CorruptArchive, CrcMismatch, EncryptedEntry, EntryNotFound, MissingEndRecord,
    UnsupportedMethod,
};
use crate::error::Result;
use crate::inflate::{inflate, SliceSource};
use std::path::Path;
use tracing::debug;

const LOC_SIG: u32 = 0x0403_4B50; // "PK\x03\x04"
const CEN_SIG: u32 = 0x0201_4B50; // "PK\x01\x02"
const END_SIG: u32 = 0x0605_4B50; // "PK\x05\x06"

const END_HEADER_SIZE: usize = 22;
const CEN_HEADER_SIZE: usize = 46;
const LOC_HEADER_SIZE: usize = 30;
const MAX_COMMENT: usize = 0xFFFF;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

const FLAG_ENCRYPTED: u16 = 0x0001;

/// Metadata for one archive entry, read from its central header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JarEntry {
    pub name: String,
    pub method: u16,
    pub compressed_size: usize,
    pub uncompressed_size: usize,
    pub crc: u32,
    pub local_header_offset: usize,
}

/// An opened JAR archive.
///
/// The archive bytes are held in memory; the central directory is walked
/// lazily on each lookup, matching the loader's access pattern of a
/// handful of reads per archive.
#[derive(Debug)]
pub struct JarFile {
    name: String,
    data: Vec<u8>,
    /// Offset of the first central-directory header.
    central_offset: usize,
    /// Number of central-directory entries.
    entry_count: usize,
}

impl JarFile {
    /// Open a JAR from a file path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not a zip
    /// archive.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        Self::from_bytes(path.to_string_lossy(), data)
    }

    /// Open a JAR over in-memory archive bytes.
    ///
    /// # Errors
    /// Returns `MissingEndRecord` if no valid end-of-central-directory
    /// record exists, or `CorruptArchive` if the directory is
    /// inconsistent.
    pub fn from_bytes<S: AsRef<str>>(name: S, data: Vec<u8>) -> Result<Self> {
        let (central_offset, entry_count) = locate_central_directory(&data)?;
        debug!(
            "opened jar {}: {entry_count} entries, central directory at {central_offset:#x}",
            name.as_ref()
        );
        Ok(JarFile {
            name: name.as_ref().to_string(),
            data,
            central_offset,
            entry_count,
        })
    }

    /// The archive's name (usually its path).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of entries in the archive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entry_count
    }

    /// Whether the archive has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Find an entry by exact name with a linear central-directory walk.
    ///
    /// # Errors
    /// Returns `EntryNotFound` if no entry matches.
    pub fn find_entry(&self, name: &str) -> Result<JarEntry> {
        let mut offset = self.central_offset;
        for _ in 0..self.entry_count {
            if read_u32(&self.data, offset)? != CEN_SIG {
                return Err(CorruptArchive("bad central header signature".to_string()));
            }
            let name_length = usize::from(read_u16(&self.data, offset + 28)?);
            let extra_length = usize::from(read_u16(&self.data, offset + 30)?);
            let comment_length = usize::from(read_u16(&self.data, offset + 32)?);
            let name_start = offset + CEN_HEADER_SIZE;
            let entry_name = self
                .data
                .get(name_start..name_start + name_length)
                .ok_or_else(|| CorruptArchive("truncated central header".to_string()))?;

            if entry_name == name.as_bytes() {
                return Ok(JarEntry {
                    name: name.to_string(),
                    method: read_u16(&self.data, offset + 10)?,
                    compressed_size: read_u32(&self.data, offset + 20)? as usize,
                    uncompressed_size: read_u32(&self.data, offset + 24)? as usize,
                    crc: read_u32(&self.data, offset + 16)?,
                    local_header_offset: read_u32(&self.data, offset + 42)? as usize,
                });
            }
            offset = name_start + name_length + extra_length + comment_length;
        }
        Err(EntryNotFound(name.to_string()))
    }

    /// Read and decompress an entry, verifying length and CRC-32.
    ///
    /// # Errors
    /// Returns an error on a missing entry, unsupported or encrypted
    /// compression, malformed data, or a CRC mismatch.
    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        let entry = self.find_entry(name)?;
        let offset = entry.local_header_offset;
        if read_u32(&self.data, offset)? != LOC_SIG {
            return Err(CorruptArchive("bad local header signature".to_string()));
        }
        let flags = read_u16(&self.data, offset + 6)?;
        if flags & FLAG_ENCRYPTED != 0 {
            return Err(EncryptedEntry);
        }
        // Name and extra lengths in the local header may differ from the
        // central copy; the local ones position the data.
        let name_length = usize::from(read_u16(&self.data, offset + 26)?);
        let extra_length = usize::from(read_u16(&self.data, offset + 28)?);
        let data_start = offset + LOC_HEADER_SIZE + name_length + extra_length;
        let compressed = self
            .data
            .get(data_start..data_start + entry.compressed_size)
            .ok_or_else(|| CorruptArchive("truncated entry data".to_string()))?;

        let inflated = match entry.method {
            METHOD_STORED => {
                if entry.compressed_size != entry.uncompressed_size {
                    return Err(CorruptArchive("stored entry size mismatch".to_string()));
                }
                compressed.to_vec()
            }
            METHOD_DEFLATED => {
                // SliceSource supplies the padding bytes the inflater's
                // bit buffer is allowed to read past the block end.
                let mut source = SliceSource::new(compressed);
                inflate(&mut source, compressed.len(), entry.uncompressed_size)?
            }
            method => return Err(UnsupportedMethod(method)),
        };

        let computed = crc32(&inflated);
        if computed != entry.crc {
            return Err(CrcMismatch {
                stored: entry.crc,
                computed,
            });
        }
        Ok(inflated)
    }
}

/// Locate the end-of-central-directory record and return the central
/// directory offset and entry count.
fn locate_central_directory(data: &[u8]) -> Result<(usize, usize)> {
    if data.len() < END_HEADER_SIZE {
        return Err(MissingEndRecord);
    }

    let scan_limit = data.len().saturating_sub(END_HEADER_SIZE + MAX_COMMENT);
    let mut position = data.len() - END_HEADER_SIZE;
    loop {
        if read_u32(data, position)? == END_SIG {
            let comment_length = usize::from(read_u16(data, position + 20)?);
            // A real end record's comment runs exactly to end of file.
            if position + END_HEADER_SIZE + comment_length == data.len() {
                let entry_count = usize::from(read_u16(data, position + 10)?);
                let central_offset = read_u32(data, position + 16)? as usize;
                validate_directory(data, central_offset, entry_count)?;
                return Ok((central_offset, entry_count));
            }
        }
        if position == scan_limit {
            return Err(MissingEndRecord);
        }
        position -= 1;
    }
}

/// Cross-check the directory offset by reading the first headers it
/// implies; a signature mismatch means the end record was a decoy (for
/// example inside the archive comment).
fn validate_directory(data: &[u8], central_offset: usize, entry_count: usize) -> Result<()> {
    if entry_count == 0 {
        return Ok(());
    }
    if read_u32(data, central_offset)? != CEN_SIG {
        return Err(CorruptArchive("central directory offset invalid".to_string()));
    }
    let local_offset = read_u32(data, central_offset + 42)? as usize;
    if read_u32(data, local_offset)? != LOC_SIG {
        return Err(CorruptArchive("first local header invalid".to_string()));
    }
    Ok(())
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    let bytes = data
        .get(offset..offset + 2)
        .ok_or_else(|| CorruptArchive("read past end of archive".to_string()))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or_else(|| CorruptArchive("read past end of archive".to_string()))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::{CompressionMethod, ZipWriter};

    fn build_jar(entries: &[(&str, &[u8], CompressionMethod)], comment: &str) -> Vec<u8> {
        let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, data, method) in entries {
            let options = FileOptions::default().compression_method(*method);
            writer.start_file(*name, options).expect("start file");
            writer.write_all(data).expect("write entry");
        }
        writer.set_comment(comment);
        writer
            .finish()
            .expect("finish archive")
            .into_inner()
    }

    #[test_log::test]
    fn test_read_deflated_entry() -> Result<()> {
        let payload = b"four score and seven bytecodes ago".repeat(20);
        let archive = build_jar(
            &[("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n", CompressionMethod::Deflated),
              ("Hello.class", &payload, CompressionMethod::Deflated)],
            "",
        );
        let jar = JarFile::from_bytes("test.jar", archive)?;
        assert_eq!(jar.len(), 2);
        assert_eq!(jar.read_entry("Hello.class")?, payload);
        Ok(())
    }

    #[test_log::test]
    fn test_read_stored_entry() -> Result<()> {
        let archive = build_jar(&[("a.txt", b"stored bytes", CompressionMethod::Stored)], "");
        let jar = JarFile::from_bytes("test.jar", archive)?;
        assert_eq!(jar.read_entry("a.txt")?, b"stored bytes");
        Ok(())
    }

    #[test_log::test]
    fn test_entry_not_found() -> Result<()> {
        let archive = build_jar(&[("a.txt", b"x", CompressionMethod::Stored)], "");
        let jar = JarFile::from_bytes("test.jar", archive)?;
        assert_eq!(
            jar.read_entry("missing.txt"),
            Err(EntryNotFound("missing.txt".to_string()))
        );
        Ok(())
    }

    #[test_log::test]
    fn test_comment_up_to_maximum() -> Result<()> {
        let comment = "c".repeat(MAX_COMMENT);
        let archive = build_jar(&[("a.txt", b"hidden", CompressionMethod::Stored)], &comment);
        let jar = JarFile::from_bytes("test.jar", archive)?;
        assert_eq!(jar.read_entry("a.txt")?, b"hidden");
        Ok(())
    }

    #[test_log::test]
    fn test_decoy_end_record_in_comment() -> Result<()> {
        // An end-of-central-directory signature inside the comment must
        // not be mistaken for the real record.
        let mut comment_bytes = vec![b'x'; 64];
        comment_bytes[10..14].copy_from_slice(&END_SIG.to_le_bytes());
        let comment = String::from_utf8(comment_bytes).expect("ascii comment");
        let archive = build_jar(&[("a.txt", b"real", CompressionMethod::Stored)], &comment);
        let jar = JarFile::from_bytes("test.jar", archive)?;
        assert_eq!(jar.read_entry("a.txt")?, b"real");
        Ok(())
    }

    #[test_log::test]
    fn test_not_an_archive() {
        let result = JarFile::from_bytes("bogus", b"not a zip file at all".to_vec());
        assert_eq!(result.err(), Some(MissingEndRecord));
    }

    #[test_log::test]
    fn test_crc_mismatch_detected() -> Result<()> {
        let payload = b"corrupt me".repeat(10);
        let mut archive = build_jar(&[("a.bin", &payload, CompressionMethod::Stored)], "");
        // Flip a byte inside the stored entry data.
        let position = archive
            .windows(4)
            .position(|window| window == b"corr")
            .expect("payload present");
        archive[position] ^= 0xFF;
        let jar = JarFile::from_bytes("test.jar", archive)?;
        assert!(matches!(
            jar.read_entry("a.bin"),
            Err(Error::CrcMismatch { .. })
        ));
        Ok(())
    }
}
