//! Archive round-trip behaviour over real files on disk.

use kelvin_jar::{JarFile, Result};
use std::io::Write;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// A classfile-shaped payload: magic, version 45.3, then filler that
/// compresses well enough to force a DEFLATED entry.
fn class_bytes() -> Vec<u8> {
    let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x03, 0x00, 0x2D];
    for i in 0..2000u16 {
        bytes.extend_from_slice(&i.to_be_bytes());
        bytes.extend_from_slice(b"constant pool filler ");
    }
    bytes
}

#[test_log::test]
fn test_deflated_class_round_trip() -> Result<()> {
    let payload = class_bytes();
    let temp_dir = tempfile::tempdir()?;
    let jar_path = temp_dir.path().join("hello.jar");

    let mut writer = ZipWriter::new(std::fs::File::create(&jar_path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file("Hello.class", options).expect("start file");
    writer.write_all(&payload)?;
    writer.finish().expect("finish archive");

    let jar = JarFile::open(&jar_path)?;
    let entry = jar.find_entry("Hello.class")?;
    assert!(entry.compressed_size < payload.len());

    let inflated = jar.read_entry("Hello.class")?;
    assert_eq!(inflated.len(), payload.len());
    assert_eq!(&inflated[..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
    assert_eq!(inflated, payload);
    Ok(())
}

#[test_log::test]
fn test_entry_metadata_matches_directory() -> Result<()> {
    let payload = class_bytes();
    let temp_dir = tempfile::tempdir()?;
    let jar_path = temp_dir.path().join("meta.jar");

    let mut writer = ZipWriter::new(std::fs::File::create(&jar_path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file("A.class", options).expect("start file");
    writer.write_all(&payload)?;
    writer.start_file("B.class", options).expect("start file");
    writer.write_all(&payload[..100])?;
    writer.finish().expect("finish archive");

    let jar = JarFile::open(&jar_path)?;
    assert_eq!(jar.len(), 2);
    let entry = jar.find_entry("B.class")?;
    assert_eq!(entry.uncompressed_size, 100);
    assert_eq!(jar.read_entry("B.class")?, &payload[..100]);
    Ok(())
}
