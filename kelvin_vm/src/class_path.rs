//! The class path: an ordered list of directories and JAR archives
//! searched for classfile bytes. First match wins.

use crate::error::Error::ClassNotFound;
use crate::error::Result;
use kelvin_jar::JarFile;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One class path entry.
#[derive(Debug)]
enum Entry {
    Directory(PathBuf),
    Jar(JarFile),
}

/// An ordered class path.
#[derive(Debug, Default)]
pub struct ClassPath {
    entries: Vec<Entry>,
}

impl ClassPath {
    #[must_use]
    pub fn new() -> Self {
        ClassPath::default()
    }

    /// Parse a platform-separated class path string; entries ending in
    /// `.jar` or `.zip` open as archives, everything else is a
    /// directory. Unreadable archives are skipped with a debug note,
    /// matching "first usable match wins".
    #[must_use]
    pub fn from_string(path: &str) -> Self {
        let mut class_path = ClassPath::new();
        for part in std::env::split_paths(path) {
            if part.as_os_str().is_empty() {
                continue;
            }
            class_path.push(&part);
        }
        class_path
    }

    /// Append one entry.
    pub fn push(&mut self, path: &Path) {
        let is_archive = path
            .extension()
            .is_some_and(|extension| extension == "jar" || extension == "zip");
        if is_archive {
            match JarFile::open(path) {
                Ok(jar) => self.entries.push(Entry::Jar(jar)),
                Err(error) => debug!("skipping unreadable archive {}: {error}", path.display()),
            }
        } else {
            self.entries.push(Entry::Directory(path.to_path_buf()));
        }
    }

    /// Append an already-open archive (used by tests and embedders).
    pub fn push_jar(&mut self, jar: JarFile) {
        self.entries.push(Entry::Jar(jar));
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the class path is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Open a class's bytes by its internal name (`java/lang/Object`).
    ///
    /// # Errors
    /// Returns `ClassNotFound` if no entry supplies the class.
    pub fn open_class(&self, name: &str) -> Result<Vec<u8>> {
        let file_name = format!("{name}.class");
        for entry in &self.entries {
            match entry {
                Entry::Directory(directory) => {
                    let path = directory.join(&file_name);
                    if path.is_file() {
                        return Ok(std::fs::read(path)?);
                    }
                }
                Entry::Jar(jar) => {
                    if let Ok(bytes) = jar.read_entry(&file_name) {
                        return Ok(bytes);
                    }
                }
            }
        }
        Err(ClassNotFound(name.replace('/', ".")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_directory_entry() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let class_path_dir = temp_dir.path().join("classes");
        std::fs::create_dir_all(class_path_dir.join("pkg"))?;
        std::fs::write(class_path_dir.join("pkg/Thing.class"), b"not real")?;

        let mut class_path = ClassPath::new();
        class_path.push(&class_path_dir);
        assert_eq!(class_path.open_class("pkg/Thing")?, b"not real");
        assert!(matches!(
            class_path.open_class("pkg/Missing"),
            Err(ClassNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_jar_entry_and_ordering() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let jar_path = temp_dir.path().join("classes.jar");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&jar_path)?);
        writer
            .start_file("A.class", zip::write::FileOptions::default())
            .expect("start file");
        writer.write_all(b"from jar")?;
        writer.finish().expect("finish archive");

        // A directory earlier on the path shadows the jar.
        let dir = temp_dir.path().join("dir");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("A.class"), b"from dir")?;

        let mut class_path = ClassPath::new();
        class_path.push(&dir);
        class_path.push(&jar_path);
        assert_eq!(class_path.open_class("A")?, b"from dir");
        Ok(())
    }
}
