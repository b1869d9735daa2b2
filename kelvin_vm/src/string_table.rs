//! The interned UTF-8 string table and compressed signatures.
//!
//! Every class, field, and method name is interned once and addressed
//! by a 16-bit key; equal strings always share a key, so name equality
//! is key equality. Method signatures are compressed into the byte form
//! `(argCount, arg1, ..., ret)` where primitive types keep their
//! descriptor letter and class types use the class name's table key
//! (prefixed with `'L'` when the key's high byte would collide with an
//! ASCII letter), and the compressed bytes are themselves interned.
//! The resulting 32-bit `(name, type)` keys identify members uniquely.
//!
//! Entries are byte strings: stack-map long-form bitmaps are interned
//! here too and need not be valid UTF-8.

use crate::error::Error::Internal;
use crate::error::Result;
use ahash::AHashMap;
use kelvin_classfile::{FieldType, MethodDescriptor};

/// A 16-bit interned-string key. Key 0 is never assigned.
pub type StringKey = u16;

/// A member identity: `name_key << 16 | type_key`.
pub type NameTypeKey = u32;

/// Combine name and type keys into a member identity.
#[must_use]
pub fn name_type_key(name: StringKey, descriptor: StringKey) -> NameTypeKey {
    (u32::from(name) << 16) | u32::from(descriptor)
}

/// The global intern table.
#[derive(Debug)]
pub struct StringTable {
    entries: Vec<Vec<u8>>,
    index: AHashMap<Vec<u8>, StringKey>,
}

impl Default for StringTable {
    fn default() -> Self {
        StringTable::new()
    }
}

impl StringTable {
    #[must_use]
    pub fn new() -> Self {
        StringTable {
            // Key 0 stays unassigned so 0 can mean "no name".
            entries: vec![Vec::new()],
            index: AHashMap::new(),
        }
    }

    /// Intern a byte string and return its key; equal inputs always
    /// return equal keys.
    ///
    /// # Errors
    /// Returns an internal error if the 16-bit key space overflows.
    pub fn intern_bytes(&mut self, bytes: &[u8]) -> Result<StringKey> {
        if let Some(&key) = self.index.get(bytes) {
            return Ok(key);
        }
        let key = u16::try_from(self.entries.len())
            .map_err(|_| Internal("string table overflow".to_string()))?;
        self.entries.push(bytes.to_vec());
        self.index.insert(bytes.to_vec(), key);
        Ok(key)
    }

    /// Intern a UTF-8 string.
    ///
    /// # Errors
    /// Returns an internal error if the 16-bit key space overflows.
    pub fn intern(&mut self, value: &str) -> Result<StringKey> {
        self.intern_bytes(value.as_bytes())
    }

    /// Look up a key's bytes.
    #[must_use]
    pub fn get_bytes(&self, key: StringKey) -> &[u8] {
        self.entries
            .get(key as usize)
            .map_or(&[], Vec::as_slice)
    }

    /// Look up a key's string value (lossy for non-UTF-8 entries such
    /// as interned stack-map bitmaps).
    #[must_use]
    pub fn get(&self, key: StringKey) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.get_bytes(key))
    }

    /// Key for a string that is already interned, if any.
    #[must_use]
    pub fn lookup(&self, value: &str) -> Option<StringKey> {
        self.index.get(value.as_bytes()).copied()
    }

    /// Number of interned entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    /// Whether the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----- compressed signatures ---------------------------------------------

/// Encode one parameter or return type into the compressed form.
fn encode_type(field_type: &FieldType, table: &mut StringTable, out: &mut Vec<u8>) -> Result<()> {
    match field_type {
        FieldType::Base(base_type) => out.push(base_type.code() as u8),
        FieldType::Object(_) | FieldType::Array(_) => {
            // Arrays intern their full descriptor as the class name,
            // the same way array classes are named.
            let name = match field_type {
                FieldType::Object(name) => name.clone(),
                other => other.to_string(),
            };
            let key = table.intern(&name)?;
            let high = (key >> 8) as u8;
            let low = (key & 0xFF) as u8;
            if high.is_ascii_uppercase() {
                // The high byte collides with a primitive letter; an
                // explicit 'L' prefix disambiguates.
                out.push(b'L');
            }
            out.push(high);
            out.push(low);
        }
    }
    Ok(())
}

/// Compress a method descriptor to `(argCount, arg..., ret)` bytes and
/// intern them, returning the signature key.
///
/// # Errors
/// Returns an error on a malformed descriptor or table overflow.
pub fn compress_method_descriptor(
    descriptor: &MethodDescriptor,
    table: &mut StringTable,
) -> Result<StringKey> {
    let mut bytes = Vec::with_capacity(descriptor.parameters.len() * 2 + 2);
    bytes.push(u8::try_from(descriptor.parameters.len()).map_err(|_| {
        Internal("more than 255 method parameters".to_string())
    })?);
    for parameter in &descriptor.parameters {
        encode_type(parameter, table, &mut bytes)?;
    }
    match &descriptor.return_type {
        None => bytes.push(b'V'),
        Some(return_type) => encode_type(return_type, table, &mut bytes)?,
    }
    table.intern_bytes(&bytes)
}

/// Iterate the parameter tags of a compressed signature, reporting for
/// each parameter whether it is a pointer and how many slots it takes.
/// This is what derives a method's entry-point register mask.
pub fn for_each_parameter(
    signature: &[u8],
    mut visit: impl FnMut(bool, usize),
) -> Result<()> {
    let arg_count = *signature
        .first()
        .ok_or_else(|| Internal("empty compressed signature".to_string()))?;
    let mut position = 1;
    for _ in 0..arg_count {
        let tag = *signature
            .get(position)
            .ok_or_else(|| Internal("truncated compressed signature".to_string()))?;
        if tag == b'L' {
            visit(true, 1);
            position += 3;
        } else if tag.is_ascii_uppercase() {
            let slots = if tag == b'J' || tag == b'D' { 2 } else { 1 };
            visit(false, slots);
            position += 1;
        } else {
            visit(true, 1);
            position += 2;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_law() -> Result<()> {
        let mut table = StringTable::new();
        let strings = ["fact", "(I)J", "java/lang/Object", "", "Δελτα"];
        for value in strings {
            let key = table.intern(value)?;
            assert_eq!(table.get(key), value);
        }
        Ok(())
    }

    #[test]
    fn test_equal_strings_share_keys() -> Result<()> {
        let mut table = StringTable::new();
        let first = table.intern("same")?;
        let second = table.intern("same")?;
        let other = table.intern("other")?;
        assert_eq!(first, second);
        assert_ne!(first, other);
        Ok(())
    }

    #[test]
    fn test_name_type_key() {
        assert_eq!(name_type_key(0x1234, 0x5678), 0x1234_5678);
    }

    #[test]
    fn test_compressed_signature_parameters() -> Result<()> {
        let mut table = StringTable::new();
        let descriptor = MethodDescriptor::parse("(IJLjava/lang/String;[BD)V")
            .map_err(|error| Internal(error.to_string()))?;
        let key = compress_method_descriptor(&descriptor, &mut table)?;
        let bytes = table.get_bytes(key).to_vec();
        assert_eq!(bytes[0], 5);

        let mut seen = Vec::new();
        for_each_parameter(&bytes, |is_pointer, slots| seen.push((is_pointer, slots)))?;
        assert_eq!(
            seen,
            vec![(false, 1), (false, 2), (true, 1), (true, 1), (false, 2)]
        );
        Ok(())
    }

    #[test]
    fn test_non_utf8_entry() -> Result<()> {
        let mut table = StringTable::new();
        let bytes = [0x03, 0xFF, 0x80, 0x01];
        let key = table.intern_bytes(&bytes)?;
        assert_eq!(table.get_bytes(key), bytes);
        Ok(())
    }
}
