//! Error handling for the Kelvin heap and garbage collector.

/// Kelvin GC result type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur during heap management and collection.
///
/// Most allocation failure is reported in-band (a null pointer) so the
/// VM can raise `OutOfMemoryError` through its own machinery; the
/// variants here cover conditions that are fatal to the VM.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Permanent-space allocation could not be satisfied even after a
    /// full collection. Fatal: permanent metadata has no failure path.
    #[error("Out of permanent memory: requested {requested} cells")]
    OutOfPermanentMemory { requested: usize },
    /// An allocation request exceeded the maximum encodable object size
    #[error("Object size {requested} exceeds the {maximum}-cell header limit")]
    ObjectTooLarge { requested: usize, maximum: usize },
    /// The debug sweep found a corrupt header or a broken free chain
    #[error("Heap corruption detected: {0}")]
    HeapCorrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let error = Error::OutOfPermanentMemory { requested: 16 };
        assert_eq!(
            error.to_string(),
            "Out of permanent memory: requested 16 cells"
        );
    }
}
