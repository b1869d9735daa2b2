//! Error handling for the Kelvin VM.
//!
//! The original expressed exception delivery as non-local jumps; here a
//! thrown Java object travels as the distinguished [`Error::JavaThrow`]
//! variant through ordinary `Result` returns until the frame unwinder
//! consumes it. Everything else is either a load-time failure that gets
//! converted into a Java linkage error at the triggering instruction,
//! or a fatal condition that terminates the VM with exit code 127.

use kelvin_gc::Ptr;

/// A specialized Result type for VM operations.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur while loading classes and executing bytecode.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A Java throwable in flight; consumed by the frame unwinder.
    #[error("Java throwable in flight")]
    JavaThrow(Ptr),
    /// An uncaught throwable terminated the program (exit code 128).
    #[error("Uncaught exception: {class_name}")]
    UncaughtException { class_name: String },
    /// A class could not be located on the class path
    #[error("Class not found: {0}")]
    ClassNotFound(String),
    /// A classfile failed to parse or violated a format constraint
    #[error("Class format error in {context}: {message}")]
    ClassFormat { context: String, message: String },
    /// Fatal internal error (exit code 127)
    #[error("Fatal: {0}")]
    Fatal(String),
    /// Internal invariant violation; treated as fatal
    #[error("Internal error: {0}")]
    Internal(String),
    /// IO error reading the class path
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IoError(error.to_string())
    }
}

impl From<kelvin_gc::Error> for Error {
    fn from(error: kelvin_gc::Error) -> Self {
        // Heap corruption and permanent-space exhaustion have no
        // recovery path.
        Error::Fatal(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_errors_are_fatal() {
        let error: Error = kelvin_gc::Error::OutOfPermanentMemory { requested: 4 }.into();
        assert!(matches!(error, Error::Fatal(_)));
    }
}
