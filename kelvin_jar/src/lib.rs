//! # Kelvin JAR
//!
//! A small JAR (zip) reader sized for the Kelvin VM's class loader. The
//! archive directory is located by scanning backward for the
//! end-of-central-directory record (tolerating the maximum 65,535-byte
//! archive comment), entries are found by a linear central-directory
//! walk, and entry data is decompressed with the crate's own RFC 1951
//! inflater and verified against the stored CRC-32.
//!
//! Only `STORED` and `DEFLATED` entries are supported; encrypted entries
//! are rejected.

mod crc32;
mod error;
mod inflate;
mod jar;

pub use crc32::crc32;
pub use error::{Error, Result};
pub use inflate::{inflate, ByteSource, SliceSource, INFLATER_EXTRA_BYTES};
pub use jar::{JarEntry, JarFile};
