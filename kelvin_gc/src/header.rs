//! Object headers and the heap pointer type.
//!
//! Every heap-resident value begins with a single header word:
//!
//! ```text
//! [  size (24 bits)  |  gc-kind (6 bits) | S | M ]
//! ```
//!
//! `size` is the payload length in cells excluding the header. `S` marks
//! permanent objects, `M` is the collector's mark bit. A heap pointer
//! addresses the first payload cell; the header is at `cell[-1]`.

use std::fmt;

/// One machine word. All heap sizes are in cells.
pub type Cell = u32;

/// A heap pointer: the cell index of an object's first payload cell.
/// Index 0 is reserved, so `Ptr::NULL` is the all-zero value.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Ptr(pub u32);

impl Ptr {
    pub const NULL: Ptr = Ptr(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The cell index of this object's header.
    #[must_use]
    pub fn header_index(self) -> usize {
        self.0 as usize - 1
    }

    /// The cell index of payload cell `offset`.
    #[must_use]
    pub fn index(self, offset: usize) -> usize {
        self.0 as usize + offset
    }
}

impl fmt::Display for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#x}", self.0)
    }
}

/// The collector's closed set of object shapes.
///
/// The kind determines which payload cells hold pointers; all dispatch
/// on it is localised in the collector (`pointer-slot` logic) rather
/// than spread across call sites.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GcKind {
    /// A chunk on the free list. Payload cell 0 links the next chunk.
    Free,
    /// Payload contains no pointers.
    NoPointers,
    /// `[class, mhc, field...]`; pointer fields per the class layout.
    Instance,
    /// `[class, mhc, length, packed element bytes...]`.
    Array,
    /// `[class, mhc, length, element pointer...]`.
    ObjectArray,
    /// Internal pointer vector `[length, pointer...]` (ROM method
    /// tables; treated identically to `PointerList`).
    MethodTable,
    /// Internal pointer vector `[length, pointer...]`.
    PointerList,
    /// A thread stack chunk `[next, size, stack cell...]`; stack cells
    /// are scanned precisely through the VM's stack maps, not here.
    ExecStack,
    /// A VM thread record; see [`crate::thread_layout`].
    Thread,
    /// An inflated lock record; see [`crate::monitor_layout`].
    Monitor,
    /// `[length, finalizer, weak pointer...]`; referents are weak.
    WeakPointerList,
    /// `[class, mhc, referent]`; the referent is weak.
    WeakReference,
}

impl GcKind {
    /// Decode a kind from its 6-bit header field.
    #[must_use]
    pub fn from_bits(bits: u32) -> Option<GcKind> {
        let kind = match bits {
            0 => GcKind::Free,
            1 => GcKind::NoPointers,
            2 => GcKind::Instance,
            3 => GcKind::Array,
            4 => GcKind::ObjectArray,
            5 => GcKind::MethodTable,
            6 => GcKind::PointerList,
            7 => GcKind::ExecStack,
            8 => GcKind::Thread,
            9 => GcKind::Monitor,
            10 => GcKind::WeakPointerList,
            11 => GcKind::WeakReference,
            _ => return None,
        };
        Some(kind)
    }

    #[must_use]
    pub fn to_bits(self) -> u32 {
        match self {
            GcKind::Free => 0,
            GcKind::NoPointers => 1,
            GcKind::Instance => 2,
            GcKind::Array => 3,
            GcKind::ObjectArray => 4,
            GcKind::MethodTable => 5,
            GcKind::PointerList => 6,
            GcKind::ExecStack => 7,
            GcKind::Thread => 8,
            GcKind::Monitor => 9,
            GcKind::WeakPointerList => 10,
            GcKind::WeakReference => 11,
        }
    }
}

/// Maximum payload size encodable in the 24-bit header field.
pub const MAX_OBJECT_CELLS: usize = 0x00FF_FFFF;

/// A decoded object header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub size: usize,
    pub kind: GcKind,
    pub permanent: bool,
    pub marked: bool,
}

impl Header {
    #[must_use]
    pub fn new(size: usize, kind: GcKind) -> Header {
        Header {
            size,
            kind,
            permanent: false,
            marked: false,
        }
    }

    /// Decode a header word; `None` if the kind bits are invalid.
    #[must_use]
    pub fn from_cell(cell: Cell) -> Option<Header> {
        let kind = GcKind::from_bits((cell >> 2) & 0x3F)?;
        Some(Header {
            size: (cell >> 8) as usize,
            kind,
            permanent: cell & 0b10 != 0,
            marked: cell & 0b01 != 0,
        })
    }

    #[must_use]
    pub fn to_cell(self) -> Cell {
        debug_assert!(self.size <= MAX_OBJECT_CELLS);
        ((self.size as u32) << 8)
            | (self.kind.to_bits() << 2)
            | (u32::from(self.permanent) << 1)
            | u32::from(self.marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        for kind_bits in 0..12 {
            let kind = GcKind::from_bits(kind_bits).expect("valid kind");
            let header = Header {
                size: 12345,
                kind,
                permanent: kind_bits % 2 == 0,
                marked: kind_bits % 3 == 0,
            };
            assert_eq!(Header::from_cell(header.to_cell()), Some(header));
        }
    }

    #[test]
    fn test_invalid_kind_bits() {
        assert_eq!(GcKind::from_bits(12), None);
        assert_eq!(Header::from_cell(12 << 2), None);
    }

    #[test]
    fn test_max_size_fits() {
        let header = Header::new(MAX_OBJECT_CELLS, GcKind::NoPointers);
        assert_eq!(
            Header::from_cell(header.to_cell()).map(|header| header.size),
            Some(MAX_OBJECT_CELLS)
        );
    }

    #[test]
    fn test_null_ptr() {
        assert!(Ptr::NULL.is_null());
        assert!(!Ptr(1).is_null());
    }
}
