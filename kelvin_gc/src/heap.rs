//! The cell-addressed heap.
//!
//! One `Vec<u32>` backs both memory regions: the collected heap grows
//! upward from the bottom, the permanent sub-heap grows downward from
//! the top, and the two never overlap. Cell index 0 is reserved so that
//! 0 is the null pointer.
//!
//! Allocation is a first-fit scan of the free list. A chosen chunk is
//! split when the excess would form a viable free chunk (header plus at
//! least one payload cell); smaller excess becomes dead space inside
//! the allocation.

use crate::config::{Configuration, Statistics, PERMANENT_GROWTH_CELLS};
use crate::error::Error::{HeapCorrupt, OutOfPermanentMemory};
use crate::error::Result;
use crate::header::{Cell, GcKind, Header, Ptr, MAX_OBJECT_CELLS};
use tracing::{debug, trace};

/// Minimum viable free chunk: header plus one payload cell.
pub(crate) const MIN_FREE_CELLS: usize = 2;

/// Per-class instance layout registered by the loader: the number of
/// field cells and which of them hold pointers (inheritance already
/// flattened in).
#[derive(Clone, Debug, Default)]
pub struct InstanceLayout {
    pub field_cells: usize,
    pub pointer_map: Vec<bool>,
}

/// The heap.
#[derive(Debug)]
pub struct Heap {
    pub(crate) cells: Vec<Cell>,
    /// First allocatable cell of the collected heap.
    pub(crate) heap_start: u32,
    /// Exclusive end of the collected heap; also the permanent-space
    /// lower bound.
    pub(crate) heap_end: u32,
    /// Lowest cell in use by permanent data; bumps downward.
    perm_next: u32,
    /// Head of the address-ordered free chunk chain.
    pub(crate) free_list: Ptr,
    layouts: Vec<InstanceLayout>,
    pub(crate) config: Configuration,
    pub(crate) stats: Statistics,
}

impl Heap {
    /// Create a heap of `config.heap_cells` cells.
    #[must_use]
    pub fn new(config: Configuration) -> Self {
        let total = config.heap_cells.max(16);
        let mut heap = Heap {
            cells: vec![0; total],
            heap_start: 1,
            heap_end: u32::try_from(total).unwrap_or(u32::MAX),
            perm_next: u32::try_from(total).unwrap_or(u32::MAX),
            free_list: Ptr::NULL,
            layouts: Vec::new(),
            config,
            stats: Statistics::default(),
        };
        // The whole collected region starts as a single free chunk.
        let payload = heap.heap_end as usize - heap.heap_start as usize - 1;
        let chunk = Ptr(heap.heap_start + 1);
        heap.write_header(chunk, Header::new(payload, GcKind::Free));
        heap.set(chunk, 0, 0);
        heap.free_list = chunk;
        heap
    }

    /// The configuration this heap was built with.
    #[must_use]
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Collection statistics so far.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        self.stats
    }

    /// Register (or update) the instance layout for a class id. Called
    /// by the loader before the first instance of the class exists.
    pub fn define_layout(&mut self, class_id: u32, layout: InstanceLayout) {
        let index = class_id as usize;
        if index >= self.layouts.len() {
            self.layouts.resize_with(index + 1, InstanceLayout::default);
        }
        self.layouts[index] = layout;
    }

    /// The registered layout for a class id, if any.
    #[must_use]
    pub fn layout(&self, class_id: u32) -> Option<&InstanceLayout> {
        self.layouts.get(class_id as usize)
    }

    // ----- object access -------------------------------------------------

    /// Read payload cell `offset` of `ptr`.
    #[must_use]
    pub fn get(&self, ptr: Ptr, offset: usize) -> Cell {
        self.cells[ptr.index(offset)]
    }

    /// Write payload cell `offset` of `ptr`.
    pub fn set(&mut self, ptr: Ptr, offset: usize, value: Cell) {
        self.cells[ptr.index(offset)] = value;
    }

    /// Read payload cell `offset` of `ptr` as a pointer.
    #[must_use]
    pub fn get_ptr(&self, ptr: Ptr, offset: usize) -> Ptr {
        Ptr(self.cells[ptr.index(offset)])
    }

    /// Write a pointer into payload cell `offset` of `ptr`.
    pub fn set_ptr(&mut self, ptr: Ptr, offset: usize, value: Ptr) {
        self.cells[ptr.index(offset)] = value.0;
    }

    /// Read an arbitrary cell by absolute index.
    #[must_use]
    pub fn cell_at(&self, index: u32) -> Cell {
        self.cells[index as usize]
    }

    /// Write an arbitrary cell by absolute index.
    pub fn set_cell_at(&mut self, index: u32, value: Cell) {
        self.cells[index as usize] = value;
    }

    /// Decode the header of `ptr`.
    ///
    /// # Errors
    /// Returns `HeapCorrupt` if the header word is not decodable.
    pub fn header(&self, ptr: Ptr) -> Result<Header> {
        Header::from_cell(self.cells[ptr.header_index()])
            .ok_or_else(|| HeapCorrupt(format!("undecodable header at {ptr}")))
    }

    pub(crate) fn write_header(&mut self, ptr: Ptr, header: Header) {
        self.cells[ptr.header_index()] = header.to_cell();
    }

    /// The object's gc kind.
    ///
    /// # Errors
    /// Returns `HeapCorrupt` on an undecodable header.
    pub fn kind(&self, ptr: Ptr) -> Result<GcKind> {
        Ok(self.header(ptr)?.kind)
    }

    /// The object's payload size in cells.
    ///
    /// # Errors
    /// Returns `HeapCorrupt` on an undecodable header.
    pub fn size(&self, ptr: Ptr) -> Result<usize> {
        Ok(self.header(ptr)?.size)
    }

    /// Whether `ptr` addresses permanent space.
    #[must_use]
    pub fn is_permanent(&self, ptr: Ptr) -> bool {
        ptr.0 >= self.heap_end
    }

    /// Whether `ptr` addresses the collected heap.
    #[must_use]
    pub fn in_collected_heap(&self, ptr: Ptr) -> bool {
        ptr.0 >= self.heap_start && ptr.0 < self.heap_end
    }

    // ----- allocation ----------------------------------------------------

    /// Allocate `size_cells` payload cells of `kind`, zero-filled.
    /// Returns null when no free chunk satisfies the request; the caller
    /// decides whether to collect and retry or to raise out-of-memory.
    /// A zero-cell request yields a one-cell object.
    #[must_use]
    pub fn allocate(&mut self, size_cells: usize, kind: GcKind) -> Ptr {
        let size = size_cells.max(1);
        if size > MAX_OBJECT_CELLS {
            return Ptr::NULL;
        }

        let mut previous = Ptr::NULL;
        let mut chunk = self.free_list;
        while !chunk.is_null() {
            let chunk_size = match self.header(chunk) {
                Ok(header) => header.size,
                Err(_) => return Ptr::NULL,
            };
            let next = self.get_ptr(chunk, 0);

            if chunk_size >= size {
                let excess = chunk_size - size;
                let ptr = if excess >= MIN_FREE_CELLS {
                    // Split: the free chunk keeps its place in the list
                    // and the allocation comes off its tail.
                    let remaining = excess - 1;
                    self.write_header(chunk, Header::new(remaining, GcKind::Free));
                    Ptr(chunk.0 + remaining as u32 + 1)
                } else {
                    // Take the whole chunk; up to one cell of excess
                    // becomes dead space inside the object.
                    if previous.is_null() {
                        self.free_list = next;
                    } else {
                        self.set_ptr(previous, 0, next);
                    }
                    chunk
                };

                let total = if excess >= MIN_FREE_CELLS { size } else { chunk_size };
                self.write_header(ptr, Header::new(total, kind));
                for offset in 0..total {
                    self.set(ptr, offset, 0);
                }
                trace!("allocated {total} cells of {kind:?} at {ptr}");
                return ptr;
            }

            previous = chunk;
            chunk = next;
        }
        Ptr::NULL
    }

    /// Allocate permanent (immortal, never moved) space. The permanent
    /// region grows downward in 2 KiB steps when an allocation would
    /// collide with the free frontier; growth consumes the tail of the
    /// collected heap, which must be free.
    ///
    /// The caller runs a full collection before retrying when this
    /// returns `OutOfPermanentMemory` and growth might still succeed;
    /// see [`Heap::try_grow_permanent`].
    ///
    /// # Errors
    /// Returns `OutOfPermanentMemory` when the region cannot grow far
    /// enough. Permanent allocation failure is fatal to the VM.
    pub fn allocate_permanent(&mut self, size_cells: usize) -> Result<Ptr> {
        let size = size_cells.max(1);
        if size > MAX_OBJECT_CELLS {
            return Err(OutOfPermanentMemory { requested: size });
        }
        let needed = size + 1;

        if (self.perm_next as usize) < needed + self.heap_end as usize
            && !self.try_grow_permanent(needed)
        {
            return Err(OutOfPermanentMemory { requested: size });
        }

        let header_index = self.perm_next - needed as u32;
        let ptr = Ptr(header_index + 1);
        let mut header = Header::new(size, GcKind::NoPointers);
        header.permanent = true;
        self.cells[header_index as usize] = header.to_cell();
        for offset in 0..size {
            self.set(ptr, offset, 0);
        }
        self.perm_next = header_index;
        trace!("permanent allocation of {size} cells at {ptr}");
        Ok(ptr)
    }

    /// Re-tag a permanent allocation with a specific kind (the S bit is
    /// preserved). Permanent objects are never collected, so the kind
    /// only documents the payload shape.
    ///
    /// # Errors
    /// Returns `HeapCorrupt` on an undecodable header.
    pub fn set_permanent_kind(&mut self, ptr: Ptr, kind: GcKind) -> Result<()> {
        let mut header = self.header(ptr)?;
        header.kind = kind;
        self.write_header(ptr, header);
        Ok(())
    }

    /// Try to lower the permanent-space bound far enough to fit `needed`
    /// more cells. The consumed tail of the collected heap must be a
    /// free chunk. Returns whether the growth succeeded.
    pub fn try_grow_permanent(&mut self, needed: usize) -> bool {
        let available = self.perm_next as usize - self.heap_end as usize;
        let deficit = needed.saturating_sub(available);
        if deficit == 0 {
            return true;
        }
        let steps = deficit.div_ceil(PERMANENT_GROWTH_CELLS);
        let growth = steps * PERMANENT_GROWTH_CELLS;
        if (self.heap_end as usize) < growth + self.heap_start as usize + MIN_FREE_CELLS {
            return false;
        }
        let mut new_end = self.heap_end - growth as u32;

        // Find the free chunk that runs exactly to the current end.
        let mut previous = Ptr::NULL;
        let mut chunk = self.free_list;
        while !chunk.is_null() {
            let Ok(header) = self.header(chunk) else {
                return false;
            };
            let next = self.get_ptr(chunk, 0);
            let end = chunk.0 + header.size as u32;
            if end == self.heap_end {
                let chunk_header = chunk.0 - 1;
                if chunk_header > new_end {
                    return false; // tail free space too small
                }
                if chunk_header + 1 == new_end {
                    // A split would leave a header-only sliver; cede the
                    // cell to the permanent region instead.
                    new_end = chunk_header;
                }
                if chunk_header >= new_end {
                    // Chunk fully consumed.
                    if previous.is_null() {
                        self.free_list = next;
                    } else {
                        self.set_ptr(previous, 0, next);
                    }
                } else {
                    let remaining = (new_end - chunk_header - 1) as usize;
                    self.write_header(chunk, Header::new(remaining, GcKind::Free));
                }
                debug!(
                    "permanent space grew by {growth} cells; bound {} -> {new_end}",
                    self.heap_end
                );
                self.heap_end = new_end;
                return true;
            }
            previous = chunk;
            chunk = next;
        }
        false
    }

    // ----- accounting ----------------------------------------------------

    /// Total free cells on the free list (payload only).
    #[must_use]
    pub fn free_cells(&self) -> usize {
        let mut total = 0;
        let mut chunk = self.free_list;
        while !chunk.is_null() {
            let Ok(header) = self.header(chunk) else {
                return total;
            };
            total += header.size;
            chunk = self.get_ptr(chunk, 0);
        }
        total
    }

    /// Largest free chunk's payload size in cells.
    #[must_use]
    pub fn largest_free_chunk(&self) -> usize {
        let mut largest = 0;
        let mut chunk = self.free_list;
        while !chunk.is_null() {
            let Ok(header) = self.header(chunk) else {
                return largest;
            };
            largest = largest.max(header.size);
            chunk = self.get_ptr(chunk, 0);
        }
        largest
    }

    /// Walk every object in the collected heap, free chunks included.
    ///
    /// # Errors
    /// Returns `HeapCorrupt` if a header is undecodable or an object
    /// runs past the heap end.
    pub fn for_each_object(&self, mut visit: impl FnMut(Ptr, Header)) -> Result<()> {
        let mut index = self.heap_start;
        while index < self.heap_end {
            let ptr = Ptr(index + 1);
            let header = self.header(ptr)?;
            let next = index + 1 + header.size as u32;
            if next > self.heap_end {
                return Err(HeapCorrupt(format!(
                    "object at {ptr} runs past the heap end"
                )));
            }
            visit(ptr, header);
            index = next;
        }
        Ok(())
    }

    /// Validate every header and the free-list accounting: the free sum
    /// plus the live sum plus one header per object must equal the heap
    /// size. This is the debug sweep; failure is fatal to the VM.
    ///
    /// # Errors
    /// Returns `HeapCorrupt` when validation fails.
    pub fn validate(&self) -> Result<()> {
        let mut accounted = 0usize;
        let mut free_sum = 0usize;
        let mut result = Ok(());
        self.for_each_object(|ptr, header| {
            accounted += header.size + 1;
            if header.kind == GcKind::Free {
                free_sum += header.size;
            }
            if header.marked && result.is_ok() {
                result = Err(HeapCorrupt(format!("mark bit set outside GC at {ptr}")));
            }
            if header.permanent && result.is_ok() {
                result = Err(HeapCorrupt(format!(
                    "static bit set in the collected heap at {ptr}"
                )));
            }
        })?;
        result?;

        if accounted != self.heap_end as usize - self.heap_start as usize {
            return Err(HeapCorrupt(format!(
                "object walk covered {accounted} cells of {}",
                self.heap_end - self.heap_start
            )));
        }
        if free_sum != self.free_cells() {
            return Err(HeapCorrupt(
                "free list disagrees with free chunks found by sweep".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> Heap {
        Heap::new(Configuration::default().with_heap_cells(1024))
    }

    #[test]
    fn test_allocate_and_access() {
        let mut heap = small_heap();
        let ptr = heap.allocate(4, GcKind::NoPointers);
        assert!(!ptr.is_null());
        heap.set(ptr, 0, 0xDEAD);
        heap.set(ptr, 3, 0xBEEF);
        assert_eq!(heap.get(ptr, 0), 0xDEAD);
        assert_eq!(heap.get(ptr, 3), 0xBEEF);
        assert_eq!(heap.size(ptr).expect("header"), 4);
        assert_eq!(heap.kind(ptr).expect("header"), GcKind::NoPointers);
    }

    #[test]
    fn test_zero_cell_allocation_yields_one_cell() {
        let mut heap = small_heap();
        let ptr = heap.allocate(0, GcKind::NoPointers);
        assert_eq!(heap.size(ptr).expect("header"), 1);
    }

    #[test]
    fn test_oversized_allocation_rejected() {
        let mut heap = small_heap();
        assert!(heap.allocate(MAX_OBJECT_CELLS + 1, GcKind::NoPointers).is_null());
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let mut heap = small_heap();
        let mut count = 0;
        while !heap.allocate(64, GcKind::NoPointers).is_null() {
            count += 1;
        }
        assert!(count > 0);
        assert!(heap.allocate(64, GcKind::NoPointers).is_null());
        // Small allocations may still fit in the remainder.
        assert!(heap.validate().is_ok());
    }

    #[test]
    fn test_validate_fresh_heap() {
        let heap = small_heap();
        assert!(heap.validate().is_ok());
        assert_eq!(heap.free_cells(), heap.largest_free_chunk());
    }

    #[test]
    fn test_permanent_allocation() -> Result<()> {
        let mut heap = small_heap();
        let first = heap.allocate_permanent(8)?;
        let second = heap.allocate_permanent(8)?;
        assert!(heap.is_permanent(first));
        assert!(heap.is_permanent(second));
        assert!(second < first);
        assert!(heap.header(first)?.permanent);
        // The collected heap shrank or stayed put, and stays valid.
        heap.validate()?;
        Ok(())
    }

    #[test]
    fn test_permanent_growth_consumes_free_tail() -> Result<()> {
        let mut heap = small_heap();
        let before = heap.free_cells();
        // Exceed the initial slack so the bound has to move.
        for _ in 0..4 {
            heap.allocate_permanent(200)?;
        }
        assert!(heap.free_cells() < before);
        heap.validate()?;
        Ok(())
    }

    #[test]
    fn test_permanent_exhaustion() {
        let mut heap = Heap::new(Configuration::default().with_heap_cells(256));
        let mut result = Ok(Ptr::NULL);
        for _ in 0..64 {
            result = heap.allocate_permanent(16);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(OutOfPermanentMemory { .. })));
    }
}
