//! Sliding compaction with a break table (Haddon-Waite).
//!
//! Live objects slide toward low addresses in address order; each moved
//! run of adjacent live objects contributes one `(address, delta)`
//! entry. A pointer is relocated by finding the largest entry whose
//! address is less than or equal to it and subtracting that entry's
//! delta; pointers at or above the heap end (permanent space) and null
//! are never rewritten.
//!
//! The table here is an ordinary vector built in address order, behind
//! the narrow `compact(heap) -> BreakTable` interface; the original's
//! self-relocating in-heap table (and its end-of-pass sort after
//! "rolls") is an artifact of compacting without free memory, which
//! this implementation does not need to reproduce.

use crate::error::Result;
use crate::header::{GcKind, Header, Ptr};
use crate::heap::{Heap, MIN_FREE_CELLS};
use tracing::debug;

/// One relocation entry: objects at `address` and above (up to the next
/// entry) moved down by `delta` cells.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BreakEntry {
    pub address: u32,
    pub delta: u32,
}

/// The relocation map produced by a compaction.
#[derive(Debug, Default)]
pub struct BreakTable {
    entries: Vec<BreakEntry>,
    /// Exclusive upper bound of relocatable addresses (the heap end at
    /// compaction time). Addresses at or above it are never rewritten.
    limit: u32,
}

impl BreakTable {
    /// Relocate an object pointer. Null and permanent pointers are
    /// returned unchanged.
    #[must_use]
    pub fn relocate(&self, ptr: Ptr) -> Ptr {
        if ptr.is_null() {
            return ptr;
        }
        Ptr(self.relocate_address(ptr.0))
    }

    /// Relocate a raw cell address (object pointer or interior pointer;
    /// both lie inside some moved run and share its delta).
    #[must_use]
    pub fn relocate_address(&self, address: u32) -> u32 {
        if address >= self.limit {
            return address;
        }
        address - self.delta_for(address)
    }

    /// Delta of the largest entry whose address is `<= address`; zero
    /// when no entry qualifies (the unmoved prefix).
    fn delta_for(&self, address: u32) -> u32 {
        match self
            .entries
            .binary_search_by(|entry| entry.address.cmp(&address))
        {
            Ok(index) => self.entries[index].delta,
            Err(0) => 0,
            Err(index) => self.entries[index - 1].delta,
        }
    }

    /// Number of relocation entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether compaction moved nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Slide all live objects toward low addresses, consuming the free
/// list. On return the heap has a single free chunk at its top (or none
/// if it is exactly full) and every pointer in it is stale until
/// rewritten through the returned table.
pub(crate) fn compact(heap: &mut Heap) -> Result<BreakTable> {
    let mut table = BreakTable {
        entries: Vec::new(),
        limit: heap.heap_end,
    };

    // Collect the free runs in address order (the sweep builds the
    // free list sorted).
    let mut free_runs: Vec<(u32, u32)> = Vec::new();
    let mut chunk = heap.free_list;
    while !chunk.is_null() {
        let header = heap.header(chunk)?;
        let start = chunk.0 - 1;
        free_runs.push((start, start + 1 + header.size as u32));
        chunk = heap.get_ptr(chunk, 0);
    }

    let mut copy_target = heap.heap_start;
    let mut scanner = heap.heap_start;
    for (run_index, &(free_start, free_end)) in free_runs.iter().enumerate() {
        let live_start = scanner;
        let live_end = free_start;
        let live_size = live_end - live_start;
        scanner = free_end;

        if run_index == 0 {
            // Leading live objects stay in place.
            copy_target = live_end;
            continue;
        }
        if live_size > 0 {
            let delta = live_start - copy_target;
            heap.cells.copy_within(
                live_start as usize..live_end as usize,
                copy_target as usize,
            );
            table.entries.push(BreakEntry {
                // Entries address the first payload cell of the run's
                // first object, matching how pointers address objects.
                address: live_start + 1,
                delta,
            });
            copy_target += live_size;
        }
    }
    // Trailing live objects after the last free chunk.
    let live_start = scanner;
    let live_end = heap.heap_end;
    if live_start < live_end && live_start != copy_target {
        let delta = live_start - copy_target;
        heap.cells.copy_within(
            live_start as usize..live_end as usize,
            copy_target as usize,
        );
        table.entries.push(BreakEntry {
            address: live_start + 1,
            delta,
        });
        copy_target += live_end - live_start;
    } else if live_start < live_end {
        copy_target = live_end;
    }

    // One free chunk covers everything above the compacted objects.
    let free_cells = (heap.heap_end - copy_target) as usize;
    if free_cells >= MIN_FREE_CELLS {
        let chunk = Ptr(copy_target + 1);
        heap.write_header(chunk, Header::new(free_cells - 1, GcKind::Free));
        heap.set(chunk, 0, 0);
        heap.free_list = chunk;
    } else {
        heap.free_list = Ptr::NULL;
    }

    debug!(
        "compacted: {} break entries, {free_cells} cells free at top",
        table.len()
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relocation_lookup() {
        let table = BreakTable {
            entries: vec![
                BreakEntry {
                    address: 100,
                    delta: 10,
                },
                BreakEntry {
                    address: 300,
                    delta: 50,
                },
            ],
            limit: 1000,
        };
        // Before the first entry: unmoved.
        assert_eq!(table.relocate(Ptr(50)), Ptr(50));
        // Within the first run.
        assert_eq!(table.relocate(Ptr(100)), Ptr(90));
        assert_eq!(table.relocate(Ptr(299)), Ptr(289));
        // Within the second run.
        assert_eq!(table.relocate(Ptr(300)), Ptr(250));
        // Permanent space: untouched.
        assert_eq!(table.relocate(Ptr(1000)), Ptr(1000));
        // Null: untouched.
        assert_eq!(table.relocate(Ptr::NULL), Ptr::NULL);
    }
}
