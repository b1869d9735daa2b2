//! Compaction behaviour: survivors keep their contents, roots are
//! rewritten to the survivors' new addresses, and a fragmented heap
//! yields one large chunk.

use kelvin_gc::layout::pointer_list;
use kelvin_gc::{
    BreakTable, CollectorHooks, Configuration, GcKind, Heap, MarkQueue, Ptr, Result, TempRoots,
};

#[derive(Debug, Default)]
struct RootHooks {
    globals: Vec<Ptr>,
}

impl CollectorHooks for RootHooks {
    fn scan_roots(&mut self, _heap: &Heap, queue: &mut MarkQueue) {
        for &ptr in &self.globals {
            queue.push(ptr);
        }
    }

    fn weak_slot_cleared(&mut self, _finalizer: u32, _referent: Ptr) {}

    fn update_roots(&mut self, _heap: &mut Heap, table: &BreakTable) {
        for ptr in &mut self.globals {
            *ptr = table.relocate(*ptr);
        }
    }
}

/// Fill the heap with interleaved live and garbage objects, then force
/// a compacting collection: the swept holes are all 8-cell slivers, so
/// a 256-cell request can only be met by sliding the survivors
/// together.
#[test_log::test]
fn test_interleaved_survivors_keep_their_values() -> Result<()> {
    let mut heap = Heap::new(Configuration::default().with_heap_cells(4096));
    let roots = TempRoots::new();
    let mut hooks = RootHooks::default();

    let capacity = 300;
    let list = heap.allocate(pointer_list::DATA + capacity, GcKind::PointerList);
    heap.set(list, pointer_list::LENGTH, capacity as u32);
    hooks.globals.push(list);

    // Alternate live and garbage until the heap is full; unfilled list
    // slots stay null, which the collector ignores.
    let mut count = 0u32;
    loop {
        let live = heap.allocate(8, GcKind::NoPointers);
        if live.is_null() {
            break;
        }
        heap.set(live, 0, count);
        let list = hooks.globals[0];
        heap.set_ptr(list, pointer_list::DATA + count as usize, live);
        count += 1;

        let garbage = heap.allocate(8, GcKind::NoPointers);
        if garbage.is_null() {
            break;
        }
        heap.set(garbage, 0, 0xDEAD);
    }
    assert!(count >= 20, "heap should hold at least 20 pairs");

    let largest = heap.collect(256, &roots, &mut hooks)?;
    assert!(largest >= 256);
    assert!(heap.statistics().compactions >= 1);

    let list = hooks.globals[0];
    for index in 0..count {
        let live = heap.get_ptr(list, pointer_list::DATA + index as usize);
        assert_eq!(heap.get(live, 0), index, "survivor {index} lost its value");
    }
    heap.validate()?;
    Ok(())
}

/// After compaction every root must address its object's new location
/// (universal invariant: `*R` equals the new address of `O`).
#[test_log::test]
fn test_roots_rewritten_to_new_addresses() -> Result<()> {
    let mut heap = Heap::new(Configuration::default().with_heap_cells(1024));
    let roots = TempRoots::new();
    let mut hooks = RootHooks::default();

    // A garbage object below the survivor guarantees the survivor
    // moves down during compaction.
    let _garbage = heap.allocate(64, GcKind::NoPointers);
    let survivor = heap.allocate(4, GcKind::NoPointers);
    heap.set(survivor, 0, 0xCAFE);
    let temp_id = roots.push(survivor);
    hooks.globals.push(survivor);

    heap.collect(256, &roots, &mut hooks)?;

    let via_temp_root = roots.get(temp_id);
    let via_global = hooks.globals[0];
    assert_eq!(via_temp_root, via_global);
    assert!(via_temp_root < survivor, "survivor should have slid down");
    assert_eq!(heap.get(via_temp_root, 0), 0xCAFE);
    Ok(())
}

/// Compaction is skipped when the sweep already satisfies the request.
#[test_log::test]
fn test_no_compaction_when_sweep_suffices() -> Result<()> {
    let mut heap = Heap::new(Configuration::default().with_heap_cells(1024));
    let roots = TempRoots::new();
    let _garbage = heap.allocate(16, GcKind::NoPointers);

    heap.collect(4, &roots, &mut kelvin_gc::NoHooks)?;
    assert_eq!(heap.statistics().compactions, 0);
    Ok(())
}

/// With compaction disabled the collector never moves objects even
/// when the request cannot be satisfied.
#[test_log::test]
fn test_compaction_disabled() -> Result<()> {
    let mut heap = Heap::new(
        Configuration::default()
            .with_heap_cells(1024)
            .with_compaction(false),
    );
    let roots = TempRoots::new();
    let survivor = heap.allocate(4, GcKind::NoPointers);
    let id = roots.push(survivor);

    heap.collect(100_000, &roots, &mut kelvin_gc::NoHooks)?;
    assert_eq!(heap.statistics().compactions, 0);
    assert_eq!(roots.get(id), survivor);
    Ok(())
}
