//! Boundary behaviour at the VM surface: oversized arrays, identity
//! hash stability, and the four-state lock word transitions.

mod common;

use common::make_vm;
use kelvin_classfile::BaseType;
use kelvin_vm::{Error, MonitorStatus, Result};

#[test_log::test]
fn test_huge_array_is_out_of_memory_not_overflow() -> Result<()> {
    let (mut vm, _host) = make_vm(8 * 1024, false)?;
    // 2^24 elements cannot be represented in the 24-bit header size
    // field; the request must fail cleanly as out-of-memory.
    let result = vm.allocate_array(BaseType::Int, 0x0100_0000);
    let Err(Error::JavaThrow(thrown)) = result else {
        panic!("expected an out-of-memory throw");
    };
    assert_eq!(thrown, vm.globals.memory_error_singleton);
    // And so must a byte array just over the packed limit.
    let result = vm.allocate_array(BaseType::Long, 0x00A0_0000);
    assert!(matches!(result, Err(Error::JavaThrow(_))));
    Ok(())
}

#[test_log::test]
fn test_negative_array_size() -> Result<()> {
    let (mut vm, _host) = make_vm(8 * 1024, false)?;
    let result = vm.allocate_array(BaseType::Byte, -1);
    let Err(Error::JavaThrow(thrown)) = result else {
        panic!("expected a throw");
    };
    assert_eq!(
        vm.throwable_class_name(thrown),
        "java.lang.NegativeArraySizeException"
    );
    Ok(())
}

#[test_log::test]
fn test_identity_hash_stable_across_compaction() -> Result<()> {
    let (mut vm, _host) = make_vm(8 * 1024, false)?;
    let object_class = vm.well_known.object;
    let mut regs = kelvin_vm::Registers::default();

    // A garbage object below keeps the survivor away from the heap
    // floor so compaction actually moves it.
    let _garbage = vm.allocate_instance(object_class)?;
    let survivor = vm.allocate_instance(object_class)?;
    let root = vm.roots.push(survivor);

    let hash_before = vm.identity_hash(&mut regs, survivor)?;
    assert_ne!(hash_before, 0);

    let heap_cells = vm.heap.config().heap_cells;
    vm.gc(heap_cells)?;
    let survivor = vm.roots.get(root);

    let hash_after = vm.identity_hash(&mut regs, survivor)?;
    assert_eq!(hash_before, hash_after);
    Ok(())
}

#[test_log::test]
fn test_lock_word_state_transitions() -> Result<()> {
    let (mut vm, _host) = make_vm(8 * 1024, false)?;
    let object_class = vm.well_known.object;

    let thread = vm.create_thread(5)?;
    vm.globals.current_thread = thread;
    let mut regs = kelvin_vm::Registers::default();

    let target = vm.allocate_instance(object_class)?;
    let root = vm.roots.push(target);

    // Unlocked -> SimpleLock -> ExtendedLock (depth 2) -> back down.
    assert_eq!(vm.monitor_enter(&mut regs, target)?, MonitorStatus::Own);
    assert_eq!(vm.monitor_enter(&mut regs, target)?, MonitorStatus::Own);
    assert_eq!(vm.monitor_exit(target), MonitorStatus::Own);
    assert_eq!(vm.monitor_exit(target), MonitorStatus::Released);
    // A depth-d ownership needs exactly d exits; one more is an error.
    assert_eq!(vm.monitor_exit(target), MonitorStatus::Error);

    // A hashcode assigned while simple-locked promotes the lock so the
    // hash survives unlocking.
    let target = vm.roots.get(root);
    assert_eq!(vm.monitor_enter(&mut regs, target)?, MonitorStatus::Own);
    let hash = vm.identity_hash(&mut regs, target)?;
    assert_ne!(hash, 0);
    assert_eq!(vm.monitor_exit(target), MonitorStatus::Released);
    assert_eq!(vm.identity_hash(&mut regs, target)?, hash);

    // notify without ownership is an error.
    assert_eq!(vm.monitor_notify(target, false), MonitorStatus::Error);
    Ok(())
}

/// One thread, two locked objects: hashing the first while it is
/// simple-locked claims the thread's single extended-lock slot, so the
/// second object's lock and hashcode must take the inflated path
/// without disturbing the first object's depth or hashcode.
#[test_log::test]
fn test_second_lock_does_not_corrupt_promoted_first() -> Result<()> {
    let (mut vm, _host) = make_vm(8 * 1024, false)?;
    let object_class = vm.well_known.object;

    let thread = vm.create_thread(5)?;
    vm.globals.current_thread = thread;
    let mut regs = kelvin_vm::Registers::default();

    let first = vm.allocate_instance(object_class)?;
    let first_root = vm.roots.push(first);
    let second = vm.allocate_instance(object_class)?;
    let second_root = vm.roots.push(second);

    // First object: SimpleLock, then hash -> ExtendedLock (depth 1,
    // hash in the owner's extended slots).
    assert_eq!(vm.monitor_enter(&mut regs, first)?, MonitorStatus::Own);
    let first_hash = vm.identity_hash(&mut regs, first)?;
    assert_ne!(first_hash, 0);

    // Second object on the same thread: the extended slot is taken, so
    // its hash must not be allowed to overwrite it.
    let second = vm.roots.get(second_root);
    assert_eq!(vm.monitor_enter(&mut regs, second)?, MonitorStatus::Own);
    let second_hash = vm.identity_hash(&mut regs, second)?;
    assert_ne!(second_hash, 0);
    assert_ne!(second_hash, first_hash);

    // The first object's extended state is intact: its hash is
    // unchanged and its depth is still exactly one.
    let first = vm.roots.get(first_root);
    assert_eq!(vm.identity_hash(&mut regs, first)?, first_hash);
    assert_eq!(vm.monitor_enter(&mut regs, first)?, MonitorStatus::Own);
    assert_eq!(vm.monitor_exit(first), MonitorStatus::Own);
    assert_eq!(vm.monitor_exit(first), MonitorStatus::Released);
    assert_eq!(vm.monitor_exit(first), MonitorStatus::Error);
    assert_eq!(vm.identity_hash(&mut regs, first)?, first_hash);

    // And the second object unlocks cleanly with its own hash.
    let second = vm.roots.get(second_root);
    assert_eq!(vm.monitor_exit(second), MonitorStatus::Released);
    assert_eq!(vm.identity_hash(&mut regs, second)?, second_hash);
    Ok(())
}
