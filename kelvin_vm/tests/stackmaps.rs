//! The register-mask scanner: recorded entries reproduce the verifier
//! frames, and symbolic stepping tracks slot pointer-ness between them.

mod common;

use common::{class_bytes, find_method, make_vm, MethodSpec};
use kelvin_classfile::bytecode::opcode::*;
use kelvin_classfile::{ConstantPool, StackMapFrame, VerificationType};
use kelvin_vm::stackmap::{mask_bit, register_mask};
use kelvin_vm::Result;

#[test_log::test]
fn test_recorded_offsets_match_verifier_frames() -> Result<()> {
    let (mut vm, _host) = make_vm(16 * 1024, false)?;

    let mut constant_pool = ConstantPool::new();
    let object_class = constant_pool.add_class("java/lang/Object").expect("class");

    // static void probe(Object a) {
    //     Object b = a;          // 0: aload_0, 1: astore_1
    //     null; pop              // 2: aconst_null, 3: pop
    //     return;                // 4: return
    // }
    let probe = MethodSpec {
        max_stack: 2,
        max_locals: 2,
        code: vec![ALOAD_0, ASTORE_1, ACONST_NULL, POP, RETURN],
        stack_map: vec![StackMapFrame {
            offset: 2,
            locals: vec![
                VerificationType::Object { class_index: object_class },
                VerificationType::Object { class_index: object_class },
            ],
            stack: vec![],
        }],
        ..MethodSpec::new("probe", "(Ljava/lang/Object;)V")
    };

    let bytes = class_bytes(constant_pool, "Probe", "java/lang/Object", &[], &[], &[probe]);
    let class_id = vm.define_class("Probe", bytes)?;
    let method = find_method(&mut vm, class_id, "probe", "(Ljava/lang/Object;)V");

    let mut map = Vec::new();

    // Exactly at the recorded offset: the entry is used verbatim.
    let depth = register_mask(&vm.registry, &vm.strings, method, 2, &mut map)?;
    assert_eq!(depth, 0);
    assert!(mask_bit(&map, 0), "local 0 holds the parameter");
    assert!(mask_bit(&map, 1), "local 1 holds the copy");

    // Before the first entry: derived from the signature, stepped one
    // instruction; the loaded reference sits on the stack.
    let depth = register_mask(&vm.registry, &vm.strings, method, 1, &mut map)?;
    assert_eq!(depth, 1);
    assert!(mask_bit(&map, 0));
    assert!(!mask_bit(&map, 1), "local 1 is not yet written");
    assert!(mask_bit(&map, 2), "the pushed reference is on the stack");

    // Past the entry: aconst_null pushes a pointer, pop removes it.
    let depth = register_mask(&vm.registry, &vm.strings, method, 3, &mut map)?;
    assert_eq!(depth, 1);
    assert!(mask_bit(&map, 2), "null on the stack is a pointer");
    let depth = register_mask(&vm.registry, &vm.strings, method, 4, &mut map)?;
    assert_eq!(depth, 0);
    Ok(())
}

#[test_log::test]
fn test_dup_and_swap_track_pointerness() -> Result<()> {
    let (mut vm, _host) = make_vm(16 * 1024, false)?;

    // static void shuffle(Object a) {
    //     0: aload_0    [P]
    //     1: iconst_0   [P I]
    //     2: swap       [I P]
    //     3: dup        [I P P]
    //     4: pop, 5: pop, 6: pop, 7: return
    // }
    let shuffle = MethodSpec {
        max_stack: 3,
        max_locals: 1,
        code: vec![ALOAD_0, ICONST_0, SWAP, DUP, POP, POP, POP, RETURN],
        ..MethodSpec::new("shuffle", "(Ljava/lang/Object;)V")
    };

    let constant_pool = ConstantPool::new();
    let bytes = class_bytes(constant_pool, "Shuffle", "java/lang/Object", &[], &[], &[shuffle]);
    let class_id = vm.define_class("Shuffle", bytes)?;
    let method = find_method(&mut vm, class_id, "shuffle", "(Ljava/lang/Object;)V");

    let mut map = Vec::new();
    let depth = register_mask(&vm.registry, &vm.strings, method, 4, &mut map)?;
    assert_eq!(depth, 3);
    // Slots 1.. are the stack (one local).
    assert!(!mask_bit(&map, 1), "bottom of stack became the int");
    assert!(mask_bit(&map, 2), "the reference swapped up");
    assert!(mask_bit(&map, 3), "dup copied the reference");
    Ok(())
}
