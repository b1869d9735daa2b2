//! Live frames survive compaction: a method churns garbage and forces
//! full collections while holding an array in a local slot, then reads
//! every element back.

mod common;

use common::{class_bytes, find_method, int_result, make_vm, MethodSpec};
use kelvin_classfile::bytecode::opcode::*;
use kelvin_classfile::{ConstantPool, StackMapFrame, VerificationType};
use kelvin_vm::Result;

#[test_log::test]
fn test_locals_survive_forced_compaction() -> Result<()> {
    let (mut vm, _host) = make_vm(16 * 1024, false)?;

    let mut constant_pool = ConstantPool::new();
    let int_array_class = constant_pool.add_class("[I").expect("class");
    let gc_ref = constant_pool
        .add_method_ref("java/lang/System", "gc", "()V")
        .expect("method ref");
    let [gc_hi, gc_lo] = gc_ref.to_be_bytes();
    const T_INT: u8 = 10;

    // static int test() {
    //     int[] kept = new int[20];
    //     for (int i = 0; i < 20; i++) {
    //         kept[i] = i;
    //         int[] garbage = new int[8];   // dropped immediately
    //         System.gc();                  // full compacting collection
    //     }
    //     int sum = 0;
    //     for (int i = 0; i < 20; i++) sum += kept[i];
    //     return sum;
    // }
    let test = MethodSpec {
        max_stack: 3,
        max_locals: 3,
        code: vec![
            BIPUSH, 20,                 //  0
            NEWARRAY, T_INT,            //  2
            ASTORE_0,                   //  4
            ICONST_0,                   //  5
            ISTORE_1,                   //  6
            GOTO, 0, 18,                //  7 -> 25
            ALOAD_0,                    // 10
            ILOAD_1,                    // 11
            ILOAD_1,                    // 12
            IASTORE,                    // 13
            BIPUSH, 8,                  // 14
            NEWARRAY, T_INT,            // 16
            POP,                        // 18
            INVOKESTATIC, gc_hi, gc_lo, // 19
            IINC, 1, 1,                 // 22
            ILOAD_1,                    // 25
            BIPUSH, 20,                 // 26
            IF_ICMPLT, 0xFF, 0xEE,      // 28 -> 10 (-18)
            ICONST_0,                   // 31
            ISTORE_1,                   // 32
            ICONST_0,                   // 33
            ISTORE_2,                   // 34
            GOTO, 0, 12,                // 35 -> 47
            ILOAD_2,                    // 38
            ALOAD_0,                    // 39
            ILOAD_1,                    // 40
            IALOAD,                     // 41
            IADD,                       // 42
            ISTORE_2,                   // 43
            IINC, 1, 1,                 // 44
            ILOAD_1,                    // 47
            BIPUSH, 20,                 // 48
            IF_ICMPLT, 0xFF, 0xF4,      // 50 -> 38 (-12)
            ILOAD_2,                    // 53
            IRETURN,                    // 54
        ],
        stack_map: vec![
            StackMapFrame {
                offset: 10,
                locals: vec![
                    VerificationType::Object { class_index: int_array_class },
                    VerificationType::Integer,
                    VerificationType::Top,
                ],
                stack: vec![],
            },
            StackMapFrame {
                offset: 25,
                locals: vec![
                    VerificationType::Object { class_index: int_array_class },
                    VerificationType::Integer,
                    VerificationType::Top,
                ],
                stack: vec![],
            },
            StackMapFrame {
                offset: 38,
                locals: vec![
                    VerificationType::Object { class_index: int_array_class },
                    VerificationType::Integer,
                    VerificationType::Integer,
                ],
                stack: vec![],
            },
            StackMapFrame {
                offset: 47,
                locals: vec![
                    VerificationType::Object { class_index: int_array_class },
                    VerificationType::Integer,
                    VerificationType::Integer,
                ],
                stack: vec![],
            },
        ],
        ..MethodSpec::new("test", "()I")
    };

    let bytes = class_bytes(constant_pool, "Churn", "java/lang/Object", &[], &[], &[test]);
    let class_id = vm.define_class("Churn", bytes)?;
    let test_method = find_method(&mut vm, class_id, "test", "()I");

    let result = vm.invoke_static(class_id, test_method)?;
    assert!(!vm.saw_uncaught_exception());
    // 0 + 1 + ... + 19
    assert_eq!(int_result(&result), 190);
    assert!(
        vm.heap.statistics().compactions >= 20,
        "System.gc should have compacted each iteration"
    );
    assert!(vm.heap.statistics().objects_reclaimed >= 19);
    vm.heap.validate().map_err(kelvin_vm::Error::from)?;
    Ok(())
}
