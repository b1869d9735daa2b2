//! Recursive method invocation: a classic factorial over a
//! freshly synthesized classfile.

mod common;

use common::{class_bytes, find_method, long_result, make_vm, MethodSpec};
use kelvin_classfile::bytecode::opcode::*;
use kelvin_classfile::{ConstantPool, StackMapFrame, VerificationType};
use kelvin_vm::Result;

#[test_log::test]
fn test_recursive_factorial() -> Result<()> {
    let (mut vm, _host) = make_vm(32 * 1024, false)?;

    let mut constant_pool = ConstantPool::new();
    let fact_ref = constant_pool
        .add_method_ref("Fact", "fact", "(I)J")
        .expect("method ref");
    let [fact_hi, fact_lo] = fact_ref.to_be_bytes();

    // static long fact(int n) { return n <= 1 ? 1 : n * fact(n - 1); }
    let fact = MethodSpec {
        max_stack: 4,
        max_locals: 1,
        code: vec![
            ILOAD_0,           //  0
            ICONST_1,          //  1
            IF_ICMPGT, 0, 5,   //  2: n > 1 -> 7
            LCONST_1,          //  5
            LRETURN,           //  6
            ILOAD_0,           //  7
            I2L,               //  8
            ILOAD_0,           //  9
            ICONST_1,          // 10
            ISUB,              // 11
            INVOKESTATIC, fact_hi, fact_lo, // 12
            LMUL,              // 15
            LRETURN,           // 16
        ],
        stack_map: vec![StackMapFrame {
            offset: 7,
            locals: vec![VerificationType::Integer],
            stack: vec![],
        }],
        ..MethodSpec::new("fact", "(I)J")
    };

    // static long test() { return fact(12); }
    let test = MethodSpec {
        max_stack: 2,
        max_locals: 0,
        code: vec![
            BIPUSH, 12,
            INVOKESTATIC, fact_hi, fact_lo,
            LRETURN,
        ],
        ..MethodSpec::new("test", "()J")
    };

    let bytes = class_bytes(constant_pool, "Fact", "java/lang/Object", &[], &[], &[fact, test]);
    let class_id = vm.define_class("Fact", bytes)?;
    let test_method = find_method(&mut vm, class_id, "test", "()J");

    let result = vm.invoke_static(class_id, test_method)?;
    assert!(!vm.saw_uncaught_exception());
    assert_eq!(long_result(&result), 479_001_600);
    Ok(())
}

#[test_log::test]
fn test_factorial_survives_allocation_stress() -> Result<()> {
    // The same program with a collection forced before every
    // allocation: every recursive call's chunk handling and register
    // reloads run against a moving heap.
    let (mut vm, _host) = make_vm(32 * 1024, true)?;

    let mut constant_pool = ConstantPool::new();
    let fact_ref = constant_pool
        .add_method_ref("Fact", "fact", "(I)J")
        .expect("method ref");
    let [fact_hi, fact_lo] = fact_ref.to_be_bytes();

    let fact = MethodSpec {
        max_stack: 4,
        max_locals: 1,
        code: vec![
            ILOAD_0,
            ICONST_1,
            IF_ICMPGT, 0, 5,
            LCONST_1,
            LRETURN,
            ILOAD_0,
            I2L,
            ILOAD_0,
            ICONST_1,
            ISUB,
            INVOKESTATIC, fact_hi, fact_lo,
            LMUL,
            LRETURN,
        ],
        stack_map: vec![StackMapFrame {
            offset: 7,
            locals: vec![VerificationType::Integer],
            stack: vec![],
        }],
        ..MethodSpec::new("fact", "(I)J")
    };
    let test = MethodSpec {
        max_stack: 2,
        max_locals: 0,
        code: vec![BIPUSH, 10, INVOKESTATIC, fact_hi, fact_lo, LRETURN],
        ..MethodSpec::new("test", "()J")
    };

    let bytes = class_bytes(constant_pool, "Fact", "java/lang/Object", &[], &[], &[fact, test]);
    let class_id = vm.define_class("Fact", bytes)?;
    let test_method = find_method(&mut vm, class_id, "test", "()J");

    let result = vm.invoke_static(class_id, test_method)?;
    assert!(!vm.saw_uncaught_exception());
    assert_eq!(long_result(&result), 3_628_800);
    Ok(())
}
