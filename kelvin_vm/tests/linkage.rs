//! Constant-pool resolution enforces the member access rules: private
//! and protected violations, static/instance mismatches, and missing
//! members each surface as their linkage error at the triggering
//! instruction.

mod common;

use common::{find_method, int_result, make_vm};
use kelvin_classfile::bytecode::opcode::*;
use kelvin_classfile::{
    Attribute, ClassAccessFlags, ClassFile, ConstantPool, Field, FieldAccessFlags, Method,
    MethodAccessFlags,
};
use kelvin_vm::{Result, Vm};

struct FieldDef<'a> {
    name: &'a str,
    descriptor: &'a str,
    flags: FieldAccessFlags,
}

struct MethodDef<'a> {
    name: &'a str,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
}

/// Assemble a classfile with explicit member flags (the shared helper
/// only produces public members) and hand it to the loader.
fn define(
    vm: &mut Vm,
    mut constant_pool: ConstantPool,
    name: &str,
    super_name: &str,
    fields: &[FieldDef<'_>],
    methods: &[MethodDef<'_>],
) -> Result<kelvin_vm::ClassId> {
    let this_class = constant_pool.add_class(name).expect("class entry");
    let super_class = constant_pool.add_class(super_name).expect("super entry");
    let code_name = constant_pool.add_utf8("Code").expect("utf8");

    let class_fields = fields
        .iter()
        .map(|field| Field {
            access_flags: field.flags,
            name_index: constant_pool.add_utf8(field.name).expect("utf8"),
            descriptor_index: constant_pool.add_utf8(field.descriptor).expect("utf8"),
            attributes: vec![],
        })
        .collect();
    let class_methods = methods
        .iter()
        .map(|method| Method {
            access_flags: MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            name_index: constant_pool.add_utf8(method.name).expect("utf8"),
            descriptor_index: constant_pool.add_utf8("()I").expect("utf8"),
            attributes: vec![Attribute::Code {
                name_index: code_name,
                max_stack: method.max_stack,
                max_locals: method.max_locals,
                code: method.code.clone(),
                exception_table: vec![],
                attributes: vec![],
            }],
        })
        .collect();

    let class_file = ClassFile {
        constant_pool,
        access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
        this_class,
        super_class,
        fields: class_fields,
        methods: class_methods,
        ..Default::default()
    };
    let mut bytes = Vec::new();
    class_file.to_bytes(&mut bytes).expect("serialise classfile");
    vm.define_class(name, bytes)
}

/// Run the class's `test()I` and require that its thread died to an
/// uncaught throwable; the caller asserts on the printed class name.
fn run_expecting_uncaught(vm: &mut Vm, class_id: kelvin_vm::ClassId) -> Result<()> {
    let method = find_method(vm, class_id, "test", "()I");
    vm.invoke_static(class_id, method)?;
    assert!(vm.saw_uncaught_exception(), "resolution should have thrown");
    Ok(())
}

#[test_log::test]
fn test_private_field_access_raises_illegal_access() -> Result<()> {
    let (mut vm, host) = make_vm(16 * 1024, false)?;

    define(
        &mut vm,
        ConstantPool::new(),
        "Holder",
        "java/lang/Object",
        &[FieldDef {
            name: "secret",
            descriptor: "I",
            flags: FieldAccessFlags::PRIVATE | FieldAccessFlags::STATIC,
        }],
        &[],
    )?;

    let mut constant_pool = ConstantPool::new();
    let secret_ref = constant_pool
        .add_field_ref("Holder", "secret", "I")
        .expect("field ref");
    let [secret_hi, secret_lo] = secret_ref.to_be_bytes();
    let intruder = define(
        &mut vm,
        constant_pool,
        "Intruder",
        "java/lang/Object",
        &[],
        &[MethodDef {
            name: "test",
            max_stack: 1,
            max_locals: 0,
            code: vec![GETSTATIC, secret_hi, secret_lo, IRETURN],
        }],
    )?;

    run_expecting_uncaught(&mut vm, intruder)?;
    assert!(
        host.output().contains("java.lang.IllegalAccessError"),
        "output was: {}",
        host.output()
    );
    Ok(())
}

#[test_log::test]
fn test_static_mismatch_raises_incompatible_class_change() -> Result<()> {
    let (mut vm, host) = make_vm(16 * 1024, false)?;

    // An instance field reached through getstatic.
    define(
        &mut vm,
        ConstantPool::new(),
        "Holder",
        "java/lang/Object",
        &[FieldDef {
            name: "value",
            descriptor: "I",
            flags: FieldAccessFlags::PUBLIC,
        }],
        &[],
    )?;

    let mut constant_pool = ConstantPool::new();
    let value_ref = constant_pool
        .add_field_ref("Holder", "value", "I")
        .expect("field ref");
    let [value_hi, value_lo] = value_ref.to_be_bytes();
    let intruder = define(
        &mut vm,
        constant_pool,
        "Intruder",
        "java/lang/Object",
        &[],
        &[MethodDef {
            name: "test",
            max_stack: 1,
            max_locals: 0,
            code: vec![GETSTATIC, value_hi, value_lo, IRETURN],
        }],
    )?;

    run_expecting_uncaught(&mut vm, intruder)?;
    assert!(
        host.output()
            .contains("java.lang.IncompatibleClassChangeError"),
        "output was: {}",
        host.output()
    );
    Ok(())
}

#[test_log::test]
fn test_missing_field_raises_no_such_field() -> Result<()> {
    let (mut vm, host) = make_vm(16 * 1024, false)?;

    define(&mut vm, ConstantPool::new(), "Holder", "java/lang/Object", &[], &[])?;

    let mut constant_pool = ConstantPool::new();
    let missing_ref = constant_pool
        .add_field_ref("Holder", "missing", "I")
        .expect("field ref");
    let [missing_hi, missing_lo] = missing_ref.to_be_bytes();
    let intruder = define(
        &mut vm,
        constant_pool,
        "Intruder",
        "java/lang/Object",
        &[],
        &[MethodDef {
            name: "test",
            max_stack: 1,
            max_locals: 0,
            code: vec![GETSTATIC, missing_hi, missing_lo, IRETURN],
        }],
    )?;

    run_expecting_uncaught(&mut vm, intruder)?;
    assert!(
        host.output().contains("java.lang.NoSuchFieldError"),
        "output was: {}",
        host.output()
    );
    Ok(())
}

#[test_log::test]
fn test_missing_method_raises_no_such_method() -> Result<()> {
    let (mut vm, host) = make_vm(16 * 1024, false)?;

    define(&mut vm, ConstantPool::new(), "Holder", "java/lang/Object", &[], &[])?;

    let mut constant_pool = ConstantPool::new();
    let absent_ref = constant_pool
        .add_method_ref("Holder", "absent", "()I")
        .expect("method ref");
    let [absent_hi, absent_lo] = absent_ref.to_be_bytes();
    let intruder = define(
        &mut vm,
        constant_pool,
        "Intruder",
        "java/lang/Object",
        &[],
        &[MethodDef {
            name: "test",
            max_stack: 1,
            max_locals: 0,
            code: vec![INVOKESTATIC, absent_hi, absent_lo, IRETURN],
        }],
    )?;

    run_expecting_uncaught(&mut vm, intruder)?;
    assert!(
        host.output().contains("java.lang.NoSuchMethodError"),
        "output was: {}",
        host.output()
    );
    Ok(())
}

/// The protected-outside-package subclass rule has two halves: the
/// accessor must be a subclass of the declaring class, and the class
/// named at the call site must be related to the accessor. Access
/// through an unrelated sibling subclass is rejected; access through
/// the accessor's own class is allowed.
#[test_log::test]
fn test_protected_across_packages_requires_related_call_site() -> Result<()> {
    let (mut vm, host) = make_vm(16 * 1024, false)?;

    define(
        &mut vm,
        ConstantPool::new(),
        "pkga/Holder",
        "java/lang/Object",
        &[FieldDef {
            name: "guarded",
            descriptor: "I",
            flags: FieldAccessFlags::PROTECTED | FieldAccessFlags::STATIC,
        }],
        &[],
    )?;
    define(
        &mut vm,
        ConstantPool::new(),
        "pkgb/Sibling",
        "pkga/Holder",
        &[],
        &[],
    )?;

    let mut constant_pool = ConstantPool::new();
    let via_sibling = constant_pool
        .add_field_ref("pkgb/Sibling", "guarded", "I")
        .expect("field ref");
    let via_self = constant_pool
        .add_field_ref("pkgb/Sub", "guarded", "I")
        .expect("field ref");
    let [sibling_hi, sibling_lo] = via_sibling.to_be_bytes();
    let [self_hi, self_lo] = via_self.to_be_bytes();
    let sub = define(
        &mut vm,
        constant_pool,
        "pkgb/Sub",
        "pkga/Holder",
        &[],
        &[
            MethodDef {
                name: "test",
                max_stack: 1,
                max_locals: 0,
                code: vec![GETSTATIC, sibling_hi, sibling_lo, IRETURN],
            },
            MethodDef {
                name: "good",
                max_stack: 1,
                max_locals: 0,
                code: vec![GETSTATIC, self_hi, self_lo, IRETURN],
            },
        ],
    )?;

    // Through the accessor's own class: the inherited protected static
    // resolves and reads its default value.
    let good = find_method(&mut vm, sub, "good", "()I");
    let result = vm.invoke_static(sub, good)?;
    assert!(!vm.saw_uncaught_exception());
    assert_eq!(int_result(&result), 0);

    // Through the unrelated sibling: rejected.
    run_expecting_uncaught(&mut vm, sub)?;
    assert!(
        host.output().contains("java.lang.IllegalAccessError"),
        "output was: {}",
        host.output()
    );
    Ok(())
}
