//! An uncaught exception terminates the program with exit code 128 and
//! the exception's class name on the output.

mod common;

use common::SharedHost;
use kelvin_classfile::bytecode::opcode::*;
use kelvin_classfile::{
    Attribute, ClassAccessFlags, ClassFile, ConstantPool, Method, MethodAccessFlags,
};
use kelvin_vm::{CaptureHost, ClassPath, ConfigurationBuilder, Result, Vm, EXIT_UNCAUGHT};
use std::rc::Rc;

fn divide_by_zero_main() -> Vec<u8> {
    let mut constant_pool = ConstantPool::new();
    let this_class = constant_pool.add_class("ArithFail").expect("class");
    let super_class = constant_pool.add_class("java/lang/Object").expect("class");
    let code_name = constant_pool.add_utf8("Code").expect("utf8");
    let main_name = constant_pool.add_utf8("main").expect("utf8");
    let main_descriptor = constant_pool
        .add_utf8("([Ljava/lang/String;)V")
        .expect("utf8");

    let class_file = ClassFile {
        constant_pool,
        access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
        this_class,
        super_class,
        methods: vec![Method {
            access_flags: MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            name_index: main_name,
            descriptor_index: main_descriptor,
            attributes: vec![Attribute::Code {
                name_index: code_name,
                max_stack: 2,
                max_locals: 1,
                code: vec![ICONST_1, ICONST_0, IDIV, POP, RETURN],
                exception_table: vec![],
                attributes: vec![],
            }],
        }],
        ..Default::default()
    };
    let mut bytes = Vec::new();
    class_file.to_bytes(&mut bytes).expect("serialise");
    bytes
}

#[test_log::test]
fn test_uncaught_arithmetic_exception_exits_128() -> Result<()> {
    // Loading goes through a real class path directory, the way the
    // launcher drives the VM.
    let temp_dir = tempfile::tempdir()?;
    std::fs::write(temp_dir.path().join("ArithFail.class"), divide_by_zero_main())?;
    let mut class_path = ClassPath::new();
    class_path.push(temp_dir.path());

    let host = Rc::new(CaptureHost::new());
    let configuration = ConfigurationBuilder::new()
        .class_path(class_path)
        .main_class("ArithFail")
        .build()?;
    let mut vm = Vm::with_host(configuration, Box::new(SharedHost(Rc::clone(&host))))?;

    let exit_code = vm.invoke_main(&[])?;
    assert_eq!(exit_code, EXIT_UNCAUGHT);
    assert!(
        host.output().contains("java.lang.ArithmeticException"),
        "output was: {}",
        host.output()
    );
    Ok(())
}

#[test_log::test]
fn test_missing_main_class_exits_128() -> Result<()> {
    let host = Rc::new(CaptureHost::new());
    let configuration = ConfigurationBuilder::new()
        .main_class("does.not.Exist")
        .build()?;
    let mut vm = Vm::with_host(configuration, Box::new(SharedHost(Rc::clone(&host))))?;
    let exit_code = vm.invoke_main(&[])?;
    assert_eq!(exit_code, EXIT_UNCAUGHT);
    assert!(host.output().contains("NoClassDefFoundError"));
    Ok(())
}
