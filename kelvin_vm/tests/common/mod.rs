//! Shared scaffolding for the end-to-end tests: a capturing host and
//! helpers to synthesize classfiles the loader consumes.

use kelvin_classfile::{
    Attribute, ClassAccessFlags, ClassFile, ConstantPool, ExceptionTableEntry, Field,
    FieldAccessFlags, Method, MethodAccessFlags, MethodDescriptor, StackMapFrame,
};
use kelvin_vm::{
    compress_method_descriptor, name_type_key, CaptureHost, ClassId, ConfigurationBuilder, Host,
    MethodId, Result, Vm,
};
use std::rc::Rc;

/// A `Host` that shares one [`CaptureHost`] with the test body.
#[derive(Debug)]
pub struct SharedHost(pub Rc<CaptureHost>);

impl Host for SharedHost {
    fn current_time_millis(&self) -> u64 {
        self.0.current_time_millis()
    }

    fn random_int(&self) -> i32 {
        self.0.random_int()
    }

    fn write_byte(&self, byte: u8) {
        self.0.write_byte(byte);
    }

    fn idle(&self, millis: u64) {
        self.0.idle(millis);
    }
}

/// Build a VM over a capturing host.
pub fn make_vm(heap_cells: usize, stress_gc: bool) -> Result<(Vm, Rc<CaptureHost>)> {
    let host = Rc::new(CaptureHost::new());
    let configuration = ConfigurationBuilder::new()
        .heap_cells(heap_cells)
        .collect_on_every_allocation(stress_gc)
        .build()?;
    let vm = Vm::with_host(configuration, Box::new(SharedHost(Rc::clone(&host))))?;
    Ok((vm, host))
}

/// One synthesized method body.
pub struct MethodSpec<'a> {
    pub name: &'a str,
    pub descriptor: &'a str,
    pub is_static: bool,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub handlers: Vec<ExceptionTableEntry>,
    pub stack_map: Vec<StackMapFrame>,
}

impl<'a> MethodSpec<'a> {
    pub fn new(name: &'a str, descriptor: &'a str) -> Self {
        MethodSpec {
            name,
            descriptor,
            is_static: true,
            max_stack: 0,
            max_locals: 0,
            code: Vec::new(),
            handlers: Vec::new(),
            stack_map: Vec::new(),
        }
    }
}

/// Assemble a classfile from an externally prepared constant pool and
/// method specs, and serialise it to bytes.
pub fn class_bytes(
    mut constant_pool: ConstantPool,
    name: &str,
    super_name: &str,
    static_int_fields: &[&str],
    static_object_fields: &[&str],
    methods: &[MethodSpec<'_>],
) -> Vec<u8> {
    let this_class = constant_pool.add_class(name).expect("class entry");
    let super_class = constant_pool.add_class(super_name).expect("super entry");
    let code_name = constant_pool.add_utf8("Code").expect("utf8");
    let stack_map_name = constant_pool.add_utf8("StackMap").expect("utf8");

    let mut fields = Vec::new();
    for field_name in static_int_fields {
        let name_index = constant_pool.add_utf8(field_name).expect("utf8");
        let descriptor_index = constant_pool.add_utf8("I").expect("utf8");
        fields.push(Field {
            access_flags: FieldAccessFlags::STATIC,
            name_index,
            descriptor_index,
            attributes: vec![],
        });
    }
    for field_name in static_object_fields {
        let name_index = constant_pool.add_utf8(field_name).expect("utf8");
        let descriptor_index = constant_pool.add_utf8("Ljava/lang/Object;").expect("utf8");
        fields.push(Field {
            access_flags: FieldAccessFlags::STATIC,
            name_index,
            descriptor_index,
            attributes: vec![],
        });
    }

    let mut class_methods = Vec::new();
    for spec in methods {
        let name_index = constant_pool.add_utf8(spec.name).expect("utf8");
        let descriptor_index = constant_pool.add_utf8(spec.descriptor).expect("utf8");
        let mut attributes = Vec::new();
        if !spec.stack_map.is_empty() {
            attributes.push(Attribute::StackMap {
                name_index: stack_map_name,
                frames: spec.stack_map.clone(),
            });
        }
        let mut access_flags = MethodAccessFlags::PUBLIC;
        if spec.is_static {
            access_flags |= MethodAccessFlags::STATIC;
        }
        class_methods.push(Method {
            access_flags,
            name_index,
            descriptor_index,
            attributes: vec![Attribute::Code {
                name_index: code_name,
                max_stack: spec.max_stack,
                max_locals: spec.max_locals,
                code: spec.code.clone(),
                exception_table: spec.handlers.clone(),
                attributes,
            }],
        });
    }

    let class_file = ClassFile {
        constant_pool,
        access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
        this_class,
        super_class,
        fields,
        methods: class_methods,
        ..Default::default()
    };
    let mut bytes = Vec::new();
    class_file.to_bytes(&mut bytes).expect("serialise classfile");
    bytes
}

/// Find a declared or inherited method by name and descriptor.
pub fn find_method(vm: &mut Vm, class_id: ClassId, name: &str, descriptor: &str) -> MethodId {
    let name_key = vm.strings.intern(name).expect("intern");
    let parsed = MethodDescriptor::parse(descriptor).expect("descriptor");
    let type_key = compress_method_descriptor(&parsed, &mut vm.strings).expect("signature");
    vm.registry
        .lookup_method(class_id, name_type_key(name_key, type_key))
        .expect("method present")
}

/// Interpret two return cells as a Java long.
pub fn long_result(cells: &[u32]) -> i64 {
    assert_eq!(cells.len(), 2, "expected a two-cell return value");
    (((u64::from(cells[0])) << 32) | u64::from(cells[1])) as i64
}

/// Interpret one return cell as a Java int.
pub fn int_result(cells: &[u32]) -> i32 {
    assert_eq!(cells.len(), 1, "expected a one-cell return value");
    cells[0] as i32
}
