//! The built-in system classes.
//!
//! These stand in for the pre-linked image an ahead-of-time tool would
//! supply: `java/lang/Object`, `String`, `Thread`, `System`, the
//! throwable hierarchy, and one synthetic continuation class whose only
//! "bytecode" is the custom-code opcode. `is_rom` answers true for all
//! of them. Their methods are native (bound against the built-in
//! native table) or trivial bytecode; user code comes from the class
//! path.

use crate::error::Error::Internal;
use crate::error::Result;
use crate::klass::{
    Class, ClassId, ClassState, Field, FieldId, JavaBody, Method, MethodBody, MethodId, StackMaps,
};
use crate::pool::RuntimeConstantPool;
use crate::string_table::compress_method_descriptor;
use crate::vm::Vm;
use kelvin_classfile::bytecode::opcode;
use kelvin_classfile::{
    ClassAccessFlags, FieldAccessFlags, FieldType, MethodAccessFlags, MethodDescriptor,
};
use kelvin_gc::{GcKind, Ptr};

/// The synthetic class carrying the custom-code method.
pub const CONTINUATION_CLASS: &str = "kelvin/vm/Continuation";
/// Locals of a custom-code frame: callback id, state word, operand.
pub const CUSTOM_LOCALS: u16 = 4;

struct MethodSpec {
    name: &'static str,
    descriptor: &'static str,
    /// `Some((code, max_stack, max_locals))` for bytecode bodies;
    /// `None` binds a native (or abstract, on interfaces).
    code: Option<(Vec<u8>, u16, u16)>,
}

fn native(name: &'static str, descriptor: &'static str) -> MethodSpec {
    MethodSpec {
        name,
        descriptor,
        code: None,
    }
}

impl Vm {
    /// Register the system image. Runs once during VM construction,
    /// before any user class loads.
    pub(crate) fn bootstrap(&mut self) -> Result<()> {
        // The root of the hierarchy.
        let object = self.define_system_class(
            "java/lang/Object",
            None,
            false,
            &[],
            &[
                MethodSpec {
                    name: "<init>",
                    descriptor: "()V",
                    code: Some((vec![opcode::RETURN], 0, 1)),
                },
                native("hashCode", "()I"),
                native("equals", "(Ljava/lang/Object;)Z"),
                native("notify", "()V"),
                native("notifyAll", "()V"),
                native("wait", "()V"),
                native("wait", "(J)V"),
            ],
        )?;
        self.well_known.object = object;

        self.well_known.string = self.define_system_class(
            "java/lang/String",
            Some("java/lang/Object"),
            false,
            &[("value", "[C"), ("offset", "I"), ("count", "I")],
            &[
                native("length", "()I"),
                native("charAt", "(I)C"),
                native("intern", "()Ljava/lang/String;"),
            ],
        )?;

        self.well_known.runnable = self.define_system_class(
            "java/lang/Runnable",
            Some("java/lang/Object"),
            true,
            &[],
            &[native("run", "()V")],
        )?;

        self.well_known.thread = self.define_system_class(
            "java/lang/Thread",
            Some("java/lang/Object"),
            false,
            &[
                // Managed by the VM; typed as Object so the collector
                // traces and relocates it.
                ("vmThread", "Ljava/lang/Object;"),
                ("target", "Ljava/lang/Runnable;"),
                ("priority", "I"),
            ],
            &[
                native("<init>", "()V"),
                native("<init>", "(Ljava/lang/Runnable;)V"),
                native("start", "()V"),
                native("run", "()V"),
                native("interrupt", "()V"),
                native("setPriority", "(I)V"),
                native("getPriority", "()I"),
                native("isAlive", "()Z"),
                native("sleep", "(J)V"),
                native("yield", "()V"),
                native("currentThread", "()Ljava/lang/Thread;"),
                native("activeCount", "()I"),
            ],
        )?;

        self.define_system_class(
            "java/lang/System",
            Some("java/lang/Object"),
            false,
            &[],
            &[
                native("currentTimeMillis", "()J"),
                native("arraycopy", "(Ljava/lang/Object;ILjava/lang/Object;II)V"),
                native("identityHashCode", "(Ljava/lang/Object;)I"),
                native("exit", "(I)V"),
                native("gc", "()V"),
                native("print", "(Ljava/lang/String;)V"),
                native("print", "(I)V"),
                native("println", "(Ljava/lang/String;)V"),
                native("println", "(I)V"),
                native("println", "()V"),
            ],
        )?;

        // The throwable hierarchy.
        let throwable = self.define_system_class(
            "java/lang/Throwable",
            Some("java/lang/Object"),
            false,
            &[("message", "Ljava/lang/String;")],
            &[
                native("<init>", "()V"),
                native("<init>", "(Ljava/lang/String;)V"),
                native("getMessage", "()Ljava/lang/String;"),
            ],
        )?;
        self.well_known.throwable = throwable;

        const HIERARCHY: &[(&str, &str)] = &[
            ("java/lang/Error", "java/lang/Throwable"),
            ("java/lang/LinkageError", "java/lang/Error"),
            ("java/lang/ClassFormatError", "java/lang/LinkageError"),
            ("java/lang/VerifyError", "java/lang/LinkageError"),
            ("java/lang/NoClassDefFoundError", "java/lang/LinkageError"),
            ("java/lang/UnsatisfiedLinkError", "java/lang/LinkageError"),
            (
                "java/lang/IncompatibleClassChangeError",
                "java/lang/LinkageError",
            ),
            (
                "java/lang/IllegalAccessError",
                "java/lang/IncompatibleClassChangeError",
            ),
            (
                "java/lang/NoSuchFieldError",
                "java/lang/IncompatibleClassChangeError",
            ),
            (
                "java/lang/NoSuchMethodError",
                "java/lang/IncompatibleClassChangeError",
            ),
            (
                "java/lang/InstantiationError",
                "java/lang/IncompatibleClassChangeError",
            ),
            (
                "java/lang/AbstractMethodError",
                "java/lang/IncompatibleClassChangeError",
            ),
            ("java/lang/VirtualMachineError", "java/lang/Error"),
            ("java/lang/OutOfMemoryError", "java/lang/VirtualMachineError"),
            ("java/lang/StackOverflowError", "java/lang/VirtualMachineError"),
            ("java/lang/Exception", "java/lang/Throwable"),
            ("java/lang/ClassNotFoundException", "java/lang/Exception"),
            ("java/lang/InterruptedException", "java/lang/Exception"),
            ("java/lang/InstantiationException", "java/lang/Exception"),
            ("java/lang/IllegalAccessException", "java/lang/Exception"),
            ("java/io/IOException", "java/lang/Exception"),
            ("java/lang/RuntimeException", "java/lang/Exception"),
            ("java/lang/ArithmeticException", "java/lang/RuntimeException"),
            ("java/lang/NullPointerException", "java/lang/RuntimeException"),
            ("java/lang/ClassCastException", "java/lang/RuntimeException"),
            (
                "java/lang/IllegalArgumentException",
                "java/lang/RuntimeException",
            ),
            (
                "java/lang/NumberFormatException",
                "java/lang/IllegalArgumentException",
            ),
            (
                "java/lang/IllegalMonitorStateException",
                "java/lang/RuntimeException",
            ),
            (
                "java/lang/IndexOutOfBoundsException",
                "java/lang/RuntimeException",
            ),
            (
                "java/lang/ArrayIndexOutOfBoundsException",
                "java/lang/IndexOutOfBoundsException",
            ),
            (
                "java/lang/NegativeArraySizeException",
                "java/lang/RuntimeException",
            ),
            ("java/lang/ArrayStoreException", "java/lang/RuntimeException"),
            ("java/lang/SecurityException", "java/lang/RuntimeException"),
        ];
        for (name, super_name) in HIERARCHY {
            self.define_system_class(name, Some(super_name), false, &[], &[])?;
        }

        // The continuation class: one method whose single "bytecode"
        // dispatches to a host callback held in the frame's locals.
        let continuation = self.define_system_class(CONTINUATION_CLASS, Some("java/lang/Object"), false, &[], &[])?;
        let name_key = self.strings.intern("run")?;
        let descriptor = MethodDescriptor::parse("()V").map_err(|error| Internal(error.to_string()))?;
        let type_key = compress_method_descriptor(&descriptor, &mut self.strings)?;
        self.well_known.custom_code = self.registry.register_method(Method {
            id: MethodId(u32::MAX),
            class_id: continuation,
            name_key,
            type_key,
            access: MethodAccessFlags::STATIC,
            arg_slots: 0,
            return_slots: 0,
            return_is_pointer: false,
            body: MethodBody::Java(JavaBody {
                code: vec![opcode::CUSTOMCODE],
                max_stack: 2,
                frame_size: CUSTOM_LOCALS,
                handlers: Vec::new(),
                stack_maps: StackMaps::None,
                inline_caches: Vec::new(),
            }),
        })?;

        // The shared memory-error singleton: delivering out-of-memory
        // or stack overflow never allocates.
        let oom_key = self
            .strings
            .lookup("java/lang/OutOfMemoryError")
            .ok_or_else(|| Internal("OutOfMemoryError missing from bootstrap".to_string()))?;
        let oom_class = self
            .registry
            .find(oom_key)
            .ok_or_else(|| Internal("OutOfMemoryError missing from bootstrap".to_string()))?;
        let instance_cells = usize::from(self.registry.class(oom_class).instance_cells);
        let singleton = self.allocate_permanent_cells(
            kelvin_gc::layout::object::INSTANCE_OVERHEAD + instance_cells,
        )?;
        self.heap.set_permanent_kind(singleton, GcKind::Instance)?;
        self.heap
            .set(singleton, kelvin_gc::layout::object::CLASS, oom_class.0);
        self.globals.memory_error_singleton = singleton;
        Ok(())
    }

    /// Define one system class: fields by `(name, descriptor)` pairs,
    /// methods from their [`MethodSpec`] entries, then link straight to
    /// `Ready` (system classes have no static initialisers).
    fn define_system_class(
        &mut self,
        name: &str,
        super_name: Option<&str>,
        is_interface: bool,
        fields: &[(&str, &str)],
        methods: &[MethodSpec],
    ) -> Result<ClassId> {
        let super_class = match super_name {
            Some(super_name) => {
                let key = self
                    .strings
                    .lookup(super_name)
                    .ok_or_else(|| Internal(format!("system superclass {super_name} not yet defined")))?;
                Some(
                    self.registry
                        .find(key)
                        .ok_or_else(|| Internal(format!("system superclass {super_name} missing")))?,
                )
            }
            None => None,
        };

        let mut access = ClassAccessFlags::PUBLIC;
        if is_interface {
            access |= ClassAccessFlags::INTERFACE | ClassAccessFlags::ABSTRACT;
        } else {
            access |= ClassAccessFlags::SUPER;
        }
        let name_key = self.strings.intern(name)?;
        let class_id = self.registry.register_class(Class {
            id: ClassId(0),
            name_key,
            access,
            state: ClassState::Verified,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            instance_cells: 0,
            pool: RuntimeConstantPool::default(),
            statics: Ptr::NULL,
            static_pointer_map: Vec::new(),
            array_element: None,
            is_rom: true,
            init_thread: Ptr::NULL,
            init_lock: Ptr::NULL,
        })?;

        for (field_name, descriptor) in fields {
            let field_type = FieldType::parse(descriptor)
                .map_err(|error| Internal(error.to_string()))?;
            let field_name_key = self.strings.intern(field_name)?;
            let type_key = self.strings.intern(descriptor)?;
            self.registry.register_field(Field {
                id: FieldId(0),
                class_id,
                name_key: field_name_key,
                type_key,
                access: FieldAccessFlags::empty(),
                is_pointer: field_type.is_reference(),
                is_double: field_type.slots() == 2,
                offset: 0,
                constant_value: None,
            })?;
        }

        for spec in methods {
            let parsed = MethodDescriptor::parse(spec.descriptor)
                .map_err(|error| Internal(error.to_string()))?;
            let is_static = matches!(
                spec.name,
                "sleep" | "yield" | "currentThread" | "activeCount"
            ) || self.is_static_system_class(name);
            let receiver_slots = usize::from(!is_static);
            let arg_slots = u16::try_from(parsed.parameter_slots() + receiver_slots)
                .map_err(|_| Internal("argument slots overflow".to_string()))?;

            let mut access = MethodAccessFlags::PUBLIC;
            if is_static {
                access |= MethodAccessFlags::STATIC;
            }
            let body = match &spec.code {
                Some((code, max_stack, max_locals)) => MethodBody::Java(JavaBody {
                    code: code.clone(),
                    max_stack: *max_stack,
                    frame_size: *max_locals,
                    handlers: Vec::new(),
                    stack_maps: StackMaps::None,
                    inline_caches: Vec::new(),
                }),
                None if is_interface => {
                    access |= MethodAccessFlags::ABSTRACT;
                    MethodBody::Abstract
                }
                None => {
                    access |= MethodAccessFlags::NATIVE;
                    MethodBody::Native {
                        table_index: std::cell::Cell::new(None),
                    }
                }
            };

            let method_name_key = self.strings.intern(spec.name)?;
            let type_key = compress_method_descriptor(&parsed, &mut self.strings)?;
            self.registry.register_method(Method {
                id: MethodId(u32::MAX),
                class_id,
                name_key: method_name_key,
                type_key,
                access,
                arg_slots,
                return_slots: parsed.return_slots() as u8,
                return_is_pointer: parsed
                    .return_type
                    .as_ref()
                    .is_some_and(FieldType::is_reference),
                body,
            })?;
        }

        self.link_class(class_id)?;
        self.registry.class_mut(class_id).state = ClassState::Ready;
        Ok(class_id)
    }

    /// System classes whose members are all static.
    fn is_static_system_class(&self, name: &str) -> bool {
        name == "java/lang/System"
    }
}
