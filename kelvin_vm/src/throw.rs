//! Exception taxonomy and throwable construction.
//!
//! Exceptions travel as `Error::JavaThrow(ptr)` through ordinary
//! `Result` returns; the interpreter's unwinder consumes them. The
//! out-of-memory and stack-overflow conditions share one pre-allocated
//! singleton so that delivering them never allocates.

use crate::error::Error::{self, Fatal, JavaThrow};
use crate::error::Result;
use crate::object;
use crate::vm::Vm;
use kelvin_gc::Ptr;
use tracing::debug;

/// Class names of the throwables the core raises.
pub mod names {
    // Linkage errors (class-load time).
    pub const CLASS_NOT_FOUND: &str = "java/lang/ClassNotFoundException";
    pub const NO_CLASS_DEF_FOUND_ERROR: &str = "java/lang/NoClassDefFoundError";
    pub const CLASS_FORMAT_ERROR: &str = "java/lang/ClassFormatError";
    pub const VERIFY_ERROR: &str = "java/lang/VerifyError";
    pub const INCOMPATIBLE_CLASS_CHANGE_ERROR: &str = "java/lang/IncompatibleClassChangeError";
    pub const ILLEGAL_ACCESS_ERROR: &str = "java/lang/IllegalAccessError";
    pub const NO_SUCH_FIELD_ERROR: &str = "java/lang/NoSuchFieldError";
    pub const NO_SUCH_METHOD_ERROR: &str = "java/lang/NoSuchMethodError";
    pub const INSTANTIATION_ERROR: &str = "java/lang/InstantiationError";
    pub const ABSTRACT_METHOD_ERROR: &str = "java/lang/AbstractMethodError";
    pub const UNSATISFIED_LINK_ERROR: &str = "java/lang/UnsatisfiedLinkError";

    // Runtime exceptions (execution time).
    pub const NULL_POINTER: &str = "java/lang/NullPointerException";
    pub const ARRAY_INDEX: &str = "java/lang/ArrayIndexOutOfBoundsException";
    pub const NEGATIVE_ARRAY_SIZE: &str = "java/lang/NegativeArraySizeException";
    pub const CLASS_CAST: &str = "java/lang/ClassCastException";
    pub const ARITHMETIC: &str = "java/lang/ArithmeticException";
    pub const ILLEGAL_MONITOR_STATE: &str = "java/lang/IllegalMonitorStateException";
    pub const ILLEGAL_ARGUMENT: &str = "java/lang/IllegalArgumentException";
    pub const INDEX_OUT_OF_BOUNDS: &str = "java/lang/IndexOutOfBoundsException";
    pub const ARRAY_STORE: &str = "java/lang/ArrayStoreException";
    pub const NUMBER_FORMAT: &str = "java/lang/NumberFormatException";
    pub const SECURITY: &str = "java/lang/SecurityException";
    pub const INTERRUPTED: &str = "java/lang/InterruptedException";
    pub const IO: &str = "java/io/IOException";

    // Errors.
    pub const OUT_OF_MEMORY_ERROR: &str = "java/lang/OutOfMemoryError";
    pub const STACK_OVERFLOW_ERROR: &str = "java/lang/StackOverflowError";
    pub const ERROR: &str = "java/lang/Error";
    pub const THROWABLE: &str = "java/lang/Throwable";
    pub const EXCEPTION: &str = "java/lang/Exception";
}

impl Vm {
    /// Construct a throwable of `class_name` carrying `message` and
    /// return it as the in-flight [`Error::JavaThrow`].
    ///
    /// Allocation failure degrades to the pre-allocated out-of-memory
    /// singleton; an unknown throwable class is a fatal error.
    pub fn raise(&mut self, class_name: &str, message: &str) -> Error {
        debug!("raising {class_name}: {message}");
        match self.make_throwable(class_name, message) {
            Ok(throwable) => JavaThrow(throwable),
            Err(error @ Fatal(_)) => error,
            Err(_) => self.raise_out_of_memory(),
        }
    }

    /// The pre-allocated out-of-memory/stack-overflow singleton; its
    /// delivery never allocates.
    pub fn raise_out_of_memory(&mut self) -> Error {
        JavaThrow(self.globals.memory_error_singleton)
    }

    /// Build a throwable instance. The instance is protected by a
    /// temporary root while the message string is allocated.
    fn make_throwable(&mut self, class_name: &str, message: &str) -> Result<Ptr> {
        let Some(name_key) = self.strings.lookup(class_name) else {
            return Err(Fatal(format!("unknown throwable class {class_name}")));
        };
        let Some(class_id) = self.registry.find(name_key) else {
            return Err(Fatal(format!("unregistered throwable class {class_name}")));
        };

        let throwable = self.allocate_instance(class_id)?;
        if !message.is_empty() {
            let roots = std::rc::Rc::clone(&self.roots);
            let scope = kelvin_gc::RootScope::new(&roots);
            let root = scope.roots().push(throwable);
            let text = self.allocate_string(message)?;
            let throwable = scope.roots().get(root);
            let offset = object::THROWABLE_MESSAGE_OFFSET;
            self.heap.set_ptr(throwable, kelvin_gc::layout::object::FIELDS + offset, text);
            return Ok(throwable);
        }
        Ok(throwable)
    }

    /// The class name of a throwable instance, dotted for display.
    #[must_use]
    pub fn throwable_class_name(&self, throwable: Ptr) -> String {
        let class_id = crate::klass::ClassId(self.heap.get(throwable, kelvin_gc::layout::object::CLASS));
        let name_key = self.registry.class(class_id).name_key;
        self.strings.get(name_key).replace('/', ".")
    }

    /// The message string of a throwable, if set.
    #[must_use]
    pub fn throwable_message(&self, throwable: Ptr) -> Option<String> {
        let message = self.heap.get_ptr(
            throwable,
            kelvin_gc::layout::object::FIELDS + object::THROWABLE_MESSAGE_OFFSET,
        );
        if message.is_null() {
            return None;
        }
        Some(object::string_value(&self.heap, message))
    }
}
