//! The core classes every program needs, assembled in process instead of
//! being read from a runtime image.

use std::{borrow::Cow, collections::HashMap, sync::Arc};

use once_cell::sync::Lazy;

use crate::{
    class::{ClassBuilder, CodeBuilder},
    consts::{ClassAccessFlag, FieldAccessFlag, MethodAccessFlag},
    error::{LinkageError, LoadingError, VmResult},
    runtime::{
        Class,
        class_loader::{ClassRegistry, ClassSource},
        instructions as inst,
    },
};

pub(crate) use crate::runtime::verifier::OBJECT;
pub(crate) const STRING: &str = "java/lang/String";
pub(crate) const THREAD: &str = "java/lang/Thread";
pub(crate) const THROWABLE: &str = "java/lang/Throwable";

const PUBLIC: MethodAccessFlag = MethodAccessFlag::PUBLIC;
const PUBLIC_NATIVE: MethodAccessFlag = MethodAccessFlag::PUBLIC.union(MethodAccessFlag::NATIVE);
const STATIC_NATIVE: MethodAccessFlag = PUBLIC_NATIVE.union(MethodAccessFlag::STATIC);
const FINAL_CLASS: ClassAccessFlag = ClassAccessFlag::PUBLIC
    .union(ClassAccessFlag::FINAL)
    .union(ClassAccessFlag::SUPER);
const INTERFACE: ClassAccessFlag = ClassAccessFlag::PUBLIC
    .union(ClassAccessFlag::INTERFACE)
    .union(ClassAccessFlag::ABSTRACT);

/// Throwable classes the engine itself raises, with their superclass.
const THROWABLES: &[(&str, &str)] = &[
    ("java/lang/Exception", THROWABLE),
    ("java/lang/Error", THROWABLE),
    ("java/lang/RuntimeException", "java/lang/Exception"),
    ("java/lang/InterruptedException", "java/lang/Exception"),
    ("java/lang/CloneNotSupportedException", "java/lang/Exception"),
    ("java/lang/ArithmeticException", "java/lang/RuntimeException"),
    ("java/lang/NullPointerException", "java/lang/RuntimeException"),
    ("java/lang/ClassCastException", "java/lang/RuntimeException"),
    ("java/lang/ArrayStoreException", "java/lang/RuntimeException"),
    ("java/lang/NegativeArraySizeException", "java/lang/RuntimeException"),
    ("java/lang/IllegalMonitorStateException", "java/lang/RuntimeException"),
    ("java/lang/IllegalArgumentException", "java/lang/RuntimeException"),
    ("java/lang/IllegalThreadStateException", "java/lang/IllegalArgumentException"),
    ("java/lang/IndexOutOfBoundsException", "java/lang/RuntimeException"),
    ("java/lang/ArrayIndexOutOfBoundsException", "java/lang/IndexOutOfBoundsException"),
    ("java/lang/VirtualMachineError", "java/lang/Error"),
    ("java/lang/StackOverflowError", "java/lang/VirtualMachineError"),
    ("java/lang/OutOfMemoryError", "java/lang/VirtualMachineError"),
    ("java/lang/InternalError", "java/lang/VirtualMachineError"),
    ("java/lang/LinkageError", "java/lang/Error"),
    ("java/lang/NoClassDefFoundError", "java/lang/LinkageError"),
    ("java/lang/ClassCircularityError", "java/lang/LinkageError"),
    ("java/lang/VerifyError", "java/lang/LinkageError"),
    ("java/lang/ClassFormatError", "java/lang/LinkageError"),
    ("java/lang/UnsupportedClassVersionError", "java/lang/ClassFormatError"),
    ("java/lang/UnsatisfiedLinkError", "java/lang/LinkageError"),
    ("java/lang/ExceptionInInitializerError", "java/lang/LinkageError"),
    ("java/lang/IncompatibleClassChangeError", "java/lang/LinkageError"),
    ("java/lang/AbstractMethodError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/NoSuchFieldError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/NoSuchMethodError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/IllegalAccessError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/InstantiationError", "java/lang/IncompatibleClassChangeError"),
];

static BOOTSTRAP_CLASSES: Lazy<HashMap<&'static str, Vec<u8>>> = Lazy::new(|| {
    let mut classes = HashMap::new();
    classes.insert(OBJECT, object_class());
    classes.insert("java/lang/Class", class_class());
    classes.insert(STRING, string_class());
    classes.insert("java/lang/Cloneable", marker_interface("java/lang/Cloneable"));
    classes.insert("java/io/Serializable", marker_interface("java/io/Serializable"));
    classes.insert("java/lang/Runnable", runnable_interface());
    classes.insert(THREAD, thread_class());
    classes.insert("java/lang/System", system_class());
    classes.insert(THROWABLE, throwable_class());
    for &(name, super_name) in THROWABLES {
        classes.insert(name, exception_class(name, super_name));
    }
    classes
});

/// Class source serving the synthesized core classes. It is always the
/// first source of a registry.
#[derive(Debug, Default)]
pub struct BootstrapSource;

impl BootstrapSource {
    pub fn new() -> Self {
        BootstrapSource
    }

    pub fn class_names() -> impl Iterator<Item = &'static str> {
        BOOTSTRAP_CLASSES.keys().copied()
    }
}

impl ClassSource for BootstrapSource {
    fn name(&self) -> &str {
        "bootstrap"
    }

    fn find_class(&self, class_name: &str) -> Result<Option<Cow<'_, [u8]>>, LoadingError> {
        Ok(BOOTSTRAP_CLASSES
            .get(class_name)
            .map(|bytes| Cow::Borrowed(bytes.as_slice())))
    }
}

fn marker_interface(name: &str) -> Vec<u8> {
    let mut builder = ClassBuilder::new(name);
    builder.access(INTERFACE);
    builder.build()
}

fn runnable_interface() -> Vec<u8> {
    let mut builder = ClassBuilder::new("java/lang/Runnable");
    builder.access(INTERFACE).declare_method(
        MethodAccessFlag::PUBLIC | MethodAccessFlag::ABSTRACT,
        "run",
        "()V",
    );
    builder.build()
}

fn object_class() -> Vec<u8> {
    let mut builder = ClassBuilder::new(OBJECT);
    builder
        .no_super_class()
        .method(PUBLIC, "<init>", "()V", |code| {
            code.vreturn();
        })
        .method(PUBLIC, "equals", "(Ljava/lang/Object;)Z", |code| {
            let different = code.new_label();
            code.aload(0).aload(1).branch(inst::IF_ACMPNE, different);
            code.iconst(1).ireturn();
            code.bind(different).iconst(0).ireturn();
        })
        .method(PUBLIC | MethodAccessFlag::FINAL, "wait", "()V", |code| {
            code.aload(0)
                .lconst(0)
                .invokevirtual(OBJECT, "wait", "(J)V")
                .vreturn();
        })
        .declare_method(PUBLIC_NATIVE, "hashCode", "()I")
        .declare_method(PUBLIC_NATIVE, "toString", "()Ljava/lang/String;")
        .declare_method(
            PUBLIC_NATIVE | MethodAccessFlag::FINAL,
            "getClass",
            "()Ljava/lang/Class;",
        )
        .declare_method(
            MethodAccessFlag::PROTECTED | MethodAccessFlag::NATIVE,
            "clone",
            "()Ljava/lang/Object;",
        )
        .declare_method(PUBLIC_NATIVE | MethodAccessFlag::FINAL, "wait", "(J)V")
        .declare_method(PUBLIC_NATIVE | MethodAccessFlag::FINAL, "notify", "()V")
        .declare_method(PUBLIC_NATIVE | MethodAccessFlag::FINAL, "notifyAll", "()V");
    builder.build()
}

fn class_class() -> Vec<u8> {
    let mut builder = ClassBuilder::new("java/lang/Class");
    builder
        .access(FINAL_CLASS)
        .method(MethodAccessFlag::PRIVATE, "<init>", "()V", |code| {
            code.super_init(OBJECT).vreturn();
        })
        .declare_method(PUBLIC_NATIVE, "getName", "()Ljava/lang/String;")
        .declare_method(PUBLIC_NATIVE, "isArray", "()Z")
        .declare_method(PUBLIC_NATIVE, "isInterface", "()Z")
        .declare_method(PUBLIC_NATIVE, "getSuperclass", "()Ljava/lang/Class;")
        .declare_method(PUBLIC_NATIVE, "isInstance", "(Ljava/lang/Object;)Z");
    builder.build()
}

fn string_class() -> Vec<u8> {
    let mut builder = ClassBuilder::new(STRING);
    builder
        .access(FINAL_CLASS)
        .interface("java/io/Serializable")
        .field(FieldAccessFlag::PRIVATE | FieldAccessFlag::FINAL, "value", "[C")
        .method(PUBLIC, "<init>", "()V", |code| {
            code.super_init(OBJECT)
                .aload(0)
                .iconst(0)
                .newarray(crate::consts::array_type::T_CHAR)
                .putfield(STRING, "value", "[C")
                .vreturn();
        })
        .method(PUBLIC, "<init>", "([C)V", |code| {
            code.super_init(OBJECT)
                .aload(0)
                .aload(1)
                .invokevirtual("[C", "clone", "()Ljava/lang/Object;")
                .checkcast("[C")
                .putfield(STRING, "value", "[C")
                .vreturn();
        })
        .method(PUBLIC, "length", "()I", |code| {
            code.aload(0)
                .getfield(STRING, "value", "[C")
                .arraylength()
                .ireturn();
        })
        .method(PUBLIC, "charAt", "(I)C", |code| {
            code.aload(0)
                .getfield(STRING, "value", "[C")
                .iload(1)
                .op(inst::CALOAD)
                .ireturn();
        })
        .method(PUBLIC, "hashCode", "()I", |code| {
            string_hash_code(code);
        })
        .method(PUBLIC, "toString", "()Ljava/lang/String;", |code| {
            code.aload(0).areturn();
        })
        .declare_method(PUBLIC_NATIVE, "equals", "(Ljava/lang/Object;)Z")
        .declare_method(PUBLIC_NATIVE, "intern", "()Ljava/lang/String;")
        .declare_method(
            PUBLIC_NATIVE,
            "concat",
            "(Ljava/lang/String;)Ljava/lang/String;",
        )
        .declare_method(STATIC_NATIVE, "valueOf", "(I)Ljava/lang/String;")
        .declare_method(STATIC_NATIVE, "valueOf", "(J)Ljava/lang/String;")
        .declare_method(STATIC_NATIVE, "valueOf", "(D)Ljava/lang/String;");
    builder.build()
}

/// `h = 31 * h + value[i]` over the characters.
fn string_hash_code(code: &mut CodeBuilder) {
    let top = code.new_label();
    let done = code.new_label();
    code.iconst(0).istore(1);
    code.iconst(0).istore(2);
    code.aload(0).getfield(STRING, "value", "[C").astore(3);
    code.bind(top)
        .iload(2)
        .aload(3)
        .arraylength()
        .branch(inst::IF_ICMPGE, done);
    code.iload(1)
        .iconst(31)
        .op(inst::IMUL)
        .aload(3)
        .iload(2)
        .op(inst::CALOAD)
        .op(inst::IADD)
        .istore(1);
    code.iinc(2, 1).goto(top);
    code.bind(done).iload(1).ireturn();
}

fn thread_class() -> Vec<u8> {
    let mut builder = ClassBuilder::new(THREAD);
    builder
        .interface("java/lang/Runnable")
        .field(FieldAccessFlag::PRIVATE, "name", "Ljava/lang/String;")
        .field(FieldAccessFlag::PRIVATE, "target", "Ljava/lang/Runnable;")
        .field(FieldAccessFlag::PRIVATE, "daemon", "Z")
        .method(
            PUBLIC,
            "<init>",
            "(Ljava/lang/Runnable;Ljava/lang/String;)V",
            |code| {
                code.super_init(OBJECT)
                    .aload(0)
                    .aload(1)
                    .putfield(THREAD, "target", "Ljava/lang/Runnable;")
                    .aload(0)
                    .aload(2)
                    .putfield(THREAD, "name", "Ljava/lang/String;")
                    .vreturn();
            },
        )
        .method(PUBLIC, "<init>", "()V", |code| {
            code.aload(0).aconst_null().aconst_null();
            delegate_thread_init(code);
        })
        .method(PUBLIC, "<init>", "(Ljava/lang/Runnable;)V", |code| {
            code.aload(0).aload(1).aconst_null();
            delegate_thread_init(code);
        })
        .method(PUBLIC, "<init>", "(Ljava/lang/String;)V", |code| {
            code.aload(0).aconst_null().aload(1);
            delegate_thread_init(code);
        })
        .method(PUBLIC, "run", "()V", |code| {
            let done = code.new_label();
            code.aload(0)
                .getfield(THREAD, "target", "Ljava/lang/Runnable;")
                .astore(1);
            code.aload(1).branch(inst::IFNULL, done);
            code.aload(1).invokeinterface("java/lang/Runnable", "run", "()V");
            code.bind(done).vreturn();
        })
        .method(PUBLIC, "getName", "()Ljava/lang/String;", |code| {
            code.aload(0)
                .getfield(THREAD, "name", "Ljava/lang/String;")
                .areturn();
        })
        .method(PUBLIC, "isDaemon", "()Z", |code| {
            code.aload(0).getfield(THREAD, "daemon", "Z").ireturn();
        })
        .declare_method(PUBLIC_NATIVE | MethodAccessFlag::SYNCHRONIZED, "start", "()V")
        .declare_method(PUBLIC_NATIVE, "join", "()V")
        .declare_method(PUBLIC_NATIVE, "setDaemon", "(Z)V")
        .declare_method(PUBLIC_NATIVE, "isAlive", "()Z")
        .declare_method(PUBLIC_NATIVE, "interrupt", "()V")
        .declare_method(PUBLIC_NATIVE, "isInterrupted", "()Z")
        .declare_method(PUBLIC_NATIVE, "getId", "()J")
        .declare_method(STATIC_NATIVE, "interrupted", "()Z")
        .declare_method(STATIC_NATIVE, "currentThread", "()Ljava/lang/Thread;")
        .declare_method(STATIC_NATIVE, "sleep", "(J)V")
        .declare_method(STATIC_NATIVE, "yield", "()V");
    builder.build()
}

fn delegate_thread_init(code: &mut CodeBuilder) {
    code.invokespecial(
        THREAD,
        "<init>",
        "(Ljava/lang/Runnable;Ljava/lang/String;)V",
    )
    .vreturn();
}

fn system_class() -> Vec<u8> {
    let mut builder = ClassBuilder::new("java/lang/System");
    builder
        .access(FINAL_CLASS)
        .method(MethodAccessFlag::PRIVATE, "<init>", "()V", |code| {
            code.super_init(OBJECT).vreturn();
        })
        .declare_method(
            STATIC_NATIVE,
            "arraycopy",
            "(Ljava/lang/Object;ILjava/lang/Object;II)V",
        )
        .declare_method(STATIC_NATIVE, "identityHashCode", "(Ljava/lang/Object;)I")
        .declare_method(STATIC_NATIVE, "nanoTime", "()J")
        .declare_method(STATIC_NATIVE, "currentTimeMillis", "()J")
        .declare_method(STATIC_NATIVE, "gc", "()V")
        .declare_method(STATIC_NATIVE, "loadLibrary", "(Ljava/lang/String;)V")
        .declare_method(STATIC_NATIVE, "printInt", "(I)V")
        .declare_method(STATIC_NATIVE, "printLong", "(J)V")
        .declare_method(STATIC_NATIVE, "printDouble", "(D)V")
        .declare_method(STATIC_NATIVE, "printString", "(Ljava/lang/String;)V");
    builder.build()
}

fn throwable_class() -> Vec<u8> {
    let mut builder = ClassBuilder::new(THROWABLE);
    builder
        .interface("java/io/Serializable")
        .field(FieldAccessFlag::PRIVATE, "detailMessage", "Ljava/lang/String;")
        .field(FieldAccessFlag::PRIVATE, "cause", "Ljava/lang/Throwable;")
        .method(PUBLIC, "<init>", "()V", |code| {
            code.super_init(OBJECT);
            fill_in_stack_trace(code);
        })
        .method(PUBLIC, "<init>", "(Ljava/lang/String;)V", |code| {
            code.super_init(OBJECT)
                .aload(0)
                .aload(1)
                .putfield(THROWABLE, "detailMessage", "Ljava/lang/String;");
            fill_in_stack_trace(code);
        })
        .method(
            PUBLIC,
            "<init>",
            "(Ljava/lang/String;Ljava/lang/Throwable;)V",
            |code| {
                code.super_init(OBJECT)
                    .aload(0)
                    .aload(1)
                    .putfield(THROWABLE, "detailMessage", "Ljava/lang/String;")
                    .aload(0)
                    .aload(2)
                    .putfield(THROWABLE, "cause", "Ljava/lang/Throwable;");
                fill_in_stack_trace(code);
            },
        )
        .method(PUBLIC, "getMessage", "()Ljava/lang/String;", |code| {
            code.aload(0)
                .getfield(THROWABLE, "detailMessage", "Ljava/lang/String;")
                .areturn();
        })
        .method(PUBLIC, "getCause", "()Ljava/lang/Throwable;", |code| {
            code.aload(0)
                .getfield(THROWABLE, "cause", "Ljava/lang/Throwable;")
                .areturn();
        })
        .declare_method(PUBLIC_NATIVE, "fillInStackTrace", "()Ljava/lang/Throwable;")
        .declare_method(PUBLIC_NATIVE, "printStackTrace", "()V")
        .declare_method(PUBLIC_NATIVE, "toString", "()Ljava/lang/String;");
    builder.build()
}

fn fill_in_stack_trace(code: &mut CodeBuilder) {
    code.aload(0)
        .invokevirtual(THROWABLE, "fillInStackTrace", "()Ljava/lang/Throwable;")
        .pop()
        .vreturn();
}

/// A throwable with the two usual constructors, both delegating to the
/// superclass.
fn exception_class(name: &str, super_name: &str) -> Vec<u8> {
    let mut builder = ClassBuilder::new(name);
    builder
        .super_class(super_name)
        .method(PUBLIC, "<init>", "()V", |code| {
            code.super_init(super_name).vreturn();
        })
        .method(PUBLIC, "<init>", "(Ljava/lang/String;)V", |code| {
            code.aload(0)
                .aload(1)
                .invokespecial(super_name, "<init>", "(Ljava/lang/String;)V")
                .vreturn();
        });
    builder.build()
}

/// Core classes and field slots the engine touches directly.
#[derive(Debug)]
pub(crate) struct FamousClasses {
    pub(crate) class: Arc<Class>,
    pub(crate) string: Arc<Class>,
    pub(crate) char_array: Arc<Class>,
    pub(crate) string_array: Arc<Class>,
    pub(crate) thread: Arc<Class>,
    pub(crate) string_value: u16,
    pub(crate) thread_name: u16,
    pub(crate) thread_daemon: u16,
    pub(crate) throwable_message: u16,
    pub(crate) throwable_cause: u16,
}

impl FamousClasses {
    pub(crate) fn resolve(registry: &ClassRegistry) -> VmResult<Self> {
        let string = registry.resolve(STRING)?;
        let thread = registry.resolve(THREAD)?;
        let throwable = registry.resolve(THROWABLE)?;
        for &(name, _) in THROWABLES {
            registry.resolve(name)?;
        }
        Ok(Self {
            class: registry.resolve("java/lang/Class")?,
            char_array: registry.resolve("[C")?,
            string_array: registry.resolve("[Ljava/lang/String;")?,
            string_value: field_slot(&string, "value")?,
            thread_name: field_slot(&thread, "name")?,
            thread_daemon: field_slot(&thread, "daemon")?,
            throwable_message: field_slot(&throwable, "detailMessage")?,
            throwable_cause: field_slot(&throwable, "cause")?,
            string,
            thread,
        })
    }
}

fn field_slot(class: &Class, name: &str) -> VmResult<u16> {
    class
        .instance_field(name)
        .map(|f| f.slot)
        .ok_or_else(|| {
            LinkageError::NoSuchField {
                class: class.name.to_string(),
                name: name.to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_classes_verify() {
        let registry = ClassRegistry::new(vec![Box::new(BootstrapSource::new())]);
        for name in BootstrapSource::class_names() {
            let class = registry.resolve(name).unwrap();
            assert!(class.is_linked(), "{name}");
        }
        let famous = FamousClasses::resolve(&registry).unwrap();
        assert_eq!(famous.string.instance_slots, 1);
        assert!(famous.thread.all_interfaces.contains("java/lang/Runnable"));
    }

    #[test]
    fn test_exception_hierarchy() {
        let registry = ClassRegistry::new(vec![Box::new(BootstrapSource::new())]);
        let aioobe = registry
            .resolve("java/lang/ArrayIndexOutOfBoundsException")
            .unwrap();
        let names: Vec<_> = std::iter::successors(Some(aioobe), |c| c.super_class.clone())
            .map(|c| c.name.to_string())
            .collect();
        assert_eq!(
            names,
            [
                "java/lang/ArrayIndexOutOfBoundsException",
                "java/lang/IndexOutOfBoundsException",
                "java/lang/RuntimeException",
                "java/lang/Exception",
                THROWABLE,
                OBJECT
            ]
        );
    }
}
