mod common;

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};

use common::{call_int, config, thrown_class, vm, vm_with};
use jvm_engine::{
    LinkageError, NativeEnv, NativeLibrary, NativeResult, Value, VmConfig, VmError,
    class::ClassBuilder,
    consts::MethodAccessFlag,
    runtime::instructions as inst,
};

const STATIC: MethodAccessFlag = MethodAccessFlag::PUBLIC.union(MethodAccessFlag::STATIC);
const NATIVE: MethodAccessFlag = STATIC.union(MethodAccessFlag::NATIVE);
const STRING: &str = "Ljava/lang/String;";

fn demo() -> ClassBuilder {
    let mut class = ClassBuilder::new("Demo");
    class
        .declare_method(NATIVE, "twice", "(I)I")
        .declare_method(NATIVE, "greet", "(Ljava/lang/String;)Ljava/lang/String;")
        .declare_method(NATIVE, "squares", "(I)[I")
        .declare_method(NATIVE, "checked", "(I)I")
        .declare_method(NATIVE, "unbound", "()V")
        .method(STATIC, "load", "()V", |code| {
            code.ldc_string("demo");
            code.invokestatic("java/lang/System", "loadLibrary", "(Ljava/lang/String;)V");
            code.vreturn();
        })
        .method(STATIC, "square", "(I)I", |code| {
            code.iload(0).iload(0).op(inst::IMUL).ireturn();
        })
        // the sum of squares(n)
        .method(STATIC, "sumSquares", "(I)I", |code| {
            let top = code.new_label();
            let done = code.new_label();
            code.iload(0).invokestatic("Demo", "squares", "(I)[I").astore(1);
            code.iconst(0).istore(2).iconst(0).istore(3);
            code.bind(top).iload(3).aload(1).arraylength().branch(inst::IF_ICMPGE, done);
            code.iload(2).aload(1).iload(3).op(inst::IALOAD).op(inst::IADD).istore(2);
            code.iinc(3, 1).goto(top);
            code.bind(done).iload(2).ireturn();
        });
    class
}

fn twice(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    Ok(Some(Value::Int(env.int_arg(0)?.wrapping_mul(2))))
}

fn greet(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let name = env.reference_arg(0)?;
    let Some(name) = env.string_value(name) else {
        return Err(env.null_pointer());
    };
    let greeting = env.new_string(&format!("hello, {name}"))?;
    Ok(Some(Value::Reference(greeting)))
}

// squares are computed by calling back into Demo.square
fn squares(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let length = env.int_arg(0)?;
    let array = env.new_array("[I", length)?;
    for index in 0..length {
        let square = env.call_static("Demo", "square", "(I)I", &[Value::Int(index)])?;
        env.set_array_element(array, index, square.unwrap_or(Value::Int(0)))?;
    }
    Ok(Some(Value::Reference(array)))
}

fn checked(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let value = env.int_arg(0)?;
    if value < 0 {
        return Err(env.throw("java/lang/IllegalArgumentException", Some("negative")));
    }
    Ok(Some(Value::Int(value)))
}

fn library() -> NativeLibrary {
    let mut library = NativeLibrary::new("demo");
    library
        .register("Demo", "twice", "(I)I", twice)
        .register("Demo", "greet", &format!("({STRING}){STRING}"), greet)
        .register("Demo", "squares", "(I)[I", squares)
        .register("Demo", "checked", "(I)I", checked);
    library
}

#[test]
fn test_library_binds_after_load() {
    let vm = vm(&[("Demo", &demo())]);
    vm.register_library(library());
    let mut ctx = vm.attach_current_thread("test");

    let result = ctx.invoke_static("Demo", "twice", "(I)I", &[Value::Int(21)]);
    assert_eq!(thrown_class(&ctx, result), "java.lang.UnsatisfiedLinkError");

    ctx.invoke_static("Demo", "load", "()V", &[]).unwrap();
    assert_eq!(call_int(&mut ctx, "Demo", "twice", "(I)I", &[Value::Int(21)]), 42);

    // declared but never registered
    let result = ctx.invoke_static("Demo", "unbound", "()V", &[]);
    assert_eq!(thrown_class(&ctx, result), "java.lang.UnsatisfiedLinkError");
}

#[test]
fn test_natives_use_the_environment() {
    let vm = vm(&[("Demo", &demo())]);
    vm.register_library(library());
    vm.load_library("demo").unwrap();
    let mut ctx = vm.attach_current_thread("test");

    let name = ctx.new_string("world").unwrap();
    let greeting = ctx
        .invoke_static("Demo", "greet", "(Ljava/lang/String;)Ljava/lang/String;", &[Value::Reference(name)])
        .unwrap()
        .and_then(|v| v.get_reference())
        .unwrap();
    assert_eq!(ctx.string_value(greeting).as_deref(), Some("hello, world"));

    let result = ctx.invoke_static(
        "Demo",
        "greet",
        "(Ljava/lang/String;)Ljava/lang/String;",
        &[Value::Reference(0)],
    );
    assert_eq!(thrown_class(&ctx, result), "java.lang.NullPointerException");

    // 0 + 1 + 4 + 9 + 16
    assert_eq!(call_int(&mut ctx, "Demo", "sumSquares", "(I)I", &[Value::Int(5)]), 30);

    assert_eq!(call_int(&mut ctx, "Demo", "checked", "(I)I", &[Value::Int(3)]), 3);
    let result = ctx.invoke_static("Demo", "checked", "(I)I", &[Value::Int(-3)]);
    assert_eq!(thrown_class(&ctx, result), "java.lang.IllegalArgumentException");
}

#[test]
fn test_unknown_libraries() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(format!("{DLL_PREFIX}foreign{DLL_SUFFIX}")), b"\x7fELF").unwrap();
    let vm = vm_with(
        VmConfig {
            native_library_path: vec![dir.path().to_path_buf()],
            ..config()
        },
        &[],
    );

    match vm.load_library("missing") {
        Err(VmError::Linkage(LinkageError::UnsatisfiedLink(message))) => {
            assert!(message.contains("no missing in library path"), "{message}")
        }
        other => panic!("unexpected {other:?}"),
    }
    match vm.load_library("foreign") {
        Err(VmError::Linkage(LinkageError::UnsatisfiedLink(message))) => {
            assert!(message.contains("cannot load a foreign library"), "{message}")
        }
        other => panic!("unexpected {other:?}"),
    }
    // the core library is always there
    vm.load_library("java").unwrap();
}
