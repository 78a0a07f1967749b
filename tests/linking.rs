mod common;

use std::{fs::File, io::Write};

use common::{call_int, config, thrown_class, vm, vm_with};
use jvm_engine::{
    Exception, LinkageError, LoadingError, MainError, Vm, VmConfig, VmError,
    class::ClassBuilder,
    consts::MethodAccessFlag,
    runtime::instructions as inst,
};
use zip::{ZipWriter, write::SimpleFileOptions};

const STATIC: MethodAccessFlag = MethodAccessFlag::PUBLIC.union(MethodAccessFlag::STATIC);
const MAIN: &str = "([Ljava/lang/String;)V";

/// `Bad.broken()` adds two ints it never pushed.
fn bad() -> ClassBuilder {
    let mut class = ClassBuilder::new("Bad");
    class.method(STATIC, "broken", "()V", |code| {
        code.op(inst::IADD).vreturn();
    });
    class
}

fn caller() -> ClassBuilder {
    let mut class = ClassBuilder::new("Caller");
    class.method(STATIC, "call", "()V", |code| {
        code.invokestatic("Bad", "broken", "()V").vreturn();
    });
    class
}

#[test]
fn test_verify_failure() {
    let vm = vm(&[("Bad", &bad()), ("Caller", &caller())]);
    let mut ctx = vm.attach_current_thread("test");

    let result = ctx.invoke_static("Bad", "broken", "()V", &[]);
    assert!(
        matches!(
            result,
            Err(Exception::Vm(VmError::Linkage(LinkageError::Verify { .. })))
        ),
        "{result:?}"
    );
    assert!(!vm.registry().find_loaded("Bad").is_some_and(|c| c.is_linked()));

    // running code sees the failure as a catchable error
    let result = ctx.invoke_static("Caller", "call", "()V", &[]);
    assert_eq!(thrown_class(&ctx, result), "java.lang.VerifyError");
}

/// `Main.main` calls `fail`, which throws with a message.
fn throwing_main() -> ClassBuilder {
    let mut class = ClassBuilder::new("Main");
    class
        .source_file("Main.java")
        .method(STATIC, "main", MAIN, |code| {
            code.line(3).invokestatic("Main", "fail", "()V");
            code.line(4).vreturn();
        })
        .method(STATIC, "fail", "()V", |code| {
            let exception = "java/lang/IllegalArgumentException";
            code.line(8).new_object(exception).dup().ldc_string("boom");
            code.invokespecial(exception, "<init>", "(Ljava/lang/String;)V");
            code.line(9).athrow();
        });
    class
}

#[test]
fn test_uncaught_exception_in_main() {
    let vm = vm(&[("Main", &throwing_main())]);
    let err = vm.run_main("Main", &[]).unwrap_err();
    assert_eq!(err.exit_code(), 1);
    let MainError::Uncaught { class, report } = &err else {
        panic!("unexpected {err:?}");
    };
    assert_eq!(class, "java.lang.IllegalArgumentException");
    assert!(
        report.starts_with("java.lang.IllegalArgumentException: boom\n"),
        "{report}"
    );
    assert!(report.contains("\tat Main.fail(Main.java:8)\n"), "{report}");
    assert!(report.contains("\tat Main.main(Main.java:3)\n"), "{report}");
    assert!(err.to_string().starts_with("Exception in thread \"main\" java.lang."));
}

#[test]
fn test_startup_failures() {
    let mut no_main = ClassBuilder::new("NoMain");
    no_main.method(STATIC, "helper", "()V", |code| {
        code.vreturn();
    });
    let mut future = ClassBuilder::new("Future").build();
    // major version 70
    future[6..8].copy_from_slice(&70u16.to_be_bytes());
    let source = jvm_engine::runtime::MemorySource::new("test")
        .with_class("NoMain", no_main.build())
        .with_class("Future", future);
    let vm = Vm::with_sources(config(), vec![Box::new(source)]).unwrap();

    let err = vm.run_main("Missing", &[]).unwrap_err();
    assert!(matches!(err, MainError::Startup(VmError::Loading(LoadingError::NotFound(_)))));
    assert_eq!(err.exit_code(), 2);

    let err = vm.run_main("NoMain", &[]).unwrap_err();
    assert!(matches!(
        err,
        MainError::Startup(VmError::Linkage(LinkageError::NoSuchMethod { .. }))
    ));
    assert_eq!(err.exit_code(), 2);

    let err = vm.run_main("Future", &[]).unwrap_err();
    assert!(matches!(
        err,
        MainError::Startup(VmError::Loading(LoadingError::UnsupportedVersion { major: 70, .. }))
    ));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn test_heap_too_small_to_start() {
    let result = Vm::with_sources(
        VmConfig {
            heap_size: 16,
            ..config()
        },
        Vec::new(),
    );
    let err = result.err().expect("startup fails");
    assert!(matches!(err, VmError::ResourceExhaustion(_)), "{err:?}");
    assert_eq!(MainError::Startup(err).exit_code(), 3);
}

#[test]
fn test_stack_overflow_is_catchable() {
    let mut deep = ClassBuilder::new("Deep");
    deep.method(STATIC, "recurse", "()V", |code| {
        code.invokestatic("Deep", "recurse", "()V").vreturn();
    });
    deep.method(STATIC, "guarded", "()I", |code| {
        let start = code.new_label();
        let end = code.new_label();
        let handler = code.new_label();
        code.bind(start).invokestatic("Deep", "recurse", "()V");
        code.bind(end).iconst(0).ireturn();
        code.bind(handler).pop().iconst(1).ireturn();
        code.try_catch(start, end, handler, Some("java/lang/StackOverflowError"));
    });
    let vm = vm_with(
        VmConfig {
            max_stack_depth: 200,
            ..config()
        },
        &[("Deep", &deep)],
    );
    let mut ctx = vm.attach_current_thread("test");
    assert_eq!(call_int(&mut ctx, "Deep", "guarded", "()I", &[]), 1);
    let result = ctx.invoke_static("Deep", "recurse", "()V", &[]);
    assert_eq!(thrown_class(&ctx, result), "java.lang.StackOverflowError");
}

/// `app.Hello.main` stores `lib.Util.value() + args.length` in `result`.
fn hello() -> ClassBuilder {
    let mut class = ClassBuilder::new("app/Hello");
    class
        .field(jvm_engine::consts::FieldAccessFlag::STATIC, "result", "I")
        .method(STATIC, "main", MAIN, |code| {
            code.invokestatic("lib/Util", "value", "()I");
            code.aload(0).arraylength().op(inst::IADD);
            code.putstatic("app/Hello", "result", "I").vreturn();
        })
        .method(STATIC, "result", "()I", |code| {
            code.getstatic("app/Hello", "result", "I").ireturn();
        });
    class
}

fn util() -> ClassBuilder {
    let mut class = ClassBuilder::new("lib/Util");
    class.method(STATIC, "value", "()I", |code| {
        code.iconst(40).ireturn();
    });
    class
}

#[test]
fn test_class_path_directory_and_jar() {
    let dir = tempfile::tempdir().unwrap();
    let classes = dir.path().join("classes");
    std::fs::create_dir_all(classes.join("app")).unwrap();
    std::fs::write(classes.join("app/Hello.class"), hello().build()).unwrap();

    let jar = dir.path().join("util.jar");
    let mut writer = ZipWriter::new(File::create(&jar).unwrap());
    writer
        .start_file("lib/Util.class", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(&util().build()).unwrap();
    writer.finish().unwrap();

    let vm = Vm::new(VmConfig {
        class_path: vec![classes, jar],
        ..config()
    })
    .unwrap();
    vm.run_main("app.Hello", &["a".to_string(), "b".to_string()])
        .unwrap();

    let mut ctx = vm.attach_current_thread("test");
    assert_eq!(call_int(&mut ctx, "app/Hello", "result", "()I", &[]), 42);
    assert!(vm.registry().find_loaded("lib/Util").is_some());
}
