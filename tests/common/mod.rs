#![allow(dead_code)]

use jvm_engine::{
    Exception, ThreadContext, Value, Vm, VmConfig,
    class::ClassBuilder,
    runtime::MemorySource,
};

/// Interpreter only, with a heap large enough that tests not about memory
/// never collect.
pub fn config() -> VmConfig {
    VmConfig {
        jit_threshold: 0,
        heap_size: 32 << 20,
        ..VmConfig::default()
    }
}

pub fn vm_with(config: VmConfig, classes: &[(&str, &ClassBuilder)]) -> Vm {
    let source = classes
        .iter()
        .fold(MemorySource::new("test"), |source, (name, builder)| {
            source.with_class(*name, builder.build())
        });
    Vm::with_sources(config, vec![Box::new(source)]).expect("vm starts")
}

pub fn vm(classes: &[(&str, &ClassBuilder)]) -> Vm {
    vm_with(config(), classes)
}

pub fn call_int(ctx: &mut ThreadContext, class: &str, name: &str, desc: &str, args: &[Value]) -> i32 {
    match ctx.invoke_static(class, name, desc, args) {
        Ok(Some(Value::Int(value))) => value,
        other => panic!("{class}.{name}{desc} returned {other:?}"),
    }
}

/// Binary class name of a thrown exception.
pub fn thrown_class(ctx: &ThreadContext, result: Result<Option<Value>, Exception>) -> String {
    match result {
        Err(Exception::Java(throwable)) => ctx.class_name(throwable).expect("throwable is live"),
        other => panic!("expected a java exception, got {other:?}"),
    }
}
