mod common;

use common::{call_int, config, thrown_class, vm_with};
use jvm_engine::{
    GcStrategy, Value, VmConfig,
    class::ClassBuilder,
    consts::{MethodAccessFlag, array_type},
    runtime::instructions as inst,
};

const STATIC: MethodAccessFlag = MethodAccessFlag::PUBLIC.union(MethodAccessFlag::STATIC);

fn small_heap(gc: GcStrategy) -> VmConfig {
    VmConfig {
        heap_size: 1 << 20,
        tlab_size: 4 << 10,
        gc,
        gc_threads: 4,
        ..config()
    }
}

fn garbage() -> ClassBuilder {
    let mut class = ClassBuilder::new("Garbage");
    class
        // allocates n int[64] and drops each; returns the summed lengths
        .method(STATIC, "churn", "(I)I", |code| {
            let top = code.new_label();
            let done = code.new_label();
            code.iconst(0).istore(1).iconst(0).istore(2);
            code.bind(top).iload(2).iload(0).branch(inst::IF_ICMPGE, done);
            code.iconst(64).newarray(array_type::T_INT).arraylength();
            code.iload(1).op(inst::IADD).istore(1);
            code.iinc(2, 1).goto(top);
            code.bind(done).iload(1).ireturn();
        })
        // a linked list of Object[2] that grows until allocation fails
        .method(STATIC, "hoard", "()V", |code| {
            let top = code.new_label();
            code.aconst_null().astore(0);
            code.bind(top).iconst(2).anewarray("java/lang/Object").astore(1);
            code.aload(1).iconst(0).aload(0).op(inst::AASTORE);
            code.aload(1).astore(0).goto(top);
        })
        // an array only a frame refers to survives collections
        .method(STATIC, "keep", "()I", |code| {
            code.iconst(1).newarray(array_type::T_INT).astore(0);
            code.aload(0).iconst(0).iconst(42).op(inst::IASTORE);
            code.iconst(5000).invokestatic("Garbage", "churn", "(I)I").pop();
            code.aload(0).iconst(0).op(inst::IALOAD).ireturn();
        });
    class
}

#[test]
fn test_churn_collects() {
    for gc in [GcStrategy::Serial, GcStrategy::Parallel] {
        let vm = vm_with(small_heap(gc), &[("Garbage", &garbage())]);
        let mut ctx = vm.attach_current_thread("test");
        let total = call_int(&mut ctx, "Garbage", "churn", "(I)I", &[Value::Int(10_000)]);
        assert_eq!(total, 640_000);
        let stats = vm.gc_stats();
        assert!(stats.collections > 0, "{gc:?}: {stats:?}");
        assert!(stats.reclaimed_objects > 0);
    }
}

#[test]
fn test_frame_references_survive() {
    let vm = vm_with(small_heap(GcStrategy::Serial), &[("Garbage", &garbage())]);
    let mut ctx = vm.attach_current_thread("test");
    assert_eq!(call_int(&mut ctx, "Garbage", "keep", "()I", &[]), 42);
    assert!(vm.gc_stats().collections > 0);
}

#[test]
fn test_exhaustion_throws_and_recovers() {
    let vm = vm_with(small_heap(GcStrategy::Serial), &[("Garbage", &garbage())]);
    let mut ctx = vm.attach_current_thread("test");
    let result = ctx.invoke_static("Garbage", "hoard", "()V", &[]);
    assert_eq!(thrown_class(&ctx, result), "java.lang.OutOfMemoryError");
    ctx.clear_locals();

    // the list died with the frame
    let total = call_int(&mut ctx, "Garbage", "churn", "(I)I", &[Value::Int(100)]);
    assert_eq!(total, 6400);
}

#[test]
fn test_epsilon_never_collects() {
    let vm = vm_with(small_heap(GcStrategy::Epsilon), &[("Garbage", &garbage())]);
    let mut ctx = vm.attach_current_thread("test");
    let result = ctx.invoke_static("Garbage", "churn", "(I)I", &[Value::Int(100_000)]);
    assert_eq!(thrown_class(&ctx, result), "java.lang.OutOfMemoryError");
    assert_eq!(vm.gc_stats().collections, 0);
}

#[test]
fn test_context_references_are_roots() {
    let vm = vm_with(small_heap(GcStrategy::Serial), &[]);
    let mut ctx = vm.attach_current_thread("test");
    let string = ctx.new_string("held").unwrap();

    ctx.collect_garbage().expect("collection ran");
    assert!(ctx.is_live(string));
    assert_eq!(ctx.string_value(string).as_deref(), Some("held"));

    ctx.clear_locals();
    ctx.collect_garbage().expect("collection ran");
    assert!(!ctx.is_live(string));
}
