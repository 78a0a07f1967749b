mod common;

use std::time::{Duration, Instant};

use common::{call_int, config, thrown_class, vm, vm_with};
use jvm_engine::{
    Value, VmConfig,
    class::ClassBuilder,
    consts::{FieldAccessFlag, MethodAccessFlag},
    runtime::instructions as inst,
};

const THREAD: &str = "java/lang/Thread";
const OBJECT: &str = "java/lang/Object";
const LOCK: &str = "Ljava/lang/Object;";
const STATIC: MethodAccessFlag = MethodAccessFlag::PUBLIC.union(MethodAccessFlag::STATIC);

/// `Worker extends Thread`; `run` bumps `counter` while holding the class
/// lock. `spawn(n)` starts n workers, joins them all and returns `counter`.
fn worker() -> ClassBuilder {
    let mut class = ClassBuilder::new("Worker");
    class
        .super_class(THREAD)
        .field(FieldAccessFlag::STATIC, "counter", "I")
        .method(MethodAccessFlag::PUBLIC, "<init>", "()V", |code| {
            code.super_init(THREAD).vreturn();
        })
        .method(MethodAccessFlag::PUBLIC, "run", "()V", |code| {
            code.ldc_class("Worker").dup().astore(1).monitorenter();
            code.getstatic("Worker", "counter", "I").iconst(1).op(inst::IADD);
            code.putstatic("Worker", "counter", "I");
            code.aload(1).monitorexit().vreturn();
        })
        .method(STATIC, "spawn", "(I)I", |code| {
            code.iload(0).anewarray("Worker").astore(1);

            let start = code.new_label();
            let started = code.new_label();
            code.iconst(0).istore(2);
            code.bind(start).iload(2).iload(0).branch(inst::IF_ICMPGE, started);
            code.aload(1).iload(2).new_object("Worker").dup();
            code.invokespecial("Worker", "<init>", "()V").op(inst::AASTORE);
            code.aload(1).iload(2).op(inst::AALOAD).invokevirtual("Worker", "start", "()V");
            code.iinc(2, 1).goto(start);

            let join = code.new_label();
            let joined = code.new_label();
            code.bind(started).iconst(0).istore(2);
            code.bind(join).iload(2).iload(0).branch(inst::IF_ICMPGE, joined);
            code.aload(1).iload(2).op(inst::AALOAD).invokevirtual("Worker", "join", "()V");
            code.iinc(2, 1).goto(join);

            code.bind(joined).getstatic("Worker", "counter", "I").ireturn();
        })
        // starting a thread twice throws
        .method(STATIC, "restart", "()V", |code| {
            code.new_object("Worker").dup().invokespecial("Worker", "<init>", "()V").astore(0);
            code.aload(0).invokevirtual("Worker", "start", "()V");
            code.aload(0).invokevirtual("Worker", "join", "()V");
            code.aload(0).invokevirtual("Worker", "start", "()V");
            code.vreturn();
        })
        .method(STATIC, "aliveAfterJoin", "()Z", |code| {
            code.new_object("Worker").dup().invokespecial("Worker", "<init>", "()V").astore(0);
            code.aload(0).invokevirtual("Worker", "start", "()V");
            code.aload(0).invokevirtual("Worker", "join", "()V");
            code.aload(0).invokevirtual("Worker", "isAlive", "()Z").ireturn();
        });
    class
}

#[test]
fn test_ten_thousand_threads() {
    let vm = vm_with(
        VmConfig {
            thread_stack_size: 256 << 10,
            ..config()
        },
        &[("Worker", &worker())],
    );
    let mut ctx = vm.attach_current_thread("test");
    let count = call_int(&mut ctx, "Worker", "spawn", "(I)I", &[Value::Int(10_000)]);
    assert_eq!(count, 10_000);
}

#[test]
fn test_thread_lifecycle() {
    let vm = vm(&[("Worker", &worker())]);
    let mut ctx = vm.attach_current_thread("test");

    let alive = ctx.invoke_static("Worker", "aliveAfterJoin", "()Z", &[]);
    assert_eq!(alive, Ok(Some(Value::Int(0))));

    let result = ctx.invoke_static("Worker", "restart", "()V", &[]);
    assert_eq!(
        thrown_class(&ctx, result),
        "java.lang.IllegalThreadStateException"
    );
}

/// `Mon.test()` enters `lock` three times, starts a `Taker` that wants the
/// same lock, and exits twice. The taker must still be blocked then;
/// only the third exit lets it set `flag`. Returns
/// `flag seen before the last exit * 10 + flag after joining`.
fn reentrant_classes() -> (ClassBuilder, ClassBuilder) {
    let mut mon = ClassBuilder::new("Mon");
    mon.field(FieldAccessFlag::STATIC, "lock", "Ljava/lang/Object;")
        .field(FieldAccessFlag::STATIC | FieldAccessFlag::VOLATILE, "flag", "I")
        .method(STATIC, "pause", "()V", |code| {
            code.lconst(50).invokestatic(THREAD, "sleep", "(J)V").vreturn();
        })
        .method(STATIC, "test", "()I", |code| {
            code.new_object("java/lang/Object").dup();
            code.invokespecial("java/lang/Object", "<init>", "()V");
            code.putstatic("Mon", "lock", "Ljava/lang/Object;");
            for _ in 0..3 {
                code.getstatic("Mon", "lock", "Ljava/lang/Object;").monitorenter();
            }

            code.new_object("Taker").dup().invokespecial("Taker", "<init>", "()V").astore(0);
            code.aload(0).invokevirtual("Taker", "start", "()V");
            code.invokestatic("Mon", "pause", "()V");

            for _ in 0..2 {
                code.getstatic("Mon", "lock", "Ljava/lang/Object;").monitorexit();
            }
            code.invokestatic("Mon", "pause", "()V");
            code.getstatic("Mon", "flag", "I").istore(1);
            code.getstatic("Mon", "lock", "Ljava/lang/Object;").monitorexit();

            code.aload(0).invokevirtual("Taker", "join", "()V");
            code.iload(1).iconst(10).op(inst::IMUL);
            code.getstatic("Mon", "flag", "I").op(inst::IADD).ireturn();
        });

    let mut taker = ClassBuilder::new("Taker");
    taker
        .super_class(THREAD)
        .method(MethodAccessFlag::PUBLIC, "<init>", "()V", |code| {
            code.super_init(THREAD).vreturn();
        })
        .method(MethodAccessFlag::PUBLIC, "run", "()V", |code| {
            code.getstatic("Mon", "lock", "Ljava/lang/Object;").monitorenter();
            code.iconst(1).putstatic("Mon", "flag", "I");
            code.getstatic("Mon", "lock", "Ljava/lang/Object;").monitorexit();
            code.vreturn();
        });
    (mon, taker)
}

#[test]
fn test_monitor_is_reentrant() {
    let (mon, taker) = reentrant_classes();
    let vm = vm(&[("Mon", &mon), ("Taker", &taker)]);
    let mut ctx = vm.attach_current_thread("test");
    assert_eq!(call_int(&mut ctx, "Mon", "test", "()I", &[]), 1);
}

/// `Sleeper.run` sleeps for a minute unless interrupted, recording
/// `InterruptedException` in `woken`.
fn sleeper() -> ClassBuilder {
    let mut class = ClassBuilder::new("Sleeper");
    class
        .super_class(THREAD)
        .field(FieldAccessFlag::STATIC | FieldAccessFlag::VOLATILE, "woken", "I")
        .method(MethodAccessFlag::PUBLIC, "<init>", "()V", |code| {
            code.super_init(THREAD).vreturn();
        })
        .method(MethodAccessFlag::PUBLIC, "run", "()V", |code| {
            let start = code.new_label();
            let end = code.new_label();
            let handler = code.new_label();
            code.bind(start).lconst(60_000).invokestatic(THREAD, "sleep", "(J)V");
            code.bind(end).vreturn();
            code.bind(handler).pop().iconst(1).putstatic("Sleeper", "woken", "I").vreturn();
            code.try_catch(start, end, handler, Some("java/lang/InterruptedException"));
        })
        .method(STATIC, "interruptSleeper", "()I", |code| {
            code.new_object("Sleeper").dup().invokespecial("Sleeper", "<init>", "()V").astore(0);
            code.aload(0).invokevirtual("Sleeper", "start", "()V");
            code.lconst(20).invokestatic(THREAD, "sleep", "(J)V");
            code.aload(0).invokevirtual("Sleeper", "interrupt", "()V");
            code.aload(0).invokevirtual("Sleeper", "join", "()V");
            code.getstatic("Sleeper", "woken", "I").ireturn();
        });
    class
}

#[test]
fn test_interrupt_wakes_sleeper() {
    let vm = vm(&[("Sleeper", &sleeper())]);
    let mut ctx = vm.attach_current_thread("test");
    assert_eq!(call_int(&mut ctx, "Sleeper", "interruptSleeper", "()I", &[]), 1);
}

#[test]
fn test_rust_threads_share_a_vm() {
    let vm = vm(&[("Worker", &worker())]);
    std::thread::scope(|scope| {
        for index in 0..4 {
            let vm = &vm;
            scope.spawn(move || {
                let mut ctx = vm.attach_current_thread(&format!("host-{index}"));
                ctx.invoke_static("Worker", "spawn", "(I)I", &[Value::Int(25)])
                    .expect("spawn returns");
            });
        }
    });
    let mut ctx = vm.attach_current_thread("test");
    let count = call_int(&mut ctx, "Worker", "spawn", "(I)I", &[Value::Int(0)]);
    assert_eq!(count, 100);
}

/// `Waiter.run` takes `Latch.lock` twice and waits on it until `Latch.ready`
/// is set, then releases it twice and sets `Latch.woken`. The releases only
/// succeed if `wait` gave back both holds.
fn latch_classes() -> (ClassBuilder, ClassBuilder) {
    let mut latch = ClassBuilder::new("Latch");
    latch
        .field(FieldAccessFlag::STATIC, "lock", LOCK)
        .field(FieldAccessFlag::STATIC | FieldAccessFlag::VOLATILE, "ready", "I")
        .field(FieldAccessFlag::STATIC | FieldAccessFlag::VOLATILE, "woken", "I")
        // starts a waiter, signals it under the lock and joins it
        .method(STATIC, "signal", "()I", |code| {
            code.new_object(OBJECT).dup().invokespecial(OBJECT, "<init>", "()V");
            code.putstatic("Latch", "lock", LOCK);
            code.new_object("Waiter").dup().invokespecial("Waiter", "<init>", "()V").astore(0);
            code.aload(0).invokevirtual("Waiter", "start", "()V");
            code.lconst(50).invokestatic(THREAD, "sleep", "(J)V");

            code.getstatic("Latch", "lock", LOCK).dup().astore(1).monitorenter();
            code.iconst(1).putstatic("Latch", "ready", "I");
            code.aload(1).invokevirtual(OBJECT, "notifyAll", "()V");
            code.aload(1).monitorexit();

            code.aload(0).invokevirtual("Waiter", "join", "()V");
            code.getstatic("Latch", "woken", "I").ireturn();
        })
        // waits on an object nobody notifies
        .method(STATIC, "timedWait", "(J)V", |code| {
            code.new_object(OBJECT).dup().invokespecial(OBJECT, "<init>", "()V").astore(2);
            code.aload(2).monitorenter();
            code.aload(2).lload(0).invokevirtual(OBJECT, "wait", "(J)V");
            code.aload(2).monitorexit().vreturn();
        })
        .method(STATIC, "unownedNotify", "()V", |code| {
            code.new_object(OBJECT).dup().invokespecial(OBJECT, "<init>", "()V");
            code.invokevirtual(OBJECT, "notify", "()V").vreturn();
        })
        .method(STATIC, "unownedWait", "()V", |code| {
            code.new_object(OBJECT).dup().invokespecial(OBJECT, "<init>", "()V");
            code.invokevirtual(OBJECT, "wait", "()V").vreturn();
        });

    let mut waiter = ClassBuilder::new("Waiter");
    waiter
        .super_class(THREAD)
        .method(MethodAccessFlag::PUBLIC, "<init>", "()V", |code| {
            code.super_init(THREAD).vreturn();
        })
        .method(MethodAccessFlag::PUBLIC, "run", "()V", |code| {
            let check = code.new_label();
            let ready = code.new_label();
            code.getstatic("Latch", "lock", LOCK).astore(1);
            code.aload(1).monitorenter().aload(1).monitorenter();
            code.bind(check).getstatic("Latch", "ready", "I").branch(inst::IFNE, ready);
            code.aload(1).invokevirtual(OBJECT, "wait", "()V").goto(check);
            code.bind(ready).aload(1).monitorexit().aload(1).monitorexit();
            code.iconst(1).putstatic("Latch", "woken", "I").vreturn();
        });
    (latch, waiter)
}

#[test]
fn test_wait_and_notify_all() {
    let (latch, waiter) = latch_classes();
    let vm = vm(&[("Latch", &latch), ("Waiter", &waiter)]);
    let mut ctx = vm.attach_current_thread("test");
    assert_eq!(call_int(&mut ctx, "Latch", "signal", "()I", &[]), 1);
}

#[test]
fn test_timed_wait_returns() {
    let (latch, waiter) = latch_classes();
    let vm = vm(&[("Latch", &latch), ("Waiter", &waiter)]);
    let mut ctx = vm.attach_current_thread("test");
    let started = Instant::now();
    let result = ctx.invoke_static("Latch", "timedWait", "(J)V", &[Value::Long(30)]);
    assert_eq!(result, Ok(None));
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[test]
fn test_monitor_calls_need_ownership() {
    let (latch, waiter) = latch_classes();
    let vm = vm(&[("Latch", &latch), ("Waiter", &waiter)]);
    let mut ctx = vm.attach_current_thread("test");
    for method in ["unownedNotify", "unownedWait"] {
        let result = ctx.invoke_static("Latch", method, "()V", &[]);
        assert_eq!(
            thrown_class(&ctx, result),
            "java.lang.IllegalMonitorStateException",
            "{method}"
        );
    }
}
