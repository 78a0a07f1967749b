mod common;

use std::time::Duration;

use common::vm;
use jvm_engine::{
    Value,
    class::ClassBuilder,
    consts::{FieldAccessFlag, MethodAccessFlag},
    runtime::{
        DebugCommand, DebugError, DebugReply, EventKind, EventMask, ThreadState,
        instructions as inst,
    },
};

const STATIC: MethodAccessFlag = MethodAccessFlag::PUBLIC.union(MethodAccessFlag::STATIC);
const TIMEOUT: Duration = Duration::from_secs(10);

/// Builds `Target`, returning it with the pcs the tests stop at: the load
/// of the product in `compute` and the field read in `boxed`.
fn target() -> (ClassBuilder, u32, u32) {
    let mut compute_pc = 0;
    let mut boxed_pc = 0;
    let mut class = ClassBuilder::new("Target");
    class
        .source_file("Target.java")
        .field(FieldAccessFlag::PUBLIC, "value", "I")
        .method(MethodAccessFlag::PUBLIC, "<init>", "()V", |code| {
            code.super_init("java/lang/Object").vreturn();
        })
        // int product = x * 2; return product;
        .method(STATIC, "compute", "(I)I", |code| {
            code.line(5).iload(0).iconst(2).op(inst::IMUL).istore(1);
            compute_pc = code.pc() as u32;
            code.line(6).iload(1).ireturn();
        })
        .method(STATIC, "boxed", "(I)I", |code| {
            code.new_object("Target").dup().invokespecial("Target", "<init>", "()V").astore(1);
            code.aload(1).iload(0).putfield("Target", "value", "I");
            boxed_pc = code.pc() as u32;
            code.aload(1).getfield("Target", "value", "I").ireturn();
        });
    (class, compute_pc, boxed_pc)
}

#[test]
fn test_breakpoint_inspect_modify_step() {
    let (class, compute_pc, _) = target();
    let vm = vm(&[("Target", &class)]);
    let session = vm
        .attach_debugger(EventMask::BREAKPOINT | EventMask::SINGLE_STEP)
        .unwrap();
    assert!(matches!(
        vm.attach_debugger(EventMask::BREAKPOINT),
        Err(DebugError::AlreadyAttached)
    ));
    assert!(matches!(
        session.set_breakpoint("Target", "compute", "(I)I", compute_pc + 100),
        Err(DebugError::InvalidLocation { .. })
    ));
    session
        .set_breakpoint("Target", "compute", "(I)I", compute_pc)
        .unwrap();

    std::thread::scope(|scope| {
        let debuggee = scope.spawn(|| {
            let mut ctx = vm.attach_current_thread("debuggee");
            ctx.invoke_static("Target", "compute", "(I)I", &[Value::Int(21)])
        });

        let event = session.next_event(TIMEOUT).expect("breakpoint is hit");
        assert_eq!(event.kind, EventKind::Breakpoint);
        assert_eq!(event.thread_name, "debuggee");
        let location = event.location.clone().unwrap();
        assert_eq!(
            (location.class.as_str(), location.method.as_str(), location.pc),
            ("Target", "compute", compute_pc)
        );
        assert_eq!(location.line, Some(6));
        assert_eq!(event.frames[0].locals, vec![21, 42]);

        let Some(DebugReply::Frames(frames)) = event.command(DebugCommand::ReadFrames) else {
            panic!("no frames");
        };
        assert_eq!(frames, event.frames);

        // the slot holds an int
        let reply = event.command(DebugCommand::WriteLocal {
            depth: 0,
            index: 1,
            value: Value::Double(1.0),
        });
        assert!(matches!(reply, Some(DebugReply::Error(_))), "{reply:?}");
        let reply = event.command(DebugCommand::WriteLocal {
            depth: 0,
            index: 1,
            value: Value::Int(100),
        });
        assert_eq!(reply, Some(DebugReply::Done));

        assert_eq!(event.step(), Some(DebugReply::Done));
        let event = session.next_event(TIMEOUT).expect("step completes");
        assert_eq!(event.kind, EventKind::SingleStep);
        let location = event.location.clone().unwrap();
        assert_eq!(location.method, "compute");
        assert!(location.pc > compute_pc);
        event.resume();

        let result = debuggee.join().unwrap();
        assert_eq!(result, Ok(Some(Value::Int(100))));
    });

    // no longer stops once cleared
    session
        .clear_breakpoint("Target", "compute", "(I)I", compute_pc)
        .unwrap();
    let mut ctx = vm.attach_current_thread("test");
    let result = ctx.invoke_static("Target", "compute", "(I)I", &[Value::Int(4)]);
    assert_eq!(result, Ok(Some(Value::Int(8))));
    assert!(session.try_next_event().is_none());
}

#[test]
fn test_write_field() {
    let (class, _, boxed_pc) = target();
    let vm = vm(&[("Target", &class)]);
    let session = vm.attach_debugger(EventMask::BREAKPOINT).unwrap();
    session
        .set_breakpoint("Target", "boxed", "(I)I", boxed_pc)
        .unwrap();

    std::thread::scope(|scope| {
        let debuggee = scope.spawn(|| {
            let mut ctx = vm.attach_current_thread("debuggee");
            ctx.invoke_static("Target", "boxed", "(I)I", &[Value::Int(1)])
        });

        let event = session.next_event(TIMEOUT).expect("breakpoint is hit");
        let object = event.frames[0].locals[1] as u32;

        let reply = event.command(DebugCommand::WriteField {
            object,
            field: "value".to_string(),
            value: Value::Long(7),
        });
        assert!(matches!(reply, Some(DebugReply::Error(_))), "{reply:?}");
        let reply = event.command(DebugCommand::WriteField {
            object,
            field: "missing".to_string(),
            value: Value::Int(7),
        });
        assert!(matches!(reply, Some(DebugReply::Error(_))), "{reply:?}");
        let reply = event.command(DebugCommand::WriteField {
            object,
            field: "value".to_string(),
            value: Value::Int(7),
        });
        assert_eq!(reply, Some(DebugReply::Done));

        // stepping needs single-step events
        let reply = event.command(DebugCommand::Step);
        assert!(matches!(reply, Some(DebugReply::Error(_))), "{reply:?}");
        event.resume();

        assert_eq!(debuggee.join().unwrap(), Ok(Some(Value::Int(7))));
    });
}

/// `Starter.main` starts a bare `Thread` and joins it.
fn starter() -> ClassBuilder {
    let thread = "java/lang/Thread";
    let mut class = ClassBuilder::new("Starter");
    class.method(STATIC, "main", "([Ljava/lang/String;)V", |code| {
        code.new_object(thread).dup().invokespecial(thread, "<init>", "()V").astore(1);
        code.aload(1).invokevirtual(thread, "start", "()V");
        code.aload(1).invokevirtual(thread, "join", "()V");
        code.vreturn();
    });
    class
}

#[test]
fn test_lifecycle_events() {
    let vm = vm(&[("Starter", &starter())]);
    let session = vm
        .attach_debugger(EventMask::VM_INIT | EventMask::THREAD_START | EventMask::THREAD_END)
        .unwrap();

    std::thread::scope(|scope| {
        let main = scope.spawn(|| vm.run_main("Starter", &[]));

        let mut seen = Vec::new();
        while seen.last() != Some(&EventKind::ThreadEnd) {
            let event = session.next_event(TIMEOUT).expect("lifecycle event");
            assert!(event.location.is_none());
            match event.kind {
                EventKind::VmInit => assert_eq!(event.thread_name, "main"),
                _ => assert!(event.thread_name.starts_with("Thread-"), "{}", event.thread_name),
            }
            seen.push(event.kind);
            event.resume();
        }
        assert_eq!(
            seen,
            [EventKind::VmInit, EventKind::ThreadStart, EventKind::ThreadEnd]
        );
        main.join().unwrap().unwrap();
    });
}

/// `Napper.nap()` starts a `Napper`, whose `run` sleeps until interrupted,
/// then calls `mark()` before interrupting and joining it.
fn napper() -> ClassBuilder {
    let thread = "java/lang/Thread";
    let mut class = ClassBuilder::new("Napper");
    class
        .super_class(thread)
        .method(MethodAccessFlag::PUBLIC, "<init>", "()V", |code| {
            code.super_init(thread).vreturn();
        })
        .method(MethodAccessFlag::PUBLIC, "run", "()V", |code| {
            let start = code.new_label();
            let end = code.new_label();
            let handler = code.new_label();
            code.bind(start).lconst(60_000).invokestatic(thread, "sleep", "(J)V");
            code.bind(end).vreturn();
            code.bind(handler).pop().vreturn();
            code.try_catch(start, end, handler, Some("java/lang/InterruptedException"));
        })
        .method(STATIC, "mark", "()V", |code| {
            code.vreturn();
        })
        .method(STATIC, "nap", "()V", |code| {
            code.new_object("Napper").dup().invokespecial("Napper", "<init>", "()V").astore(0);
            code.aload(0).invokevirtual("Napper", "start", "()V");
            code.invokestatic("Napper", "mark", "()V");
            code.aload(0).invokevirtual("Napper", "interrupt", "()V");
            code.aload(0).invokevirtual("Napper", "join", "()V");
            code.vreturn();
        });
    class
}

#[test]
fn test_started_threads_are_runnable() {
    let vm = vm(&[("Napper", &napper())]);
    let session = vm.attach_debugger(EventMask::BREAKPOINT).unwrap();
    session.set_breakpoint("Napper", "mark", "()V", 0).unwrap();

    std::thread::scope(|scope| {
        let debuggee = scope.spawn(|| {
            let mut ctx = vm.attach_current_thread("debuggee");
            ctx.invoke_static("Napper", "nap", "()V", &[])
        });

        let event = session.next_event(TIMEOUT).expect("breakpoint is hit");
        let Some(DebugReply::Threads(threads)) = event.command(DebugCommand::ReadThreads) else {
            panic!("no threads");
        };
        assert!(threads.iter().any(|t| t.name == "debuggee"), "{threads:?}");
        // started before `mark`, so past New whether or not it is asleep yet
        let started: Vec<_> = threads
            .iter()
            .filter(|t| t.name.starts_with("Thread-"))
            .collect();
        assert_eq!(started.len(), 1, "{threads:?}");
        assert!(
            matches!(started[0].state, ThreadState::Runnable | ThreadState::TimedWaiting),
            "{threads:?}"
        );
        event.resume();

        assert_eq!(debuggee.join().unwrap(), Ok(None));
    });
}
