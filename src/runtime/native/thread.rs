//! `java/lang/Thread`: each started thread object runs on its own OS
//! thread, attached to the VM for as long as `run` executes.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use log::{debug, error, warn};

use crate::{
    error::VmError,
    runtime::{
        Exception, HeapObject, Method, NativeEnv, NativeLibrary, NativeResult, Reference, Slot,
        Value,
        debug::{self, EventKind},
        interpreter::{CallStack, invoke_method, objects},
        native::throwable,
        thread::{ThreadEnv, ThreadHandle, ThreadState},
        vm::Global,
    },
};

const THREAD: &str = "java/lang/Thread";

static THREAD_NUMBER: AtomicU32 = AtomicU32::new(0);

/// The `Thread` object of the current thread, created for threads that
/// were attached from Rust rather than started by the program.
pub(crate) fn current_thread_object(env: &ThreadEnv, stack: &mut CallStack) -> NativeResult<Reference> {
    let existing = env.thread.object();
    if existing != 0 {
        return Ok(existing);
    }
    let famous = &env.global.famous;
    let name = objects::new_string(env, stack, None, &env.thread.name)?;
    let mark = stack.locals.len();
    stack.hold(name);
    let object = objects::allocate(env, stack, None, HeapObject::new_object(Arc::clone(&famous.thread)));
    stack.locals.truncate(mark);
    let object = object?;
    let thread = objects::deref(env, object)?;
    thread.put_field(famous.thread_name, name as Slot);
    thread.put_field(famous.thread_daemon, env.thread.daemon as Slot);
    env.global.threads.bind_object(&env.thread, object);
    Ok(object)
}

/// The runtime thread started for `object`, if it was started.
fn handle_of(env: &NativeEnv<'_>, object: Reference) -> Option<Arc<ThreadHandle>> {
    if object == env.env.thread.object() {
        return Some(Arc::clone(&env.env.thread));
    }
    env.env.global.threads.by_object(object)
}

// public synchronized native void start();
fn start(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    if handle_of(env, this).is_some() {
        return Err(env.throw("java/lang/IllegalThreadStateException", None));
    }
    let famous = &env.env.global.famous;
    let (name_slot, daemon_slot) = (famous.thread_name, famous.thread_daemon);
    let object = env.deref(this)?;
    let daemon = object.get_field(daemon_slot) != 0;
    let name = match object.get_field(name_slot) as Reference {
        0 => {
            let name = format!("Thread-{}", THREAD_NUMBER.fetch_add(1, Ordering::Relaxed));
            let string = env.new_string(&name)?;
            object.put_field(name_slot, string as Slot);
            name
        }
        string => env.string_value(string).unwrap_or_default(),
    };
    let Some(run) = object.class.lookup_method("run", "()V") else {
        return Err(env.raise(VmError::Internal(format!("{} has no run method", object.class.name))));
    };

    let global = Arc::clone(&env.env.global);
    let handle = global.threads.register(name.clone(), daemon, this, true);
    handle.set_state(ThreadState::Runnable);
    let spawned = {
        let global = Arc::clone(&global);
        let handle = Arc::clone(&handle);
        std::thread::Builder::new()
            .name(name.clone())
            .stack_size(global.config.thread_stack_size)
            .spawn(move || run_thread(global, handle, run))
    };
    match spawned {
        Ok(_) => {
            debug!("started thread {} ({name})", handle.id);
            Ok(None)
        }
        Err(err) => {
            warn!("cannot create thread {name}: {err}");
            // attaching and detaching again retires the registration
            drop(ThreadEnv::attach(global, handle, true));
            let error = VmError::ResourceExhaustion(format!("unable to create native thread: {err}"));
            Err(env.raise(error))
        }
    }
}

/// Body of every program-started thread.
fn run_thread(global: Arc<Global>, handle: Arc<ThreadHandle>, run: Arc<Method>) {
    let env = ThreadEnv::attach(global, handle, true);
    let mut stack = CallStack::new();
    let this = env.thread.object();
    debug::on_thread_event(&env, &mut stack, EventKind::ThreadStart);
    match invoke_method(&env, &mut stack, &run, &[Value::Reference(this)]) {
        Ok(_) => {}
        Err(Exception::Java(throwable)) => {
            let report = throwable::report(&env, throwable);
            eprint!("Exception in thread \"{}\" {report}", env.thread.name);
        }
        Err(Exception::Vm(err)) => {
            error!("thread {} ({}) failed: {err}", env.thread.id, env.thread.name);
        }
    }
    debug::on_thread_event(&env, &mut stack, EventKind::ThreadEnd);
}

// public native void join() throws InterruptedException;
fn join(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let Some(target) = handle_of(env, this) else {
        return Ok(None);
    };
    if target.id == env.thread_id() {
        // joining yourself never returns
        return Err(env.throw(
            "java/lang/IllegalThreadStateException",
            Some("a thread cannot join itself"),
        ));
    }
    // not interruptible: the pending interrupt is reported afterwards
    env.blocking(|| target.wait_terminated());
    if env.env.thread.take_interrupt() {
        return Err(env.throw("java/lang/InterruptedException", None));
    }
    Ok(None)
}

// public native void setDaemon(boolean on);
fn set_daemon(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let on = env.int_arg(1)?;
    if handle_of(env, this).is_some_and(|t| !t.is_terminated()) {
        return Err(env.throw("java/lang/IllegalThreadStateException", None));
    }
    let slot = env.env.global.famous.thread_daemon;
    env.non_null(this)?.put_field(slot, (on != 0) as Slot);
    Ok(None)
}

// public native boolean isAlive();
fn is_alive(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let alive = handle_of(env, this).is_some_and(|t| !t.is_terminated());
    Ok(Some(Value::Int(alive as i32)))
}

// public native void interrupt();
fn interrupt(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    if let Some(target) = handle_of(env, this) {
        target.interrupt();
    }
    Ok(None)
}

// public native boolean isInterrupted();
fn is_interrupted(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let interrupted = handle_of(env, this).is_some_and(|t| t.is_interrupted());
    Ok(Some(Value::Int(interrupted as i32)))
}

// public native long getId();
fn get_id(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let id = handle_of(env, this).map_or(0, |t| t.id);
    Ok(Some(Value::Long(id as i64)))
}

// public static native boolean interrupted();
fn interrupted(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    Ok(Some(Value::Int(env.env.thread.take_interrupt() as i32)))
}

// public static native Thread currentThread();
fn current_thread(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let object = current_thread_object(env.env, env.stack)?;
    Ok(Some(Value::Reference(object)))
}

// public static native void sleep(long millis) throws InterruptedException;
fn sleep(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let millis = env.long_arg(0)?;
    if millis < 0 {
        return Err(env.throw(
            "java/lang/IllegalArgumentException",
            Some("timeout value is negative"),
        ));
    }
    let thread = Arc::clone(&env.env.thread);
    let stack = &*env.stack;
    let interrupted = env.env.safe_region(
        ThreadState::TimedWaiting,
        &|| stack.roots(None),
        || thread.sleep(Duration::from_millis(millis as u64)),
    );
    if interrupted {
        return Err(env.throw("java/lang/InterruptedException", Some("sleep interrupted")));
    }
    Ok(None)
}

// public static native void yield();
fn yield_now(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    std::thread::yield_now();
    let stack = &*env.stack;
    env.env.poll(&|| stack.roots(None));
    Ok(None)
}

pub(super) fn register_natives(library: &mut NativeLibrary) {
    library
        .register(THREAD, "start", "()V", start)
        .register(THREAD, "join", "()V", join)
        .register(THREAD, "setDaemon", "(Z)V", set_daemon)
        .register(THREAD, "isAlive", "()Z", is_alive)
        .register(THREAD, "interrupt", "()V", interrupt)
        .register(THREAD, "isInterrupted", "()Z", is_interrupted)
        .register(THREAD, "getId", "()J", get_id)
        .register(THREAD, "interrupted", "()Z", interrupted)
        .register(THREAD, "currentThread", "()Ljava/lang/Thread;", current_thread)
        .register(THREAD, "sleep", "(J)V", sleep)
        .register(THREAD, "yield", "()V", yield_now);
}
