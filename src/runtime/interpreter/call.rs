//! Frame management: the dispatch loop that moves between frames of both
//! tiers, calls, returns, exception unwinding and class initialization.

use std::sync::{Arc, atomic::Ordering};

use log::debug;

use crate::{
    error::{LinkageError, VmError},
    runtime::{
        Class, ConstantValue, Exception, InitState, Method, NativeResult, Reference, Slot, Value,
        inheritance,
        interpreter::{
            InterpreterEnv, Next, is_watched,
            frame::{CallStack, Frame},
            objects, resolve,
        },
        jit,
        native::NativeEnv,
        thread::{ThreadEnv, ThreadState},
    },
};

/// Runs the frames above `base` until the frame at `base` returns, and
/// yields its return value. An exception no frame above `base` handles is
/// returned with those frames removed.
pub(crate) fn run(env: &ThreadEnv, stack: &mut CallStack, base: usize) -> NativeResult<Option<Slot>> {
    loop {
        let Some(mut frame) = stack.frames.pop() else {
            return Err(VmError::Internal("call stack underflow".into()).into());
        };
        if frame.compiled.is_some() && !may_run_compiled(env, &frame.method) {
            debug!("deoptimizing {} at pc {}", frame.method, frame.pc);
            frame.compiled = None;
        }
        let next = match frame.compiled.clone() {
            Some(code) => jit::execute(env, stack, &mut frame, &code),
            None => InterpreterEnv::new(env, stack, &mut frame).execute(),
        };
        match next {
            Next::Invoke(method) => {
                stack.frames.push(frame);
                if let Err(exception) = invoke(env, stack, method) {
                    unwind(env, stack, base, exception)?;
                }
            }
            Next::Return(value) => {
                if let Some(monitor) = frame.monitor
                    && let Err(exception) = objects::monitor_exit(env, stack, Some(&frame), monitor)
                {
                    drop(frame);
                    if stack.frames.len() == base {
                        return Err(exception);
                    }
                    unwind(env, stack, base, exception)?;
                    continue;
                }
                if stack.frames.len() == base {
                    return Ok(value);
                }
                let caller = top_frame(stack)?;
                if let Some(value) = value {
                    push_return(caller, &frame.method, value);
                }
                caller.resume_after_call();
            }
            Next::Initialize(class) => {
                stack.frames.push(frame);
                if let Err(exception) = initialize_class(env, stack, &class) {
                    unwind(env, stack, base, exception)?;
                }
            }
            Next::Exception(exception) => {
                stack.frames.push(frame);
                unwind(env, stack, base, exception)?;
            }
        }
    }
}

fn top_frame(stack: &mut CallStack) -> NativeResult<&mut Frame> {
    stack
        .frames
        .last_mut()
        .ok_or_else(|| VmError::Internal("no calling frame".into()).into())
}

/// Compiled code is bypassed while a debugger watches the method or steps
/// the thread.
fn may_run_compiled(env: &ThreadEnv, method: &Method) -> bool {
    !is_watched(env, method)
}

fn push_return(frame: &mut Frame, method: &Method, value: Slot) {
    match &method.descriptor.return_type {
        Some(ty) if ty.is_long() => frame.push_wide(value),
        Some(_) => frame.push(value),
        None => {}
    }
}

fn new_frame(env: &ThreadEnv, method: &Arc<Method>) -> NativeResult<Frame> {
    let class = method
        .declaring_class()
        .ok_or_else(|| VmError::Internal(format!("{method} outlived its class")))?;
    let compiled = if may_run_compiled(env, method) {
        method.compiled_code()
    } else {
        None
    };
    Frame::new(Arc::clone(method), class, compiled)
        .ok_or_else(|| VmError::Internal(format!("{method} has no code")).into())
}

/// Counts an invocation and queues the method for compilation once it is
/// hot.
fn count_invocation(env: &ThreadEnv, method: &Arc<Method>) {
    let config = &env.global.config;
    if config.jit_enabled() && method.profile.tick(config.jit_threshold) {
        env.global.jit.enqueue(method);
    }
}

/// Object a synchronized method locks: the receiver, or the class mirror
/// for static methods.
fn lock_target(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    method: &Method,
    receiver: Reference,
) -> NativeResult<Reference> {
    if !method.is_static() {
        return Ok(receiver);
    }
    let class = method
        .declaring_class()
        .ok_or_else(|| VmError::Internal(format!("{method} outlived its class")))?;
    objects::mirror_of(env, stack, current, &class)
}

fn check_callable(env: &ThreadEnv, stack: &mut CallStack, method: &Method) -> NativeResult<()> {
    if method.is_abstract() {
        let error = LinkageError::AbstractMethod {
            class: method.class_name.to_string(),
            name: method.name.to_string(),
            descriptor: method.raw_descriptor.to_string(),
        };
        return Err(objects::raise(env, stack, None, error.into()));
    }
    if stack.frames.len() >= env.global.config.max_stack_depth {
        return Err(objects::throw_new(env, stack, None, "java/lang/StackOverflowError", None));
    }
    Ok(())
}

/// Calls `method` with its arguments on top of the calling frame's operand
/// stack. Bytecode methods get a new frame; natives run to completion here.
pub(crate) fn invoke(env: &ThreadEnv, stack: &mut CallStack, method: Arc<Method>) -> NativeResult<()> {
    check_callable(env, stack, &method)?;
    env.poll(&|| stack.roots(None));

    if method.is_native() {
        let caller = top_frame(stack)?;
        let args = arguments(&method, caller.pop_args(method.arg_slots));
        let result = native_call(env, stack, &method, args)?;
        let caller = top_frame(stack)?;
        if let Some(value) = result {
            push_return(caller, &method, value.to_slot());
        }
        caller.resume_after_call();
        return Ok(());
    }

    let mut frame = new_frame(env, &method)?;
    let slots = method.arg_slots;
    frame.slots[..slots].copy_from_slice(top_frame(stack)?.pop_args(slots));
    if method.is_synchronized() {
        let target = lock_target(env, stack, Some(&frame), &method, frame.slots[0] as Reference)?;
        objects::monitor_enter(env, stack, Some(&frame), target)?;
        frame.monitor = Some(target);
    }
    count_invocation(env, &method);
    stack.frames.push(frame);
    Ok(())
}

/// Decodes raw argument slots by the method's signature.
fn arguments(method: &Method, slots: &[Slot]) -> Vec<Value> {
    let mut args = Vec::with_capacity(method.descriptor.parameters.len() + 1);
    let mut index = 0;
    if !method.is_static() {
        args.push(Value::Reference(slots[0] as Reference));
        index = 1;
    }
    for ty in &method.descriptor.parameters {
        args.push(Value::from_slot(slots[index], ty));
        index += ty.slot_size();
    }
    args
}

/// Runs a native method. Reference arguments stay reachable for the
/// duration of the call.
pub(crate) fn native_call(
    env: &ThreadEnv,
    stack: &mut CallStack,
    method: &Arc<Method>,
    args: Vec<Value>,
) -> NativeResult<Option<Value>> {
    let function = env
        .global
        .natives
        .bind(method)
        .map_err(|err| objects::raise(env, stack, None, err))?;
    let mark = stack.locals.len();
    for arg in &args {
        if let Value::Reference(reference) = *arg {
            stack.hold(reference);
        }
    }
    let receiver = args.first().and_then(Value::get_reference).unwrap_or(0);
    let result = call_locked(env, stack, method, receiver, |stack| {
        function(&mut NativeEnv::new(env, stack, Arc::clone(method), args))
    });
    stack.locals.truncate(mark);
    result
}

fn call_locked<R>(
    env: &ThreadEnv,
    stack: &mut CallStack,
    method: &Method,
    receiver: Reference,
    call: impl FnOnce(&mut CallStack) -> NativeResult<R>,
) -> NativeResult<R> {
    if !method.is_synchronized() {
        return call(stack);
    }
    let target = lock_target(env, stack, None, method, receiver)?;
    stack.hold(target);
    objects::monitor_enter(env, stack, None, target)?;
    let result = call(stack);
    let released = objects::monitor_exit(env, stack, None, target);
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(exception), _) | (Ok(_), Err(exception)) => Err(exception),
    }
}

/// Calls `method` from Rust and waits for the result.
pub(crate) fn invoke_method(
    env: &ThreadEnv,
    stack: &mut CallStack,
    method: &Arc<Method>,
    args: &[Value],
) -> NativeResult<Option<Value>> {
    check_callable(env, stack, method)?;
    if method.is_native() {
        return native_call(env, stack, method, args.to_vec());
    }
    let mut frame = new_frame(env, method)?;
    let mut slot = 0;
    for arg in args {
        let Some(target) = frame.slots.get_mut(slot) else {
            break;
        };
        *target = arg.to_slot();
        slot += if arg.is_wide() { 2 } else { 1 };
    }
    if slot != method.arg_slots {
        return Err(VmError::Internal(format!(
            "{method} takes {} argument slots, got {slot}",
            method.arg_slots
        ))
        .into());
    }
    if method.is_synchronized() {
        let target = lock_target(env, stack, Some(&frame), method, frame.slots[0] as Reference)?;
        objects::monitor_enter(env, stack, Some(&frame), target)?;
        frame.monitor = Some(target);
    }
    count_invocation(env, method);
    let base = stack.frames.len();
    stack.frames.push(frame);
    let result = run(env, stack, base)?;
    Ok(match (&method.descriptor.return_type, result) {
        (Some(ty), Some(slot)) => Some(Value::from_slot(slot, ty)),
        _ => None,
    })
}

/// Hands `exception` to the nearest handler above `base`, popping frames
/// without one. Fails with the exception once every such frame is gone.
pub(crate) fn unwind(
    env: &ThreadEnv,
    stack: &mut CallStack,
    base: usize,
    exception: Exception,
) -> NativeResult<()> {
    let mut throwable = match exception {
        Exception::Java(throwable) => throwable,
        Exception::Vm(error) => match objects::raise(env, stack, None, error) {
            Exception::Java(throwable) => throwable,
            fatal => return Err(fatal),
        },
    };
    let mark = stack.locals.len();
    stack.hold(throwable);
    let mut first_entry = 0;
    while stack.frames.len() > base {
        let frame = top_frame(stack)?;
        match find_handler(env, frame, throwable, first_entry) {
            Ok(Some(handler_pc)) => {
                frame.resume_at_handler(handler_pc, throwable);
                stack.locals.truncate(mark);
                return Ok(());
            }
            Ok(None) => {
                first_entry = 0;
                if let Some(frame) = stack.frames.pop()
                    && let Some(monitor) = frame.monitor
                    && let Err(exception) = objects::monitor_exit(env, stack, None, monitor)
                {
                    debug!("releasing the monitor of {} while unwinding: {exception:?}", frame.method);
                }
            }
            // the catch type itself failed to resolve; that error replaces
            // the exception and the search goes on after the entry
            Err((entry, error)) => {
                throwable = match objects::raise(env, stack, None, error) {
                    Exception::Java(replacement) => replacement,
                    fatal => {
                        stack.locals.truncate(mark);
                        return Err(fatal);
                    }
                };
                stack.hold(throwable);
                first_entry = entry + 1;
            }
        }
    }
    stack.locals.truncate(mark);
    Err(Exception::Java(throwable))
}

fn find_handler(
    env: &ThreadEnv,
    frame: &Frame,
    throwable: Reference,
    first_entry: usize,
) -> Result<Option<usize>, (usize, VmError)> {
    let Some(code) = frame.method.code() else {
        return Ok(None);
    };
    let pc = frame.current_pc() as usize;
    let thrown = env
        .heap()
        .get(throwable)
        .map(|object| Arc::clone(&object.class))
        .ok_or_else(|| (first_entry, VmError::Internal(format!("dangling throwable {throwable}"))))?;
    for (entry, item) in code.exception_table.iter().enumerate().skip(first_entry) {
        if !item.covers(pc) {
            continue;
        }
        let catches = match &item.catch_type {
            None => true,
            Some(info) => {
                let catch_class = resolve::load_class(env, &frame.class, info).map_err(|e| (entry, e))?;
                inheritance::is_assignable(&thrown, &catch_class)
            }
        };
        if catches {
            return Ok(Some(item.handler_pc as usize));
        }
    }
    Ok(None)
}

/// Runs the static initializer of `class` (and of its superclasses) unless
/// it already ran. A thread finding another thread initializing the class
/// waits for it.
pub(crate) fn initialize_class(env: &ThreadEnv, stack: &mut CallStack, class: &Arc<Class>) -> NativeResult<()> {
    if class.is_initialized() {
        return Ok(());
    }
    let me = env.thread.id;
    loop {
        let mut state = class.init.state.lock();
        match *state {
            InitState::Initialized => return Ok(()),
            InitState::InProgress(owner) if owner == me => return Ok(()),
            InitState::Erroneous => {
                drop(state);
                let message = format!("Could not initialize class {}", class.name.replace('/', "."));
                return Err(objects::throw_new(
                    env,
                    stack,
                    None,
                    "java/lang/NoClassDefFoundError",
                    Some(&message),
                ));
            }
            InitState::InProgress(_) => {
                drop(state);
                env.safe_region(ThreadState::Waiting, &|| stack.roots(None), || {
                    let mut state = class.init.state.lock();
                    while matches!(*state, InitState::InProgress(owner) if owner != me) {
                        class.init.cond.wait(&mut state);
                    }
                });
            }
            InitState::Uninitialized => {
                *state = InitState::InProgress(me);
                break;
            }
        }
    }

    let result = run_initializer(env, stack, class);
    let result = match result {
        Err(Exception::Java(thrown)) if !is_error(env, thrown) => Err(objects::throw_with_cause(
            env,
            stack,
            None,
            "java/lang/ExceptionInInitializerError",
            thrown,
        )),
        other => other,
    };
    let mut state = class.init.state.lock();
    if result.is_ok() {
        *state = InitState::Initialized;
        class.init.done.store(true, Ordering::Release);
        debug!("initialized {}", class.name);
    } else {
        *state = InitState::Erroneous;
        debug!("initialization of {} failed", class.name);
    }
    class.init.cond.notify_all();
    result
}

fn is_error(env: &ThreadEnv, throwable: Reference) -> bool {
    let Some(object) = env.heap().get(throwable) else {
        return false;
    };
    let mut current = Some(&object.class);
    while let Some(class) = current {
        if &*class.name == "java/lang/Error" {
            return true;
        }
        current = class.super_class.as_ref();
    }
    false
}

fn run_initializer(env: &ThreadEnv, stack: &mut CallStack, class: &Arc<Class>) -> NativeResult<()> {
    if let Some(super_class) = &class.super_class {
        initialize_class(env, stack, super_class)?;
    }
    for field in class.fields.iter().filter(|f| f.is_static()) {
        let value = match &field.constant_value {
            None => continue,
            Some(ConstantValue::Int(v)) => *v as u32 as Slot,
            Some(ConstantValue::Long(v)) => *v as Slot,
            Some(ConstantValue::Float(v)) => v.to_bits() as Slot,
            Some(ConstantValue::Double(v)) => v.to_bits(),
            Some(ConstantValue::String(s)) => objects::intern(env, stack, None, s)? as Slot,
        };
        class.set_static(field.slot, value);
    }
    if let Some(initializer) = class.declared_method("<clinit>", "()V") {
        let initializer = Arc::clone(initializer);
        invoke_method(env, stack, &initializer, &[])?;
    }
    Ok(())
}
