//! Heap operations both tiers perform: allocation, strings, mirrors,
//! throwables and the checked array, field and monitor accesses.
//!
//! `current` is the frame being executed, which is off the call stack
//! while it runs; it is passed along so that a collection triggered here
//! still sees its references.

use std::sync::Arc;

use crate::{
    error::VmError,
    runtime::{
        Class, Exception, HeapObject, NativeResult, Reference, Slot,
        interpreter::frame::{CallStack, Frame},
        inheritance,
        thread::{MonitorError, ThreadEnv},
    },
};

pub(crate) fn allocate(
    env: &ThreadEnv,
    stack: &CallStack,
    current: Option<&Frame>,
    object: HeapObject,
) -> NativeResult<Reference> {
    env.allocate(object, &|| stack.roots(current))
}

pub(crate) fn deref(env: &ThreadEnv, reference: Reference) -> NativeResult<Arc<HeapObject>> {
    env.heap()
        .get(reference)
        .ok_or_else(|| VmError::Internal(format!("dangling reference {reference}")).into())
}

pub(crate) fn new_object(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    class: &Arc<Class>,
) -> NativeResult<Reference> {
    if class.is_abstract() || class.is_interface() || class.is_array() {
        return Err(throw_new(
            env,
            stack,
            current,
            "java/lang/InstantiationError",
            Some(&class.name.replace('/', ".")),
        ));
    }
    allocate(env, stack, current, HeapObject::new_object(Arc::clone(class)))
}

pub(crate) fn new_array(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    class: &Arc<Class>,
    length: i32,
) -> NativeResult<Reference> {
    if length < 0 {
        return Err(throw_new(
            env,
            stack,
            current,
            "java/lang/NegativeArraySizeException",
            Some(&length.to_string()),
        ));
    }
    // never materialize an array the heap could not hold anyway
    if HeapObject::size_for(length as usize) > env.heap().capacity() {
        return Err(Exception::Java(env.global.out_of_memory));
    }
    allocate(
        env,
        stack,
        current,
        HeapObject::new_array(Arc::clone(class), length as usize),
    )
}

/// `multianewarray`: `class` has at least `lengths.len()` dimensions.
pub(crate) fn new_multi_array(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    class: &Arc<Class>,
    lengths: &[i32],
) -> NativeResult<Reference> {
    if let Some(&negative) = lengths.iter().find(|&&l| l < 0) {
        return Err(throw_new(
            env,
            stack,
            current,
            "java/lang/NegativeArraySizeException",
            Some(&negative.to_string()),
        ));
    }
    let Some((&length, rest)) = lengths.split_first() else {
        return Err(VmError::Internal("multianewarray without dimensions".into()).into());
    };
    let array = new_array(env, stack, current, class, length)?;
    if rest.is_empty() {
        return Ok(array);
    }
    let Some(component) = class.array.as_ref().and_then(|a| a.component_class.clone()) else {
        return Err(VmError::Internal(format!("{} has too few dimensions", class.name)).into());
    };
    let mark = stack.locals.len();
    stack.hold(array);
    let object = deref(env, array)?;
    let filled = (0..length).try_for_each(|index| {
        let element = new_multi_array(env, stack, current, &component, rest)?;
        object.put_element(index, element as Slot);
        Ok(())
    });
    stack.locals.truncate(mark);
    filled.map(|()| array)
}

pub(crate) fn new_string(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    value: &str,
) -> NativeResult<Reference> {
    let famous = &env.global.famous;
    let chars: Vec<u16> = value.encode_utf16().collect();
    let array = new_array(env, stack, current, &famous.char_array, chars.len() as i32)?;
    let mark = stack.locals.len();
    stack.hold(array);
    let array_object = deref(env, array)?;
    for (index, &c) in chars.iter().enumerate() {
        array_object.put_element(index as i32, c as Slot);
    }
    let string = allocate(env, stack, current, HeapObject::new_object(Arc::clone(&famous.string)));
    stack.locals.truncate(mark);
    let string = string?;
    deref(env, string)?.put_field(famous.string_value, array as Slot);
    Ok(string)
}

pub(crate) fn string_value(env: &ThreadEnv, string: Reference) -> Option<String> {
    env.heap()
        .read_string(string, env.global.famous.string_value)
}

/// The canonical string object for `value`.
pub(crate) fn intern(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    value: &str,
) -> NativeResult<Reference> {
    let strings = &env.heap().strings;
    if let Some(string) = strings.get(value) {
        return Ok(string);
    }
    let string = new_string(env, stack, current, value)?;
    Ok(strings.insert(Arc::from(value), string))
}

/// The `java/lang/Class` object of `class`, created on first use.
pub(crate) fn mirror_of(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    class: &Arc<Class>,
) -> NativeResult<Reference> {
    if let Some(&mirror) = class.mirror.get() {
        return Ok(mirror);
    }
    let mirror = allocate(
        env,
        stack,
        current,
        HeapObject::new_object(Arc::clone(&env.global.famous.class)),
    )?;
    match class.mirror.set(mirror) {
        Ok(()) => {
            env.heap().register_mirror(mirror, class);
            Ok(mirror)
        }
        Err(_) => Ok(class.mirror.get().copied().unwrap_or(mirror)),
    }
}

/// Creates a throwable of class `class_name` without running a
/// constructor and returns it as the exception to raise.
pub(crate) fn throw_new(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    class_name: &str,
    message: Option<&str>,
) -> Exception {
    match create_throwable(env, stack, current, class_name, message, 0) {
        Ok(throwable) => Exception::Java(throwable),
        Err(err) => err,
    }
}

pub(crate) fn throw_with_cause(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    class_name: &str,
    cause: Reference,
) -> Exception {
    let mark = stack.locals.len();
    stack.hold(cause);
    let result = create_throwable(env, stack, current, class_name, None, cause);
    stack.locals.truncate(mark);
    match result {
        Ok(throwable) => Exception::Java(throwable),
        Err(err) => err,
    }
}

fn create_throwable(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    class_name: &str,
    message: Option<&str>,
    cause: Reference,
) -> NativeResult<Reference> {
    let class = env.global.registry.resolve(class_name)?;
    let message = match message {
        Some(message) => new_string(env, stack, current, message)?,
        None => 0,
    };
    let mark = stack.locals.len();
    stack.hold(message);
    let throwable = allocate(env, stack, current, HeapObject::new_object(class));
    stack.locals.truncate(mark);
    let throwable = throwable?;
    let famous = &env.global.famous;
    let object = deref(env, throwable)?;
    object.put_field(famous.throwable_message, message as Slot);
    object.put_field(famous.throwable_cause, cause as Slot);
    capture_backtrace(env, stack, current, throwable);
    Ok(throwable)
}

pub(crate) fn capture_backtrace(
    env: &ThreadEnv,
    stack: &CallStack,
    current: Option<&Frame>,
    throwable: Reference,
) {
    env.heap()
        .set_backtrace(throwable, stack.trace(current).into());
}

/// Turns an engine error raised while running program code into the
/// throwable the program observes. Fatal errors pass through.
pub(crate) fn raise(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    error: VmError,
) -> Exception {
    match error.java_class() {
        Some(class_name) => throw_new(env, stack, current, class_name, Some(&error.to_string())),
        None => Exception::Vm(error),
    }
}

pub(crate) fn null_pointer(env: &ThreadEnv, stack: &mut CallStack, current: Option<&Frame>) -> Exception {
    throw_new(env, stack, current, "java/lang/NullPointerException", None)
}

fn non_null(
    env: &ThreadEnv,
    stack: &mut CallStack,
    frame: &Frame,
    reference: Reference,
) -> NativeResult<Arc<HeapObject>> {
    if reference == 0 {
        return Err(null_pointer(env, stack, Some(frame)));
    }
    deref(env, reference)
}

fn out_of_bounds(
    env: &ThreadEnv,
    stack: &mut CallStack,
    frame: &Frame,
    index: i32,
    length: usize,
) -> Exception {
    throw_new(
        env,
        stack,
        Some(frame),
        "java/lang/ArrayIndexOutOfBoundsException",
        Some(&format!("Index {index} out of bounds for length {length}")),
    )
}

pub(crate) fn array_load(
    env: &ThreadEnv,
    stack: &mut CallStack,
    frame: &Frame,
    array: Reference,
    index: i32,
) -> NativeResult<Slot> {
    let object = non_null(env, stack, frame, array)?;
    match object.get_element(index) {
        Some(value) => Ok(value),
        None => Err(out_of_bounds(env, stack, frame, index, object.array_length())),
    }
}

pub(crate) fn array_store(
    env: &ThreadEnv,
    stack: &mut CallStack,
    frame: &Frame,
    array: Reference,
    index: i32,
    value: Slot,
) -> NativeResult<()> {
    let object = non_null(env, stack, frame, array)?;
    if index < 0 || index as usize >= object.array_length() {
        return Err(out_of_bounds(env, stack, frame, index, object.array_length()));
    }
    if let Some(element_class) = object.class.array.as_ref().and_then(|a| a.component_class.as_ref())
        && value != 0
    {
        let stored = deref(env, value as Reference)?;
        if !inheritance::is_assignable(&stored.class, element_class) {
            return Err(throw_new(
                env,
                stack,
                Some(frame),
                "java/lang/ArrayStoreException",
                Some(&stored.class.name.replace('/', ".")),
            ));
        }
    }
    object.put_element(index, value);
    Ok(())
}

pub(crate) fn array_length(
    env: &ThreadEnv,
    stack: &mut CallStack,
    frame: &Frame,
    array: Reference,
) -> NativeResult<i32> {
    Ok(non_null(env, stack, frame, array)?.array_length() as i32)
}

pub(crate) fn get_field(
    env: &ThreadEnv,
    stack: &mut CallStack,
    frame: &Frame,
    object: Reference,
    slot: u16,
) -> NativeResult<Slot> {
    Ok(non_null(env, stack, frame, object)?.get_field(slot))
}

pub(crate) fn put_field(
    env: &ThreadEnv,
    stack: &mut CallStack,
    frame: &Frame,
    object: Reference,
    slot: u16,
    value: Slot,
) -> NativeResult<()> {
    non_null(env, stack, frame, object)?.put_field(slot, value);
    Ok(())
}

pub(crate) fn instance_of(env: &ThreadEnv, object: Reference, class: &Class) -> NativeResult<bool> {
    if object == 0 {
        return Ok(false);
    }
    Ok(inheritance::is_assignable(&deref(env, object)?.class, class))
}

pub(crate) fn check_cast(
    env: &ThreadEnv,
    stack: &mut CallStack,
    frame: &Frame,
    object: Reference,
    class: &Class,
) -> NativeResult<()> {
    if object == 0 {
        return Ok(());
    }
    let actual = deref(env, object)?;
    if inheritance::is_assignable(&actual.class, class) {
        return Ok(());
    }
    let message = format!(
        "class {} cannot be cast to class {}",
        actual.class.name.replace('/', "."),
        class.name.replace('/', ".")
    );
    Err(throw_new(
        env,
        stack,
        Some(frame),
        "java/lang/ClassCastException",
        Some(&message),
    ))
}

pub(crate) fn monitor_enter(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    reference: Reference,
) -> NativeResult<()> {
    if reference == 0 {
        return Err(null_pointer(env, stack, current));
    }
    let object = deref(env, reference)?;
    env.monitor_enter(reference, &object, &|| stack.roots(current));
    Ok(())
}

pub(crate) fn monitor_exit(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    reference: Reference,
) -> NativeResult<()> {
    if reference == 0 {
        return Err(null_pointer(env, stack, current));
    }
    let object = deref(env, reference)?;
    env.monitor_exit(reference, &object)
        .map_err(|err| monitor_error(env, stack, current, err))
}

pub(crate) fn monitor_error(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&Frame>,
    error: MonitorError,
) -> Exception {
    match error {
        MonitorError::IllegalState => throw_new(
            env,
            stack,
            current,
            "java/lang/IllegalMonitorStateException",
            Some("current thread is not owner"),
        ),
        MonitorError::Interrupted => throw_new(
            env,
            stack,
            current,
            "java/lang/InterruptedException",
            None,
        ),
    }
}

/// `athrow`: the exception to raise for `throwable`.
pub(crate) fn athrow(env: &ThreadEnv, stack: &mut CallStack, frame: &Frame, throwable: Reference) -> Exception {
    if throwable == 0 {
        null_pointer(env, stack, Some(frame))
    } else {
        Exception::Java(throwable)
    }
}
