use std::sync::Arc;

use crate::{
    error::VmError,
    runtime::{
        Class, NativeEnv, NativeLibrary, NativeResult, Value,
        interpreter::objects,
    },
};

const CLASS: &str = "java/lang/Class";

/// The class a `java/lang/Class` receiver stands for.
fn this_class(env: &mut NativeEnv<'_>) -> NativeResult<Arc<Class>> {
    let this = env.this()?;
    env.env
        .heap()
        .mirrored_class(this)
        .ok_or_else(|| VmError::Internal(format!("{this} is not a class mirror")).into())
}

/// `java.lang.String`, `[I`, `[Ljava.lang.String;`.
pub(crate) fn binary_name(class: &Class) -> String {
    class.name.replace('/', ".")
}

// public native String getName();
fn get_name(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let class = this_class(env)?;
    Ok(Some(Value::Reference(env.new_string(&binary_name(&class))?)))
}

// public native boolean isArray();
fn is_array(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    Ok(Some(Value::Int(this_class(env)?.is_array() as i32)))
}

// public native boolean isInterface();
fn is_interface(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    Ok(Some(Value::Int(this_class(env)?.is_interface() as i32)))
}

// public native Class<? super T> getSuperclass();
fn get_superclass(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let class = this_class(env)?;
    let mirror = match class.super_class() {
        Some(super_class) if !class.is_interface() => {
            objects::mirror_of(env.env, env.stack, None, super_class)?
        }
        _ => 0,
    };
    Ok(Some(Value::Reference(mirror)))
}

// public native boolean isInstance(Object obj);
fn is_instance(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let class = this_class(env)?;
    let object = env.reference_arg(1)?;
    let result = objects::instance_of(env.env, object, &class)?;
    Ok(Some(Value::Int(result as i32)))
}

pub(super) fn register_natives(library: &mut NativeLibrary) {
    library
        .register(CLASS, "getName", "()Ljava/lang/String;", get_name)
        .register(CLASS, "isArray", "()Z", is_array)
        .register(CLASS, "isInterface", "()Z", is_interface)
        .register(CLASS, "getSuperclass", "()Ljava/lang/Class;", get_superclass)
        .register(CLASS, "isInstance", "(Ljava/lang/Object;)Z", is_instance);
}
