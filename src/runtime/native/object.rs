use std::{sync::Arc, time::Duration};

use crate::runtime::{
    NativeEnv, NativeLibrary, NativeResult, Reference, Value,
    interpreter::objects,
};

const OBJECT: &str = "java/lang/Object";

/// Identity hash: the object id, stable for the object's lifetime.
pub(super) fn identity_hash(reference: Reference) -> i32 {
    reference as i32
}

// public native int hashCode();
fn hash_code(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    Ok(Some(Value::Int(identity_hash(env.this()?))))
}

// public native String toString();
fn to_string(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let object = env.non_null(this)?;
    let text = format!(
        "{}@{:x}",
        object.class.name.replace('/', "."),
        identity_hash(this)
    );
    Ok(Some(Value::Reference(env.new_string(&text)?)))
}

// public final native Class<?> getClass();
fn get_class(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let class = Arc::clone(&env.non_null(this)?.class);
    let mirror = objects::mirror_of(env.env, env.stack, None, &class)?;
    Ok(Some(Value::Reference(mirror)))
}

// protected native Object clone() throws CloneNotSupportedException;
fn clone(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let object = env.non_null(this)?;
    if !object.is_array() && !object.class.all_interfaces.contains("java/lang/Cloneable") {
        let name = object.class.name.replace('/', ".");
        return Err(env.throw("java/lang/CloneNotSupportedException", Some(&name)));
    }
    let copy = objects::allocate(env.env, env.stack, None, object.duplicate())?;
    Ok(Some(Value::Reference(copy)))
}

// public final native void wait(long timeoutMillis) throws InterruptedException;
fn wait(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let millis = env.long_arg(1)?;
    if millis < 0 {
        return Err(env.throw(
            "java/lang/IllegalArgumentException",
            Some("timeout value is negative"),
        ));
    }
    let object = env.non_null(this)?;
    let timeout = (millis > 0).then(|| Duration::from_millis(millis as u64));
    let stack = &*env.stack;
    let waited = env
        .env
        .monitor_wait(this, &object, timeout, &|| stack.roots(None));
    match waited {
        Ok(()) => Ok(None),
        Err(err) => Err(objects::monitor_error(env.env, env.stack, None, err)),
    }
}

fn notify_one_or_all(env: &mut NativeEnv<'_>, all: bool) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let object = env.non_null(this)?;
    match env.env.monitor_notify(this, &object, all) {
        Ok(()) => Ok(None),
        Err(err) => Err(objects::monitor_error(env.env, env.stack, None, err)),
    }
}

// public final native void notify();
fn notify(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    notify_one_or_all(env, false)
}

// public final native void notifyAll();
fn notify_all(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    notify_one_or_all(env, true)
}

pub(super) fn register_natives(library: &mut NativeLibrary) {
    library
        .register(OBJECT, "hashCode", "()I", hash_code)
        .register(OBJECT, "toString", "()Ljava/lang/String;", to_string)
        .register(OBJECT, "getClass", "()Ljava/lang/Class;", get_class)
        .register(OBJECT, "clone", "()Ljava/lang/Object;", clone)
        .register(OBJECT, "wait", "(J)V", wait)
        .register(OBJECT, "notify", "()V", notify)
        .register(OBJECT, "notifyAll", "()V", notify_all);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_hash_is_the_id() {
        assert_eq!(identity_hash(0), 0);
        assert_eq!(identity_hash(42), 42);
        assert_eq!(identity_hash(u32::MAX), -1);
    }
}
