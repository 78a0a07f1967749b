use std::{fmt::Write as _, io::Write as _, sync::Arc};

use crate::runtime::{
    NativeEnv, NativeLibrary, NativeResult, Reference, Value, inheritance::is_assignable,
    interpreter::objects, native::class::binary_name, thread::ThreadEnv,
};

const THROWABLE: &str = "java/lang/Throwable";

/// Longest cause chain printed before giving up on a cycle.
const MAX_CAUSES: usize = 64;

/// `java.lang.IllegalStateException: message`
fn describe(env: &ThreadEnv, throwable: Reference) -> String {
    let Some(object) = env.heap().get(throwable) else {
        return "<collected throwable>".to_string();
    };
    let name = binary_name(&object.class);
    let message = object.get_field(env.global.famous.throwable_message) as Reference;
    match objects::string_value(env, message) {
        Some(message) => format!("{name}: {message}"),
        None => name,
    }
}

/// The text `printStackTrace` prints: the description, one `at` line per
/// captured frame, then the causes.
pub(crate) fn report(env: &ThreadEnv, throwable: Reference) -> String {
    let mut out = String::new();
    let mut current = throwable;
    for depth in 0..MAX_CAUSES {
        if depth > 0 {
            out.push_str("Caused by: ");
        }
        let _ = writeln!(out, "{}", describe(env, current));
        for entry in env.heap().backtrace(current).iter().flat_map(|t| t.iter()) {
            let _ = writeln!(out, "\tat {entry}");
        }
        let cause = env
            .heap()
            .get(current)
            .map_or(0, |o| o.get_field(env.global.famous.throwable_cause) as Reference);
        if cause == 0 || cause == current {
            break;
        }
        current = cause;
    }
    out
}

// public native Throwable fillInStackTrace();
fn fill_in_stack_trace(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let class = Arc::clone(&env.non_null(this)?.class);
    // frames of the throwable's own construction are not part of its trace
    let trace: Vec<_> = env
        .stack
        .trace(None)
        .into_iter()
        .skip_while(|entry| {
            let method = &entry.method;
            &*method.name == "fillInStackTrace"
                || (method.is_constructor()
                    && method
                        .declaring_class()
                        .is_some_and(|declaring| is_assignable(&class, &declaring)))
        })
        .collect();
    env.env.heap().set_backtrace(this, trace.into());
    Ok(Some(Value::Reference(this)))
}

// public native void printStackTrace();
fn print_stack_trace(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let report = report(env.env, this);
    let _ = std::io::stderr().lock().write_all(report.as_bytes());
    Ok(None)
}

// public native String toString();
fn to_string(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    env.non_null(this)?;
    let text = describe(env.env, this);
    Ok(Some(Value::Reference(env.new_string(&text)?)))
}

pub(super) fn register_natives(library: &mut NativeLibrary) {
    library
        .register(
            THROWABLE,
            "fillInStackTrace",
            "()Ljava/lang/Throwable;",
            fill_in_stack_trace,
        )
        .register(THROWABLE, "printStackTrace", "()V", print_stack_trace)
        .register(THROWABLE, "toString", "()Ljava/lang/String;", to_string);
}
