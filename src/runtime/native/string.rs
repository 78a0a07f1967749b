use std::sync::Arc;

use crate::runtime::{NativeEnv, NativeLibrary, NativeResult, Reference, Value};

const STRING: &str = "java/lang/String";

/// Decimal text of a `double` as the language prints it: `1.0`, `0.001`,
/// `1.0E7`, `-Infinity`.
pub(crate) fn double_to_string(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let magnitude = value.abs();
    if magnitude == 0.0 || (1e-3..1e7).contains(&magnitude) {
        let mut text = value.to_string();
        if !text.contains('.') {
            text.push_str(".0");
        }
        return text;
    }
    let text = format!("{value:e}");
    let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
    if mantissa.contains('.') {
        format!("{mantissa}E{exponent}")
    } else {
        format!("{mantissa}.0E{exponent}")
    }
}

/// Contents of the string `reference`, which must not be null.
fn contents(env: &mut NativeEnv<'_>, reference: Reference) -> NativeResult<String> {
    if reference == 0 {
        return Err(env.null_pointer());
    }
    Ok(env.string_value(reference).unwrap_or_default())
}

// public native boolean equals(Object anObject);
fn equals(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let other = env.reference_arg(1)?;
    if this == other {
        return Ok(Some(Value::Int(1)));
    }
    if other == 0 {
        return Ok(Some(Value::Int(0)));
    }
    let other_object = env.deref(other)?;
    if !Arc::ptr_eq(&other_object.class, &env.env.global.famous.string) {
        return Ok(Some(Value::Int(0)));
    }
    let equal = env.string_value(this) == env.string_value(other);
    Ok(Some(Value::Int(equal as i32)))
}

// public native String intern();
fn intern(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let value = contents(env, this)?;
    let canonical = env.env.heap().strings.insert(Arc::from(value), this);
    Ok(Some(Value::Reference(canonical)))
}

// public native String concat(String str);
fn concat(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let this = env.this()?;
    let other = env.reference_arg(1)?;
    let tail = contents(env, other)?;
    if tail.is_empty() {
        return Ok(Some(Value::Reference(this)));
    }
    let mut head = contents(env, this)?;
    head.push_str(&tail);
    Ok(Some(Value::Reference(env.new_string(&head)?)))
}

// public static native String valueOf(int i);
fn value_of_int(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let text = env.int_arg(0)?.to_string();
    Ok(Some(Value::Reference(env.new_string(&text)?)))
}

// public static native String valueOf(long l);
fn value_of_long(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let text = env.long_arg(0)?.to_string();
    Ok(Some(Value::Reference(env.new_string(&text)?)))
}

// public static native String valueOf(double d);
fn value_of_double(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let text = double_to_string(env.double_arg(0)?);
    Ok(Some(Value::Reference(env.new_string(&text)?)))
}

pub(super) fn register_natives(library: &mut NativeLibrary) {
    library
        .register(STRING, "equals", "(Ljava/lang/Object;)Z", equals)
        .register(STRING, "intern", "()Ljava/lang/String;", intern)
        .register(
            STRING,
            "concat",
            "(Ljava/lang/String;)Ljava/lang/String;",
            concat,
        )
        .register(STRING, "valueOf", "(I)Ljava/lang/String;", value_of_int)
        .register(STRING, "valueOf", "(J)Ljava/lang/String;", value_of_long)
        .register(STRING, "valueOf", "(D)Ljava/lang/String;", value_of_double);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_to_string() {
        assert_eq!(double_to_string(1.0), "1.0");
        assert_eq!(double_to_string(-0.0), "-0.0");
        assert_eq!(double_to_string(0.5), "0.5");
        assert_eq!(double_to_string(0.001), "0.001");
        assert_eq!(double_to_string(1234567.0), "1234567.0");
        assert_eq!(double_to_string(1e7), "1.0E7");
        assert_eq!(double_to_string(1.5e-5), "1.5E-5");
        assert_eq!(double_to_string(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(double_to_string(f64::NAN), "NaN");
    }
}
