use std::{
    io::Write,
    sync::LazyLock,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use log::debug;

use crate::runtime::{
    HeapObject, NativeEnv, NativeLibrary, NativeResult, Reference, Value,
    inheritance::is_assignable,
    native::{object::identity_hash, string::double_to_string},
};

const SYSTEM: &str = "java/lang/System";

//     public static native void arraycopy(Object src,  int  srcPos,
//                                         Object dest, int destPos,
//                                         int length);
fn arraycopy(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let src_ref = env.reference_arg(0)?;
    let src_pos = env.int_arg(1)?;
    let dest_ref = env.reference_arg(2)?;
    let dest_pos = env.int_arg(3)?;
    let length = env.int_arg(4)?;

    let src = env.non_null(src_ref)?;
    let dest = env.non_null(dest_ref)?;
    let (Some(src_type), Some(dest_type)) = (src.component_type(), dest.component_type()) else {
        return Err(env.throw(
            "java/lang/ArrayStoreException",
            Some("arraycopy: source and destination must be arrays"),
        ));
    };
    let primitive = !src_type.is_reference() || !dest_type.is_reference();
    if primitive && src_type != dest_type {
        let message = format!(
            "arraycopy: type mismatch: can not copy {}[] into {}[]",
            src_type, dest_type
        );
        return Err(env.throw("java/lang/ArrayStoreException", Some(&message)));
    }

    let src_len = src.array_length() as i64;
    let dest_len = dest.array_length() as i64;
    if src_pos < 0
        || dest_pos < 0
        || length < 0
        || src_pos as i64 + length as i64 > src_len
        || dest_pos as i64 + length as i64 > dest_len
    {
        let message = format!(
            "arraycopy: range [{src_pos}, {src_pos} + {length}) out of bounds for length {src_len} \
             or [{dest_pos}, {dest_pos} + {length}) out of bounds for length {dest_len}"
        );
        return Err(env.throw("java/lang/ArrayIndexOutOfBoundsException", Some(&message)));
    }
    let (src_pos, dest_pos, length) = (src_pos as usize, dest_pos as usize, length as usize);

    // element checks are only needed when the source may hold objects the
    // destination cannot
    if primitive || is_assignable(&src.class, &dest.class) {
        HeapObject::copy_elements(&src, src_pos, &dest, dest_pos, length);
        return Ok(None);
    }
    let element_class = dest
        .class
        .array
        .as_ref()
        .and_then(|array| array.component_class.clone());
    for offset in 0..length {
        let Some(value) = src.get_element((src_pos + offset) as i32) else {
            break;
        };
        let element = value as Reference;
        if element != 0
            && let Some(element_class) = &element_class
            && !is_assignable(&env.deref(element)?.class, element_class)
        {
            let message = format!(
                "arraycopy: element type mismatch: can not cast one of the elements of {} to the type of the destination array",
                src.class.name.replace('/', ".")
            );
            return Err(env.throw("java/lang/ArrayStoreException", Some(&message)));
        }
        dest.put_element((dest_pos + offset) as i32, value);
    }
    Ok(None)
}

// public static native int identityHashCode(Object x);
fn identity_hash_code(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    Ok(Some(Value::Int(identity_hash(env.reference_arg(0)?))))
}

// public static native long currentTimeMillis();
fn current_time_millis(_env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64);
    Ok(Some(Value::Long(millis)))
}

// public static native long nanoTime();
fn nano_time(_env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    static INSTANT_BASE: LazyLock<Instant> = LazyLock::new(Instant::now);
    let nanos = INSTANT_BASE.elapsed().as_nanos() as i64;
    Ok(Some(Value::Long(nanos)))
}

// public static native void gc();
fn gc(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let roots = env.roots();
    if let Some(stats) = env.env.collect_garbage(roots) {
        debug!("System.gc: {} objects live", stats.live_objects);
    }
    Ok(None)
}

// public static native void loadLibrary(String libname);
fn load_library(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let name = env.reference_arg(0)?;
    if name == 0 {
        return Err(env.null_pointer());
    }
    let name = env.string_value(name).unwrap_or_default();
    match env.env.global.natives.load(&name) {
        Ok(()) => Ok(None),
        Err(err) => Err(env.raise(err)),
    }
}

fn print_line(text: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{text}");
}

// public static native void printInt(int i);
fn print_int(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    print_line(&env.int_arg(0)?.to_string());
    Ok(None)
}

// public static native void printLong(long l);
fn print_long(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    print_line(&env.long_arg(0)?.to_string());
    Ok(None)
}

// public static native void printDouble(double d);
fn print_double(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    print_line(&double_to_string(env.double_arg(0)?));
    Ok(None)
}

// public static native void printString(String s);
fn print_string(env: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
    let string = env.reference_arg(0)?;
    let text = match string {
        0 => "null".to_string(),
        _ => env.string_value(string).unwrap_or_default(),
    };
    print_line(&text);
    Ok(None)
}

pub(super) fn register_natives(library: &mut NativeLibrary) {
    library
        .register(
            SYSTEM,
            "arraycopy",
            "(Ljava/lang/Object;ILjava/lang/Object;II)V",
            arraycopy,
        )
        .register(SYSTEM, "identityHashCode", "(Ljava/lang/Object;)I", identity_hash_code)
        .register(SYSTEM, "currentTimeMillis", "()J", current_time_millis)
        .register(SYSTEM, "nanoTime", "()J", nano_time)
        .register(SYSTEM, "gc", "()V", gc)
        .register(SYSTEM, "loadLibrary", "(Ljava/lang/String;)V", load_library)
        .register(SYSTEM, "printInt", "(I)V", print_int)
        .register(SYSTEM, "printLong", "(J)V", print_long)
        .register(SYSTEM, "printDouble", "(D)V", print_double)
        .register(SYSTEM, "printString", "(Ljava/lang/String;)V", print_string);
}
