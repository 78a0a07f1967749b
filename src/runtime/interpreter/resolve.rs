//! Symbolic reference resolution and method selection. Results are cached
//! in the constant pool entries, which both tiers read.

use std::sync::Arc;

use crate::{
    consts::{ClassAccessFlag, FieldAccessFlag},
    error::{LinkageError, VmError, VmResult},
    runtime::{
        Class, ConstantPoolInfo, CpClassInfo, InitState, Method, ResolvedField,
        inheritance::is_same_or_sub_class_of,
        thread::ThreadEnv,
    },
};

pub(crate) fn load_class(env: &ThreadEnv, current: &Arc<Class>, info: &CpClassInfo) -> VmResult<Arc<Class>> {
    info.get_or_load_class(|name| {
        if name == &*current.name {
            Ok(Arc::clone(current))
        } else {
            env.global.registry.resolve(name)
        }
    })
}

fn bad_constant(current: &Class, index: u16, expected: &str) -> VmError {
    VmError::Internal(format!(
        "{}: constant {index} is not a {expected}",
        current.name
    ))
}

pub(crate) fn class(env: &ThreadEnv, current: &Arc<Class>, index: u16) -> VmResult<Arc<Class>> {
    match current.constant_or_err(index)? {
        ConstantPoolInfo::Class(info) => load_class(env, current, info),
        _ => Err(bad_constant(current, index, "class")),
    }
}

pub(crate) fn field(
    env: &ThreadEnv,
    current: &Arc<Class>,
    index: u16,
    is_static: bool,
) -> VmResult<ResolvedField> {
    let ConstantPoolInfo::Fieldref(field_ref) = current.constant_or_err(index)? else {
        return Err(bad_constant(current, index, "field reference"));
    };
    let resolved = field_ref.resolved.get_or_try_init(|| {
        let class = load_class(env, current, &field_ref.class)?;
        let name_and_type = &field_ref.name_and_type;
        let (owner, field) = class
            .lookup_field(&name_and_type.name, &name_and_type.raw_descriptor)
            .ok_or_else(|| LinkageError::NoSuchField {
                class: class.name.to_string(),
                name: name_and_type.name.to_string(),
            })?;
        if field.access_flags.contains(FieldAccessFlag::PRIVATE) && owner.name != current.name {
            return Err(VmError::from(LinkageError::IllegalAccess {
                class: current.name.to_string(),
                target: format!("{}.{}", owner.name, field.name),
            }));
        }
        Ok(ResolvedField {
            is_static: field.is_static(),
            slot: field.slot,
            ty: field.ty,
            class: owner,
        })
    })?;
    if resolved.is_static != is_static {
        return Err(LinkageError::IncompatibleClassChange {
            class: resolved.class.name.to_string(),
            message: format!(
                "expected {} field {}",
                if is_static { "static" } else { "non-static" },
                field_ref.name_and_type.name
            ),
        }
        .into());
    }
    Ok(resolved.clone())
}

pub(crate) fn method(env: &ThreadEnv, current: &Arc<Class>, index: u16) -> VmResult<Arc<Method>> {
    let (method_ref, interface) = match current.constant_or_err(index)? {
        ConstantPoolInfo::Methodref(method_ref) => (method_ref, false),
        ConstantPoolInfo::InterfaceMethodref(method_ref) => (method_ref, true),
        _ => return Err(bad_constant(current, index, "method reference")),
    };
    method_ref
        .resolved
        .get_or_try_init(|| {
            let class = load_class(env, current, &method_ref.class)?;
            let name_and_type = &method_ref.name_and_type;
            if interface != class.is_interface() {
                return Err(VmError::from(LinkageError::IncompatibleClassChange {
                    class: class.name.to_string(),
                    message: format!(
                        "method {} referenced as a{} method",
                        name_and_type.name,
                        if interface { "n interface" } else { " class" }
                    ),
                }));
            }
            let method = class
                .lookup_method(&name_and_type.name, &name_and_type.raw_descriptor)
                .ok_or_else(|| LinkageError::NoSuchMethod {
                    class: class.name.to_string(),
                    name: name_and_type.name.to_string(),
                    descriptor: name_and_type.raw_descriptor.to_string(),
                })?;
            if method.is_private() && method.class_name != current.name {
                return Err(LinkageError::IllegalAccess {
                    class: current.name.to_string(),
                    target: method.to_string(),
                }
                .into());
            }
            Ok(method)
        })
        .map(Arc::clone)
}

pub(crate) fn expect_static(method: &Method, is_static: bool) -> VmResult<()> {
    if method.is_static() == is_static {
        return Ok(());
    }
    Err(LinkageError::IncompatibleClassChange {
        class: method.class_name.to_string(),
        message: format!(
            "expected {} method {}{}",
            if is_static { "static" } else { "non-static" },
            method.name,
            method.raw_descriptor
        ),
    }
    .into())
}

/// Implementation of `method` for a receiver of class `receiver`.
pub(crate) fn select_virtual(receiver: &Class, method: &Arc<Method>) -> VmResult<Arc<Method>> {
    if method.is_private() || method.is_final() {
        return Ok(Arc::clone(method));
    }
    match method.vtable_index.and_then(|index| receiver.vtable.get(index)) {
        Some(selected) => Ok(Arc::clone(selected)),
        // a default method reached through a class reference
        None => select_interface(receiver, method),
    }
}

pub(crate) fn select_interface(receiver: &Class, method: &Arc<Method>) -> VmResult<Arc<Method>> {
    if let Some(selected) = method.vtable_index.and_then(|index| receiver.vtable.get(index)) {
        return Ok(Arc::clone(selected));
    }
    let key = (Arc::clone(&method.name), Arc::clone(&method.raw_descriptor));
    if let Some(selected) = receiver.itable.get(&key) {
        return Ok(Arc::clone(selected));
    }
    if !method.is_abstract() {
        return Ok(Arc::clone(method));
    }
    Err(LinkageError::AbstractMethod {
        class: receiver.name.to_string(),
        name: method.name.to_string(),
        descriptor: method.raw_descriptor.to_string(),
    }
    .into())
}

/// `invokespecial` of a superclass method from `current` selects the
/// nearest override above `current`.
pub(crate) fn select_special(current: &Class, method: &Arc<Method>) -> Arc<Method> {
    if method.is_constructor() || method.is_private() || !current.access_flags.contains(ClassAccessFlag::SUPER) {
        return Arc::clone(method);
    }
    let Some(owner) = method.declaring_class() else {
        return Arc::clone(method);
    };
    if owner.is_interface() || owner.name == current.name || !is_same_or_sub_class_of(current, &owner) {
        return Arc::clone(method);
    }
    current
        .super_class
        .as_ref()
        .and_then(|s| s.lookup_method(&method.name, &method.raw_descriptor))
        .unwrap_or_else(|| Arc::clone(method))
}

/// Whether an access to `class` must first run its initializer. The thread
/// running the initializer may use the class while it is in progress.
pub(crate) fn needs_initialization(env: &ThreadEnv, class: &Class) -> bool {
    !class.is_initialized() && *class.init.state.lock() != InitState::InProgress(env.thread.id)
}
