use crate::runtime::Class;

/// Whether a value of class `source` may be stored where `target` is expected
/// (`checkcast`, `instanceof`, `aastore` and exception matching).
pub(crate) fn is_assignable(source: &Class, target: &Class) -> bool {
    if source.name == target.name {
        return true;
    }
    match (&source.array, &target.array) {
        (Some(source_array), Some(target_array)) => {
            match (&source_array.component_class, &target_array.component_class) {
                (Some(source_component), Some(target_component)) => {
                    is_assignable(source_component, target_component)
                }
                // primitive components must match exactly, which the name
                // comparison above already covered
                _ => false,
            }
        }
        (Some(_), None) => matches!(
            &*target.name,
            "java/lang/Object" | "java/lang/Cloneable" | "java/io/Serializable"
        ),
        (None, Some(_)) => false,
        (None, None) => {
            if target.is_interface() {
                source.all_interfaces.contains(&target.name)
            } else if source.is_interface() {
                &*target.name == "java/lang/Object"
            } else {
                is_same_or_sub_class_of(source, target)
            }
        }
    }
}

pub(crate) fn is_same_or_sub_class_of(source: &Class, target: &Class) -> bool {
    let mut current = Some(source);
    while let Some(class) = current {
        if class.name == target.name {
            return true;
        }
        current = class.super_class.as_deref();
    }
    false
}
