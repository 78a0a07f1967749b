use std::{collections::HashSet, fmt, sync::Arc};

use crate::{descriptor::FieldType, error::VmResult, runtime::Class};

pub(crate) const OBJECT: &str = "java/lang/Object";

/// Type of one local-variable or operand-stack slot during verification.
/// Category 2 values are a `Long`/`Double` followed by `Top`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VerificationType {
    Top,
    Int,
    Float,
    Long,
    Double,
    Null,
    /// `this` in a constructor before the superclass constructor ran.
    UninitializedThis,
    /// Result of the `new` at this pc before its constructor ran.
    Uninitialized(u32),
    /// A class or array type by internal name.
    Reference(Arc<str>),
}

impl VerificationType {
    pub(crate) fn reference(name: &str) -> Self {
        VerificationType::Reference(Arc::from(name))
    }

    pub(crate) fn from_field_type(ty: &FieldType) -> Self {
        match ty {
            FieldType::Boolean
            | FieldType::Byte
            | FieldType::Char
            | FieldType::Short
            | FieldType::Int => VerificationType::Int,
            FieldType::Float => VerificationType::Float,
            FieldType::Long => VerificationType::Long,
            FieldType::Double => VerificationType::Double,
            FieldType::Object(name) => VerificationType::Reference(Arc::clone(name)),
            FieldType::Array(_) => VerificationType::Reference(Arc::from(ty.to_string())),
        }
    }

    /// Whether the slot holds a heap reference (possibly null or not yet
    /// constructed).
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            VerificationType::Null
                | VerificationType::UninitializedThis
                | VerificationType::Uninitialized(_)
                | VerificationType::Reference(_)
        )
    }

    pub(crate) fn is_uninitialized(&self) -> bool {
        matches!(
            self,
            VerificationType::UninitializedThis | VerificationType::Uninitialized(_)
        )
    }

    pub(crate) fn is_category2(&self) -> bool {
        matches!(self, VerificationType::Long | VerificationType::Double)
    }

    /// Element type of an array type, `None` if this is not an array.
    pub(crate) fn component(&self) -> Option<VerificationType> {
        let VerificationType::Reference(name) = self else {
            return None;
        };
        let component = name.strip_prefix('[')?;
        Some(match component.as_bytes().first()? {
            b'L' => VerificationType::reference(component.get(1..component.len() - 1)?),
            b'[' => VerificationType::reference(component),
            b'J' => VerificationType::Long,
            b'D' => VerificationType::Double,
            b'F' => VerificationType::Float,
            _ => VerificationType::Int,
        })
    }
}

impl fmt::Display for VerificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationType::Top => f.write_str("top"),
            VerificationType::Int => f.write_str("int"),
            VerificationType::Float => f.write_str("float"),
            VerificationType::Long => f.write_str("long"),
            VerificationType::Double => f.write_str("double"),
            VerificationType::Null => f.write_str("null"),
            VerificationType::UninitializedThis => f.write_str("uninitializedThis"),
            VerificationType::Uninitialized(pc) => write!(f, "uninitialized({pc})"),
            VerificationType::Reference(name) => f.write_str(name),
        }
    }
}

/// Class lookups the verifier needs for subtyping. Loading here must not
/// link or initialize anything.
pub(crate) trait ClassHierarchy {
    fn load(&self, name: &str) -> VmResult<Arc<Class>>;
}

fn array_component_name(name: &str) -> Option<&str> {
    name.strip_prefix('[')
}

/// Subtyping as the verifier sees it: every reference is assignable to an
/// interface type, since interface types are only checked at run time.
pub(crate) fn is_assignable(
    hierarchy: &dyn ClassHierarchy,
    from: &VerificationType,
    to: &VerificationType,
) -> VmResult<bool> {
    use VerificationType as T;
    if from == to {
        return Ok(true);
    }
    Ok(match (from, to) {
        (_, T::Top) => true,
        (T::Null, T::Reference(_)) => true,
        (T::Reference(from), T::Reference(to)) => is_reference_assignable(hierarchy, from, to)?,
        _ => false,
    })
}

fn is_reference_assignable(hierarchy: &dyn ClassHierarchy, from: &str, to: &str) -> VmResult<bool> {
    if from == to || to == OBJECT {
        return Ok(true);
    }
    match (array_component_name(from), array_component_name(to)) {
        (Some(from_component), Some(to_component)) => {
            let from_ref = reference_component(from_component);
            let to_ref = reference_component(to_component);
            match (from_ref, to_ref) {
                (Some(from), Some(to)) => is_reference_assignable(hierarchy, from, to),
                _ => Ok(false),
            }
        }
        (Some(_), None) => Ok(matches!(to, "java/lang/Cloneable" | "java/io/Serializable")),
        (None, Some(_)) => Ok(false),
        (None, None) => {
            let target = hierarchy.load(to)?;
            if target.is_interface() {
                return Ok(true);
            }
            let mut current = Some(hierarchy.load(from)?);
            while let Some(class) = current {
                if &*class.name == to {
                    return Ok(true);
                }
                current = class.super_class.clone();
            }
            Ok(false)
        }
    }
}

/// Class name of a reference array component descriptor (`Lpkg/A;` or a
/// nested array), `None` for primitives.
fn reference_component(component: &str) -> Option<&str> {
    if component.starts_with('[') {
        Some(component)
    } else {
        component.strip_prefix('L')?.strip_suffix(';')
    }
}

/// Least upper bound of two types; `Top` when they do not merge.
pub(crate) fn merge(
    hierarchy: &dyn ClassHierarchy,
    a: &VerificationType,
    b: &VerificationType,
) -> VmResult<VerificationType> {
    use VerificationType as T;
    if a == b {
        return Ok(a.clone());
    }
    Ok(match (a, b) {
        (T::Null, T::Reference(_)) => b.clone(),
        (T::Reference(_), T::Null) => a.clone(),
        (T::Reference(x), T::Reference(y)) => T::Reference(common_super(hierarchy, x, y)?),
        _ => T::Top,
    })
}

fn common_super(hierarchy: &dyn ClassHierarchy, a: &Arc<str>, b: &Arc<str>) -> VmResult<Arc<str>> {
    match (array_component_name(a), array_component_name(b)) {
        (Some(x), Some(y)) => {
            return Ok(match (reference_component(x), reference_component(y)) {
                (Some(x), Some(y)) => {
                    let component = common_super(hierarchy, &Arc::from(x), &Arc::from(y))?;
                    if component.starts_with('[') {
                        Arc::from(format!("[{component}"))
                    } else {
                        Arc::from(format!("[L{component};"))
                    }
                }
                _ => Arc::from(OBJECT),
            });
        }
        (None, None) => {}
        _ => return Ok(Arc::from(OBJECT)),
    }

    let a_class = hierarchy.load(a)?;
    let b_class = hierarchy.load(b)?;
    if a_class.is_interface() || b_class.is_interface() {
        return Ok(Arc::from(OBJECT));
    }
    let mut ancestors = HashSet::new();
    let mut current = Some(a_class);
    while let Some(class) = current {
        ancestors.insert(Arc::clone(&class.name));
        current = class.super_class.clone();
    }
    let mut current = Some(b_class);
    while let Some(class) = current {
        if ancestors.contains(&class.name) {
            return Ok(Arc::clone(&class.name));
        }
        current = class.super_class.clone();
    }
    Ok(Arc::from(OBJECT))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoClasses;

    impl ClassHierarchy for NoClasses {
        fn load(&self, name: &str) -> VmResult<Arc<Class>> {
            Err(crate::error::LoadingError::NotFound(name.to_string()).into())
        }
    }

    #[test]
    fn test_component() {
        let t = VerificationType::reference("[Ljava/lang/String;");
        assert_eq!(t.component(), Some(VerificationType::reference("java/lang/String")));
        let t = VerificationType::reference("[[I");
        assert_eq!(t.component(), Some(VerificationType::reference("[I")));
        let t = VerificationType::reference("[J");
        assert_eq!(t.component(), Some(VerificationType::Long));
        assert_eq!(VerificationType::reference(OBJECT).component(), None);
    }

    #[test]
    fn test_merge_without_loading() {
        let h = NoClasses;
        let string = VerificationType::reference("java/lang/String");
        assert_eq!(
            merge(&h, &VerificationType::Null, &string).unwrap(),
            string
        );
        assert_eq!(
            merge(&h, &VerificationType::Int, &VerificationType::Float).unwrap(),
            VerificationType::Top
        );
        assert_eq!(
            merge(
                &h,
                &VerificationType::reference("[I"),
                &VerificationType::reference("[J")
            )
            .unwrap(),
            VerificationType::reference(OBJECT)
        );
    }

    #[test]
    fn test_array_assignability() {
        let h = NoClasses;
        let ints = VerificationType::reference("[I");
        assert!(is_assignable(&h, &ints, &VerificationType::reference(OBJECT)).unwrap());
        assert!(
            is_assignable(&h, &ints, &VerificationType::reference("java/lang/Cloneable")).unwrap()
        );
        assert!(!is_assignable(&h, &ints, &VerificationType::reference("[J")).unwrap());
        assert!(!is_assignable(&h, &VerificationType::Int, &VerificationType::Float).unwrap());
    }
}
