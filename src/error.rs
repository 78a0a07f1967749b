use thiserror::Error;

/// Failure to produce a class from bytes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadingError {
    #[error("class not found: {0}")]
    NotFound(String),
    #[error("malformed class {class}: {reason}")]
    Malformed { class: String, reason: String },
    #[error("unsupported class file version {major}.{minor} in {class}")]
    UnsupportedVersion {
        class: String,
        major: u16,
        minor: u16,
    },
    #[error("wrong name: expected {expected}, found {found}")]
    WrongName { expected: String, found: String },
    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },
}

impl LoadingError {
    pub fn malformed(class: impl Into<String>, reason: impl Into<String>) -> Self {
        LoadingError::Malformed {
            class: class.into(),
            reason: reason.into(),
        }
    }
}

/// Failure while resolving, verifying, or linking an already loaded class.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkageError {
    #[error("class circularity while loading {0}")]
    Circularity(String),
    #[error("{class}: {message}")]
    IncompatibleClassChange { class: String, message: String },
    #[error("verification of {class}.{method}{descriptor} failed at pc {pc}: {message}")]
    Verify {
        class: String,
        method: String,
        descriptor: String,
        pc: u32,
        message: String,
    },
    #[error("no such field {class}.{name}")]
    NoSuchField { class: String, name: String },
    #[error("no such method {class}.{name}{descriptor}")]
    NoSuchMethod {
        class: String,
        name: String,
        descriptor: String,
    },
    #[error("abstract method {class}.{name}{descriptor}")]
    AbstractMethod {
        class: String,
        name: String,
        descriptor: String,
    },
    #[error("cannot access {target} from {class}")]
    IllegalAccess { class: String, target: String },
    #[error("cannot instantiate {0}")]
    Instantiation(String),
    #[error("no native implementation for {0}")]
    UnsatisfiedLink(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VmError {
    #[error(transparent)]
    Loading(#[from] LoadingError),
    #[error(transparent)]
    Linkage(#[from] LinkageError),
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),
    #[error("host fault: {0}")]
    HostFault(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    /// The throwable class a running program observes for this error, or
    /// `None` when the error is fatal to the engine.
    pub fn java_class(&self) -> Option<&'static str> {
        let name = match self {
            VmError::Loading(LoadingError::NotFound(_) | LoadingError::Io { .. }) => {
                "java/lang/NoClassDefFoundError"
            }
            VmError::Loading(LoadingError::WrongName { .. }) => "java/lang/NoClassDefFoundError",
            VmError::Loading(LoadingError::Malformed { .. }) => "java/lang/ClassFormatError",
            VmError::Loading(LoadingError::UnsupportedVersion { .. }) => {
                "java/lang/UnsupportedClassVersionError"
            }
            VmError::Linkage(error) => match error {
                LinkageError::Circularity(_) => "java/lang/ClassCircularityError",
                LinkageError::IncompatibleClassChange { .. } => {
                    "java/lang/IncompatibleClassChangeError"
                }
                LinkageError::Verify { .. } => "java/lang/VerifyError",
                LinkageError::NoSuchField { .. } => "java/lang/NoSuchFieldError",
                LinkageError::NoSuchMethod { .. } => "java/lang/NoSuchMethodError",
                LinkageError::AbstractMethod { .. } => "java/lang/AbstractMethodError",
                LinkageError::IllegalAccess { .. } => "java/lang/IllegalAccessError",
                LinkageError::Instantiation(_) => "java/lang/InstantiationError",
                LinkageError::UnsatisfiedLink(_) => "java/lang/UnsatisfiedLinkError",
            },
            VmError::ResourceExhaustion(_) => "java/lang/OutOfMemoryError",
            VmError::HostFault(_) | VmError::Internal(_) => return None,
        };
        Some(name)
    }

    pub fn is_fatal(&self) -> bool {
        self.java_class().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_java_class_mapping() {
        let error = VmError::from(LinkageError::Circularity("A".into()));
        assert_eq!(error.java_class(), Some("java/lang/ClassCircularityError"));
        assert!(!error.is_fatal());

        let error = VmError::from(LoadingError::NotFound("Missing".into()));
        assert_eq!(error.java_class(), Some("java/lang/NoClassDefFoundError"));

        assert!(VmError::HostFault("spawn".into()).is_fatal());
        assert!(VmError::Internal("bug".into()).is_fatal());
    }

    #[test]
    fn test_display() {
        let error = VmError::from(LinkageError::Verify {
            class: "A".into(),
            method: "m".into(),
            descriptor: "()V".into(),
            pc: 3,
            message: "stack underflow".into(),
        });
        assert_eq!(
            error.to_string(),
            "verification of A.m()V failed at pc 3: stack underflow"
        );
    }
}
