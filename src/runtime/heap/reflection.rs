//! Runtime data attached to particular objects: the class behind each
//! `java/lang/Class` mirror and the captured stack of each throwable.

use std::{fmt, sync::Arc};

use crate::runtime::{Class, Method, Reference, heap::Heap};

/// One frame of a captured stack trace.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub(crate) method: Arc<Method>,
    pub(crate) pc: u32,
}

impl TraceEntry {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn line_number(&self) -> Option<u16> {
        self.method.code()?.line_number(self.pc as usize)
    }
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = self.method.class_name.replace('/', ".");
        write!(f, "{class}.{}(", self.method.name)?;
        let file = self
            .method
            .declaring_class()
            .and_then(|c| c.source_file.clone());
        match (self.method.is_native(), file, self.line_number()) {
            (true, _, _) => f.write_str("Native Method)"),
            (false, Some(file), Some(line)) => write!(f, "{file}:{line})"),
            (false, Some(file), None) => write!(f, "{file})"),
            (false, None, _) => f.write_str("Unknown Source)"),
        }
    }
}

impl Heap {
    /// Mirrors live as long as the process; classes are never unloaded.
    pub(crate) fn register_mirror(&self, mirror: Reference, class: &Arc<Class>) {
        self.mirrors.insert(mirror, Arc::clone(class));
    }

    pub(crate) fn mirrored_class(&self, mirror: Reference) -> Option<Arc<Class>> {
        self.mirrors.get(&mirror).map(|c| Arc::clone(c.value()))
    }

    pub(crate) fn set_backtrace(&self, throwable: Reference, trace: Arc<[TraceEntry]>) {
        self.backtraces.insert(throwable, trace);
    }

    pub(crate) fn backtrace(&self, throwable: Reference) -> Option<Arc<[TraceEntry]>> {
        self.backtraces.get(&throwable).map(|t| Arc::clone(t.value()))
    }
}
