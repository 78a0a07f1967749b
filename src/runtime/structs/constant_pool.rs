use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::{
    descriptor::{FieldType, MethodDescriptor},
    runtime::{Class, Method, Reference},
};

#[derive(Debug)]
pub enum ConstantPoolInfo {
    Utf8(Arc<str>),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(CpClassInfo),
    String(CpStringInfo),
    Fieldref(FieldRef),
    Methodref(MethodRef),
    InterfaceMethodref(MethodRef),
    NameAndType(CpNameAndTypeInfo<Arc<str>>),
    MethodHandle,
    MethodType,
    Dynamic,
    InvokeDynamic,
    Module(Arc<str>),
    Package(Arc<str>),
    Empty,
}

/// A symbolic class reference; `class` caches the resolution.
#[derive(Debug)]
pub struct CpClassInfo {
    pub(crate) name: Arc<str>,
    pub(crate) class: OnceCell<Arc<Class>>,
}

impl CpClassInfo {
    pub(crate) fn new(name: Arc<str>) -> Self {
        Self {
            name,
            class: OnceCell::new(),
        }
    }

    pub(crate) fn get_or_load_class<E>(
        &self,
        resolver: impl FnOnce(&str) -> Result<Arc<Class>, E>,
    ) -> Result<Arc<Class>, E> {
        self.class
            .get_or_try_init(|| resolver(&self.name))
            .map(Arc::clone)
    }
}

#[derive(Debug)]
pub struct CpStringInfo {
    pub(crate) value: Arc<str>,
    /// The interned string object; interned strings are permanent roots.
    pub(crate) interned: OnceCell<Reference>,
}

#[derive(Debug, Clone)]
pub struct CpNameAndTypeInfo<T> {
    pub(crate) name: Arc<str>,
    pub(crate) descriptor: T,
    pub(crate) raw_descriptor: Arc<str>,
}

#[derive(Debug)]
pub struct FieldRef {
    pub(crate) class: CpClassInfo,
    pub(crate) name_and_type: CpNameAndTypeInfo<FieldType>,
    pub(crate) resolved: OnceCell<ResolvedField>,
}

#[derive(Debug, Clone)]
pub struct ResolvedField {
    /// Class declaring the field; static accesses initialize it.
    pub(crate) class: Arc<Class>,
    pub(crate) slot: u16,
    pub(crate) is_static: bool,
    pub(crate) ty: FieldType,
}

#[derive(Debug)]
pub struct MethodRef {
    pub(crate) class: CpClassInfo,
    pub(crate) name_and_type: CpNameAndTypeInfo<MethodDescriptor>,
    pub(crate) resolved: OnceCell<Arc<Method>>,
}
