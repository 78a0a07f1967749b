use std::sync::Arc;

use crate::{
    consts::{ClassAccessFlag, FieldAccessFlag, MethodAccessFlag},
    error::LoadingError,
};

#[derive(Debug)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: Vec<ConstantPoolInfo>,
    pub access_flags: ClassAccessFlag,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<AttributeInfo>,
}

/// Constant-pool entries exactly as stored; index 0 is not represented, so
/// pool index `i` lives at `constant_pool[i - 1]`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantPoolInfo {
    Utf8(Arc<str>),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class {
        name_index: u16,
    },
    String {
        string_index: u16,
    },
    Fieldref {
        class_index: u16,
        name_and_type_index: u16,
    },
    Methodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    Module {
        name_index: u16,
    },
    Package {
        name_index: u16,
    },
    /// Second slot of a `Long`/`Double` entry.
    Empty,
}

#[derive(Debug)]
pub struct FieldInfo {
    pub access_flags: FieldAccessFlag,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug)]
pub struct MethodInfo {
    pub access_flags: MethodAccessFlag,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug)]
pub struct AttributeInfo {
    pub attribute_name_index: u16,
    pub info: Vec<u8>,
}

impl ClassFile {
    pub fn entry(&self, index: u16) -> Result<&ConstantPoolInfo, LoadingError> {
        index
            .checked_sub(1)
            .and_then(|i| self.constant_pool.get(i as usize))
            .ok_or_else(|| self.malformed(format!("constant pool index {index} out of range")))
    }

    pub fn utf8(&self, index: u16) -> Result<&Arc<str>, LoadingError> {
        match self.entry(index)? {
            ConstantPoolInfo::Utf8(s) => Ok(s),
            other => Err(self.malformed(format!(
                "constant pool index {index} is {other:?}, expected Utf8"
            ))),
        }
    }

    pub fn class_name(&self, index: u16) -> Result<&Arc<str>, LoadingError> {
        match self.entry(index)? {
            ConstantPoolInfo::Class { name_index } => self.utf8(*name_index),
            other => Err(self.malformed(format!(
                "constant pool index {index} is {other:?}, expected Class"
            ))),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&Arc<str>, &Arc<str>), LoadingError> {
        match self.entry(index)? {
            ConstantPoolInfo::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            other => Err(self.malformed(format!(
                "constant pool index {index} is {other:?}, expected NameAndType"
            ))),
        }
    }

    /// Name of this class, or a placeholder when the pool is broken.
    pub fn this_class_name(&self) -> Result<&Arc<str>, LoadingError> {
        self.class_name(self.this_class)
    }

    pub fn super_class_name(&self) -> Result<Option<&Arc<str>>, LoadingError> {
        if self.super_class == 0 {
            Ok(None)
        } else {
            self.class_name(self.super_class).map(Some)
        }
    }

    pub fn find_attribute<'a>(
        &self,
        attributes: &'a [AttributeInfo],
        name: &str,
    ) -> Result<Option<&'a AttributeInfo>, LoadingError> {
        for attribute in attributes {
            if &**self.utf8(attribute.attribute_name_index)? == name {
                return Ok(Some(attribute));
            }
        }
        Ok(None)
    }

    pub(crate) fn malformed(&self, reason: String) -> LoadingError {
        let class = match self
            .this_class
            .checked_sub(1)
            .and_then(|i| self.constant_pool.get(i as usize))
        {
            Some(ConstantPoolInfo::Class { name_index }) => name_index
                .checked_sub(1)
                .and_then(|i| self.constant_pool.get(i as usize))
                .and_then(|e| match e {
                    ConstantPoolInfo::Utf8(s) => Some(s.to_string()),
                    _ => None,
                }),
            _ => None,
        };
        LoadingError::malformed(class.unwrap_or_else(|| "<unknown>".to_string()), reason)
    }
}
