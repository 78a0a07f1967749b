//! Turns parsed class files into runtime [`Class`]es: constant-pool
//! conversion, field layout, virtual and interface dispatch tables.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64},
    },
};

use nom::{
    IResult, Parser,
    bytes::complete::take,
    multi::count,
    number::complete::{be_u16, be_u32},
};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::{
    class::{self, ClassFile},
    consts::{ClassAccessFlag, FieldAccessFlag, MethodAccessFlag},
    descriptor::{FieldDescriptor, FieldType, MethodDescriptor},
    error::{LinkageError, LoadingError, VmResult},
    runtime::{
        ArrayInfo, Class, ClassInit, CodeAttribute, ConstantPoolInfo, ConstantValue, CpClassInfo,
        CpNameAndTypeInfo, CpStringInfo, ExceptionTableItem, FieldInfo, FieldRef,
        LineNumberTableItem, Method, MethodRef, jit::MethodProfile,
    },
};

mod bootstrap;
mod source;

pub use bootstrap::ClassRegistry;
pub use source::{
    ClassSource, DirectorySource, JarSource, MemorySource, class_path_sources, source_for_path,
};

/// Builds the runtime class for `file`. The superclass and direct
/// interfaces must already be loaded.
pub(crate) fn define_class(
    file: &ClassFile,
    super_class: Option<Arc<Class>>,
    interfaces: Vec<Arc<Class>>,
) -> VmResult<Arc<Class>> {
    let name = Arc::clone(file.this_class_name()?);
    check_supertypes(file, &name, super_class.as_deref(), &interfaces)?;

    let constant_pool = convert_constant_pool(file)?;

    let inherited_slots = super_class.as_ref().map_or(0, |s| s.instance_slots);
    let mut instance_refs: Vec<u16> = super_class
        .as_ref()
        .map(|s| s.instance_refs.to_vec())
        .unwrap_or_default();
    let mut static_refs = Vec::new();
    let mut instance_slots = inherited_slots;
    let mut static_slots = 0usize;
    let mut fields = Vec::with_capacity(file.fields.len());
    for field in &file.fields {
        let field_name = Arc::clone(file.utf8(field.name_index)?);
        let raw_descriptor = Arc::clone(file.utf8(field.descriptor_index)?);
        let FieldDescriptor(ty) = raw_descriptor.parse()?;
        let is_static = field.access_flags.contains(FieldAccessFlag::STATIC);
        let slot = if is_static {
            static_slots += 1;
            static_slots - 1
        } else {
            instance_slots += 1;
            instance_slots - 1
        };
        let slot = u16::try_from(slot)
            .map_err(|_| LoadingError::malformed(&*name, "too many fields"))?;
        if ty.is_reference() {
            if is_static {
                static_refs.push(slot);
            } else {
                instance_refs.push(slot);
            }
        }
        let constant_value = if is_static {
            match file.find_attribute(&field.attributes, "ConstantValue")? {
                Some(attribute) => Some(constant_value(file, &attribute.info, &ty)?),
                None => None,
            }
        } else {
            None
        };
        fields.push(FieldInfo {
            access_flags: field.access_flags,
            name: field_name,
            ty,
            raw_descriptor,
            slot,
            constant_value,
        });
    }

    let is_interface = file.access_flags.contains(ClassAccessFlag::INTERFACE);
    let mut vtable_layout = VtableLayout::inherit(super_class.as_deref());
    let mut methods = Vec::with_capacity(file.methods.len());
    for method in &file.methods {
        let method_name = Arc::clone(file.utf8(method.name_index)?);
        let raw_descriptor = Arc::clone(file.utf8(method.descriptor_index)?);
        let descriptor: MethodDescriptor = raw_descriptor.parse()?;
        let flags = method.access_flags;
        let code = match file.find_attribute(&method.attributes, "Code")? {
            Some(attribute) => Some(parse_code(file, &name, &attribute.info)?),
            None => None,
        };
        let has_body = !flags.intersects(MethodAccessFlag::NATIVE | MethodAccessFlag::ABSTRACT);
        if has_body != code.is_some() {
            return Err(LoadingError::malformed(
                &*name,
                format!("method {method_name}{raw_descriptor} has a misplaced Code attribute"),
            )
            .into());
        }
        let vtable_index = if is_interface || !is_virtual(flags, &method_name) {
            None
        } else {
            Some(vtable_layout.place(&name, &method_name, &raw_descriptor)?)
        };
        let receiver = usize::from(!flags.contains(MethodAccessFlag::STATIC));
        methods.push(PendingMethod {
            arg_slots: descriptor.parameter_slots() + receiver,
            name: method_name,
            descriptor,
            raw_descriptor,
            access_flags: flags,
            code,
            vtable_index,
        });
    }

    let mut all_interfaces: HashSet<Arc<str>> = super_class
        .as_ref()
        .map(|s| s.all_interfaces.clone())
        .unwrap_or_default();
    for interface in &interfaces {
        all_interfaces.insert(Arc::clone(&interface.name));
        all_interfaces.extend(interface.all_interfaces.iter().cloned());
    }

    let source_file = match file.find_attribute(&file.attributes, "SourceFile")? {
        Some(attribute) if attribute.info.len() == 2 => Some(Arc::clone(
            file.utf8(u16::from_be_bytes([attribute.info[0], attribute.info[1]]))?,
        )),
        _ => None,
    };

    let class = Arc::new_cyclic(|weak: &Weak<Class>| {
        let methods: Vec<Arc<Method>> = methods
            .into_iter()
            .map(|m| Arc::new(m.into_method(weak.clone(), Arc::clone(&name))))
            .collect();
        let vtable = vtable_layout.finish(&methods);
        let itable = if is_interface {
            HashMap::new()
        } else {
            build_itable(&vtable, super_class.as_deref(), &interfaces)
        };
        Class {
            name: Arc::clone(&name),
            access_flags: file.access_flags,
            super_class,
            interfaces,
            all_interfaces,
            constant_pool,
            fields,
            methods,
            instance_slots,
            instance_refs: instance_refs.into_boxed_slice(),
            static_fields: (0..static_slots).map(|_| AtomicU64::new(0)).collect(),
            static_refs: static_refs.into_boxed_slice(),
            vtable,
            itable,
            array: None,
            source_file,
            linked: AtomicBool::new(false),
            init: ClassInit::new(false),
            mirror: OnceCell::new(),
        }
    });
    Ok(class)
}

/// Array classes extend `Object`, implement `Cloneable` and `Serializable`,
/// and are born linked and initialized.
pub(crate) fn define_array_class(
    name: Arc<str>,
    component: FieldType,
    component_class: Option<Arc<Class>>,
    object: Arc<Class>,
    array_interfaces: Vec<Arc<Class>>,
) -> Arc<Class> {
    let all_interfaces = array_interfaces
        .iter()
        .map(|i| Arc::clone(&i.name))
        .collect();
    Arc::new(Class {
        name,
        access_flags: ClassAccessFlag::PUBLIC | ClassAccessFlag::FINAL | ClassAccessFlag::ABSTRACT,
        vtable: object.vtable.clone(),
        super_class: Some(object),
        interfaces: array_interfaces,
        all_interfaces,
        constant_pool: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
        instance_slots: 0,
        instance_refs: Box::new([]),
        static_fields: Box::new([]),
        static_refs: Box::new([]),
        itable: HashMap::new(),
        array: Some(ArrayInfo {
            component,
            component_class,
        }),
        source_file: None,
        linked: AtomicBool::new(true),
        init: ClassInit::new(true),
        mirror: OnceCell::new(),
    })
}

fn check_supertypes(
    file: &ClassFile,
    name: &str,
    super_class: Option<&Class>,
    interfaces: &[Arc<Class>],
) -> VmResult<()> {
    let incompatible = |message: String| LinkageError::IncompatibleClassChange {
        class: name.to_string(),
        message,
    };
    match super_class {
        Some(super_class) => {
            if super_class.is_interface() {
                return Err(incompatible(format!(
                    "superclass {} is an interface",
                    super_class.name
                ))
                .into());
            }
            if super_class.is_final() || super_class.is_array() {
                return Err(incompatible(format!(
                    "cannot inherit from final class {}",
                    super_class.name
                ))
                .into());
            }
            if file.access_flags.contains(ClassAccessFlag::INTERFACE)
                && &*super_class.name != "java/lang/Object"
            {
                return Err(incompatible("interface superclass must be Object".to_string()).into());
            }
        }
        None if name != "java/lang/Object" => {
            return Err(LoadingError::malformed(name, "missing superclass").into());
        }
        None => {}
    }
    for interface in interfaces {
        if !interface.is_interface() {
            return Err(incompatible(format!("{} is not an interface", interface.name)).into());
        }
    }
    Ok(())
}

fn is_virtual(flags: MethodAccessFlag, name: &str) -> bool {
    !flags.intersects(MethodAccessFlag::STATIC | MethodAccessFlag::PRIVATE)
        && name != "<init>"
        && name != "<clinit>"
}

/// Method data gathered before the owning class exists.
struct PendingMethod {
    name: Arc<str>,
    descriptor: MethodDescriptor,
    raw_descriptor: Arc<str>,
    access_flags: MethodAccessFlag,
    code: Option<CodeAttribute>,
    arg_slots: usize,
    vtable_index: Option<usize>,
}

impl PendingMethod {
    fn into_method(self, class: Weak<Class>, class_name: Arc<str>) -> Method {
        Method {
            class,
            class_name,
            name: self.name,
            descriptor: self.descriptor,
            raw_descriptor: self.raw_descriptor,
            access_flags: self.access_flags,
            code: self.code,
            arg_slots: self.arg_slots,
            vtable_index: self.vtable_index,
            stack_maps: OnceCell::new(),
            profile: MethodProfile::default(),
            compiled: RwLock::new(None),
            native: OnceCell::new(),
            breakpoints: Mutex::new(Default::default()),
            has_breakpoints: AtomicBool::new(false),
        }
    }
}

enum VtableSlot {
    Inherited(Arc<Method>),
    /// Index into the methods declared by the class being defined.
    Own(usize),
}

/// The superclass's vtable with overrides applied and new virtual methods
/// appended.
struct VtableLayout {
    slots: Vec<VtableSlot>,
    declared: usize,
}

impl VtableLayout {
    fn inherit(super_class: Option<&Class>) -> Self {
        Self {
            slots: super_class
                .map(|s| {
                    s.vtable
                        .iter()
                        .map(|m| VtableSlot::Inherited(Arc::clone(m)))
                        .collect()
                })
                .unwrap_or_default(),
            declared: 0,
        }
    }

    /// Assigns a slot to the next declared virtual method; must be called
    /// in declaration order.
    fn place(&mut self, class: &str, name: &str, descriptor: &str) -> VmResult<usize> {
        let own = self.declared;
        self.declared += 1;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let VtableSlot::Inherited(method) = slot
                && &*method.name == name
                && &*method.raw_descriptor == descriptor
            {
                if method.is_final() {
                    return Err(LinkageError::IncompatibleClassChange {
                        class: class.to_string(),
                        message: format!("overrides final method {method}"),
                    }
                    .into());
                }
                *slot = VtableSlot::Own(own);
                return Ok(index);
            }
        }
        self.slots.push(VtableSlot::Own(own));
        Ok(self.slots.len() - 1)
    }

    fn finish(self, methods: &[Arc<Method>]) -> Vec<Arc<Method>> {
        let virtuals: Vec<&Arc<Method>> = methods
            .iter()
            .filter(|m| m.vtable_index.is_some())
            .collect();
        self.slots
            .into_iter()
            .map(|slot| match slot {
                VtableSlot::Inherited(method) => method,
                VtableSlot::Own(index) => Arc::clone(virtuals[index]),
            })
            .collect()
    }
}

/// Maps every method of every superinterface to the implementation a
/// receiver of this class runs: a class method, else the first default
/// method found, else the abstract declaration.
fn build_itable(
    vtable: &[Arc<Method>],
    super_class: Option<&Class>,
    interfaces: &[Arc<Class>],
) -> HashMap<(Arc<str>, Arc<str>), Arc<Method>> {
    let mut all = Vec::new();
    let mut seen = HashSet::new();
    let mut queue: Vec<&Arc<Class>> = interfaces.iter().collect();
    let mut current = super_class;
    while let Some(class) = current {
        queue.extend(class.interfaces.iter());
        current = class.super_class.as_deref();
    }
    let mut next = 0;
    while next < queue.len() {
        let interface = queue[next];
        next += 1;
        if seen.insert(Arc::as_ptr(interface)) {
            all.push(interface);
            queue.extend(interface.interfaces.iter());
        }
    }

    let by_signature: HashMap<(&str, &str), &Arc<Method>> = vtable
        .iter()
        .map(|m| ((&*m.name, &*m.raw_descriptor), m))
        .collect();

    let mut itable: HashMap<(Arc<str>, Arc<str>), Arc<Method>> = HashMap::new();
    for interface in &all {
        for method in &interface.methods {
            if method.is_static() || method.is_private() || &*method.name == "<clinit>" {
                continue;
            }
            let key = (Arc::clone(&method.name), Arc::clone(&method.raw_descriptor));
            if let Some(implementation) = by_signature.get(&(&*method.name, &*method.raw_descriptor))
                && !implementation.is_abstract()
            {
                itable.insert(key, Arc::clone(implementation));
                continue;
            }
            match itable.get(&key) {
                Some(existing) if !existing.is_abstract() => {}
                Some(_) if method.is_abstract() => {}
                _ => {
                    itable.insert(key, Arc::clone(method));
                }
            }
        }
    }
    itable
}

fn convert_constant_pool(file: &ClassFile) -> Result<Vec<ConstantPoolInfo>, LoadingError> {
    let mut constant_pool = Vec::with_capacity(file.constant_pool.len());
    for cp_info in &file.constant_pool {
        type Raw = class::ConstantPoolInfo;
        let converted = match cp_info {
            Raw::Utf8(v) => ConstantPoolInfo::Utf8(Arc::clone(v)),
            Raw::Integer(v) => ConstantPoolInfo::Integer(*v),
            Raw::Float(v) => ConstantPoolInfo::Float(*v),
            Raw::Long(v) => ConstantPoolInfo::Long(*v),
            Raw::Double(v) => ConstantPoolInfo::Double(*v),
            Raw::Class { name_index } => {
                ConstantPoolInfo::Class(CpClassInfo::new(Arc::clone(file.utf8(*name_index)?)))
            }
            Raw::String { string_index } => ConstantPoolInfo::String(CpStringInfo {
                value: Arc::clone(file.utf8(*string_index)?),
                interned: OnceCell::new(),
            }),
            Raw::Fieldref {
                class_index,
                name_and_type_index,
            } => {
                let (name, raw_descriptor) = file.name_and_type(*name_and_type_index)?;
                let FieldDescriptor(descriptor) = raw_descriptor.parse()?;
                ConstantPoolInfo::Fieldref(FieldRef {
                    class: CpClassInfo::new(Arc::clone(file.class_name(*class_index)?)),
                    name_and_type: CpNameAndTypeInfo {
                        name: Arc::clone(name),
                        descriptor,
                        raw_descriptor: Arc::clone(raw_descriptor),
                    },
                    resolved: OnceCell::new(),
                })
            }
            Raw::Methodref {
                class_index,
                name_and_type_index,
            }
            | Raw::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => {
                let (name, raw_descriptor) = file.name_and_type(*name_and_type_index)?;
                let method_ref = MethodRef {
                    class: CpClassInfo::new(Arc::clone(file.class_name(*class_index)?)),
                    name_and_type: CpNameAndTypeInfo {
                        name: Arc::clone(name),
                        descriptor: raw_descriptor.parse()?,
                        raw_descriptor: Arc::clone(raw_descriptor),
                    },
                    resolved: OnceCell::new(),
                };
                if matches!(cp_info, Raw::Methodref { .. }) {
                    ConstantPoolInfo::Methodref(method_ref)
                } else {
                    ConstantPoolInfo::InterfaceMethodref(method_ref)
                }
            }
            Raw::NameAndType {
                name_index,
                descriptor_index,
            } => {
                let descriptor = Arc::clone(file.utf8(*descriptor_index)?);
                ConstantPoolInfo::NameAndType(CpNameAndTypeInfo {
                    name: Arc::clone(file.utf8(*name_index)?),
                    raw_descriptor: Arc::clone(&descriptor),
                    descriptor,
                })
            }
            Raw::MethodHandle { .. } => ConstantPoolInfo::MethodHandle,
            Raw::MethodType { .. } => ConstantPoolInfo::MethodType,
            Raw::Dynamic { .. } => ConstantPoolInfo::Dynamic,
            Raw::InvokeDynamic { .. } => ConstantPoolInfo::InvokeDynamic,
            Raw::Module { name_index } => ConstantPoolInfo::Module(Arc::clone(file.utf8(*name_index)?)),
            Raw::Package { name_index } => {
                ConstantPoolInfo::Package(Arc::clone(file.utf8(*name_index)?))
            }
            Raw::Empty => ConstantPoolInfo::Empty,
        };
        constant_pool.push(converted);
    }
    Ok(constant_pool)
}

fn constant_value(file: &ClassFile, info: &[u8], ty: &FieldType) -> Result<ConstantValue, LoadingError> {
    let [high, low] = info else {
        return Err(file.malformed("bad ConstantValue attribute".to_string()));
    };
    let index = u16::from_be_bytes([*high, *low]);
    let value = match (file.entry(index)?, ty) {
        (
            class::ConstantPoolInfo::Integer(v),
            FieldType::Int
            | FieldType::Short
            | FieldType::Char
            | FieldType::Byte
            | FieldType::Boolean,
        ) => ConstantValue::Int(*v),
        (class::ConstantPoolInfo::Long(v), FieldType::Long) => ConstantValue::Long(*v),
        (class::ConstantPoolInfo::Float(v), FieldType::Float) => ConstantValue::Float(*v),
        (class::ConstantPoolInfo::Double(v), FieldType::Double) => ConstantValue::Double(*v),
        (class::ConstantPoolInfo::String { string_index }, FieldType::Object(name))
            if &**name == "java/lang/String" =>
        {
            ConstantValue::String(Arc::clone(file.utf8(*string_index)?))
        }
        (entry, _) => {
            return Err(file.malformed(format!(
                "ConstantValue {entry:?} does not match field type {ty}"
            )));
        }
    };
    Ok(value)
}

struct RawCode<'a> {
    max_stack: u16,
    max_locals: u16,
    code: &'a [u8],
    exception_table: Vec<(u16, u16, u16, u16)>,
    attributes: Vec<(u16, &'a [u8])>,
}

fn parse_raw_code(input: &[u8]) -> IResult<&[u8], RawCode<'_>> {
    let (input, max_stack) = be_u16(input)?;
    let (input, max_locals) = be_u16(input)?;
    let (input, code_length) = be_u32(input)?;
    let (input, code) = take(code_length).parse(input)?;
    let (input, exception_table_length) = be_u16(input)?;
    let (input, exception_table) =
        count(parse_exception_entry, exception_table_length as _).parse(input)?;
    let (input, attributes_count) = be_u16(input)?;
    let (input, attributes) = count(parse_raw_attribute, attributes_count as _).parse(input)?;
    Ok((
        input,
        RawCode {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        },
    ))
}

fn parse_exception_entry(input: &[u8]) -> IResult<&[u8], (u16, u16, u16, u16)> {
    let (input, start_pc) = be_u16(input)?;
    let (input, end_pc) = be_u16(input)?;
    let (input, handler_pc) = be_u16(input)?;
    let (input, catch_type) = be_u16(input)?;
    Ok((input, (start_pc, end_pc, handler_pc, catch_type)))
}

fn parse_raw_attribute(input: &[u8]) -> IResult<&[u8], (u16, &[u8])> {
    let (input, name_index) = be_u16(input)?;
    let (input, length) = be_u32(input)?;
    let (input, info) = take(length).parse(input)?;
    Ok((input, (name_index, info)))
}

fn parse_line_numbers(input: &[u8]) -> IResult<&[u8], Vec<LineNumberTableItem>> {
    let (input, length) = be_u16(input)?;
    count(
        |input| {
            let (input, start_pc) = be_u16(input)?;
            let (input, line_number) = be_u16(input)?;
            Ok((
                input,
                LineNumberTableItem {
                    start_pc,
                    line_number,
                },
            ))
        },
        length as _,
    )
    .parse(input)
}

fn parse_code(file: &ClassFile, class: &str, info: &[u8]) -> Result<CodeAttribute, LoadingError> {
    let malformed = |what: &str| LoadingError::malformed(class, format!("malformed {what}"));
    let (rest, raw) = parse_raw_code(info).map_err(|_| malformed("Code attribute"))?;
    if !rest.is_empty() || raw.code.is_empty() {
        return Err(malformed("Code attribute"));
    }

    let mut exception_table = Vec::with_capacity(raw.exception_table.len());
    for (start_pc, end_pc, handler_pc, catch_type) in raw.exception_table {
        let catch_type = if catch_type == 0 {
            None
        } else {
            Some(CpClassInfo::new(Arc::clone(file.class_name(catch_type)?)))
        };
        exception_table.push(ExceptionTableItem {
            start_pc,
            end_pc,
            handler_pc,
            catch_type,
        });
    }

    let mut line_numbers = Vec::new();
    for (name_index, info) in raw.attributes {
        if &**file.utf8(name_index)? == "LineNumberTable" {
            let (_, mut lines) =
                parse_line_numbers(info).map_err(|_| malformed("LineNumberTable"))?;
            line_numbers.append(&mut lines);
        }
    }

    Ok(CodeAttribute {
        max_stack: raw.max_stack,
        max_locals: raw.max_locals,
        code: Arc::from(raw.code),
        exception_table,
        line_numbers,
    })
}
