use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, RwLock};

pub use attributes::*;
pub use constant_pool::*;
pub(crate) use object::*;

use crate::{
    consts::{ClassAccessFlag, FieldAccessFlag, MethodAccessFlag},
    descriptor::{FieldType, MethodDescriptor},
    error::VmError,
    runtime::{
        jit::{CompiledCode, MethodProfile},
        native::NativeFunction,
        verifier::StackMaps,
    },
};

mod attributes;
mod constant_pool;
mod object;

/// Object handle; `0` is null.
pub type Reference = u32;
pub const NULL: Reference = 0;

/// One local-variable or operand-stack slot. Category 2 values occupy two
/// consecutive slots with the value in the first.
pub type Slot = u64;

pub struct Class {
    pub(crate) name: Arc<str>,
    pub(crate) access_flags: ClassAccessFlag,
    pub(crate) super_class: Option<Arc<Class>>,
    pub(crate) interfaces: Vec<Arc<Class>>,
    /// Names of every interface implemented directly or inherited.
    pub(crate) all_interfaces: HashSet<Arc<str>>,
    pub(crate) constant_pool: Vec<ConstantPoolInfo>,
    pub(crate) fields: Vec<FieldInfo>,
    pub(crate) methods: Vec<Arc<Method>>,
    /// Instance field slots including inherited ones.
    pub(crate) instance_slots: usize,
    pub(crate) instance_refs: Box<[u16]>,
    pub(crate) static_fields: Box<[AtomicU64]>,
    pub(crate) static_refs: Box<[u16]>,
    pub(crate) vtable: Vec<Arc<Method>>,
    /// Implementation of every interface method, keyed by name and descriptor.
    pub(crate) itable: HashMap<(Arc<str>, Arc<str>), Arc<Method>>,
    pub(crate) array: Option<ArrayInfo>,
    pub(crate) source_file: Option<Arc<str>>,
    pub(crate) linked: AtomicBool,
    pub(crate) init: ClassInit,
    pub(crate) mirror: OnceCell<Reference>,
}

#[derive(Debug)]
pub struct ArrayInfo {
    pub(crate) component: FieldType,
    /// Class of the elements, for arrays of references.
    pub(crate) component_class: Option<Arc<Class>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InitState {
    Uninitialized,
    /// Being initialized by the thread with this id.
    InProgress(u32),
    Initialized,
    Erroneous,
}

pub(crate) struct ClassInit {
    pub(crate) state: Mutex<InitState>,
    pub(crate) cond: Condvar,
    pub(crate) done: AtomicBool,
}

impl ClassInit {
    pub(crate) fn new(initialized: bool) -> Self {
        Self {
            state: Mutex::new(if initialized {
                InitState::Initialized
            } else {
                InitState::Uninitialized
            }),
            cond: Condvar::new(),
            done: AtomicBool::new(initialized),
        }
    }
}

impl Class {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn super_class(&self) -> Option<&Arc<Class>> {
        self.super_class.as_ref()
    }

    pub fn access_flags(&self) -> ClassAccessFlag {
        self.access_flags
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags.contains(ClassAccessFlag::INTERFACE)
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags.contains(ClassAccessFlag::ABSTRACT)
    }

    pub fn is_final(&self) -> bool {
        self.access_flags.contains(ClassAccessFlag::FINAL)
    }

    pub fn is_array(&self) -> bool {
        self.array.is_some()
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.init.done.load(Ordering::Acquire)
    }

    pub fn methods(&self) -> &[Arc<Method>] {
        &self.methods
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub(crate) fn constant(&self, index: u16) -> Option<&ConstantPoolInfo> {
        index
            .checked_sub(1)
            .and_then(|i| self.constant_pool.get(i as usize))
    }

    pub(crate) fn constant_or_err(&self, index: u16) -> Result<&ConstantPoolInfo, VmError> {
        self.constant(index).ok_or_else(|| {
            VmError::Internal(format!("{}: bad constant pool index {index}", self.name))
        })
    }

    /// Method declared by this class itself.
    pub fn declared_method(&self, name: &str, descriptor: &str) -> Option<&Arc<Method>> {
        self.methods
            .iter()
            .find(|m| &*m.name == name && &*m.raw_descriptor == descriptor)
    }

    /// Method resolution: this class, its superclasses, then superinterfaces.
    pub fn lookup_method(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        let mut current = Some(self);
        while let Some(class) = current {
            if let Some(method) = class.declared_method(name, descriptor) {
                return Some(Arc::clone(method));
            }
            current = class.super_class.as_deref();
        }
        self.lookup_interface_method(name, descriptor)
    }

    /// First non-abstract match in the superinterfaces, else the first match.
    pub(crate) fn lookup_interface_method(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        let mut found: Option<Arc<Method>> = None;
        let mut visit = vec![self];
        let mut seen = HashSet::new();
        while let Some(class) = visit.pop() {
            for interface in &class.interfaces {
                if !seen.insert(Arc::as_ptr(interface)) {
                    continue;
                }
                if let Some(method) = interface.declared_method(name, descriptor)
                    && !method.is_static()
                    && !method.is_private()
                {
                    if !method.is_abstract() {
                        return Some(Arc::clone(method));
                    }
                    found.get_or_insert_with(|| Arc::clone(method));
                }
                visit.push(interface);
            }
            if let Some(super_class) = &class.super_class {
                visit.push(super_class);
            }
        }
        found
    }

    /// Field resolution: this class, its interfaces, then its superclasses.
    pub fn lookup_field(
        self: &Arc<Self>,
        name: &str,
        descriptor: &str,
    ) -> Option<(Arc<Class>, FieldInfo)> {
        if let Some(field) = self
            .fields
            .iter()
            .find(|f| &*f.name == name && &*f.raw_descriptor == descriptor)
        {
            return Some((Arc::clone(self), field.clone()));
        }
        for interface in &self.interfaces {
            if let Some(found) = interface.lookup_field(name, descriptor) {
                return Some(found);
            }
        }
        self.super_class
            .as_ref()
            .and_then(|s| s.lookup_field(name, descriptor))
    }

    /// Instance field by name alone, searching superclasses.
    pub fn instance_field(&self, name: &str) -> Option<&FieldInfo> {
        let mut current = Some(self);
        while let Some(class) = current {
            if let Some(field) = class
                .fields
                .iter()
                .find(|f| !f.is_static() && &*f.name == name)
            {
                return Some(field);
            }
            current = class.super_class.as_deref();
        }
        None
    }

    pub fn static_field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields
            .iter()
            .find(|f| f.is_static() && &*f.name == name)
    }

    pub(crate) fn get_static(&self, slot: u16) -> u64 {
        self.static_fields[slot as usize].load(Ordering::Acquire)
    }

    pub(crate) fn set_static(&self, slot: u16, value: u64) {
        self.static_fields[slot as usize].store(value, Ordering::Release);
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("access_flags", &self.access_flags)
            .field("super_class", &self.super_class.as_ref().map(|c| &c.name))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub(crate) access_flags: FieldAccessFlag,
    pub(crate) name: Arc<str>,
    pub(crate) ty: FieldType,
    pub(crate) raw_descriptor: Arc<str>,
    /// Index into the object's slots, or into the class's statics.
    pub(crate) slot: u16,
    pub(crate) constant_value: Option<ConstantValue>,
}

impl FieldInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &FieldType {
        &self.ty
    }

    pub fn is_static(&self) -> bool {
        self.access_flags.contains(FieldAccessFlag::STATIC)
    }
}

pub struct Method {
    pub(crate) class: Weak<Class>,
    pub(crate) class_name: Arc<str>,
    pub(crate) name: Arc<str>,
    pub(crate) descriptor: MethodDescriptor,
    pub(crate) raw_descriptor: Arc<str>,
    pub(crate) access_flags: MethodAccessFlag,
    pub(crate) code: Option<CodeAttribute>,
    /// Parameter slots including the receiver.
    pub(crate) arg_slots: usize,
    pub(crate) vtable_index: Option<usize>,
    pub(crate) stack_maps: OnceCell<Arc<StackMaps>>,
    pub(crate) profile: MethodProfile,
    pub(crate) compiled: RwLock<Option<Arc<CompiledCode>>>,
    pub(crate) native: OnceCell<NativeFunction>,
    pub(crate) breakpoints: Mutex<BTreeSet<u32>>,
    pub(crate) has_breakpoints: AtomicBool,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.raw_descriptor
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn access_flags(&self) -> MethodAccessFlag {
        self.access_flags
    }

    pub fn declaring_class(&self) -> Option<Arc<Class>> {
        self.class.upgrade()
    }

    pub fn is_static(&self) -> bool {
        self.access_flags.contains(MethodAccessFlag::STATIC)
    }

    pub fn is_native(&self) -> bool {
        self.access_flags.contains(MethodAccessFlag::NATIVE)
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags.contains(MethodAccessFlag::ABSTRACT)
    }

    pub fn is_synchronized(&self) -> bool {
        self.access_flags.contains(MethodAccessFlag::SYNCHRONIZED)
    }

    pub fn is_private(&self) -> bool {
        self.access_flags.contains(MethodAccessFlag::PRIVATE)
    }

    pub fn is_final(&self) -> bool {
        self.access_flags.contains(MethodAccessFlag::FINAL)
    }

    pub fn is_constructor(&self) -> bool {
        &*self.name == "<init>"
    }

    /// Whether compiled code is currently installed for this method.
    pub fn is_compiled(&self) -> bool {
        self.compiled.read().is_some()
    }

    pub fn invocation_count(&self) -> u32 {
        self.profile.count()
    }

    pub(crate) fn code(&self) -> Option<&CodeAttribute> {
        self.code.as_ref()
    }

    pub(crate) fn compiled_code(&self) -> Option<Arc<CompiledCode>> {
        self.compiled.read().clone()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class_name, self.name, self.raw_descriptor)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Method({self})")
    }
}

/// A value crossing the boundary between Rust and the running program.
/// `boolean`, `byte`, `char` and `short` travel as `Int`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Reference(Reference),
}

impl Value {
    pub fn get_int(&self) -> Option<i32> {
        match *self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_long(&self) -> Option<i64> {
        match *self {
            Value::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_float(&self) -> Option<f32> {
        match *self {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_double(&self) -> Option<f64> {
        match *self {
            Value::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_reference(&self) -> Option<Reference> {
        match *self {
            Value::Reference(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, Value::Long(_) | Value::Double(_))
    }

    pub(crate) fn to_slot(self) -> Slot {
        match self {
            Value::Int(v) => v as u32 as u64,
            Value::Long(v) => v as u64,
            Value::Float(v) => v.to_bits() as u64,
            Value::Double(v) => v.to_bits(),
            Value::Reference(v) => v as u64,
        }
    }

    pub(crate) fn from_slot(slot: Slot, ty: &FieldType) -> Value {
        match ty {
            FieldType::Long => Value::Long(slot as i64),
            FieldType::Float => Value::Float(f32::from_bits(slot as u32)),
            FieldType::Double => Value::Double(f64::from_bits(slot)),
            FieldType::Object(_) | FieldType::Array(_) => Value::Reference(slot as u32),
            _ => Value::Int(slot as u32 as i32),
        }
    }
}

/// Abrupt completion of program code.
#[derive(Debug, Clone, PartialEq)]
pub enum Exception {
    /// A throwable object the program can catch.
    Java(Reference),
    /// An engine failure. Fatal variants are never catchable.
    Vm(VmError),
}

impl From<VmError> for Exception {
    fn from(err: VmError) -> Self {
        Exception::Vm(err)
    }
}

pub type NativeResult<T> = ::std::result::Result<T, Exception>;
