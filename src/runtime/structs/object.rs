use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::{
    descriptor::FieldType,
    runtime::{Class, Reference, Slot},
};

/// Bytes charged for every object besides its slots.
pub(crate) const HEADER_SIZE: usize = 16;

/// An object or array in the heap. Instance fields and array elements are
/// one slot each; `long`/`double` fields use a single slot too.
pub(crate) struct HeapObject {
    pub(crate) class: Arc<Class>,
    /// Thin lock word, see `thread::monitor`.
    pub(crate) lock_word: AtomicU64,
    pub(crate) mark: AtomicBool,
    data: Box<[AtomicU64]>,
}

impl HeapObject {
    pub(crate) fn new_object(class: Arc<Class>) -> Self {
        let data = (0..class.instance_slots).map(|_| AtomicU64::new(0)).collect();
        Self {
            class,
            lock_word: AtomicU64::new(0),
            mark: AtomicBool::new(false),
            data,
        }
    }

    pub(crate) fn new_array(class: Arc<Class>, length: usize) -> Self {
        debug_assert!(class.is_array());
        let data = (0..length).map(|_| AtomicU64::new(0)).collect();
        Self {
            class,
            lock_word: AtomicU64::new(0),
            mark: AtomicBool::new(false),
            data,
        }
    }

    /// Shallow copy with a fresh lock word, for `clone`.
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            class: Arc::clone(&self.class),
            lock_word: AtomicU64::new(0),
            mark: AtomicBool::new(false),
            data: self
                .data
                .iter()
                .map(|v| AtomicU64::new(v.load(Ordering::Relaxed)))
                .collect(),
        }
    }

    pub(crate) fn size_for(slots: usize) -> usize {
        HEADER_SIZE + slots * size_of::<Slot>()
    }

    pub(crate) fn size(&self) -> usize {
        Self::size_for(self.data.len())
    }

    pub(crate) fn is_array(&self) -> bool {
        self.class.is_array()
    }

    pub(crate) fn component_type(&self) -> Option<&FieldType> {
        self.class.array.as_ref().map(|a| &a.component)
    }

    pub(crate) fn get_field(&self, slot: u16) -> Slot {
        self.data[slot as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn put_field(&self, slot: u16, value: Slot) {
        self.data[slot as usize].store(value, Ordering::Relaxed);
    }

    pub(crate) fn array_length(&self) -> usize {
        self.data.len()
    }

    /// Element at `index`, `None` when out of bounds.
    pub(crate) fn get_element(&self, index: i32) -> Option<Slot> {
        let index = usize::try_from(index).ok()?;
        self.data.get(index).map(|v| v.load(Ordering::Relaxed))
    }

    /// Stores an element narrowed to the component type. Returns `false`
    /// when out of bounds, leaving the array untouched.
    pub(crate) fn put_element(&self, index: i32, value: Slot) -> bool {
        let Ok(index) = usize::try_from(index) else {
            return false;
        };
        let Some(cell) = self.data.get(index) else {
            return false;
        };
        let value = match self.component_type() {
            Some(ty) => narrow(ty, value),
            None => value,
        };
        cell.store(value, Ordering::Relaxed);
        true
    }

    pub(crate) fn elements(&self) -> impl Iterator<Item = Slot> + '_ {
        self.data.iter().map(|v| v.load(Ordering::Relaxed))
    }

    /// Copies `length` elements between arrays; the ranges may overlap when
    /// both are the same array. Bounds are the caller's business.
    pub(crate) fn copy_elements(src: &Self, src_pos: usize, dst: &Self, dst_pos: usize, length: usize) {
        let values: Vec<Slot> = src.data[src_pos..src_pos + length]
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .collect();
        for (cell, value) in dst.data[dst_pos..dst_pos + length].iter().zip(values) {
            cell.store(value, Ordering::Relaxed);
        }
    }

    /// Outgoing references, for marking.
    pub(crate) fn references(&self) -> Vec<Reference> {
        match &self.class.array {
            Some(array) if array.component.is_reference() => self
                .elements()
                .map(|v| v as Reference)
                .filter(|&r| r != 0)
                .collect(),
            Some(_) => Vec::new(),
            None => self
                .class
                .instance_refs
                .iter()
                .map(|&slot| self.get_field(slot) as Reference)
                .filter(|&r| r != 0)
                .collect(),
        }
    }
}

/// `bastore`, `castore` and `sastore` keep only the low bits, and loads
/// widen them again.
fn narrow(ty: &FieldType, value: Slot) -> Slot {
    match ty {
        FieldType::Boolean | FieldType::Byte => value as i8 as i32 as u32 as Slot,
        FieldType::Char => value as u16 as Slot,
        FieldType::Short => value as i16 as i32 as u32 as Slot,
        FieldType::Int | FieldType::Float | FieldType::Object(_) | FieldType::Array(_) => {
            value as u32 as Slot
        }
        FieldType::Long | FieldType::Double => value,
    }
}

impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapObject")
            .field("class", &self.class.name)
            .field("slots", &self.data.len())
            .finish_non_exhaustive()
    }
}
