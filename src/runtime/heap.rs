//! Object storage. References are 32-bit ids into a concurrent table, so
//! objects never move and a collection only has to find the live ids.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
};

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::{
    config::{GcStrategy, VmConfig},
    runtime::{Class, HeapObject, Reference, TraceEntry},
};

mod gc;
pub(crate) mod reflection;
pub(crate) mod string_table;

pub use gc::GcStats;
pub(crate) use string_table::StringTable;

/// A thread's share of the allocation budget. Only valid while `epoch`
/// matches the heap's; every collection recomputes the budget.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Tlab {
    epoch: u64,
    remaining: usize,
}

pub(crate) struct Heap {
    objects: DashMap<Reference, Arc<HeapObject>>,
    free_ids: SegQueue<Reference>,
    next_id: AtomicU32,
    capacity: usize,
    used: AtomicUsize,
    epoch: AtomicU64,
    strategy: GcStrategy,
    gc_threads: usize,
    tlab_size: usize,
    stats: Mutex<GcStats>,
    /// Pinned references.
    globals: Mutex<HashSet<Reference>>,
    mirrors: DashMap<Reference, Arc<Class>>,
    backtraces: DashMap<Reference, Arc<[TraceEntry]>>,
    pub(crate) strings: StringTable,
}

impl Heap {
    pub(crate) fn new(config: &VmConfig) -> Heap {
        Heap {
            objects: DashMap::new(),
            free_ids: SegQueue::new(),
            next_id: AtomicU32::new(1),
            capacity: config.heap_size,
            used: AtomicUsize::new(0),
            epoch: AtomicU64::new(1),
            strategy: config.gc,
            gc_threads: config.gc_threads.max(1),
            tlab_size: config.tlab_size.max(HeapObject::size_for(0)),
            stats: Mutex::new(GcStats::default()),
            globals: Mutex::new(HashSet::new()),
            mirrors: DashMap::new(),
            backtraces: DashMap::new(),
            strings: StringTable::new(),
        }
    }

    pub(crate) fn strategy(&self) -> GcStrategy {
        self.strategy
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out, including unused TLAB space.
    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub(crate) fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub(crate) fn get(&self, reference: Reference) -> Option<Arc<HeapObject>> {
        self.objects.get(&reference).map(|o| Arc::clone(o.value()))
    }

    pub(crate) fn contains(&self, reference: Reference) -> bool {
        self.objects.contains_key(&reference)
    }

    /// Charges `size` bytes to `tlab`, refilling it from the global budget
    /// when needed. `false` means the heap is full.
    pub(crate) fn reserve(&self, tlab: &mut Tlab, size: usize) -> bool {
        let epoch = self.epoch.load(Ordering::Acquire);
        if tlab.epoch == epoch {
            if tlab.remaining >= size {
                tlab.remaining -= size;
                return true;
            }
            self.used.fetch_sub(tlab.remaining, Ordering::Relaxed);
        }
        *tlab = Tlab::default();
        match self.take_chunk(size) {
            Some(chunk) => {
                *tlab = Tlab {
                    epoch,
                    remaining: chunk - size,
                };
                true
            }
            None => false,
        }
    }

    /// Gives back the unused part of a thread's buffer.
    pub(crate) fn retire(&self, tlab: &mut Tlab) {
        if tlab.epoch == self.epoch.load(Ordering::Acquire) {
            self.used.fetch_sub(tlab.remaining, Ordering::Relaxed);
        }
        *tlab = Tlab::default();
    }

    /// Charges `size` bytes directly against the budget.
    pub(crate) fn reserve_direct(&self, size: usize) -> bool {
        self.used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                used.checked_add(size).filter(|&total| total <= self.capacity)
            })
            .is_ok()
    }

    fn take_chunk(&self, size: usize) -> Option<usize> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let available = self.capacity.saturating_sub(current);
            if available < size {
                return None;
            }
            let chunk = self.tlab_size.max(size).min(available);
            match self.used.compare_exchange_weak(
                current,
                current + chunk,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(chunk),
                Err(actual) => current = actual,
            }
        }
    }

    /// Stores an object whose size was already reserved. `None` when the id
    /// space is exhausted.
    pub(crate) fn insert(&self, object: HeapObject) -> Option<Reference> {
        let id = match self.free_ids.pop() {
            Some(id) => id,
            None => self
                .next_id
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
                .ok()?,
        };
        self.objects.insert(id, Arc::new(object));
        Some(id)
    }

    /// Keeps `reference` alive for the life of the heap.
    pub(crate) fn pin(&self, reference: Reference) {
        if reference != 0 {
            self.globals.lock().insert(reference);
        }
    }

    pub(crate) fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        BootstrapSource, ClassRegistry,
        famous_classes::{FamousClasses, OBJECT},
    };

    fn heap_with(size: usize) -> Heap {
        Heap::new(&VmConfig {
            heap_size: size,
            tlab_size: 256,
            ..VmConfig::default()
        })
    }

    fn classes() -> FamousClasses {
        let registry = ClassRegistry::new(vec![Box::new(BootstrapSource::new())]);
        FamousClasses::resolve(&registry).unwrap()
    }

    #[test]
    fn test_ordinary_object() {
        let famous = classes();
        let heap = heap_with(1 << 20);
        let mut tlab = Tlab::default();
        assert!(heap.reserve(&mut tlab, HeapObject::size_for(1)));
        let id = heap
            .insert(HeapObject::new_object(Arc::clone(&famous.string)))
            .unwrap();
        let object = heap.get(id).unwrap();
        object.put_field(famous.string_value, 7);
        assert_eq!(object.get_field(famous.string_value), 7);
        assert_eq!(&*object.class.name, "java/lang/String");
    }

    #[test]
    fn test_array_narrowing_and_bounds() {
        let famous = classes();
        let heap = heap_with(1 << 20);
        let id = heap
            .insert(HeapObject::new_array(Arc::clone(&famous.char_array), 2))
            .unwrap();
        let array = heap.get(id).unwrap();
        assert!(array.put_element(1, 0x1_0041));
        assert_eq!(array.get_element(1), Some(0x41));
        assert_eq!(array.get_element(0), Some(0));
        assert_eq!(array.get_element(2), None);
        assert_eq!(array.get_element(-1), None);
        assert!(!array.put_element(2, 1));
    }

    #[test]
    fn test_tlab_accounting() {
        let heap = heap_with(1024);
        let mut tlab = Tlab::default();
        assert!(heap.reserve(&mut tlab, 100));
        assert_eq!(heap.used(), 256);
        assert!(heap.reserve(&mut tlab, 100));
        assert_eq!(heap.used(), 256);
        // refill returns the 56 unused bytes before taking a new chunk
        assert!(heap.reserve(&mut tlab, 100));
        assert_eq!(heap.used(), 200 + 256);
        heap.retire(&mut tlab);
        assert_eq!(heap.used(), 300);
        assert!(!heap.reserve(&mut tlab, 800));
        assert!(heap.reserve_direct(700));
        assert!(!heap.reserve_direct(100));
    }

    #[test]
    fn test_ids_are_reused() {
        let registry = ClassRegistry::new(vec![Box::new(BootstrapSource::new())]);
        let class = registry.resolve(OBJECT).unwrap();
        let heap = heap_with(1 << 20);
        let object = || HeapObject::new_object(Arc::clone(&class));
        let a = heap.insert(object()).unwrap();
        let b = heap.insert(object()).unwrap();
        assert_ne!(a, b);
        heap.pin(b);
        heap.collect(Vec::new());
        assert!(!heap.contains(a));
        assert!(heap.contains(b));
        let c = heap.insert(object()).unwrap();
        assert_eq!(c, a);
        assert_eq!(heap.get(c).unwrap().class.name.as_ref(), OBJECT);
    }
}
