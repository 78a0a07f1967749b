//! Mark-sweep collection. Callers stop every mutator before collecting;
//! see `thread::safepoint`.

use std::{
    iter,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

use crossbeam_deque::{Injector, Stealer, Worker};
use log::{debug, trace};

use crate::{
    config::GcStrategy,
    runtime::{Reference, heap::Heap},
};

/// Cumulative collector statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: u64,
    pub reclaimed_objects: u64,
    pub reclaimed_bytes: u64,
    /// Live objects and bytes after the last collection.
    pub live_objects: usize,
    pub live_bytes: usize,
    pub total_pause: Duration,
}

impl Heap {
    /// Marks everything reachable from `roots` and the heap's own roots,
    /// then frees the rest. Every mutator must be stopped.
    pub(crate) fn collect(&self, mut roots: Vec<Reference>) -> GcStats {
        let start = Instant::now();
        roots.extend(self.globals.lock().iter().copied());
        roots.extend(self.mirrors.iter().map(|m| *m.key()));
        roots.extend(self.strings.references());
        roots.retain(|&r| r != 0);
        trace!("gc: {} roots", roots.len());

        match self.strategy {
            GcStrategy::Parallel if self.gc_threads > 1 => self.mark_parallel(roots),
            _ => self.mark_serial(roots),
        }
        let (freed_objects, freed_bytes, live_bytes) = self.sweep();

        let mut stats = self.stats.lock();
        stats.collections += 1;
        stats.reclaimed_objects += freed_objects as u64;
        stats.reclaimed_bytes += freed_bytes as u64;
        stats.live_objects = self.objects.len();
        stats.live_bytes = live_bytes;
        stats.total_pause += start.elapsed();
        debug!(
            "gc #{}: freed {} objects ({} bytes), {} bytes live, took {:?}",
            stats.collections,
            freed_objects,
            freed_bytes,
            live_bytes,
            start.elapsed()
        );
        stats.clone()
    }

    fn mark_serial(&self, mut worklist: Vec<Reference>) {
        while let Some(reference) = worklist.pop() {
            if let Some(object) = self.get(reference)
                && !object.mark.swap(true, Ordering::Relaxed)
            {
                worklist.extend(object.references());
            }
        }
    }

    /// Work-stealing mark. `pending` counts references pushed but not yet
    /// scanned, so a worker may only stop once it reaches zero.
    fn mark_parallel(&self, roots: Vec<Reference>) {
        let injector = Injector::new();
        let pending = AtomicUsize::new(roots.len());
        for root in roots {
            injector.push(root);
        }
        let workers: Vec<Worker<Reference>> =
            (0..self.gc_threads).map(|_| Worker::new_lifo()).collect();
        let stealers: Vec<Stealer<Reference>> = workers.iter().map(Worker::stealer).collect();

        thread::scope(|scope| {
            for worker in workers {
                let (injector, stealers, pending) = (&injector, &stealers, &pending);
                scope.spawn(move || {
                    loop {
                        match worker.pop().or_else(|| find_task(&worker, injector, stealers)) {
                            Some(reference) => {
                                if let Some(object) = self.get(reference)
                                    && !object.mark.swap(true, Ordering::Relaxed)
                                {
                                    for child in object.references() {
                                        pending.fetch_add(1, Ordering::AcqRel);
                                        worker.push(child);
                                    }
                                }
                                pending.fetch_sub(1, Ordering::AcqRel);
                            }
                            None if pending.load(Ordering::Acquire) == 0 => break,
                            None => thread::yield_now(),
                        }
                    }
                });
            }
        });
    }

    /// Returns (freed objects, freed bytes, live bytes).
    fn sweep(&self) -> (usize, usize, usize) {
        let mut freed_objects = 0;
        let mut freed_bytes = 0;
        let mut live_bytes = 0;
        self.objects.retain(|&id, object| {
            if object.mark.swap(false, Ordering::Relaxed) {
                live_bytes += object.size();
                true
            } else {
                freed_objects += 1;
                freed_bytes += object.size();
                self.free_ids.push(id);
                false
            }
        });
        self.backtraces.retain(|id, _| self.objects.contains_key(id));
        self.used.store(live_bytes, Ordering::Relaxed);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        (freed_objects, freed_bytes, live_bytes)
    }
}

fn find_task(
    local: &Worker<Reference>,
    global: &Injector<Reference>,
    stealers: &[Stealer<Reference>],
) -> Option<Reference> {
    iter::repeat_with(|| {
        global
            .steal_batch_and_pop(local)
            .or_else(|| stealers.iter().map(Stealer::steal).collect())
    })
    .find(|s| !s.is_retry())
    .and_then(|s| s.success())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        config::VmConfig,
        runtime::{BootstrapSource, ClassRegistry, HeapObject, famous_classes::FamousClasses},
    };

    use super::*;

    fn setup(strategy: GcStrategy) -> (Heap, FamousClasses) {
        let registry = ClassRegistry::new(vec![Box::new(BootstrapSource::new())]);
        let famous = FamousClasses::resolve(&registry).unwrap();
        let heap = Heap::new(&VmConfig {
            gc: strategy,
            gc_threads: 4,
            ..VmConfig::default()
        });
        (heap, famous)
    }

    /// A reference array `[a, b]`; `b` has no other referrers.
    fn chain(heap: &Heap, famous: &FamousClasses) -> (Reference, Reference, Reference) {
        let a = heap
            .insert(HeapObject::new_object(Arc::clone(&famous.string)))
            .unwrap();
        let b = heap
            .insert(HeapObject::new_object(Arc::clone(&famous.string)))
            .unwrap();
        let array = heap
            .insert(HeapObject::new_array(Arc::clone(&famous.string_array), 2))
            .unwrap();
        let object = heap.get(array).unwrap();
        object.put_element(0, a as u64);
        object.put_element(1, b as u64);
        (array, a, b)
    }

    fn reachability(strategy: GcStrategy) {
        let (heap, famous) = setup(strategy);
        let (array, a, b) = chain(&heap, &famous);
        let garbage = heap
            .insert(HeapObject::new_object(Arc::clone(&famous.string)))
            .unwrap();
        let stats = heap.collect(vec![array]);
        assert!(heap.contains(array) && heap.contains(a) && heap.contains(b));
        assert!(!heap.contains(garbage));
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.reclaimed_objects, 1);
        assert_eq!(stats.live_objects, 3);

        heap.get(array).unwrap().put_element(1, 0);
        heap.collect(vec![array]);
        assert!(!heap.contains(b));
        assert!(heap.contains(a));

        let stats = heap.collect(Vec::new());
        assert_eq!(stats.live_objects, 0);
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn test_serial_reachability() {
        reachability(GcStrategy::Serial);
    }

    #[test]
    fn test_parallel_reachability() {
        reachability(GcStrategy::Parallel);
    }

    #[test]
    fn test_parallel_marks_long_lists() {
        let (heap, famous) = setup(GcStrategy::Parallel);
        // linked list through the first element of one-element arrays
        let mut head = 0;
        for _ in 0..10_000 {
            let node = heap
                .insert(HeapObject::new_array(Arc::clone(&famous.string_array), 1))
                .unwrap();
            heap.get(node).unwrap().put_element(0, head as u64);
            head = node;
        }
        let stats = heap.collect(vec![head]);
        assert_eq!(stats.live_objects, 10_000);
        assert_eq!(stats.reclaimed_objects, 0);
    }

    #[test]
    fn test_cycles_are_collected() {
        let (heap, famous) = setup(GcStrategy::Serial);
        let x = heap
            .insert(HeapObject::new_array(Arc::clone(&famous.string_array), 1))
            .unwrap();
        let y = heap
            .insert(HeapObject::new_array(Arc::clone(&famous.string_array), 1))
            .unwrap();
        heap.get(x).unwrap().put_element(0, y as u64);
        heap.get(y).unwrap().put_element(0, x as u64);
        heap.collect(vec![x]);
        assert!(heap.contains(y));
        heap.collect(Vec::new());
        assert!(!heap.contains(x) && !heap.contains(y));
    }
}
