//! Runtime threads. Every thread that touches the heap is attached through
//! a [`ThreadEnv`], which owns its allocation buffer and its part in the
//! safepoint protocol.

use std::{
    cell::Cell,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::{
    config::GcStrategy,
    runtime::{
        Exception, HeapObject, NativeResult, Reference,
        heap::{GcStats, Heap, Tlab},
        vm::Global,
    },
};

mod monitor;
mod safepoint;

pub(crate) use monitor::{MonitorError, ObjectMonitor, deflate_monitors};
pub(crate) use safepoint::Safepoints;

/// Produces the references a thread holds, for publishing at a safepoint.
pub(crate) type Roots<'a> = &'a dyn Fn() -> Vec<Reference>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    New,
    Runnable,
    Blocked,
    Waiting,
    TimedWaiting,
    Terminated,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ThreadState::New,
            1 => ThreadState::Runnable,
            2 => ThreadState::Blocked,
            3 => ThreadState::Waiting,
            4 => ThreadState::TimedWaiting,
            _ => ThreadState::Terminated,
        }
    }
}

pub(crate) struct ThreadHandle {
    pub(crate) id: u32,
    pub(crate) name: String,
    state: AtomicU8,
    pub(crate) daemon: bool,
    interrupted: AtomicBool,
    /// The `java/lang/Thread` object, 0 until one is needed.
    object: AtomicU32,
    terminated: Mutex<bool>,
    terminated_cond: Condvar,
    /// Monitor this thread waits on, for interrupts.
    pub(crate) parked_on: Mutex<Option<Arc<ObjectMonitor>>>,
    sleep_lock: Mutex<()>,
    sleep_cond: Condvar,
    /// Set while a debugger steps this thread.
    pub(crate) single_step: AtomicBool,
}

impl ThreadHandle {
    pub(crate) fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn object(&self) -> Reference {
        self.object.load(Ordering::Acquire)
    }

    pub(crate) fn set_object(&self, object: Reference) {
        self.object.store(object, Ordering::Release);
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Clears the interrupt flag, returning its old value.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        if let Some(monitor) = self.parked_on.lock().clone() {
            monitor.wake_waiters();
        }
        let _sleeping = self.sleep_lock.lock();
        self.sleep_cond.notify_all();
    }

    /// Sleeps until `duration` passes or the thread is interrupted. Returns
    /// whether it was interrupted, clearing the flag.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.sleep_lock.lock();
        while !self.is_interrupted() && Instant::now() < deadline {
            self.sleep_cond.wait_until(&mut guard, deadline);
        }
        drop(guard);
        self.take_interrupt()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        *self.terminated.lock()
    }

    fn terminate(&self) {
        self.set_state(ThreadState::Terminated);
        *self.terminated.lock() = true;
        self.terminated_cond.notify_all();
    }

    pub(crate) fn wait_terminated(&self) {
        let mut terminated = self.terminated.lock();
        while !*terminated {
            self.terminated_cond.wait(&mut terminated);
        }
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub(crate) struct ThreadManager {
    threads: DashMap<u32, Arc<ThreadHandle>>,
    /// Every started `Thread` object, terminated ones included until the
    /// object dies.
    by_object: DashMap<Reference, Arc<ThreadHandle>>,
    next_id: AtomicU32,
    live_non_daemon: Mutex<usize>,
    non_daemon_done: Condvar,
}

impl ThreadManager {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            ..Self::default()
        }
    }

    /// Registers a thread. Started program threads pass `counted` so that
    /// shutdown waits for the non-daemon ones.
    pub(crate) fn register(
        &self,
        name: String,
        daemon: bool,
        object: Reference,
        counted: bool,
    ) -> Arc<ThreadHandle> {
        let handle = Arc::new(ThreadHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name,
            state: AtomicU8::new(ThreadState::New as u8),
            daemon,
            interrupted: AtomicBool::new(false),
            object: AtomicU32::new(object),
            terminated: Mutex::new(false),
            terminated_cond: Condvar::new(),
            parked_on: Mutex::new(None),
            sleep_lock: Mutex::new(()),
            sleep_cond: Condvar::new(),
            single_step: AtomicBool::new(false),
        });
        self.threads.insert(handle.id, Arc::clone(&handle));
        if object != 0 {
            self.by_object.insert(object, Arc::clone(&handle));
        }
        if counted && !daemon {
            *self.live_non_daemon.lock() += 1;
        }
        handle
    }

    fn unregister(&self, handle: &ThreadHandle, counted: bool) {
        self.threads.remove(&handle.id);
        if counted && !handle.daemon {
            let mut live = self.live_non_daemon.lock();
            *live -= 1;
            if *live == 0 {
                self.non_daemon_done.notify_all();
            }
        }
    }

    pub(crate) fn bind_object(&self, handle: &Arc<ThreadHandle>, object: Reference) {
        handle.set_object(object);
        self.by_object.insert(object, Arc::clone(handle));
    }

    pub(crate) fn by_object(&self, object: Reference) -> Option<Arc<ThreadHandle>> {
        self.by_object.get(&object).map(|t| Arc::clone(t.value()))
    }

    pub(crate) fn live_threads(&self) -> Vec<Arc<ThreadHandle>> {
        let mut threads: Vec<_> = self.threads.iter().map(|t| Arc::clone(t.value())).collect();
        threads.sort_by_key(|t| t.id);
        threads
    }

    /// Objects of threads that have not terminated; those are roots.
    pub(crate) fn live_objects(&self) -> Vec<Reference> {
        self.threads
            .iter()
            .map(|t| t.object())
            .filter(|&o| o != 0)
            .collect()
    }

    pub(crate) fn forget_dead_objects(&self, heap: &Heap) {
        self.by_object.retain(|&object, _| heap.contains(object));
    }

    pub(crate) fn wait_for_non_daemon(&self) {
        let mut live = self.live_non_daemon.lock();
        while *live > 0 {
            self.non_daemon_done.wait(&mut live);
        }
    }
}

/// Per-thread view of the VM. Not `Sync`: it belongs to one OS thread.
pub(crate) struct ThreadEnv {
    pub(crate) global: Arc<Global>,
    pub(crate) thread: Arc<ThreadHandle>,
    tlab: Cell<Tlab>,
    counted: bool,
}

impl ThreadEnv {
    pub(crate) fn attach(global: Arc<Global>, thread: Arc<ThreadHandle>, counted: bool) -> Self {
        global.safepoints.attach();
        thread.set_state(ThreadState::Runnable);
        debug!("thread {} ({}) attached", thread.id, thread.name);
        Self {
            global,
            thread,
            tlab: Cell::new(Tlab::default()),
            counted,
        }
    }

    pub(crate) fn heap(&self) -> &Heap {
        &self.global.heap
    }

    #[inline]
    pub(crate) fn poll(&self, roots: Roots<'_>) {
        self.global.safepoints.poll(self.thread.id, roots);
    }

    /// Runs `f`, which may block, inside a safe region.
    pub(crate) fn safe_region<R>(&self, state: ThreadState, roots: Roots<'_>, f: impl FnOnce() -> R) -> R {
        self.thread.set_state(state);
        self.global.safepoints.block(self.thread.id, roots());
        let result = f();
        self.global.safepoints.unblock(self.thread.id);
        self.thread.set_state(ThreadState::Runnable);
        result
    }

    /// Allocates `object`, collecting first if the heap is full. Raises the
    /// preallocated `OutOfMemoryError` when that does not help.
    pub(crate) fn allocate(&self, object: HeapObject, roots: Roots<'_>) -> NativeResult<Reference> {
        self.poll(roots);
        let size = object.size();
        let heap = self.heap();
        let mut tlab = self.tlab.get();
        let mut reserved = heap.reserve(&mut tlab, size);
        self.tlab.set(tlab);
        if !reserved && heap.strategy() != GcStrategy::Epsilon {
            debug!(
                "allocation of {size} bytes failed with {} of {} bytes used",
                heap.used(),
                heap.capacity()
            );
            self.collect_garbage(roots());
            let mut tlab = self.tlab.get();
            reserved = heap.reserve(&mut tlab, size);
            self.tlab.set(tlab);
        }
        if !reserved {
            warn!("heap exhausted allocating {size} bytes for {}", object.class.name);
            return Err(Exception::Java(self.global.out_of_memory));
        }
        heap.insert(object)
            .ok_or(Exception::Java(self.global.out_of_memory))
    }

    /// Stops the world and collects. Returns `None` when another thread ran
    /// the collection instead.
    pub(crate) fn collect_garbage(&self, roots: Vec<Reference>) -> Option<GcStats> {
        let global = &self.global;
        global
            .safepoints
            .run_exclusive(self.thread.id, roots, |roots| global.collect(roots))
    }
}

impl Drop for ThreadEnv {
    fn drop(&mut self) {
        let mut tlab = self.tlab.get();
        self.global.heap.retire(&mut tlab);
        self.global.threads.unregister(&self.thread, self.counted);
        self.thread.terminate();
        self.global.safepoints.detach(self.thread.id);
        debug!("thread {} ({}) detached", self.thread.id, self.thread.name);
    }
}
