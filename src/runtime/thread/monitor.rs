//! Object monitors. An uncontended object is locked by CAS on its lock
//! word; contention, `wait` or a saturated count inflate it to an
//! [`ObjectMonitor`] kept in the VM's monitor table.
//!
//! Lock word: owner thread id in bits 0..32, recursion count in bits
//! 32..63, bit 63 set once inflated.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc,
        atomic::Ordering,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::runtime::{
    HeapObject, Reference,
    heap::Heap,
    thread::{Roots, ThreadEnv, ThreadState},
};

const INFLATED: u64 = 1 << 63;
const COUNT_ONE: u64 = 1 << 32;
const MAX_THIN_COUNT: u64 = (1 << 31) - 1;

fn thin_count(word: u64) -> u64 {
    (word >> 32) & MAX_THIN_COUNT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MonitorError {
    /// The thread does not own the monitor.
    IllegalState,
    Interrupted,
}

#[derive(Debug, Default)]
struct MonitorState {
    owner: u32,
    count: u64,
    /// Threads blocked in `enter`, served in arrival order.
    entry_queue: VecDeque<u32>,
    /// Threads in `wait` that have not been notified.
    waiters: VecDeque<u32>,
    notified: HashSet<u32>,
}

#[derive(Debug, Default)]
pub(crate) struct ObjectMonitor {
    state: Mutex<MonitorState>,
    entry_cond: Condvar,
    wait_cond: Condvar,
}

impl ObjectMonitor {
    fn try_enter(&self, me: u32) -> bool {
        let mut state = self.state.lock();
        if state.owner == me {
            state.count += 1;
            true
        } else if state.owner == 0 && state.entry_queue.is_empty() {
            state.owner = me;
            state.count = 1;
            true
        } else {
            false
        }
    }

    fn enter_blocking(&self, me: u32) {
        let mut state = self.state.lock();
        if state.owner == me {
            state.count += 1;
            return;
        }
        self.acquire(&mut state, me, 1);
    }

    fn acquire(&self, state: &mut MutexGuard<'_, MonitorState>, me: u32, count: u64) {
        state.entry_queue.push_back(me);
        while state.owner != 0 || state.entry_queue.front() != Some(&me) {
            self.entry_cond.wait(state);
        }
        state.entry_queue.pop_front();
        state.owner = me;
        state.count = count;
    }

    fn exit(&self, me: u32) -> bool {
        let mut state = self.state.lock();
        if state.owner != me {
            return false;
        }
        state.count -= 1;
        if state.count == 0 {
            state.owner = 0;
            self.entry_cond.notify_all();
        }
        true
    }

    /// Wakes waiters so they notice an interrupt.
    pub(crate) fn wake_waiters(&self) {
        let _state = self.state.lock();
        self.wait_cond.notify_all();
    }

    pub(crate) fn owner(&self) -> u32 {
        self.state.lock().owner
    }

    fn is_idle(&self) -> bool {
        match self.state.try_lock() {
            Some(state) => {
                state.owner == 0 && state.entry_queue.is_empty() && state.waiters.is_empty()
            }
            None => false,
        }
    }
}

impl ThreadEnv {
    fn monitor(&self, reference: Reference) -> Arc<ObjectMonitor> {
        Arc::clone(&self.global.monitors.entry(reference).or_default())
    }

    fn inflate(&self, reference: Reference, object: &HeapObject) -> Arc<ObjectMonitor> {
        let monitor = self.monitor(reference);
        let mut state = monitor.state.lock();
        let mut word = object.lock_word.load(Ordering::Acquire);
        while word & INFLATED == 0 {
            state.owner = word as u32;
            state.count = thin_count(word);
            match object.lock_word.compare_exchange_weak(
                word,
                INFLATED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => word = actual,
            }
        }
        drop(state);
        monitor
    }

    pub(crate) fn monitor_enter(&self, reference: Reference, object: &HeapObject, roots: Roots<'_>) {
        let me = self.thread.id;
        let mut word = object.lock_word.load(Ordering::Acquire);
        loop {
            if word == 0 {
                match object.lock_word.compare_exchange_weak(
                    0,
                    me as u64 | COUNT_ONE,
                    Ordering::Acquire,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => {
                        word = actual;
                        continue;
                    }
                }
            }
            if word & INFLATED != 0 {
                break;
            }
            if word as u32 == me && thin_count(word) < MAX_THIN_COUNT {
                match object.lock_word.compare_exchange_weak(
                    word,
                    word + COUNT_ONE,
                    Ordering::Acquire,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => {
                        word = actual;
                        continue;
                    }
                }
            }
            self.inflate(reference, object);
            break;
        }
        let monitor = self.monitor(reference);
        if !monitor.try_enter(me) {
            self.safe_region(ThreadState::Blocked, roots, || monitor.enter_blocking(me));
        }
    }

    pub(crate) fn monitor_exit(&self, reference: Reference, object: &HeapObject) -> Result<(), MonitorError> {
        let me = self.thread.id;
        let mut word = object.lock_word.load(Ordering::Relaxed);
        while word & INFLATED == 0 {
            if word as u32 != me {
                return Err(MonitorError::IllegalState);
            }
            let next = if thin_count(word) == 1 { 0 } else { word - COUNT_ONE };
            match object.lock_word.compare_exchange_weak(
                word,
                next,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => word = actual,
            }
        }
        if self.monitor(reference).exit(me) {
            Ok(())
        } else {
            Err(MonitorError::IllegalState)
        }
    }

    pub(crate) fn holds_lock(&self, reference: Reference, object: &HeapObject) -> bool {
        let word = object.lock_word.load(Ordering::Acquire);
        if word & INFLATED == 0 {
            word != 0 && word as u32 == self.thread.id
        } else {
            self.monitor(reference).owner() == self.thread.id
        }
    }

    /// `Object.wait`. `None` waits until notified or interrupted.
    pub(crate) fn monitor_wait(
        &self,
        reference: Reference,
        object: &HeapObject,
        timeout: Option<Duration>,
        roots: Roots<'_>,
    ) -> Result<(), MonitorError> {
        let me = self.thread.id;
        if !self.holds_lock(reference, object) {
            return Err(MonitorError::IllegalState);
        }
        if self.thread.take_interrupt() {
            return Err(MonitorError::Interrupted);
        }
        let monitor = self.inflate(reference, object);
        let saved = {
            let mut state = monitor.state.lock();
            let saved = state.count;
            state.owner = 0;
            state.count = 0;
            state.waiters.push_back(me);
            monitor.entry_cond.notify_all();
            saved
        };
        *self.thread.parked_on.lock() = Some(Arc::clone(&monitor));
        let deadline = timeout.map(|t| Instant::now() + t);
        let thread_state = if deadline.is_some() {
            ThreadState::TimedWaiting
        } else {
            ThreadState::Waiting
        };
        self.safe_region(thread_state, roots, || {
            let mut state = monitor.state.lock();
            loop {
                if state.notified.remove(&me) || self.thread.is_interrupted() {
                    break;
                }
                match deadline {
                    Some(deadline) if Instant::now() >= deadline => break,
                    Some(deadline) => {
                        monitor.wait_cond.wait_until(&mut state, deadline);
                    }
                    None => monitor.wait_cond.wait(&mut state),
                }
            }
            state.waiters.retain(|&t| t != me);
            state.notified.remove(&me);
            monitor.acquire(&mut state, me, saved);
        });
        self.thread.parked_on.lock().take();
        if self.thread.take_interrupt() {
            return Err(MonitorError::Interrupted);
        }
        Ok(())
    }

    pub(crate) fn monitor_notify(
        &self,
        reference: Reference,
        object: &HeapObject,
        all: bool,
    ) -> Result<(), MonitorError> {
        let me = self.thread.id;
        let word = object.lock_word.load(Ordering::Acquire);
        if word & INFLATED == 0 {
            // nobody can be waiting on a thin lock
            return if word != 0 && word as u32 == me {
                Ok(())
            } else {
                Err(MonitorError::IllegalState)
            };
        }
        let monitor = self.monitor(reference);
        let mut state = monitor.state.lock();
        if state.owner != me {
            return Err(MonitorError::IllegalState);
        }
        if all {
            let woken: Vec<u32> = state.waiters.drain(..).collect();
            state.notified.extend(woken);
        } else if let Some(waiter) = state.waiters.pop_front() {
            state.notified.insert(waiter);
        }
        monitor.wait_cond.notify_all();
        Ok(())
    }
}

/// Drops monitors of dead objects and deflates idle ones. Runs with every
/// mutator stopped, so an idle monitor nobody else holds cannot be entered
/// concurrently.
pub(crate) fn deflate_monitors(monitors: &DashMap<Reference, Arc<ObjectMonitor>>, heap: &Heap) -> usize {
    let before = monitors.len();
    monitors.retain(|&reference, monitor| {
        let Some(object) = heap.get(reference) else {
            return false;
        };
        if Arc::strong_count(monitor) == 1 && monitor.is_idle() {
            object.lock_word.store(0, Ordering::Release);
            false
        } else {
            true
        }
    });
    before - monitors.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thin_count() {
        let word = 7u64 | 3 * COUNT_ONE;
        assert_eq!(word as u32, 7);
        assert_eq!(thin_count(word), 3);
        assert_eq!(thin_count(word | INFLATED), 3);
    }

    #[test]
    fn test_monitor_fifo_handoff() {
        let monitor = Arc::new(ObjectMonitor::default());
        assert!(monitor.try_enter(1));
        assert!(monitor.try_enter(1));
        let waiter = {
            let monitor = Arc::clone(&monitor);
            std::thread::spawn(move || {
                monitor.enter_blocking(2);
                monitor.owner()
            })
        };
        while monitor.state.lock().entry_queue.is_empty() {
            std::thread::yield_now();
        }
        // queued threads are served before newcomers
        assert!(!monitor.try_enter(3));
        assert!(monitor.exit(1));
        assert_eq!(monitor.owner(), 1);
        assert!(monitor.exit(1));
        assert_eq!(waiter.join().unwrap(), 2);
        assert!(!monitor.exit(1));
        assert!(monitor.exit(2));
        assert!(monitor.is_idle());
    }
}
