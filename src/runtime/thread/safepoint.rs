//! Stop-the-world coordination. Running threads poll at backward branches,
//! calls and allocations; threads about to block first enter a safe region.
//! Either way they publish their roots and stop counting as running, and a
//! collection starts once no thread is running.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::runtime::Reference;

#[derive(Default)]
struct State {
    running: usize,
    collecting: bool,
    roots: HashMap<u32, Vec<Reference>>,
}

#[derive(Default)]
pub(crate) struct Safepoints {
    requested: AtomicBool,
    state: Mutex<State>,
    cond: Condvar,
}

impl Safepoints {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self) {
        let mut state = self.state.lock();
        while state.collecting {
            self.cond.wait(&mut state);
        }
        state.running += 1;
    }

    pub(crate) fn detach(&self, thread: u32) {
        let mut state = self.state.lock();
        state.running -= 1;
        state.roots.remove(&thread);
        self.cond.notify_all();
    }

    #[inline]
    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Parks the thread while a collection is pending. `roots` only runs
    /// when it has to.
    #[inline]
    pub(crate) fn poll(&self, thread: u32, roots: impl FnOnce() -> Vec<Reference>) {
        if self.is_requested() {
            self.park(thread, roots());
        }
    }

    #[cold]
    fn park(&self, thread: u32, roots: Vec<Reference>) {
        let mut state = self.state.lock();
        if !state.collecting {
            return;
        }
        state.roots.insert(thread, roots);
        state.running -= 1;
        self.cond.notify_all();
        while state.collecting {
            self.cond.wait(&mut state);
        }
        state.running += 1;
        state.roots.remove(&thread);
    }

    /// Enters a safe region: the thread may block for any length of time
    /// and must not touch the heap until [`Safepoints::unblock`].
    pub(crate) fn block(&self, thread: u32, roots: Vec<Reference>) {
        let mut state = self.state.lock();
        state.roots.insert(thread, roots);
        state.running -= 1;
        self.cond.notify_all();
    }

    pub(crate) fn unblock(&self, thread: u32) {
        let mut state = self.state.lock();
        while state.collecting {
            self.cond.wait(&mut state);
        }
        state.running += 1;
        state.roots.remove(&thread);
    }

    /// Stops every other attached thread and runs `f` with the union of all
    /// published roots and `roots`. If another thread is already collecting,
    /// waits for it instead and returns `None`.
    pub(crate) fn run_exclusive<R>(
        &self,
        thread: u32,
        roots: Vec<Reference>,
        f: impl FnOnce(Vec<Reference>) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock();
        if state.collecting {
            state.roots.insert(thread, roots);
            state.running -= 1;
            self.cond.notify_all();
            while state.collecting {
                self.cond.wait(&mut state);
            }
            state.running += 1;
            state.roots.remove(&thread);
            return None;
        }
        state.collecting = true;
        self.requested.store(true, Ordering::Release);
        state.running -= 1;
        while state.running > 0 {
            self.cond.wait(&mut state);
        }
        let mut all = roots;
        for published in state.roots.values() {
            all.extend_from_slice(published);
        }
        trace!("safepoint reached by {} threads", state.roots.len() + 1);
        drop(state);

        let result = f(all);

        let mut state = self.state.lock();
        state.collecting = false;
        self.requested.store(false, Ordering::Release);
        state.running += 1;
        self.cond.notify_all();
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    use super::*;

    #[test]
    fn test_exclusive_sees_published_roots() {
        let safepoints = Arc::new(Safepoints::new());
        safepoints.attach();
        let barrier = Arc::new(Barrier::new(2));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let safepoints = Arc::clone(&safepoints);
            let barrier = Arc::clone(&barrier);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                safepoints.attach();
                barrier.wait();
                while !stop.load(Ordering::Relaxed) {
                    safepoints.poll(2, || vec![42]);
                }
                safepoints.detach(2);
            })
        };
        barrier.wait();
        let roots = safepoints.run_exclusive(1, vec![7], |mut roots| {
            roots.sort();
            roots
        });
        assert_eq!(roots, Some(vec![7, 42]));
        stop.store(true, Ordering::Relaxed);
        safepoints.detach(1);
        worker.join().unwrap();
    }

    #[test]
    fn test_blocked_threads_do_not_stall_collection() {
        let safepoints = Arc::new(Safepoints::new());
        safepoints.attach();
        safepoints.attach();
        safepoints.block(2, vec![5]);
        let roots = safepoints.run_exclusive(1, Vec::new(), |roots| roots);
        assert_eq!(roots, Some(vec![5]));

        let unblocked = {
            let safepoints = Arc::clone(&safepoints);
            thread::spawn(move || {
                safepoints.unblock(2);
                safepoints.detach(2);
            })
        };
        unblocked.join().unwrap();
        assert_eq!(safepoints.run_exclusive(1, Vec::new(), |r| r.len()), Some(0));
        safepoints.detach(1);
    }
}
