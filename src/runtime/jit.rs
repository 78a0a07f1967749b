//! Tier 1. Hot methods are translated on background workers into register
//! code over the frame slots (see [`compiler`]) and installed on the method;
//! calls made after that use it.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use crossbeam::channel::{Sender, unbounded};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
    config::VmConfig,
    runtime::{Class, Method},
};

mod code;
mod compiler;
mod exec;

pub(crate) use code::CompiledCode;
pub use compiler::CompileError;
pub(crate) use exec::execute;

const NOT_QUEUED: u8 = 0;
const QUEUED: u8 = 1;
const COMPILED: u8 = 2;
const FAILED: u8 = 3;

/// Receiver classes seen at one call site.
#[derive(Debug, Clone)]
pub(crate) enum ReceiverProfile {
    Monomorphic(Arc<Class>),
    Megamorphic,
}

/// Invocation and back-edge counter of a method, plus what its virtual
/// call sites saw while it was interpreted.
#[derive(Debug, Default)]
pub(crate) struct MethodProfile {
    counter: AtomicU32,
    state: AtomicU8,
    receivers: Mutex<HashMap<u32, ReceiverProfile>>,
}

impl MethodProfile {
    pub(crate) fn count(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Counts one event. True exactly once: for the event that makes the
    /// method hot, which must then queue it.
    pub(crate) fn tick(&self, threshold: u32) -> bool {
        let count = self.counter.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        count >= threshold
            && self.state.load(Ordering::Relaxed) == NOT_QUEUED
            && self
                .state
                .compare_exchange(NOT_QUEUED, QUEUED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    pub(crate) fn record_receiver(&self, pc: u32, class: &Arc<Class>) {
        if self.state.load(Ordering::Relaxed) != NOT_QUEUED {
            return;
        }
        let mut receivers = self.receivers.lock();
        match receivers.get(&pc) {
            None => {
                receivers.insert(pc, ReceiverProfile::Monomorphic(Arc::clone(class)));
            }
            Some(ReceiverProfile::Monomorphic(seen)) if !Arc::ptr_eq(seen, class) => {
                receivers.insert(pc, ReceiverProfile::Megamorphic);
            }
            Some(_) => {}
        }
    }

    /// The only receiver class seen at `pc`, if there was exactly one.
    pub(crate) fn single_receiver(&self, pc: u32) -> Option<Arc<Class>> {
        match self.receivers.lock().get(&pc) {
            Some(ReceiverProfile::Monomorphic(class)) => Some(Arc::clone(class)),
            _ => None,
        }
    }

    fn finish(&self, compiled: bool) {
        self.state
            .store(if compiled { COMPILED } else { FAILED }, Ordering::Release);
        if compiled {
            self.receivers.lock().clear();
        }
    }
}

/// Compilation counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JitStats {
    pub compiled: usize,
    pub failed: usize,
}

/// The compile queue and its workers.
pub(crate) struct Jit {
    sender: Mutex<Option<Sender<Arc<Method>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    max_method_size: usize,
    compiled: AtomicUsize,
    failed: AtomicUsize,
}

impl Jit {
    pub(crate) fn new(config: &VmConfig) -> Self {
        let shared = Arc::new(Shared {
            max_method_size: config.jit_max_method_size,
            ..Default::default()
        });
        let jit = Self {
            sender: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            shared,
        };
        if !config.jit_enabled() {
            return jit;
        }
        let (sender, receiver) = unbounded::<Arc<Method>>();
        let mut workers = Vec::with_capacity(config.jit_workers);
        for index in 0..config.jit_workers.max(1) {
            let receiver = receiver.clone();
            let shared = Arc::clone(&jit.shared);
            let spawned = std::thread::Builder::new()
                .name(format!("jit-worker-{index}"))
                .spawn(move || {
                    for method in receiver.iter() {
                        shared.compile(&method);
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => warn!("cannot start compiler worker {index}: {err}"),
            }
        }
        if !workers.is_empty() {
            *jit.sender.lock() = Some(sender);
        }
        *jit.workers.lock() = workers;
        jit
    }

    /// Queues a hot method. Without workers the method stays interpreted.
    pub(crate) fn enqueue(&self, method: &Arc<Method>) {
        let sent = match &*self.sender.lock() {
            Some(sender) => sender.send(Arc::clone(method)).is_ok(),
            None => false,
        };
        if sent {
            debug!("queued {method} for compilation");
        } else {
            method.profile.finish(false);
        }
    }

    /// Compiles on the calling thread.
    pub(crate) fn compile_now(&self, method: &Arc<Method>) -> Result<(), CompileError> {
        self.shared.compile_checked(method)
    }

    pub(crate) fn stats(&self) -> JitStats {
        JitStats {
            compiled: self.shared.compiled.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Drops compiled code of `method`; frames running it finish in it
    /// unless the method is watched by the debugger.
    pub(crate) fn invalidate(method: &Method) {
        if method.compiled.write().take().is_some() {
            debug!("invalidated compiled code of {method}");
        }
    }

    /// Stops the workers once the queue is drained.
    pub(crate) fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                warn!("a compiler worker panicked");
            }
        }
    }
}

impl Shared {
    fn compile(&self, method: &Arc<Method>) {
        if let Err(err) = self.compile_checked(method) {
            warn!("compilation of {method} failed: {err}");
        }
    }

    fn compile_checked(&self, method: &Arc<Method>) -> Result<(), CompileError> {
        if method.has_breakpoints.load(Ordering::Relaxed) {
            method.profile.finish(false);
            self.failed.fetch_add(1, Ordering::Relaxed);
            return Err(CompileError::Watched);
        }
        match compiler::compile(method, self.max_method_size) {
            Ok(code) => {
                debug!("compiled {method}: {} ops", code.len());
                *method.compiled.write() = Some(Arc::new(code));
                method.profile.finish(true);
                self.compiled.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                method.profile.finish(false);
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_fires_once() {
        let profile = MethodProfile::default();
        let fired: Vec<bool> = (0..5).map(|_| profile.tick(3)).collect();
        assert_eq!(fired, [false, false, true, false, false]);
        assert_eq!(profile.count(), 5);
    }

    #[test]
    fn test_failed_methods_are_not_requeued() {
        let profile = MethodProfile::default();
        assert!(profile.tick(1));
        profile.finish(false);
        assert!(!profile.tick(1));
    }
}
