//! The process-wide VM state and its public entry points.

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info};
use thiserror::Error;

use crate::{
    config::VmConfig,
    error::{LinkageError, VmError, VmResult},
    runtime::{
        Exception, HeapObject, NativeResult, Reference, Value,
        class_loader::{ClassRegistry, ClassSource, source_for_path},
        debug::{self, DebugError, DebugSession, EventKind, EventMask, Debugger},
        famous_classes::{BootstrapSource, FamousClasses},
        heap::{GcStats, Heap},
        interpreter::{CallStack, initialize_class, invoke_method, objects},
        jit::{Jit, JitStats},
        native::{NativeLibrary, NativeRegistry, throwable},
        thread::{ObjectMonitor, Safepoints, ThreadEnv, ThreadManager, deflate_monitors},
    },
};

const MAIN_DESCRIPTOR: &str = "([Ljava/lang/String;)V";

/// Everything threads share. One per [`Vm`].
pub(crate) struct Global {
    pub(crate) config: VmConfig,
    pub(crate) registry: ClassRegistry,
    pub(crate) famous: FamousClasses,
    pub(crate) heap: Heap,
    pub(crate) threads: ThreadManager,
    pub(crate) safepoints: Safepoints,
    /// Inflated monitors by object.
    pub(crate) monitors: DashMap<Reference, Arc<ObjectMonitor>>,
    pub(crate) natives: NativeRegistry,
    pub(crate) jit: Jit,
    pub(crate) debugger: Debugger,
    /// Thrown when allocation fails even after collecting; allocated up
    /// front because by then nothing else can be.
    pub(crate) out_of_memory: Reference,
}

impl Global {
    fn new(config: VmConfig, sources: Vec<Box<dyn ClassSource>>) -> VmResult<Self> {
        let mut all: Vec<Box<dyn ClassSource>> = vec![Box::new(BootstrapSource::new())];
        all.extend(sources);
        let registry = ClassRegistry::new(all);
        let famous = FamousClasses::resolve(&registry)?;
        let heap = Heap::new(&config);

        let error = HeapObject::new_object(registry.resolve("java/lang/OutOfMemoryError")?);
        if !heap.reserve_direct(error.size()) {
            return Err(VmError::ResourceExhaustion(format!(
                "a heap of {} bytes cannot hold the VM's own objects",
                config.heap_size
            )));
        }
        let out_of_memory = heap
            .insert(error)
            .ok_or_else(|| VmError::ResourceExhaustion("no object ids left".into()))?;
        heap.pin(out_of_memory);

        Ok(Self {
            natives: NativeRegistry::new(config.native_library_path.clone()),
            jit: Jit::new(&config),
            registry,
            famous,
            heap,
            threads: ThreadManager::new(),
            safepoints: Safepoints::new(),
            monitors: DashMap::new(),
            debugger: Debugger::default(),
            out_of_memory,
            config,
        })
    }

    /// Collects with every mutator stopped. `roots` are the frames and
    /// local references of all threads; the VM adds its own.
    pub(crate) fn collect(&self, mut roots: Vec<Reference>) -> GcStats {
        roots.extend(self.threads.live_objects());
        for class in self.registry.loaded_classes() {
            roots.extend(
                class
                    .static_refs
                    .iter()
                    .map(|&slot| class.get_static(slot) as Reference),
            );
        }
        let stats = self.heap.collect(roots);
        self.threads.forget_dead_objects(&self.heap);
        let deflated = deflate_monitors(&self.monitors, &self.heap);
        if deflated > 0 {
            debug!("deflated {deflated} monitors");
        }
        stats
    }
}

/// How running a main class failed.
#[derive(Debug, Error)]
pub enum MainError {
    /// The main class or its `main` method could not be loaded, linked or
    /// prepared.
    #[error("{0}")]
    Startup(VmError),
    /// `main` completed by throwing. `report` is the stack trace.
    #[error("Exception in thread \"main\" {report}")]
    Uncaught { class: String, report: String },
    #[error("fatal error: {0}")]
    Fatal(VmError),
}

impl MainError {
    /// Process exit status for the launcher.
    pub fn exit_code(&self) -> i32 {
        match self {
            MainError::Uncaught { .. } => 1,
            MainError::Startup(VmError::Loading(_) | VmError::Linkage(_)) => 2,
            MainError::Startup(VmError::ResourceExhaustion(_)) => 3,
            MainError::Startup(_) | MainError::Fatal(_) => 4,
        }
    }
}

/// A virtual machine instance.
pub struct Vm {
    global: Arc<Global>,
}

impl Vm {
    /// A VM loading classes from the bootstrap classes and
    /// `config.class_path`.
    pub fn new(config: VmConfig) -> VmResult<Self> {
        let sources = config
            .class_path
            .iter()
            .map(|entry| source_for_path(entry.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::with_sources(config, sources)
    }

    /// A VM loading classes from the bootstrap classes and `sources`, in
    /// order. `config.class_path` is ignored.
    pub fn with_sources(config: VmConfig, sources: Vec<Box<dyn ClassSource>>) -> VmResult<Self> {
        let global = Global::new(config, sources)?;
        info!(
            "vm started: {} byte heap, {:?} gc, jit {}",
            global.config.heap_size,
            global.config.gc,
            if global.config.jit_enabled() { "on" } else { "off" }
        );
        Ok(Self {
            global: Arc::new(global),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.global.config
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.global.registry
    }

    pub fn add_class_source(&self, source: Box<dyn ClassSource>) {
        self.global.registry.add_source(source);
    }

    /// Makes `library` available to `System.loadLibrary`.
    pub fn register_library(&self, library: NativeLibrary) {
        self.global.natives.register(library);
    }

    /// Loads a registered library as `System.loadLibrary` would.
    pub fn load_library(&self, name: &str) -> VmResult<()> {
        self.global.natives.load(name)
    }

    /// Attaches the calling OS thread so that it can run code and hold
    /// references. It detaches when the context is dropped.
    pub fn attach_current_thread(&self, name: &str) -> ThreadContext {
        let handle = self.global.threads.register(name.to_string(), false, 0, false);
        ThreadContext {
            env: ThreadEnv::attach(Arc::clone(&self.global), handle, false),
            stack: CallStack::new(),
        }
    }

    pub fn attach_debugger(&self, mask: EventMask) -> Result<DebugSession, DebugError> {
        DebugSession::attach(Arc::clone(&self.global), mask)
    }

    /// Runs `static void main(String[])` of `class_name` (binary or
    /// internal form) on the calling thread, then waits for every
    /// non-daemon thread the program started.
    pub fn run_main(&self, class_name: &str, args: &[String]) -> Result<(), MainError> {
        let handle = self.global.threads.register("main".to_string(), false, 0, false);
        let env = ThreadEnv::attach(Arc::clone(&self.global), handle, false);
        let mut stack = CallStack::new();
        let result = run_main_on(&env, &mut stack, &class_name.replace('.', "/"), args);
        drop(stack);
        drop(env);
        if !matches!(result, Err(MainError::Startup(_) | MainError::Fatal(_))) {
            self.global.threads.wait_for_non_daemon();
        }
        result
    }

    /// Compiles a method right away, whatever its counters say.
    pub fn compile(&self, class_name: &str, name: &str, descriptor: &str) -> VmResult<()> {
        let class = self.global.registry.resolve(class_name)?;
        let method = class.declared_method(name, descriptor).ok_or_else(|| LinkageError::NoSuchMethod {
            class: class_name.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        })?;
        self.global
            .jit
            .compile_now(method)
            .map_err(|err| VmError::Internal(format!("cannot compile {method}: {err}")))
    }

    pub fn gc_stats(&self) -> GcStats {
        self.global.heap.stats()
    }

    pub fn jit_stats(&self) -> JitStats {
        self.global.jit.stats()
    }

    /// Live objects on the heap.
    pub fn object_count(&self) -> usize {
        self.global.heap.object_count()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.global.jit.shutdown();
    }
}

fn run_main_on(env: &ThreadEnv, stack: &mut CallStack, class_name: &str, args: &[String]) -> Result<(), MainError> {
    let global = &env.global;
    let class = global.registry.resolve(class_name).map_err(MainError::Startup)?;
    let main = class
        .declared_method("main", MAIN_DESCRIPTOR)
        .filter(|m| m.is_static())
        .cloned()
        .ok_or_else(|| {
            MainError::Startup(
                LinkageError::NoSuchMethod {
                    class: class_name.to_string(),
                    name: "main".to_string(),
                    descriptor: MAIN_DESCRIPTOR.to_string(),
                }
                .into(),
            )
        })?;

    let arguments = main_arguments(env, stack, args).map_err(|exception| match exception {
        Exception::Java(_) => MainError::Startup(VmError::ResourceExhaustion(
            "heap exhausted creating the arguments of main".into(),
        )),
        Exception::Vm(err) => MainError::Fatal(err),
    })?;

    debug::on_thread_event(env, stack, EventKind::VmInit);
    let result = initialize_class(env, stack, &class)
        .and_then(|()| invoke_method(env, stack, &main, &[Value::Reference(arguments)]));
    stack.locals.clear();
    match result {
        Ok(_) => Ok(()),
        Err(Exception::Java(throwable)) => Err(MainError::Uncaught {
            class: env
                .heap()
                .get(throwable)
                .map(|o| o.class.name.replace('/', "."))
                .unwrap_or_default(),
            report: throwable::report(env, throwable),
        }),
        Err(Exception::Vm(err)) => Err(MainError::Fatal(err)),
    }
}

/// The `String[]` passed to `main`, held on `stack`.
fn main_arguments(env: &ThreadEnv, stack: &mut CallStack, args: &[String]) -> NativeResult<Reference> {
    let famous = &env.global.famous;
    let array = objects::new_array(env, stack, None, &famous.string_array, args.len() as i32)?;
    stack.hold(array);
    let object = objects::deref(env, array)?;
    for (index, arg) in args.iter().enumerate() {
        let string = objects::new_string(env, stack, None, arg)?;
        object.put_element(index as i32, string as u64);
    }
    Ok(array)
}

/// A Rust thread attached to a [`Vm`]. References it returns stay alive
/// until [`ThreadContext::clear_locals`] or the context is dropped.
pub struct ThreadContext {
    env: ThreadEnv,
    stack: CallStack,
}

impl ThreadContext {
    pub fn thread_id(&self) -> u32 {
        self.env.thread.id
    }

    /// Initializes the class if needed and calls the static method.
    /// Load and link failures are reported as [`Exception::Vm`].
    pub fn invoke_static(
        &mut self,
        class_name: &str,
        name: &str,
        descriptor: &str,
        args: &[Value],
    ) -> NativeResult<Option<Value>> {
        let class = self.env.global.registry.resolve(class_name)?;
        let Some(method) = class.declared_method(name, descriptor).filter(|m| m.is_static()).cloned() else {
            return Err(VmError::from(LinkageError::NoSuchMethod {
                class: class_name.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            })
            .into());
        };
        let mark = self.stack.locals.len();
        for arg in args {
            if let Value::Reference(r) = arg {
                self.stack.hold(*r);
            }
        }
        let result = initialize_class(&self.env, &mut self.stack, &class)
            .and_then(|()| invoke_method(&self.env, &mut self.stack, &method, args));
        self.stack.locals.truncate(mark);
        match result {
            Ok(Some(Value::Reference(r))) => {
                self.stack.hold(r);
                Ok(Some(Value::Reference(r)))
            }
            Err(Exception::Java(throwable)) => {
                self.stack.hold(throwable);
                Err(Exception::Java(throwable))
            }
            other => other,
        }
    }

    pub fn new_string(&mut self, value: &str) -> NativeResult<Reference> {
        let string = objects::new_string(&self.env, &mut self.stack, None, value)?;
        Ok(self.stack.hold(string))
    }

    pub fn string_value(&self, string: Reference) -> Option<String> {
        objects::string_value(&self.env, string)
    }

    /// Name of the object's class in binary form, `None` for null.
    pub fn class_name(&self, object: Reference) -> Option<String> {
        self.env
            .heap()
            .get(object)
            .map(|o| o.class.name.replace('/', "."))
    }

    /// What `printStackTrace` would print for `throwable`.
    pub fn stack_trace(&self, throwable: Reference) -> String {
        throwable::report(&self.env, throwable)
    }

    pub fn is_live(&self, object: Reference) -> bool {
        self.env.heap().contains(object)
    }

    /// Runs a collection with this thread's locals as roots.
    pub fn collect_garbage(&self) -> Option<GcStats> {
        self.env.collect_garbage(self.stack.roots(None))
    }

    /// Releases every reference this context holds.
    pub fn clear_locals(&mut self) {
        self.stack.locals.clear();
    }
}
