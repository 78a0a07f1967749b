//! The execution engine: class registry, verifier, both execution tiers,
//! heap, threads, natives and the debugger interface.

pub(crate) mod class_loader;
pub(crate) mod debug;
pub(crate) mod famous_classes;
pub(crate) mod heap;
pub(crate) mod inheritance;
pub(crate) mod interpreter;
pub(crate) mod jit;
pub(crate) mod native;
pub(crate) mod structs;
pub(crate) mod thread;
pub(crate) mod verifier;
pub(crate) mod vm;

pub use class_loader::{
    ClassRegistry, ClassSource, DirectorySource, JarSource, MemorySource, class_path_sources,
    source_for_path,
};
pub use debug::{
    DebugCommand, DebugError, DebugEvent, DebugReply, DebugSession, EventKind, EventMask, FrameInfo,
    Location, ThreadInfo,
};
pub use famous_classes::BootstrapSource;
pub use heap::{GcStats, reflection::TraceEntry};
pub use interpreter::instructions;
pub use jit::{CompileError, JitStats};
pub use native::{CORE_LIBRARY, NativeEnv, NativeFunction, NativeLibrary};
pub use structs::*;
pub use thread::ThreadState;
pub use vm::{MainError, ThreadContext, Vm};
