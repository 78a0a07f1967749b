pub mod class;
pub mod config;
pub mod consts;
pub mod descriptor;
pub mod error;
pub mod runtime;

pub use config::{GcStrategy, VmConfig};
pub use error::{LinkageError, LoadingError, VmError, VmResult};
pub use runtime::{
    DebugSession, EventMask, Exception, MainError, NativeEnv, NativeLibrary, NativeResult, Reference,
    ThreadContext, Value, Vm,
};
