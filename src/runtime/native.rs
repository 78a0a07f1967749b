//! Native methods: Rust functions bound to `native` declarations by class,
//! name and descriptor. Functions come in named [`NativeLibrary`] bundles;
//! the core library is always loaded, others once the program asks for
//! them with `System.loadLibrary`.

mod class;
mod object;
mod string;
mod system;
pub(crate) mod thread;
pub(crate) mod throwable;

use std::{
    env::consts::{DLL_PREFIX, DLL_SUFFIX},
    fmt,
    path::PathBuf,
    sync::Arc,
};

use dashmap::{DashMap, DashSet};
use log::debug;

use crate::{
    error::{LinkageError, VmError},
    runtime::{
        Exception, HeapObject, Method, NativeResult, Reference, Value,
        interpreter::{CallStack, initialize_class, invoke_method, objects},
        thread::{ThreadEnv, ThreadState},
    },
};

pub type NativeFunction = fn(&mut NativeEnv<'_>) -> NativeResult<Option<Value>>;

/// Name of the library holding the natives of the core classes.
pub const CORE_LIBRARY: &str = "java";

// key: class_name, method_name, method_descriptor
type Key = (Arc<str>, Arc<str>, Arc<str>);

/// A named set of native functions.
#[derive(Clone)]
pub struct NativeLibrary {
    name: String,
    functions: Vec<(Key, NativeFunction)>,
}

impl NativeLibrary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binds `function` to the native method `class.name descriptor`.
    pub fn register(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
        function: NativeFunction,
    ) -> &mut Self {
        self.functions
            .push(((Arc::from(class), Arc::from(name), Arc::from(descriptor)), function));
        self
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLibrary")
            .field("name", &self.name)
            .field("functions", &self.functions.len())
            .finish()
    }
}

fn core_library() -> NativeLibrary {
    let mut library = NativeLibrary::new(CORE_LIBRARY);
    object::register_natives(&mut library);
    class::register_natives(&mut library);
    string::register_natives(&mut library);
    system::register_natives(&mut library);
    thread::register_natives(&mut library);
    throwable::register_natives(&mut library);
    library
}

/// Libraries known to the process and the functions of the loaded ones.
pub(crate) struct NativeRegistry {
    functions: DashMap<Key, NativeFunction>,
    available: DashMap<String, NativeLibrary>,
    loaded: DashSet<String>,
    search_path: Vec<PathBuf>,
}

impl NativeRegistry {
    pub(crate) fn new(search_path: Vec<PathBuf>) -> Self {
        let registry = Self {
            functions: DashMap::new(),
            available: DashMap::new(),
            loaded: DashSet::new(),
            search_path,
        };
        registry.register(core_library());
        registry.install(CORE_LIBRARY);
        registry
    }

    /// Makes `library` available to `System.loadLibrary`. A library of the
    /// same name registered earlier is replaced, unless it is loaded.
    pub(crate) fn register(&self, library: NativeLibrary) {
        debug!(
            "registered native library {} ({} functions)",
            library.name,
            library.functions.len()
        );
        self.available.insert(library.name.clone(), library);
    }

    fn install(&self, name: &str) -> bool {
        let Some(library) = self.available.get(name) else {
            return false;
        };
        for (key, function) in &library.functions {
            self.functions.insert(key.clone(), *function);
        }
        self.loaded.insert(name.to_string());
        true
    }

    pub(crate) fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains(name)
    }

    /// `System.loadLibrary`. In-process libraries always load; a name that
    /// only matches a file on the search path cannot be.
    pub(crate) fn load(&self, name: &str) -> Result<(), VmError> {
        if self.is_loaded(name) || self.install(name) {
            debug!("loaded native library {name}");
            return Ok(());
        }
        let message = match self.find_on_path(name) {
            Some(path) => format!("{}: cannot load a foreign library", path.display()),
            None => format!(
                "no {name} in library path {}",
                self.search_path
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(":")
            ),
        };
        Err(LinkageError::UnsatisfiedLink(message).into())
    }

    fn find_on_path(&self, name: &str) -> Option<PathBuf> {
        let file = format!("{DLL_PREFIX}{name}{DLL_SUFFIX}");
        self.search_path
            .iter()
            .map(|dir| dir.join(&file))
            .find(|path| path.is_file())
    }

    /// The function implementing `method`, cached on the method after the
    /// first lookup.
    pub(crate) fn bind(&self, method: &Method) -> Result<NativeFunction, VmError> {
        if let Some(&function) = method.native.get() {
            return Ok(function);
        }
        let key = (
            Arc::clone(&method.class_name),
            Arc::clone(&method.name),
            Arc::clone(&method.raw_descriptor),
        );
        let function = self
            .functions
            .get(&key)
            .map(|f| *f.value())
            .ok_or_else(|| LinkageError::UnsatisfiedLink(method.to_string()))?;
        let _ = method.native.set(function);
        Ok(function)
    }
}

/// What a native function sees of the VM: its arguments and the calling
/// thread. References created through it stay reachable until the native
/// returns.
pub struct NativeEnv<'a> {
    pub(crate) env: &'a ThreadEnv,
    pub(crate) stack: &'a mut CallStack,
    method: Arc<Method>,
    args: Vec<Value>,
}

impl<'a> NativeEnv<'a> {
    pub(crate) fn new(
        env: &'a ThreadEnv,
        stack: &'a mut CallStack,
        method: Arc<Method>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            env,
            stack,
            method,
            args,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Arguments in declaration order, the receiver first for instance
    /// methods.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    fn arg<T>(&self, index: usize, get: impl FnOnce(&Value) -> Option<T>) -> NativeResult<T> {
        self.args.get(index).and_then(get).ok_or_else(|| {
            VmError::Internal(format!(
                "{}: argument {index} is missing or has the wrong type",
                self.method
            ))
            .into()
        })
    }

    pub fn int_arg(&self, index: usize) -> NativeResult<i32> {
        self.arg(index, Value::get_int)
    }

    pub fn long_arg(&self, index: usize) -> NativeResult<i64> {
        self.arg(index, Value::get_long)
    }

    pub fn double_arg(&self, index: usize) -> NativeResult<f64> {
        self.arg(index, Value::get_double)
    }

    pub fn reference_arg(&self, index: usize) -> NativeResult<Reference> {
        self.arg(index, Value::get_reference)
    }

    /// The receiver of an instance method.
    pub fn this(&self) -> NativeResult<Reference> {
        self.reference_arg(0)
    }

    pub fn thread_id(&self) -> u32 {
        self.env.thread.id
    }

    /// Keeps `reference` alive until the native returns.
    pub fn hold(&mut self, reference: Reference) -> Reference {
        self.stack.hold(reference)
    }

    pub fn new_string(&mut self, value: &str) -> NativeResult<Reference> {
        let string = objects::new_string(self.env, self.stack, None, value)?;
        Ok(self.hold(string))
    }

    /// Contents of a string object; `None` for null or a non-string.
    pub fn string_value(&self, string: Reference) -> Option<String> {
        objects::string_value(self.env, string)
    }

    /// A new instance of `class_name`, initializing the class first. No
    /// constructor runs.
    pub fn new_object(&mut self, class_name: &str) -> NativeResult<Reference> {
        let class = self
            .env
            .global
            .registry
            .resolve(class_name)
            .map_err(|err| self.raise(err))?;
        initialize_class(self.env, self.stack, &class)?;
        let object = objects::new_object(self.env, self.stack, None, &class)?;
        Ok(self.hold(object))
    }

    /// A new array of the array class `class_name`, such as `[I`.
    pub fn new_array(&mut self, class_name: &str, length: i32) -> NativeResult<Reference> {
        let class = self
            .env
            .global
            .registry
            .resolve(class_name)
            .map_err(|err| self.raise(err))?;
        let array = objects::new_array(self.env, self.stack, None, &class, length)?;
        Ok(self.hold(array))
    }

    pub fn get_field(&mut self, object: Reference, name: &str) -> NativeResult<Value> {
        let target = self.non_null(object)?;
        let Some(field) = target.class.instance_field(name) else {
            return Err(self.no_such_field(&target, name));
        };
        Ok(Value::from_slot(target.get_field(field.slot), &field.ty))
    }

    pub fn put_field(&mut self, object: Reference, name: &str, value: Value) -> NativeResult<()> {
        let target = self.non_null(object)?;
        let Some(field) = target.class.instance_field(name) else {
            return Err(self.no_such_field(&target, name));
        };
        target.put_field(field.slot, value.to_slot());
        Ok(())
    }

    fn no_such_field(&mut self, object: &HeapObject, name: &str) -> Exception {
        let error = LinkageError::NoSuchField {
            class: object.class.name.to_string(),
            name: name.to_string(),
        };
        self.raise(error.into())
    }

    pub fn array_length(&mut self, array: Reference) -> NativeResult<i32> {
        Ok(self.non_null(array)?.array_length() as i32)
    }

    pub fn array_element(&mut self, array: Reference, index: i32) -> NativeResult<Value> {
        let target = self.non_null(array)?;
        let (Some(value), Some(ty)) = (target.get_element(index), target.component_type()) else {
            return Err(self.out_of_bounds(index, target.array_length()));
        };
        Ok(Value::from_slot(value, ty))
    }

    pub fn set_array_element(&mut self, array: Reference, index: i32, value: Value) -> NativeResult<()> {
        let target = self.non_null(array)?;
        if !target.put_element(index, value.to_slot()) {
            return Err(self.out_of_bounds(index, target.array_length()));
        }
        Ok(())
    }

    fn out_of_bounds(&mut self, index: i32, length: usize) -> Exception {
        self.throw(
            "java/lang/ArrayIndexOutOfBoundsException",
            Some(&format!("Index {index} out of bounds for length {length}")),
        )
    }

    /// Calls a static method, initializing its class first.
    pub fn call_static(
        &mut self,
        class_name: &str,
        name: &str,
        descriptor: &str,
        args: &[Value],
    ) -> NativeResult<Option<Value>> {
        let class = self
            .env
            .global
            .registry
            .resolve(class_name)
            .map_err(|err| self.raise(err))?;
        let Some(method) = class.lookup_method(name, descriptor).filter(|m| m.is_static()) else {
            let error = LinkageError::NoSuchMethod {
                class: class_name.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            };
            return Err(self.raise(error.into()));
        };
        initialize_class(self.env, self.stack, &class)?;
        invoke_method(self.env, self.stack, &method, args)
    }

    /// A new throwable of class `class_name` for the native to return.
    pub fn throw(&mut self, class_name: &str, message: Option<&str>) -> Exception {
        objects::throw_new(self.env, self.stack, None, class_name, message)
    }

    pub fn null_pointer(&mut self) -> Exception {
        objects::null_pointer(self.env, self.stack, None)
    }

    /// Runs `f`, which may block, in a safe region so that collections do
    /// not wait for it.
    pub fn blocking<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let stack = &*self.stack;
        self.env
            .safe_region(ThreadState::Waiting, &|| stack.roots(None), f)
    }

    pub(crate) fn raise(&mut self, error: VmError) -> Exception {
        objects::raise(self.env, self.stack, None, error)
    }

    pub(crate) fn deref(&self, reference: Reference) -> NativeResult<Arc<HeapObject>> {
        objects::deref(self.env, reference)
    }

    pub(crate) fn non_null(&mut self, reference: Reference) -> NativeResult<Arc<HeapObject>> {
        if reference == 0 {
            return Err(self.null_pointer());
        }
        self.deref(reference)
    }

    pub(crate) fn roots(&self) -> Vec<Reference> {
        self.stack.roots(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_: &mut NativeEnv<'_>) -> NativeResult<Option<Value>> {
        Ok(None)
    }

    #[test]
    fn test_core_library_is_loaded() {
        let registry = NativeRegistry::new(Vec::new());
        assert!(registry.is_loaded(CORE_LIBRARY));
        let key = (
            Arc::from("java/lang/System"),
            Arc::from("arraycopy"),
            Arc::from("(Ljava/lang/Object;ILjava/lang/Object;II)V"),
        );
        assert!(registry.functions.contains_key(&key));
    }

    #[test]
    fn test_registered_libraries_load_on_request() {
        let registry = NativeRegistry::new(Vec::new());
        let mut library = NativeLibrary::new("extra");
        library.register("demo/Extra", "f", "()V", nop);
        registry.register(library);
        assert!(!registry.is_loaded("extra"));
        let key = (Arc::from("demo/Extra"), Arc::from("f"), Arc::from("()V"));
        assert!(!registry.functions.contains_key(&key));
        registry.load("extra").unwrap();
        assert!(registry.functions.contains_key(&key));
    }

    #[test]
    fn test_unknown_library() {
        let dir = tempfile::tempdir().unwrap();
        let registry = NativeRegistry::new(vec![dir.path().to_path_buf()]);
        let err = registry.load("missing").unwrap_err();
        assert_eq!(err.java_class(), Some("java/lang/UnsatisfiedLinkError"));
        assert!(err.to_string().contains("no missing in library path"));

        let file = dir.path().join(format!("{DLL_PREFIX}present{DLL_SUFFIX}"));
        std::fs::write(&file, b"").unwrap();
        let err = registry.load("present").unwrap_err();
        assert!(err.to_string().contains("cannot load a foreign library"));
    }
}
