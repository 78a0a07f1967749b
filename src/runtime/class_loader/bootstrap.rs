use std::{
    sync::Arc,
    thread::{self, ThreadId},
};

use dashmap::DashMap;
use log::debug;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::{
    class,
    descriptor::FieldType,
    error::{LinkageError, LoadingError, VmError, VmResult},
    runtime::{
        Class,
        class_loader::{ClassSource, define_array_class, define_class},
        verifier::{self, ClassHierarchy, OBJECT},
    },
};

/// Lifecycle of one class name in the registry.
#[derive(Debug)]
enum EntryState {
    Unloaded,
    Loading(ThreadId),
    Loaded(Arc<Class>),
    Linking(ThreadId, Arc<Class>),
    Linked(Arc<Class>),
    Failed(VmError),
}

#[derive(Debug)]
struct ClassEntry {
    state: Mutex<EntryState>,
    cond: Condvar,
}

impl Default for ClassEntry {
    fn default() -> Self {
        Self {
            state: Mutex::new(EntryState::Unloaded),
            cond: Condvar::new(),
        }
    }
}

/// Process-wide table of loaded classes.
///
/// Each class name has its own state and lock; a thread only ever waits on
/// a class another thread is loading or linking. Linking a class links its
/// supertypes first and never the other way round.
#[derive(Debug)]
pub struct ClassRegistry {
    sources: RwLock<Vec<Box<dyn ClassSource>>>,
    entries: DashMap<Arc<str>, Arc<ClassEntry>>,
    /// Class each blocked loader thread is waiting for.
    waiting_on: DashMap<ThreadId, Arc<str>>,
    /// Thread currently loading each class in the `Loading` state.
    loading_by: DashMap<Arc<str>, ThreadId>,
}

impl ClassRegistry {
    pub fn new(sources: Vec<Box<dyn ClassSource>>) -> Self {
        Self {
            sources: RwLock::new(sources),
            entries: DashMap::new(),
            waiting_on: DashMap::new(),
            loading_by: DashMap::new(),
        }
    }

    /// Appends a source searched after the existing ones.
    pub fn add_source(&self, source: Box<dyn ClassSource>) {
        self.sources.write().push(source);
    }

    fn entry(&self, name: &str) -> Arc<ClassEntry> {
        if let Some(entry) = self.entries.get(name) {
            return Arc::clone(&entry);
        }
        Arc::clone(&self.entries.entry(Arc::from(name)).or_default())
    }

    /// Loads `name` and its supertypes without linking.
    pub fn load(&self, name: &str) -> VmResult<Arc<Class>> {
        if name.starts_with('[') {
            return self.load_array(name);
        }
        let entry = self.entry(name);
        let me = thread::current().id();
        let mut state = entry.state.lock();
        loop {
            match &*state {
                EntryState::Loaded(class)
                | EntryState::Linking(_, class)
                | EntryState::Linked(class) => return Ok(Arc::clone(class)),
                EntryState::Failed(err) => return Err(err.clone()),
                EntryState::Unloaded => {
                    *state = EntryState::Loading(me);
                    self.loading_by.insert(Arc::from(name), me);
                    break;
                }
                EntryState::Loading(owner) => {
                    let owner = *owner;
                    self.waiting_on.insert(me, Arc::from(name));
                    if self.closes_cycle(owner, me) {
                        self.waiting_on.remove(&me);
                        return Err(LinkageError::Circularity(name.to_string()).into());
                    }
                    entry.cond.wait(&mut state);
                    self.waiting_on.remove(&me);
                }
            }
        }
        drop(state);

        let result = self.define(name);
        let mut state = entry.state.lock();
        self.loading_by.remove(name);
        *state = match &result {
            Ok(class) => EntryState::Loaded(Arc::clone(class)),
            Err(err) => EntryState::Failed(err.clone()),
        };
        entry.cond.notify_all();
        result
    }

    /// Whether waiting for `owner` would close a wait-for cycle back to
    /// `me`. A class re-entered by the thread loading it is a cycle too.
    fn closes_cycle(&self, mut owner: ThreadId, me: ThreadId) -> bool {
        for _ in 0..=self.waiting_on.len() {
            if owner == me {
                return true;
            }
            let Some(awaited) = self.waiting_on.get(&owner).map(|n| Arc::clone(&n)) else {
                return false;
            };
            let Some(next) = self.loading_by.get(&awaited).map(|t| *t) else {
                return false;
            };
            owner = next;
        }
        false
    }

    fn define(&self, name: &str) -> VmResult<Arc<Class>> {
        let (bytes, source) = self.find_bytes(name)?;
        let file = class::class_file(name, &bytes)?;
        let this_name = file.this_class_name()?;
        if &**this_name != name {
            return Err(LoadingError::WrongName {
                expected: name.to_string(),
                found: this_name.to_string(),
            }
            .into());
        }
        let super_class = match file.super_class_name()? {
            Some(super_name) => Some(self.load(super_name)?),
            None => None,
        };
        let mut interfaces = Vec::with_capacity(file.interfaces.len());
        for &index in &file.interfaces {
            interfaces.push(self.load(file.class_name(index)?)?);
        }
        let class = define_class(&file, super_class, interfaces)?;
        debug!("loaded {name} from {source}");
        Ok(class)
    }

    fn find_bytes(&self, name: &str) -> VmResult<(Vec<u8>, String)> {
        let sources = self.sources.read();
        for source in sources.iter() {
            if let Some(bytes) = source.find_class(name)? {
                return Ok((bytes.into_owned(), source.name().to_string()));
            }
        }
        Err(LoadingError::NotFound(name.to_string()).into())
    }

    /// Loads and links `name`: supertypes are linked first, then every
    /// method body is verified.
    pub fn resolve(&self, name: &str) -> VmResult<Arc<Class>> {
        let class = self.load(name)?;
        self.link(&class)?;
        Ok(class)
    }

    pub fn link(&self, class: &Arc<Class>) -> VmResult<()> {
        if class.is_linked() {
            return Ok(());
        }
        let entry = self.entry(&class.name);
        let me = thread::current().id();
        let mut state = entry.state.lock();
        loop {
            match &*state {
                EntryState::Linked(_) => return Ok(()),
                EntryState::Failed(err) => return Err(err.clone()),
                // the verifier of this class asked for it again
                EntryState::Linking(owner, _) if *owner == me => return Ok(()),
                EntryState::Linking(..) => entry.cond.wait(&mut state),
                EntryState::Loaded(loaded) => {
                    *state = EntryState::Linking(me, Arc::clone(loaded));
                    break;
                }
                EntryState::Unloaded | EntryState::Loading(_) => {
                    return Err(VmError::Internal(format!(
                        "{} linked before it was loaded",
                        class.name
                    )));
                }
            }
        }
        drop(state);

        let result = self.link_supertypes_and_verify(class);
        let mut state = entry.state.lock();
        *state = match &result {
            Ok(()) => {
                class.linked.store(true, std::sync::atomic::Ordering::Release);
                debug!("linked {}", class.name);
                EntryState::Linked(Arc::clone(class))
            }
            Err(err) => {
                debug!("linking {} failed: {err}", class.name);
                EntryState::Failed(err.clone())
            }
        };
        entry.cond.notify_all();
        result
    }

    fn link_supertypes_and_verify(&self, class: &Arc<Class>) -> VmResult<()> {
        if let Some(super_class) = &class.super_class {
            self.link(super_class)?;
        }
        for interface in &class.interfaces {
            self.link(interface)?;
        }
        verifier::verify_class(class, self)
    }

    fn load_array(&self, name: &str) -> VmResult<Arc<Class>> {
        if let Some(class) = self.find_loaded(name) {
            return Ok(class);
        }
        let FieldType::Array(component) = FieldType::from_class_name(name)? else {
            return Err(LoadingError::malformed(name, "not an array class").into());
        };
        let component_class = match component.class_name() {
            Some(component_name) => Some(self.resolve(&component_name)?),
            None => None,
        };
        let object = self.resolve(OBJECT)?;
        let interfaces = vec![
            self.resolve("java/lang/Cloneable")?,
            self.resolve("java/io/Serializable")?,
        ];

        let entry = self.entry(name);
        let mut state = entry.state.lock();
        if let EntryState::Linked(class) = &*state {
            return Ok(Arc::clone(class));
        }
        let class = define_array_class(
            Arc::from(name),
            *component,
            component_class,
            object,
            interfaces,
        );
        *state = EntryState::Linked(Arc::clone(&class));
        Ok(class)
    }

    /// Array class whose elements are instances of `component`.
    pub fn array_class_of(&self, component: &Class) -> VmResult<Arc<Class>> {
        let name = if component.is_array() {
            format!("[{}", component.name)
        } else {
            format!("[L{};", component.name)
        };
        self.load_array(&name)
    }

    /// Class named `name` if it has finished loading.
    pub fn find_loaded(&self, name: &str) -> Option<Arc<Class>> {
        let entry = Arc::clone(&*self.entries.get(name)?);
        let state = entry.state.lock();
        match &*state {
            EntryState::Loaded(class)
            | EntryState::Linking(_, class)
            | EntryState::Linked(class) => Some(Arc::clone(class)),
            _ => None,
        }
    }

    /// Every class that has finished loading.
    pub fn loaded_classes(&self) -> Vec<Arc<Class>> {
        // entry locks are taken after the table is released
        let entries: Vec<_> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        entries
            .iter()
            .filter_map(|entry| match &*entry.state.lock() {
                EntryState::Loaded(class)
                | EntryState::Linking(_, class)
                | EntryState::Linked(class) => Some(Arc::clone(class)),
                _ => None,
            })
            .collect()
    }

    pub fn is_failed(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|e| Arc::clone(&e))
            .is_some_and(|e| matches!(&*e.state.lock(), EntryState::Failed(_)))
    }
}

impl ClassHierarchy for ClassRegistry {
    fn load(&self, name: &str) -> VmResult<Arc<Class>> {
        ClassRegistry::load(self, name)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::{
        class::ClassBuilder,
        consts::{ClassAccessFlag, MethodAccessFlag},
        runtime::{class_loader::MemorySource, famous_classes::BootstrapSource},
    };

    fn registry(source: MemorySource) -> ClassRegistry {
        ClassRegistry::new(vec![Box::new(BootstrapSource::new()), Box::new(source)])
    }

    fn simple(name: &str, super_name: &str) -> Vec<u8> {
        let mut builder = ClassBuilder::new(name);
        builder
            .super_class(super_name)
            .method(MethodAccessFlag::PUBLIC, "<init>", "()V", |code| {
                code.super_init(super_name).vreturn();
            });
        builder.build()
    }

    #[test]
    fn test_load_and_link() {
        let source = MemorySource::new("test")
            .with_class("A", simple("A", OBJECT))
            .with_class("B", simple("B", "A"));
        let registry = registry(source);
        let b = registry.resolve("B").unwrap();
        assert!(b.is_linked());
        let a = registry.find_loaded("A").unwrap();
        assert!(a.is_linked());
        assert!(Arc::ptr_eq(b.super_class().unwrap(), &a));
        // same descriptor on every lookup
        assert!(Arc::ptr_eq(&registry.load("B").unwrap(), &b));
    }

    #[test]
    fn test_missing_class() {
        let registry = registry(MemorySource::new("test"));
        let err = registry.load("Missing").unwrap_err();
        assert_eq!(err, LoadingError::NotFound("Missing".to_string()).into());
    }

    #[test]
    fn test_wrong_name() {
        let source = MemorySource::new("test").with_class("A", simple("Z", OBJECT));
        let registry = registry(source);
        assert!(matches!(
            registry.load("A"),
            Err(VmError::Loading(LoadingError::WrongName { .. }))
        ));
    }

    #[test]
    fn test_inheritance_cycle() {
        let source = MemorySource::new("test")
            .with_class("A", simple("A", "B"))
            .with_class("B", simple("B", "A"));
        let registry = registry(source);
        assert!(matches!(
            registry.load("A"),
            Err(VmError::Linkage(LinkageError::Circularity(_)))
        ));
        // the failure is remembered
        assert!(registry.load("A").is_err());
        assert!(registry.is_failed("A"));
    }

    #[test]
    fn test_verify_failure_is_not_linked() {
        let mut builder = ClassBuilder::new("Bad");
        builder.method(MethodAccessFlag::STATIC, "f", "()V", |code| {
            code.op(crate::runtime::instructions::IADD).vreturn();
        });
        let source = MemorySource::new("test").with_class("Bad", builder.build());
        let registry = registry(source);
        let class = registry.load("Bad").unwrap();
        assert!(matches!(
            registry.link(&class),
            Err(VmError::Linkage(LinkageError::Verify { .. }))
        ));
        assert!(!class.is_linked());
        assert!(registry.resolve("Bad").is_err());
    }

    #[test]
    fn test_final_superclass() {
        let mut builder = ClassBuilder::new("F");
        builder.access(ClassAccessFlag::PUBLIC | ClassAccessFlag::FINAL);
        let source = MemorySource::new("test")
            .with_class("F", builder.build())
            .with_class("G", simple("G", "F"));
        let registry = registry(source);
        assert!(matches!(
            registry.load("G"),
            Err(VmError::Linkage(LinkageError::IncompatibleClassChange { .. }))
        ));
    }

    #[test]
    fn test_array_classes() {
        let registry = registry(MemorySource::new("test"));
        let ints = registry.load("[I").unwrap();
        assert!(ints.is_array());
        assert!(Arc::ptr_eq(&registry.load("[I").unwrap(), &ints));
        let strings = registry.load("[[Ljava/lang/String;").unwrap();
        let component = strings.array.as_ref().unwrap().component_class.clone().unwrap();
        assert_eq!(component.name(), "[Ljava/lang/String;");
        let string = registry.resolve("java/lang/String").unwrap();
        assert!(Arc::ptr_eq(
            &registry.array_class_of(&string).unwrap(),
            &component
        ));
    }

    #[test]
    fn test_concurrent_loading() {
        let source = MemorySource::new("test").with_class("A", simple("A", OBJECT));
        let registry = Arc::new(registry(source));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.resolve("A").unwrap()
                })
            })
            .collect();
        let classes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(classes.iter().all(|c| Arc::ptr_eq(c, &classes[0])));
    }
}
