//! Scriptable host-object and store doubles.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use drover_core::{AttributeError, Instance, InstanceId, StoreError, Value};
use drover_store::KvStore;

/// A scriptable host object for entity tests.
///
/// Attributes accept any name by default; mark one read-only to make
/// apply functions fail. The removal flag feeds the runtime's
/// object-gone detection.
pub struct TestInstance {
    id: InstanceId,
    class: String,
    superclasses: RefCell<IndexSet<String>>,
    attributes: RefCell<IndexMap<String, Value>>,
    read_only: RefCell<IndexSet<String>>,
    removed: Cell<bool>,
}

impl TestInstance {
    /// A fresh instance of the given class.
    pub fn new(class: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            id: InstanceId::next(),
            class: class.into(),
            superclasses: RefCell::new(IndexSet::new()),
            attributes: RefCell::new(IndexMap::new()),
            read_only: RefCell::new(IndexSet::new()),
            removed: Cell::new(false),
        })
    }

    /// Add a superclass so `is_a(class)` holds for it.
    pub fn inherit(&self, class: impl Into<String>) {
        self.superclasses.borrow_mut().insert(class.into());
    }

    /// Directly read an attribute, bypassing the `Instance` trait.
    pub fn read(&self, name: &str) -> Option<Value> {
        self.attributes.borrow().get(name).cloned()
    }

    /// Directly write an attribute, bypassing read-only markers.
    pub fn write(&self, name: impl Into<String>, value: Value) {
        self.attributes.borrow_mut().insert(name.into(), value);
    }

    /// Make future `set_attribute` calls for `name` fail.
    pub fn mark_read_only(&self, name: impl Into<String>) {
        self.read_only.borrow_mut().insert(name.into());
    }

    /// Flag the object as removed by the host.
    pub fn set_removed(&self) {
        self.removed.set(true);
    }
}

impl Instance for TestInstance {
    fn instance_id(&self) -> InstanceId {
        self.id
    }

    fn class_name(&self) -> &str {
        &self.class
    }

    fn is_a(&self, class: &str) -> bool {
        self.class == class || self.superclasses.borrow().contains(class)
    }

    fn is_removed(&self) -> bool {
        self.removed.get()
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        self.attributes.borrow().get(name).cloned()
    }

    fn set_attribute(&self, name: &str, value: Value) -> Result<(), AttributeError> {
        if self.removed.get() {
            return Err(AttributeError::Removed);
        }
        if self.read_only.borrow().contains(name) {
            return Err(AttributeError::ReadOnly {
                name: name.to_string(),
            });
        }
        self.attributes.borrow_mut().insert(name.to_string(), value);
        Ok(())
    }
}

/// A [`KvStore`] failing its first `fail_first` operations, then
/// delegating to an in-memory map.
pub struct FlakyStore {
    inner: Rc<MemoryStoreLike>,
    fail_first: Cell<u32>,
    /// Operations attempted, successful or not.
    pub ops: Cell<u32>,
}

type MemoryStoreLike = drover_backends::MemoryStore;

impl FlakyStore {
    /// A store whose first `fail_first` operations fail.
    pub fn new(fail_first: u32) -> Rc<Self> {
        Rc::new(Self {
            inner: drover_backends::MemoryStore::shared(),
            fail_first: Cell::new(fail_first),
            ops: Cell::new(0),
        })
    }

    /// The backing in-memory store.
    pub fn inner(&self) -> Rc<MemoryStoreLike> {
        self.inner.clone()
    }

    fn trip(&self) -> Result<(), StoreError> {
        self.ops.set(self.ops.get() + 1);
        if self.fail_first.get() > 0 {
            self.fail_first.set(self.fail_first.get() - 1);
            return Err(StoreError::Backend {
                reason: "flaky store offline".into(),
            });
        }
        Ok(())
    }
}

impl KvStore for FlakyStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.trip()?;
        self.inner.read(key)
    }

    fn write(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.trip()?;
        self.inner.write(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.trip()?;
        self.inner.remove(key)
    }
}
