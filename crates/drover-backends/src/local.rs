//! Host-object backend for headless entities.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;

use drover_core::{AttributeError, Instance, InstanceId, Value};

/// An [`Instance`] backed by nothing but an attribute map.
///
/// For entities that have no host object — pure server-side records,
/// demos, doc tests. Accepts any attribute write; removal is driven by
/// the embedder via [`set_removed`](Self::set_removed).
pub struct LocalInstance {
    id: InstanceId,
    class: String,
    attributes: RefCell<IndexMap<String, Value>>,
    removed: Cell<bool>,
}

impl LocalInstance {
    /// A fresh instance of the given class.
    pub fn new(class: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            id: InstanceId::next(),
            class: class.into(),
            attributes: RefCell::new(IndexMap::new()),
            removed: Cell::new(false),
        })
    }

    /// Flag the object as removed.
    pub fn set_removed(&self) {
        self.removed.set(true);
    }

    /// Read an attribute directly.
    pub fn read(&self, name: &str) -> Option<Value> {
        self.attributes.borrow().get(name).cloned()
    }
}

impl Instance for LocalInstance {
    fn instance_id(&self) -> InstanceId {
        self.id
    }

    fn class_name(&self) -> &str {
        &self.class
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
        self.attributes.borrow_mut().insert(name.to_string(), value);
        Ok(())
    }
}
