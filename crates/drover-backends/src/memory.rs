//! In-memory key/value store.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use drover_core::StoreError;
use drover_store::KvStore;

/// A [`KvStore`] over an in-memory map. Never fails.
#[derive(Default)]
pub struct MemoryStore {
    map: RefCell<IndexMap<String, String>>,
}

impl MemoryStore {
    /// A fresh store behind an `Rc`, ready to hand to consumers.
    pub fn shared() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }

    /// All keys, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.map.borrow().keys().cloned().collect()
    }
}

impl KvStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map.borrow().get(key).cloned())
    }

    fn write(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.map.borrow_mut().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.map.borrow_mut().shift_remove(key);
        Ok(())
    }
}
