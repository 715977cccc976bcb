//! Class registries: the factory's compiled output.
//!
//! Definitions arrive as already-built class records ([`EntityClass`],
//! [`MachineClass`]); the registries expose them by class name for the
//! runtime's create paths. Unknown names are hard errors — a typo in a
//! class name should fail the create, not invent an empty class.

use std::rc::Rc;

use indexmap::IndexMap;

use drover_core::RegistryError;
use drover_entity::EntityClass;
use drover_fsm::MachineClass;

/// Compiled entity and machine classes, keyed by class name.
#[derive(Default)]
pub struct Registries {
    entity_classes: IndexMap<String, Rc<EntityClass>>,
    machine_classes: IndexMap<String, Rc<MachineClass>>,
}

impl Registries {
    /// Empty registries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity class under its own name, replacing any prior
    /// class of that name.
    pub fn add_entity_class(&mut self, class: Rc<EntityClass>) -> &mut Self {
        self.entity_classes.insert(class.name.clone(), class);
        self
    }

    /// Register a machine class under its own name, replacing any prior
    /// class of that name.
    pub fn add_machine_class(&mut self, class: Rc<MachineClass>) -> &mut Self {
        self.machine_classes
            .insert(class.class_name.clone(), class);
        self
    }

    /// Look up an entity class.
    pub fn entity_class(&self, name: &str) -> Result<Rc<EntityClass>, RegistryError> {
        self.entity_classes
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownClass {
                kind: "entity",
                name: name.to_string(),
            })
    }

    /// Look up a machine class.
    pub fn machine_class(&self, name: &str) -> Result<Rc<MachineClass>, RegistryError> {
        self.machine_classes
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownClass {
                kind: "machine",
                name: name.to_string(),
            })
    }

    /// All registered entity class names, in registration order.
    pub fn entity_class_names(&self) -> Vec<&str> {
        self.entity_classes.keys().map(String::as_str).collect()
    }

    /// All registered machine class names, in registration order.
    pub fn machine_class_names(&self) -> Vec<&str> {
        self.machine_classes.keys().map(String::as_str).collect()
    }
}
