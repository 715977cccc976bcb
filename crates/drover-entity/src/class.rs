//! Entity class descriptors.
//!
//! An [`EntityClass`] is a plain record: a name, a schema, and an apply
//! function that pushes committed changes onto the bound host object.
//! An entity whose class has no apply function is immutable — commits
//! fail rather than silently skipping the host write.

use std::fmt;
use std::rc::Rc;

use drover_core::{Instance, Packet, Schema};

/// A failed apply during commit.
///
/// When apply fails the staged changes stay pending and `state_updated`
/// does not fire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyError {
    /// Human-readable description of the failure.
    pub reason: String,
}

impl ApplyError {
    /// Build an error from any displayable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for ApplyError {}

/// Applies a committed change set to the bound host object.
pub type ApplyFn = Rc<dyn Fn(&dyn Instance, &Packet) -> Result<(), ApplyError>>;

/// The common apply function: write each changed field back as a host
/// attribute of the same name.
///
/// Stops at the first attribute failure; the commit then fails with the
/// pending set intact, so no change is half-applied from the entity's
/// point of view (host attributes already written stay written — hosts
/// that need atomicity provide their own apply function).
pub fn apply_instance_attributes(
    instance: &dyn Instance,
    changes: &Packet,
) -> Result<(), ApplyError> {
    for (name, value) in changes {
        instance
            .set_attribute(name, value.clone())
            .map_err(|e| ApplyError::new(format!("attribute '{name}': {e}")))?;
    }
    Ok(())
}

/// A compiled entity class.
#[derive(Clone)]
pub struct EntityClass {
    /// Class name, unique within a registry.
    pub name: String,
    /// The property schema entities of this class validate against.
    pub schema: Schema,
    /// Applies committed changes to the host object. `None` makes
    /// entities of this class immutable.
    pub apply: Option<ApplyFn>,
}

impl EntityClass {
    /// A class with no apply function (immutable entities).
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            apply: None,
        }
    }

    /// Attach a custom apply function.
    pub fn with_apply(
        mut self,
        apply: impl Fn(&dyn Instance, &Packet) -> Result<(), ApplyError> + 'static,
    ) -> Self {
        self.apply = Some(Rc::new(apply));
        self
    }

    /// Attach the attribute-writeback apply function
    /// ([`apply_instance_attributes`]).
    pub fn with_attribute_apply(mut self) -> Self {
        self.apply = Some(Rc::new(apply_instance_attributes));
        self
    }

    /// Finish the class for registry use.
    pub fn build(self) -> Rc<Self> {
        Rc::new(self)
    }
}

impl fmt::Debug for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityClass")
            .field("name", &self.name)
            .field("schema_len", &self.schema.len())
            .field("has_apply", &self.apply.is_some())
            .finish()
    }
}
