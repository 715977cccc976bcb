//! Schema-validated entity proxies.
//!
//! An [`Entity`] is the authoritative record of one wrapped host
//! object's state. Writes are validated against the class schema and
//! staged into a pending set; [`commit()`](Entity::commit) applies the
//! staged changes to the host object and, only on success, merges them
//! into the committed data and fires `state_updated` with the exact
//! change snapshot. Opt-in per-property flags drive replication
//! (`replicate`) and persistence (`persist`).

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod class;
pub mod entity;
pub mod persist;

pub use class::{apply_instance_attributes, ApplyError, ApplyFn, EntityClass};
pub use entity::{Entity, EntityView, Lock};
pub use persist::{Envelope, PersistenceController, ENVELOPE_VERSION};
