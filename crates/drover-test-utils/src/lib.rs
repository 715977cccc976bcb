//! Reusable test fixtures for the Drover workspace.
//!
//! - [`TestInstance`] — a scriptable host object: attribute map,
//!   class hierarchy, read-only markers, and a removal flag.
//! - [`FlakyStore`] — a [`KvStore`](drover_store::KvStore) that fails
//!   deterministically for its first N operations.
//! - [`MemoryStore`] — re-exported from `drover-backends` for test
//!   convenience.

#![forbid(unsafe_code)]

pub mod fixtures;

pub use drover_backends::MemoryStore;
pub use fixtures::{FlakyStore, TestInstance};
