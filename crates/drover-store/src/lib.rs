//! Key/value store adapter.
//!
//! The runtime persists entity envelopes through an abstract [`KvStore`];
//! the concrete backend (a cloud data store, a file, an in-memory map) is
//! opaque. [`StoreAdapter`] wraps a backend with the operational concerns
//! the backend does not provide: bounded retries with jittered backoff,
//! per-key write throttling with coalescing, and an optional read-through
//! cache.
//!
//! The adapter never sleeps. Failed or throttled writes are parked in a
//! pending set with a not-before time; a recurring scheduler task calls
//! [`flush_due()`](StoreAdapter::flush_due) to push them when due.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod adapter;

pub use adapter::{AdapterConfig, AdapterStats, FlushReport, RetryPolicy, StoreAdapter};

use drover_core::StoreError;

/// An abstract string key/value store.
///
/// Implementations surface backend failures as
/// [`StoreError::Backend`]; the adapter layers retry policy on top.
pub trait KvStore {
    /// Read the value at `key`, if present.
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` at `key`, replacing any existing value.
    fn write(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Remove the value at `key`. Removing a missing key succeeds.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}
