//! Reference backend implementations.
//!
//! Concrete stores and transports are out of the runtime's scope; these
//! in-process references exist for development, tests, and demos:
//!
//! - [`MemoryStore`] — a [`KvStore`](drover_store::KvStore) over an
//!   in-memory map.
//! - [`LoopbackHub`] — all three transport seams wired to in-process
//!   queues, pumped explicitly by the embedder.
//! - [`LocalInstance`] — a host object backed by nothing but an
//!   attribute map, for headless entities.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod local;
pub mod loopback;
pub mod memory;

pub use local::LocalInstance;
pub use loopback::LoopbackHub;
pub use memory::MemoryStore;
