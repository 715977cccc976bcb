//! The orchestrator kernel.
//!
//! [`Runtime`] is the single place entities and machines are created,
//! tracked, linked, and torn down. It drives the scheduler from host
//! frame events, bridges committed entity changes to the replication
//! transport, routes client commands and admin requests, and reaps
//! whatever the host removes.
//!
//! One runtime instance per process role: a server runtime owns the
//! authoritative entities and broadcasts deltas; a client runtime mirrors
//! them from inbound packets and sends commands upstream.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod config;
pub mod registry;
pub mod runtime;
pub mod service;

pub use config::{Role, RuntimeConfig, RuntimeConfigError};
pub use registry::Registries;
pub use runtime::{
    CreateEntity, CreateMachine, EntitySeed, PoolParams, Runtime, TransportEndpoints,
    REQUEST_ENTITY_SNAPSHOT,
};
pub use service::RuntimeSnapshot;
