//! Drover: an entity-behavior runtime for simulation-heavy applications.
//!
//! This is the top-level facade crate that re-exports the public API from
//! all Drover sub-crates. For most users, adding `drover` as a single
//! dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use drover::prelude::*;
//!
//! // A host object backed by a plain attribute map; real hosts
//! // implement `Instance` over their own object model.
//! use drover::backends::LocalInstance;
//!
//! // Describe an entity class: one replicated flag.
//! let schema = Schema::new()
//!     .with("IsOpen", PropertyDef::new(TypeTag::Bool).replicated());
//! let mut registries = Registries::new();
//! registries.add_entity_class(
//!     EntityClass::new("Door", schema).with_attribute_apply().build(),
//! );
//!
//! // Bring up a server runtime with no transport.
//! let runtime = Runtime::new(
//!     RuntimeConfig::server(),
//!     registries,
//!     TransportEndpoints::none(),
//! )
//! .unwrap();
//!
//! // Create an entity, stage a write, commit.
//! let door = runtime
//!     .create_entity(CreateEntity {
//!         entity_id: None,
//!         entity_class: "Door".into(),
//!         instance: LocalInstance::new("Door"),
//!         owner: None,
//!     })
//!     .unwrap();
//! door.borrow_mut().set("IsOpen", Value::Bool(true)).unwrap();
//! let changes = door.borrow_mut().commit(None).unwrap();
//! assert_eq!(changes.get("IsOpen"), Some(&Value::Bool(true)));
//!
//! // Drive a frame.
//! let report = runtime.run_frame();
//! assert_eq!(report.event, "heartbeat");
//! ```
//!
//! # Modules
//!
//! Each module corresponds to a sub-crate. Use them for types not in the
//! prelude:
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `drover-core` | IDs, values, schemas, signals, errors, core traits |
//! | [`sched`] | `drover-sched` | The frame-budgeted scheduler |
//! | [`fsm`] | `drover-fsm` | State machines, classes, behavior trees |
//! | [`entity`] | `drover-entity` | Entity proxies and persistence envelopes |
//! | [`store`] | `drover-store` | Key/value store adapter (retry/throttle/cache) |
//! | [`backends`] | `drover-backends` | In-memory store and loopback transport |
//! | [`runtime`] | `drover-runtime` | The orchestrator kernel |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types, traits, and ids (`drover-core`).
pub use drover_core as types;

/// The frame-budgeted scheduler (`drover-sched`).
pub use drover_sched as sched;

/// State machines and behavior trees (`drover-fsm`).
pub use drover_fsm as fsm;

/// Entity proxies and persistence (`drover-entity`).
pub use drover_entity as entity;

/// Key/value store adapter (`drover-store`).
pub use drover_store as store;

/// Reference backends (`drover-backends`).
pub use drover_backends as backends;

/// The orchestrator kernel (`drover-runtime`).
pub use drover_runtime as runtime;

/// Common imports for typical Drover usage.
///
/// ```rust
/// use drover::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use drover_core::{
        Args, Clock, Disposable, EntityId, Instance, InstanceId, LogBuffer, LogLevel, MachineId,
        ObjectRef, OwnerId, Packet, PropertyDef, Schema, Signal, TypeTag, Value,
    };

    // Errors
    pub use drover_core::{
        AttributeError, CommitError, RegistryError, ScheduleError, SchemaViolation, StoreError,
        TransitionError, TransportError,
    };

    // Scheduler
    pub use drover_sched::{SchedConfig, Scheduler, StepReport, TaskFailure, TaskSpec};

    // State machines
    pub use drover_fsm::{
        BtStatus, MachineClass, Priority, State, StateCtx, StateDef, StateFault, StateMachine,
        SubMachineConfig,
    };

    // Entities and persistence
    pub use drover_entity::{Entity, EntityClass, Envelope, PersistenceController};

    // Store
    pub use drover_store::{AdapterConfig, KvStore, RetryPolicy, StoreAdapter};

    // Runtime
    pub use drover_runtime::{
        CreateEntity, CreateMachine, PoolParams, Registries, Role, Runtime, RuntimeConfig,
        TransportEndpoints,
    };
}
