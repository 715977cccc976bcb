//! Core types and traits for the Drover entity-behavior runtime.
//!
//! This is the leaf crate with zero internal Drover dependencies. It defines
//! the fundamental abstractions used throughout the Drover workspace:
//! identifiers, dynamic values and schemas, signals, the log ring buffer,
//! error types, and core traits.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod clock;
pub mod disposal;
pub mod error;
pub mod id;
pub mod logbuf;
pub mod schema;
pub mod signal;
pub mod traits;
pub mod value;

// Re-export core types at crate root for convenience.
pub use clock::{Clock, ManualClock};
pub use disposal::Disposable;
pub use error::{
    AttributeError, CommitError, RegistryError, ScheduleError, SchemaViolation, StoreError,
    TransitionError, TransportError,
};
pub use id::{EntityId, InstanceId, MachineId, OwnerId, TickId};
pub use logbuf::{LogBuffer, LogLevel, LogRecord};
pub use schema::{InstanceResolver, PropertyDef, Schema, TypeTag};
pub use signal::{Connection, Signal};
pub use traits::{
    Broadcaster, CommandSink, Instance, Responder, CHANNEL_ENTITY_COMMAND, CHANNEL_ENTITY_UPDATE,
    REQUEST_SERVICE_MANAGER,
};
pub use value::{Args, ObjectRef, Packet, Value};
