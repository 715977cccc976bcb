//! Error types for the Drover runtime, organized by subsystem:
//! schema/commit (entity), transition (state machines), schedule
//! (scheduler), store (persistence), transport, and registry.
//!
//! Boundary operations return these as `Err` values and never panic;
//! callers that only need a success flag use `.is_ok()`.

use std::error::Error;
use std::fmt;

/// A rejected entity field write.
///
/// The pending set is never modified when a write is rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaViolation {
    /// The field name is not defined in the entity's schema.
    UnknownProperty {
        /// The rejected field name.
        name: String,
    },
    /// The value's runtime type does not satisfy the property's type tag.
    TypeMismatch {
        /// The rejected field name.
        name: String,
        /// The schema's type tag string.
        expected: String,
        /// The value's runtime type name.
        got: String,
    },
    /// The entity has been destroyed; all writes are rejected.
    EntityDestroyed,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownProperty { name } => write!(f, "unknown property '{name}'"),
            Self::TypeMismatch {
                name,
                expected,
                got,
            } => write!(f, "property '{name}' expects {expected}, got {got}"),
            Self::EntityDestroyed => write!(f, "entity has been destroyed"),
        }
    }
}

impl Error for SchemaViolation {}

/// A failed entity commit.
///
/// On any failure the pending set is left intact (except
/// [`NothingStaged`](Self::NothingStaged), where it was already empty)
/// and `StateUpdated` does not fire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitError {
    /// The pending set is empty; commit is a no-op.
    NothingStaged,
    /// The entity class has no apply function; the entity is immutable.
    NoApplier,
    /// The entity is locked by another owner.
    LockHeld {
        /// The current lock owner.
        owner: String,
    },
    /// The entity has been destroyed.
    Destroyed,
    /// The apply function failed; staged changes were not committed.
    ApplyFailed {
        /// Human-readable description of the failure.
        reason: String,
    },
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NothingStaged => write!(f, "nothing staged"),
            Self::NoApplier => write!(f, "entity class has no apply function"),
            Self::LockHeld { owner } => write!(f, "entity is locked by '{owner}'"),
            Self::Destroyed => write!(f, "entity has been destroyed"),
            Self::ApplyFailed { reason } => write!(f, "apply failed: {reason}"),
        }
    }
}

impl Error for CommitError {}

/// A rejected state machine transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionError {
    /// The target state is not registered and not a terminal name.
    UnknownState {
        /// The rejected target.
        name: String,
    },
    /// The target is outside the machine's declared valid-state set.
    NotAllowed {
        /// The rejected target.
        name: String,
    },
    /// The current state's valid-outcomes set excludes the target.
    IllegalOutcome {
        /// The current state.
        from: String,
        /// The rejected target.
        to: String,
    },
    /// The machine has finished, failed, been cancelled, or destroyed.
    MachineStopped,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownState { name } => write!(f, "unknown state '{name}'"),
            Self::NotAllowed { name } => {
                write!(f, "state '{name}' is outside the valid-state set")
            }
            Self::IllegalOutcome { from, to } => {
                write!(f, "'{to}' is not a valid outcome of '{from}'")
            }
            Self::MachineStopped => write!(f, "machine has stopped"),
        }
    }
}

impl Error for TransitionError {}

/// A rejected scheduler submission.
#[derive(Clone, Debug, PartialEq)]
pub enum ScheduleError {
    /// The task name is empty.
    EmptyName,
    /// The delay is NaN or infinite.
    InvalidDelay {
        /// The rejected delay, in seconds.
        value: f64,
    },
    /// The named task does not exist.
    UnknownTask {
        /// The unknown name.
        name: String,
    },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "task name is empty"),
            Self::InvalidDelay { value } => {
                write!(f, "delay must be finite, got {value}")
            }
            Self::UnknownTask { name } => write!(f, "unknown task '{name}'"),
        }
    }
}

impl Error for ScheduleError {}

/// A key/value store failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store reported an error.
    Backend {
        /// Backend-supplied description.
        reason: String,
    },
    /// A stored payload could not be decoded.
    Decode {
        /// Description of the decode failure.
        reason: String,
    },
    /// A payload could not be encoded for storage.
    Encode {
        /// Description of the encode failure.
        reason: String,
    },
    /// All retry attempts were exhausted.
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The final backend error message.
        last: String,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { reason } => write!(f, "store backend: {reason}"),
            Self::Decode { reason } => write!(f, "decode: {reason}"),
            Self::Encode { reason } => write!(f, "encode: {reason}"),
            Self::RetriesExhausted { attempts, last } => {
                write!(f, "store failed after {attempts} attempts: {last}")
            }
        }
    }
}

impl Error for StoreError {}

/// A transport failure.
///
/// Broadcasts are best-effort and never surface errors; requests surface
/// these to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// The request timed out waiting for a reply.
    Timeout,
    /// The transport endpoint is closed.
    Closed,
    /// The remote rejected the request.
    Rejected {
        /// Remote-supplied description.
        reason: String,
    },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Closed => write!(f, "transport is closed"),
            Self::Rejected { reason } => write!(f, "request rejected: {reason}"),
        }
    }
}

impl Error for TransportError {}

/// A failed registry or factory operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// No class is registered under the given name.
    UnknownClass {
        /// `"entity"` or `"machine"`.
        kind: &'static str,
        /// The unknown class name.
        name: String,
    },
    /// Entity creation was missing its bound instance.
    MissingInstance,
    /// No registered entry for the given id.
    UnknownId {
        /// The unknown id.
        id: String,
    },
    /// A newly created machine failed to start.
    StartFailed {
        /// The machine id.
        id: String,
        /// The underlying transition error.
        reason: String,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownClass { kind, name } => {
                write!(f, "unknown {kind} class '{name}'")
            }
            Self::MissingInstance => write!(f, "entity creation requires an instance"),
            Self::UnknownId { id } => write!(f, "no registry entry for '{id}'"),
            Self::StartFailed { id, reason } => {
                write!(f, "machine '{id}' failed to start: {reason}")
            }
        }
    }
}

impl Error for RegistryError {}

/// A failed host-object attribute access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeError {
    /// The object has no attribute of the given name.
    Unknown {
        /// The unknown attribute name.
        name: String,
    },
    /// The attribute exists but cannot be written.
    ReadOnly {
        /// The read-only attribute name.
        name: String,
    },
    /// The object has been removed from the host.
    Removed,
}

impl fmt::Display for AttributeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown { name } => write!(f, "unknown attribute '{name}'"),
            Self::ReadOnly { name } => write!(f, "attribute '{name}' is read-only"),
            Self::Removed => write!(f, "object has been removed"),
        }
    }
}

impl Error for AttributeError {}
