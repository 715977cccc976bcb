//! Core abstraction traits: the host-object handle and the transport
//! seams.
//!
//! The runtime never owns host objects and never speaks a concrete wire
//! protocol. Hosts implement [`Instance`] for whatever object model they
//! wrap, and plug transport backends in through [`Broadcaster`],
//! [`CommandSink`], and [`Responder`] at runtime construction.

use crate::error::{AttributeError, TransportError};
use crate::id::{EntityId, InstanceId};
use crate::value::{Args, ObjectRef, Packet, Value};

/// Channel name for server→client entity replication broadcasts.
pub const CHANNEL_ENTITY_UPDATE: &str = "entity_update";
/// Channel name for client→server entity commands.
pub const CHANNEL_ENTITY_COMMAND: &str = "entity_command";
/// Request name for the admin-gated service manager endpoint.
pub const REQUEST_SERVICE_MANAGER: &str = "service_manager";

/// Handle to an external host object wrapped by an entity.
///
/// The runtime requires only identity, class membership, a removal flag,
/// and attribute access. It observes but never drives the object's
/// lifetime.
pub trait Instance {
    /// Stable identity of this object.
    fn instance_id(&self) -> InstanceId;

    /// Runtime class name of this object.
    fn class_name(&self) -> &str;

    /// Whether this object is (or inherits from) the named class.
    ///
    /// The default is plain class-name equality; hosts with class
    /// hierarchies override this.
    fn is_a(&self, class: &str) -> bool {
        self.class_name() == class
    }

    /// Whether the host has removed this object.
    ///
    /// Once true it must stay true; the runtime destroys the bound
    /// entity on the next reaper pass.
    fn is_removed(&self) -> bool;

    /// Read a named attribute from the object.
    fn attribute(&self, name: &str) -> Option<Value>;

    /// Write a named attribute on the object.
    fn set_attribute(&self, name: &str, value: Value) -> Result<(), AttributeError>;
}

impl dyn Instance + '_ {
    /// Build a [`Value`]-embeddable reference to this object.
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            id: self.instance_id(),
            class: self.class_name().to_string(),
        }
    }
}

/// Fire-and-forget broadcast transport (server → all clients).
///
/// Broadcasts are best-effort: implementations log and drop on failure
/// rather than surfacing errors into the commit path.
pub trait Broadcaster {
    /// Broadcast `packet` for `entity` on the named channel.
    fn broadcast(&self, channel: &str, entity: &EntityId, packet: &Packet);
}

/// Fire-and-forget command transport (client → server).
pub trait CommandSink {
    /// Send a named command with arguments for the given entity.
    fn send_command(&self, entity: &EntityId, command: &str, args: &Args);
}

/// Request/response transport (client → server, yields until reply).
///
/// Payloads are structured JSON rather than field [`Value`]s: requests
/// carry snapshots, settings, and management envelopes that need lists
/// and nesting.
pub trait Responder {
    /// Issue a named request and wait for the reply.
    ///
    /// Timeouts surface as [`TransportError::Timeout`]; the runtime maps
    /// them to an absent result for callers that asked for one.
    fn request(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;
}
