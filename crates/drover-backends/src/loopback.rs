//! In-process loopback transport.
//!
//! One [`LoopbackHub`] stands in for the wire between a server runtime
//! and its clients. Broadcasts and commands land in queues the embedder
//! drains explicitly (deterministic pumping, no background delivery);
//! requests invoke the installed server handler synchronously.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use drover_core::{Args, Broadcaster, CommandSink, EntityId, Packet, Responder, TransportError};

type RequestHandler = Box<dyn Fn(&str, serde_json::Value) -> Result<serde_json::Value, TransportError>>;

/// A queued broadcast.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedBroadcast {
    /// Channel name.
    pub channel: String,
    /// Subject entity.
    pub entity_id: EntityId,
    /// The replicated field delta.
    pub packet: Packet,
}

/// A queued client command.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedCommand {
    /// Target entity.
    pub entity_id: EntityId,
    /// Command name.
    pub command: String,
    /// Command arguments.
    pub args: Args,
}

/// In-process implementation of all three transport seams.
#[derive(Default)]
pub struct LoopbackHub {
    broadcasts: RefCell<VecDeque<QueuedBroadcast>>,
    commands: RefCell<VecDeque<QueuedCommand>>,
    request_handler: RefCell<Option<RequestHandler>>,
}

impl LoopbackHub {
    /// A fresh hub behind an `Rc`, ready to hand to runtimes.
    pub fn shared() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Install the server-side request handler.
    pub fn serve_requests(
        &self,
        handler: impl Fn(&str, serde_json::Value) -> Result<serde_json::Value, TransportError>
            + 'static,
    ) {
        *self.request_handler.borrow_mut() = Some(Box::new(handler));
    }

    /// Drain all queued broadcasts, oldest first.
    pub fn drain_broadcasts(&self) -> Vec<QueuedBroadcast> {
        self.broadcasts.borrow_mut().drain(..).collect()
    }

    /// Drain all queued commands, oldest first.
    pub fn drain_commands(&self) -> Vec<QueuedCommand> {
        self.commands.borrow_mut().drain(..).collect()
    }

    /// Number of undelivered broadcasts.
    pub fn broadcast_depth(&self) -> usize {
        self.broadcasts.borrow().len()
    }
}

impl Broadcaster for LoopbackHub {
    fn broadcast(&self, channel: &str, entity: &EntityId, packet: &Packet) {
        self.broadcasts.borrow_mut().push_back(QueuedBroadcast {
            channel: channel.to_string(),
            entity_id: entity.clone(),
            packet: packet.clone(),
        });
    }
}

impl CommandSink for LoopbackHub {
    fn send_command(&self, entity: &EntityId, command: &str, args: &Args) {
        self.commands.borrow_mut().push_back(QueuedCommand {
            entity_id: entity.clone(),
            command: command.to_string(),
            args: args.clone(),
        });
    }
}

impl Responder for LoopbackHub {
    fn request(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let handler = self.request_handler.borrow();
        match handler.as_ref() {
            Some(handler) => handler(name, payload),
            None => Err(TransportError::Closed),
        }
    }
}
