//! The admin-gated service manager endpoint.
//!
//! One request handler multiplexes management actions behind a
//! caller-supplied gate: sanitized snapshots, scheduler settings
//! updates, machine management, console commands, and forwarded
//! scheduler operations. Requests failing the gate are rejected before
//! any action runs.

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use drover_core::{LogRecord, MachineId, TransportError, REQUEST_SERVICE_MANAGER};
use drover_entity::EntityView;
use drover_fsm::MachineView;
use drover_sched::{SchedConfig, SchedulerSnapshot};

use crate::config::Role;
use crate::runtime::Runtime;

/// Sanitized view of the whole runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    /// Server or client.
    pub role: Role,
    /// Frames stepped so far.
    pub frame: u64,
    /// All registered machines.
    pub machines: Vec<MachineView>,
    /// All registered entities.
    pub entities: Vec<EntityView>,
    /// Retained log records, oldest first.
    pub logs: Vec<LogRecord>,
    /// Scheduler settings, queues, tasks, and history.
    pub scheduler: SchedulerSnapshot,
}

impl Runtime {
    /// Build the sanitized runtime snapshot.
    pub fn snapshot(&self) -> RuntimeSnapshot {
        let machines = self
            .state_machines()
            .iter()
            .filter_map(|id| self.get_state_machine(id))
            .map(|m| m.borrow().view())
            .collect();
        let entities = self
            .entities()
            .iter()
            .filter_map(|id| self.get_entity(id))
            .map(|e| e.borrow().view())
            .collect();
        RuntimeSnapshot {
            role: self.role(),
            frame: self.frame(),
            machines,
            entities,
            logs: self.log().snapshot(),
            scheduler: self.scheduler().snapshot(),
        }
    }

    /// Register a named server-side console action.
    pub fn register_console_command(
        &self,
        name: &str,
        handler: impl Fn(&Json) -> Json + 'static,
    ) {
        self.console_commands
            .borrow_mut()
            .insert(name.to_string(), Rc::new(handler));
    }

    /// Install the gated service manager request handler.
    ///
    /// The gate sees the full request payload (including whatever auth
    /// material the embedder put there) and returns whether to proceed.
    pub fn start_service_manager(
        self: &Rc<Self>,
        gate: impl Fn(&Json) -> bool + 'static,
    ) {
        let weak = Rc::downgrade(self);
        self.register_request_handler(REQUEST_SERVICE_MANAGER, move |payload| {
            let rt = weak.upgrade().ok_or(TransportError::Closed)?;
            if !gate(&payload) {
                return Err(TransportError::Rejected {
                    reason: "not authorized".into(),
                });
            }
            let action = payload
                .get("action")
                .and_then(Json::as_str)
                .unwrap_or_default();
            match action {
                "snapshot" => serde_json::to_value(rt.snapshot())
                    .map_err(|e| TransportError::Rejected {
                        reason: e.to_string(),
                    }),
                "request_entity_snapshot" => serde_json::to_value(rt.entity_seeds())
                    .map_err(|e| TransportError::Rejected {
                        reason: e.to_string(),
                    }),
                "update_settings" => {
                    let settings = payload.get("settings").cloned().unwrap_or(Json::Null);
                    let config: SchedConfig = serde_json::from_value(settings)
                        .map_err(|e| TransportError::Rejected {
                            reason: format!("bad settings: {e}"),
                        })?;
                    rt.scheduler()
                        .configure(config)
                        .map_err(|e| TransportError::Rejected {
                            reason: e.to_string(),
                        })?;
                    Ok(json!({ "ok": true }))
                }
                "fsm" => {
                    let id = MachineId(
                        payload
                            .get("id")
                            .and_then(Json::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    );
                    match payload.get("op").and_then(Json::as_str) {
                        Some("cancel") => {
                            let found = rt.cancel_state_machine(&id);
                            Ok(json!({ "ok": found }))
                        }
                        Some("retry") => match rt.retry_state_machine(&id) {
                            Ok(_) => Ok(json!({ "ok": true })),
                            Err(e) => Err(TransportError::Rejected {
                                reason: e.to_string(),
                            }),
                        },
                        other => Err(TransportError::Rejected {
                            reason: format!("unknown fsm op {other:?}"),
                        }),
                    }
                }
                "console_command" => {
                    let name = payload
                        .get("name")
                        .and_then(Json::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let args = payload.get("args").cloned().unwrap_or(Json::Null);
                    let handler = rt.console_commands.borrow().get(&name).cloned();
                    match handler {
                        Some(handler) => Ok(handler(&args)),
                        None => Err(TransportError::Rejected {
                            reason: format!("unknown console command '{name}'"),
                        }),
                    }
                }
                "scheduler" => {
                    let task = payload
                        .get("task")
                        .and_then(Json::as_str)
                        .unwrap_or_default();
                    match payload.get("op").and_then(Json::as_str) {
                        Some("snapshot") => serde_json::to_value(rt.scheduler().snapshot())
                            .map_err(|e| TransportError::Rejected {
                                reason: e.to_string(),
                            }),
                        Some("deschedule") => {
                            Ok(json!({ "ok": rt.scheduler().deschedule(task) }))
                        }
                        Some("reset") => Ok(json!({ "ok": rt.scheduler().reset(task) })),
                        Some("execute") => match rt.scheduler().execute(task) {
                            Ok(()) => Ok(json!({ "ok": true })),
                            Err(e) => Err(TransportError::Rejected {
                                reason: e.to_string(),
                            }),
                        },
                        other => Err(TransportError::Rejected {
                            reason: format!("unknown scheduler op {other:?}"),
                        }),
                    }
                }
                other => Err(TransportError::Rejected {
                    reason: format!("unknown action '{other}'"),
                }),
            }
        });
    }
}
