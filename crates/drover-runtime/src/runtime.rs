//! The runtime kernel: registries, factories, replication, routing.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use drover_core::{
    Args, Broadcaster, CommandSink, EntityId, Instance, LogBuffer, MachineId, OwnerId, Packet,
    RegistryError, Responder, Signal, TransportError, Value, CHANNEL_ENTITY_UPDATE,
};
use drover_entity::{Entity, EntityClass};
use drover_fsm::{ContextMap, StateMachine};
use drover_sched::{Scheduler, StepReport, TaskFailure, TaskSpec, EVENT_HEARTBEAT};
use drover_store::StoreAdapter;

use crate::config::{Role, RuntimeConfig, RuntimeConfigError};
use crate::registry::Registries;

/// Request name clients use to seed their local entity set.
pub const REQUEST_ENTITY_SNAPSHOT: &str = "request_entity_snapshot";

/// Parameters for [`Runtime::create_entity`].
pub struct CreateEntity {
    /// Explicit id; generated from the class name when absent.
    pub entity_id: Option<EntityId>,
    /// Registered entity class name.
    pub entity_class: String,
    /// The host object to bind.
    pub instance: Rc<dyn Instance>,
    /// Owner attribution, if any.
    pub owner: Option<OwnerId>,
}

/// Parameters for [`Runtime::create_state_machine`].
pub struct CreateMachine {
    /// Explicit id; generated from the class name when absent.
    pub machine_id: Option<MachineId>,
    /// Registered machine class name.
    pub machine_class: String,
    /// Shared context; a fresh map when absent.
    pub context: Option<Rc<RefCell<ContextMap>>>,
    /// The state to start in.
    pub initial_state: String,
    /// Arguments passed to the initial state.
    pub args: Args,
}

/// Parameters for [`Runtime::get_pooled_entity`].
pub struct PoolParams {
    /// Registered entity class name (selects the pool).
    pub entity_class: String,
    /// Explicit id; generated when absent.
    pub entity_id: Option<EntityId>,
    /// The host object to bind.
    pub instance: Rc<dyn Instance>,
    /// Owner attribution, if any.
    pub owner: Option<OwnerId>,
}

/// The minimum data a client needs to reconstruct one entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntitySeed {
    /// Entity class name.
    pub entity_class: String,
    /// Entity id.
    pub entity_id: EntityId,
    /// Owner attribution, if any.
    pub owner: Option<OwnerId>,
    /// Committed schema values, persist fields included.
    pub data: Packet,
}

/// Outbound transport seams, all optional.
///
/// A server typically supplies a broadcaster; a client supplies a
/// command sink and a responder. Absent seams turn the corresponding
/// operations into logged no-ops or [`TransportError::Closed`].
#[derive(Clone, Default)]
pub struct TransportEndpoints {
    /// Server→clients broadcast channel.
    pub broadcaster: Option<Rc<dyn Broadcaster>>,
    /// Client→server fire-and-forget commands.
    pub commands: Option<Rc<dyn CommandSink>>,
    /// Client→server request/response.
    pub requests: Option<Rc<dyn Responder>>,
}

impl TransportEndpoints {
    /// No transport at all (single-process embedding).
    pub fn none() -> Self {
        Self::default()
    }
}

pub(crate) type CommandHandler = Rc<dyn Fn(&Rc<RefCell<Entity>>, &Args) -> Result<(), String>>;
pub(crate) type RequestHandler =
    Rc<dyn Fn(serde_json::Value) -> Result<serde_json::Value, TransportError>>;
type SeedProvider = Box<dyn Fn(&EntitySeed) -> Option<Rc<dyn Instance>>>;

struct MachineMeta {
    class_name: String,
    initial_state: String,
    task_name: String,
}

/// The orchestrator. Construct with [`Runtime::new`]; share as
/// `Rc<Runtime>` and drive it from host frame events via
/// [`step`](Self::step).
pub struct Runtime {
    config: RuntimeConfig,
    scheduler: Rc<Scheduler>,
    log: LogBuffer,
    registries: Registries,
    transport: TransportEndpoints,
    entities: RefCell<IndexMap<EntityId, Rc<RefCell<Entity>>>>,
    machines: RefCell<IndexMap<MachineId, Rc<RefCell<StateMachine>>>>,
    machine_meta: RefCell<IndexMap<MachineId, MachineMeta>>,
    pools: RefCell<IndexMap<String, Vec<Rc<RefCell<Entity>>>>>,
    buses: RefCell<IndexMap<String, Signal<Value>>>,
    command_handlers: RefCell<IndexMap<(String, String), CommandHandler>>,
    pub(crate) request_handlers: RefCell<IndexMap<String, RequestHandler>>,
    pub(crate) console_commands:
        RefCell<IndexMap<String, Rc<dyn Fn(&serde_json::Value) -> serde_json::Value>>>,
    seed_provider: RefCell<Option<SeedProvider>>,
    /// Machines whose lifecycle signal fired; reaped next sweep.
    dead_machines: Rc<RefCell<Vec<MachineId>>>,
    /// Client-side packets for entities we have not seeded yet.
    deferred_updates: RefCell<IndexMap<EntityId, Vec<Packet>>>,
    rng: RefCell<ChaCha8Rng>,
    frame: Cell<u64>,
}

impl Runtime {
    /// Construct a runtime and install its maintenance tasks.
    pub fn new(
        config: RuntimeConfig,
        registries: Registries,
        transport: TransportEndpoints,
    ) -> Result<Rc<Self>, RuntimeConfigError> {
        config.validate()?;
        let scheduler = Rc::new(Scheduler::new(
            config.sched.clone(),
            drover_core::Clock::monotonic(),
        )?);
        Self::with_scheduler(config, registries, transport, scheduler)
    }

    /// Construct a runtime on a caller-supplied scheduler (and clock).
    pub fn with_scheduler(
        config: RuntimeConfig,
        registries: Registries,
        transport: TransportEndpoints,
        scheduler: Rc<Scheduler>,
    ) -> Result<Rc<Self>, RuntimeConfigError> {
        config.validate()?;
        let log = LogBuffer::new(config.log_capacity);
        let seed = config.seed;
        let runtime = Rc::new(Self {
            config,
            scheduler,
            log,
            registries,
            transport,
            entities: RefCell::new(IndexMap::new()),
            machines: RefCell::new(IndexMap::new()),
            machine_meta: RefCell::new(IndexMap::new()),
            pools: RefCell::new(IndexMap::new()),
            buses: RefCell::new(IndexMap::new()),
            command_handlers: RefCell::new(IndexMap::new()),
            request_handlers: RefCell::new(IndexMap::new()),
            console_commands: RefCell::new(IndexMap::new()),
            seed_provider: RefCell::new(None),
            dead_machines: Rc::new(RefCell::new(Vec::new())),
            deferred_updates: RefCell::new(IndexMap::new()),
            rng: RefCell::new(ChaCha8Rng::seed_from_u64(seed)),
            frame: Cell::new(0),
        });

        // Reaper: sweep terminal machines and removed host objects.
        let weak = Rc::downgrade(&runtime);
        let interval = f64::from(runtime.config.reaper_interval_frames)
            * runtime.config.frame_seconds;
        runtime
            .scheduler
            .schedule(
                TaskSpec::new("runtime:reaper", move || {
                    if let Some(rt) = weak.upgrade() {
                        rt.reap();
                    }
                    Ok(())
                })
                .every(interval),
            )
            .expect("reaper task spec is valid");

        // Server role answers entity snapshot requests out of the box.
        if runtime.config.role == Role::Server {
            let weak = Rc::downgrade(&runtime);
            runtime.register_request_handler(REQUEST_ENTITY_SNAPSHOT, move |_payload| {
                let rt = weak.upgrade().ok_or(TransportError::Closed)?;
                serde_json::to_value(rt.entity_seeds()).map_err(|e| TransportError::Rejected {
                    reason: e.to_string(),
                })
            });
        }

        Ok(runtime)
    }

    // ── Accessors ───────────────────────────────────────────────

    /// The runtime's role.
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// The runtime's configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The shared scheduler.
    pub fn scheduler(&self) -> &Rc<Scheduler> {
        &self.scheduler
    }

    /// The shared log buffer.
    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    /// The class registries.
    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    /// Frames stepped so far.
    pub fn frame(&self) -> u64 {
        self.frame.get()
    }

    // ── Frame driving ───────────────────────────────────────────

    /// Drive one scheduler step for a frame event.
    ///
    /// The default heartbeat event also advances the frame counter.
    pub fn step(&self, event: &str) -> StepReport {
        if event == EVENT_HEARTBEAT {
            self.frame.set(self.frame.get() + 1);
        }
        self.scheduler.step(event)
    }

    /// Drive one heartbeat frame.
    pub fn run_frame(&self) -> StepReport {
        self.step(EVENT_HEARTBEAT)
    }

    // ── Entities ────────────────────────────────────────────────

    /// Create (or return the existing) entity.
    ///
    /// Idempotent by id: creating twice with the same id returns the
    /// same instance. On the server role, commits replicate: each
    /// `state_updated` is filtered to replicate-flagged fields and, when
    /// non-empty, broadcast on the entity-update channel.
    pub fn create_entity(
        &self,
        params: CreateEntity,
    ) -> Result<Rc<RefCell<Entity>>, RegistryError> {
        if let Some(id) = &params.entity_id {
            if let Some(existing) = self.entities.borrow().get(id) {
                return Ok(existing.clone());
            }
        }
        let class = self.registries.entity_class(&params.entity_class)?;
        let entity_id = params
            .entity_id
            .unwrap_or_else(|| EntityId(self.scheduler.generate_key(&params.entity_class)));

        let entity = Entity::new(
            class,
            entity_id.clone(),
            params.instance,
            params.owner,
            self.log.clone(),
        );
        let entity = Rc::new(RefCell::new(entity));
        self.connect_replication(&entity_id, &entity);
        self.entities
            .borrow_mut()
            .insert(entity_id, entity.clone());
        Ok(entity)
    }

    fn connect_replication(&self, entity_id: &EntityId, entity: &Rc<RefCell<Entity>>) {
        if self.config.role != Role::Server {
            return;
        }
        let Some(broadcaster) = self.transport.broadcaster.clone() else {
            return;
        };
        // The handler fires while the entity is mutably borrowed by
        // commit(), so it captures the class (for the schema) instead of
        // the entity.
        let class: Rc<EntityClass> = entity.borrow().class().clone();
        let id = entity_id.clone();
        entity.borrow().state_updated.connect(move |changes: &Packet| {
            let packet: Packet = changes
                .iter()
                .filter(|(name, _)| {
                    class
                        .schema
                        .get(name)
                        .is_some_and(|def| def.replicate)
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !packet.is_empty() {
                broadcaster.broadcast(CHANNEL_ENTITY_UPDATE, &id, &packet);
            }
        });
    }

    /// Look up an entity by id.
    pub fn get_entity(&self, id: &EntityId) -> Option<Rc<RefCell<Entity>>> {
        self.entities.borrow().get(id).cloned()
    }

    /// All registered entity ids, in creation order.
    pub fn entities(&self) -> Vec<EntityId> {
        self.entities.borrow().keys().cloned().collect()
    }

    /// Destroy an entity and drop it from the registry.
    pub fn delete_entity(&self, id: &EntityId) -> bool {
        let Some(entity) = self.entities.borrow_mut().shift_remove(id) else {
            return false;
        };
        entity.borrow_mut().destroy();
        true
    }

    /// Destroy every entity.
    pub fn delete_all_entities(&self) {
        let all: Vec<EntityId> = self.entities();
        for id in all {
            self.delete_entity(&id);
        }
    }

    /// Seeds describing every live entity, for client reconstruction.
    pub fn entity_seeds(&self) -> Vec<EntitySeed> {
        self.entities
            .borrow()
            .values()
            .filter(|e| e.borrow().is_active())
            .map(|e| {
                let e = e.borrow();
                EntitySeed {
                    entity_class: e.class_name().to_string(),
                    entity_id: e.entity_id().clone(),
                    owner: e.owner().cloned(),
                    data: e.data().clone(),
                }
            })
            .collect()
    }

    // ── Pooling ─────────────────────────────────────────────────

    /// Deactivate an entity and park it on its class pool.
    ///
    /// The entity leaves the registry, drops its handlers and state, and
    /// waits for [`get_pooled_entity`](Self::get_pooled_entity).
    pub fn pool_entity(&self, id: &EntityId) -> bool {
        let Some(entity) = self.entities.borrow_mut().shift_remove(id) else {
            return false;
        };
        let class_name = entity.borrow().class_name().to_string();
        entity.borrow_mut().deactivate();
        self.pools
            .borrow_mut()
            .entry(class_name)
            .or_default()
            .push(entity);
        true
    }

    /// Pop a pooled entity of the class and rebind it, or create fresh.
    pub fn get_pooled_entity(
        &self,
        params: PoolParams,
    ) -> Result<Rc<RefCell<Entity>>, RegistryError> {
        let pooled = self
            .pools
            .borrow_mut()
            .get_mut(&params.entity_class)
            .and_then(Vec::pop);
        match pooled {
            Some(entity) => {
                let entity_id = params
                    .entity_id
                    .unwrap_or_else(|| EntityId(self.scheduler.generate_key(&params.entity_class)));
                entity
                    .borrow_mut()
                    .rebind(entity_id.clone(), params.instance, params.owner);
                // Handlers were cleared on deactivate.
                self.connect_replication(&entity_id, &entity);
                self.entities
                    .borrow_mut()
                    .insert(entity_id, entity.clone());
                Ok(entity)
            }
            None => self.create_entity(CreateEntity {
                entity_id: params.entity_id,
                entity_class: params.entity_class,
                instance: params.instance,
                owner: params.owner,
            }),
        }
    }

    /// Entities currently parked in the class pool.
    pub fn pool_depth(&self, entity_class: &str) -> usize {
        self.pools
            .borrow()
            .get(entity_class)
            .map_or(0, Vec::len)
    }

    // ── State machines ──────────────────────────────────────────

    /// Create (or return the existing) machine, start it, and register
    /// its recurring tick task.
    ///
    /// The tick period is the class priority's frame interval; a seeded
    /// per-instance offset staggers identical priorities across frames.
    /// Lifecycle signals route the machine into the reaper.
    pub fn create_state_machine(
        &self,
        params: CreateMachine,
    ) -> Result<Rc<RefCell<StateMachine>>, RegistryError> {
        if let Some(id) = &params.machine_id {
            if let Some(existing) = self.machines.borrow().get(id) {
                return Ok(existing.clone());
            }
        }
        let class = self.registries.machine_class(&params.machine_class)?;
        let machine_id = params
            .machine_id
            .unwrap_or_else(|| MachineId(self.scheduler.generate_key(&params.machine_class)));
        let context = params
            .context
            .unwrap_or_else(|| Rc::new(RefCell::new(ContextMap::new())));

        let mut machine = class.instantiate(
            machine_id.clone(),
            context,
            self.scheduler.clock(),
            self.log.clone(),
        );

        // Lifecycle signals hand the machine to the reaper; handlers
        // capture only the teardown queue.
        for signal in [&machine.completed, &machine.cancelled] {
            let dead = self.dead_machines.clone();
            let id = machine_id.clone();
            signal.connect(move |_| dead.borrow_mut().push(id.clone()));
        }
        {
            let dead = self.dead_machines.clone();
            let id = machine_id.clone();
            machine
                .failed
                .connect(move |_reason: &String| dead.borrow_mut().push(id.clone()));
        }

        machine
            .start(&params.initial_state, params.args)
            .map_err(|e| RegistryError::StartFailed {
                id: machine_id.0.clone(),
                reason: e.to_string(),
            })?;

        let machine = Rc::new(RefCell::new(machine));
        let task_name = format!("fsm:{machine_id}");
        self.machines
            .borrow_mut()
            .insert(machine_id.clone(), machine.clone());
        self.machine_meta.borrow_mut().insert(
            machine_id.clone(),
            MachineMeta {
                class_name: params.machine_class,
                initial_state: params.initial_state,
                task_name: task_name.clone(),
            },
        );

        let period = class.priority.period_secs(self.config.frame_seconds);
        let stagger = self
            .rng
            .borrow_mut()
            .gen_range(0.0..self.config.frame_seconds);
        let weak = Rc::downgrade(&machine);
        let clock = self.scheduler.clock();
        let last_tick = Cell::new(clock.now_us());
        self.scheduler
            .schedule(
                TaskSpec::new(task_name, move || {
                    let Some(machine) = weak.upgrade() else {
                        // Removed without deschedule; the reaper fixes
                        // the task, nothing to do here.
                        return Ok(());
                    };
                    let now = clock.now_us();
                    let dt = now.saturating_sub(last_tick.get()) as f64 / 1_000_000.0;
                    last_tick.set(now);
                    machine.borrow_mut().tick(dt);
                    Ok(())
                })
                .every(period)
                .starting_after(period + stagger),
            )
            .map_err(|e| RegistryError::StartFailed {
                id: machine_id.0.clone(),
                reason: e.to_string(),
            })?;

        Ok(machine)
    }

    /// Look up a machine by id.
    pub fn get_state_machine(&self, id: &MachineId) -> Option<Rc<RefCell<StateMachine>>> {
        self.machines.borrow().get(id).cloned()
    }

    /// All registered machine ids, in creation order.
    pub fn state_machines(&self) -> Vec<MachineId> {
        self.machines.borrow().keys().cloned().collect()
    }

    /// Cancel a machine and remove it immediately.
    pub fn cancel_state_machine(&self, id: &MachineId) -> bool {
        let Some(machine) = self.machines.borrow().get(id).cloned() else {
            return false;
        };
        machine.borrow_mut().cancel();
        self.remove_machine(id);
        true
    }

    /// Cancel every machine.
    pub fn cancel_all(&self) {
        let all = self.state_machines();
        for id in all {
            self.cancel_state_machine(&id);
        }
    }

    /// Destroy and recreate a machine, preserving its shared context and
    /// restarting at its original initial state.
    pub fn retry_state_machine(
        &self,
        id: &MachineId,
    ) -> Result<Rc<RefCell<StateMachine>>, RegistryError> {
        let machine = self
            .machines
            .borrow()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownId { id: id.0.clone() })?;
        let (class_name, initial_state) = {
            let meta = self.machine_meta.borrow();
            let meta = meta
                .get(id)
                .ok_or_else(|| RegistryError::UnknownId { id: id.0.clone() })?;
            (meta.class_name.clone(), meta.initial_state.clone())
        };
        let context = machine.borrow().context();
        machine.borrow_mut().cancel();
        self.remove_machine(id);

        self.create_state_machine(CreateMachine {
            machine_id: Some(id.clone()),
            machine_class: class_name,
            context: Some(context),
            initial_state,
            args: Args::new(),
        })
    }

    fn remove_machine(&self, id: &MachineId) {
        if let Some(machine) = self.machines.borrow_mut().shift_remove(id) {
            machine.borrow_mut().destroy();
        }
        if let Some(meta) = self.machine_meta.borrow_mut().shift_remove(id) {
            self.scheduler.deschedule(&meta.task_name);
        }
        // A lifecycle signal may already have queued this id; a machine
        // recreated under the same name must not be reaped for it.
        self.dead_machines.borrow_mut().retain(|d| d != id);
    }

    /// Reaper sweep: collect terminal machines and entities whose host
    /// object is gone. Runs on a recurring background task; callable
    /// directly in tests.
    pub fn reap(&self) {
        let dead: Vec<MachineId> = {
            let mut queue = self.dead_machines.borrow_mut();
            queue.drain(..).collect()
        };
        for id in dead {
            self.remove_machine(&id);
        }

        let gone: Vec<EntityId> = self
            .entities
            .borrow()
            .iter()
            .filter(|(_, e)| {
                let e = e.borrow();
                !e.is_alive() || e.instance().is_removed()
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in gone {
            self.delete_entity(&id);
        }
    }

    // ── Replication (client side) ───────────────────────────────

    /// Apply an inbound entity-update packet.
    ///
    /// A known entity gets the packet written into committed data
    /// (bypassing schema validation — the server is authoritative) and
    /// applied to its host object. For an unknown entity the packet is
    /// parked and an entity snapshot is requested.
    pub fn apply_entity_update(&self, id: &EntityId, packet: &Packet) {
        let entity = self.get_entity(id);
        match entity {
            Some(entity) => {
                let packet = if self.config.validate_inbound {
                    self.validated_packet(&entity, packet)
                } else {
                    packet.clone()
                };
                entity.borrow_mut().apply_replica(&packet);
            }
            None => {
                self.log.debug(
                    Some(id.as_str()),
                    "update for unknown entity; deferring and requesting snapshot",
                );
                self.deferred_updates
                    .borrow_mut()
                    .entry(id.clone())
                    .or_default()
                    .push(packet.clone());
                if let Err(e) = self.sync_entities() {
                    self.log
                        .warn(Some(id.as_str()), format!("snapshot request failed: {e}"));
                }
            }
        }
    }

    fn validated_packet(&self, entity: &Rc<RefCell<Entity>>, packet: &Packet) -> Packet {
        let entity = entity.borrow();
        let schema = entity.schema();
        let mut out = Packet::new();
        for (name, value) in packet {
            match schema.check(name, value, None) {
                Ok(()) => {
                    out.insert(name.clone(), value.clone());
                }
                Err(violation) => self.log.warn(
                    Some(entity.entity_id().as_str()),
                    format!("dropped inbound field: {violation}"),
                ),
            }
        }
        out
    }

    /// Install the provider that conjures host objects for seeded
    /// entities (client role).
    pub fn set_seed_provider(
        &self,
        provider: impl Fn(&EntitySeed) -> Option<Rc<dyn Instance>> + 'static,
    ) {
        *self.seed_provider.borrow_mut() = Some(Box::new(provider));
    }

    /// Request the server's entity snapshot and seed local entities.
    ///
    /// Returns the number of entities seeded. Requires a responder
    /// transport and a seed provider.
    pub fn sync_entities(&self) -> Result<usize, TransportError> {
        let Some(responder) = self.transport.requests.clone() else {
            return Err(TransportError::Closed);
        };
        let reply = responder.request(REQUEST_ENTITY_SNAPSHOT, serde_json::Value::Null)?;
        let seeds: Vec<EntitySeed> =
            serde_json::from_value(reply).map_err(|e| TransportError::Rejected {
                reason: e.to_string(),
            })?;

        let mut seeded = 0;
        for seed in seeds {
            if self.get_entity(&seed.entity_id).is_some() {
                continue;
            }
            let instance = {
                let provider = self.seed_provider.borrow();
                provider.as_ref().and_then(|p| p(&seed))
            };
            let Some(instance) = instance else {
                self.log.warn(
                    Some(seed.entity_id.as_str()),
                    "no seed provider instance; skipping entity",
                );
                continue;
            };
            let entity = self.create_entity(CreateEntity {
                entity_id: Some(seed.entity_id.clone()),
                entity_class: seed.entity_class.clone(),
                instance,
                owner: seed.owner.clone(),
            });
            let Ok(entity) = entity else {
                self.log.warn(
                    Some(seed.entity_id.as_str()),
                    "seeding failed: unknown entity class",
                );
                continue;
            };
            entity.borrow_mut().apply_replica(&seed.data);
            seeded += 1;

            // Deliver packets that arrived before the seed.
            let parked = self
                .deferred_updates
                .borrow_mut()
                .shift_remove(&seed.entity_id);
            if let Some(parked) = parked {
                for packet in parked {
                    entity.borrow_mut().apply_replica(&packet);
                }
            }
        }
        Ok(seeded)
    }

    // ── Commands ────────────────────────────────────────────────

    /// Send a command upstream (client role). A server-role call is a
    /// logged no-op; the server mutates entities directly.
    pub fn send_command(&self, entity_id: &EntityId, command: &str, args: &Args) {
        if self.config.role == Role::Server {
            self.log.debug(
                Some(entity_id.as_str()),
                format!("send_command('{command}') ignored on the server role"),
            );
            return;
        }
        match &self.transport.commands {
            Some(sink) => sink.send_command(entity_id, command, args),
            None => self.log.warn(
                Some(entity_id.as_str()),
                format!("no command transport for '{command}'"),
            ),
        }
    }

    /// Register a server-side handler for one entity's command.
    pub fn register_command_handler(
        &self,
        entity_id: &EntityId,
        command: &str,
        handler: impl Fn(&Rc<RefCell<Entity>>, &Args) -> Result<(), String> + 'static,
    ) {
        self.command_handlers.borrow_mut().insert(
            (entity_id.0.clone(), command.to_string()),
            Rc::new(handler),
        );
    }

    /// Dispatch an inbound command to its registered handler.
    ///
    /// Handler failures are logged, never fatal. No registry borrow is
    /// held while the handler runs, so handlers may call back into the
    /// runtime freely.
    pub fn dispatch_command(&self, entity_id: &EntityId, command: &str, args: &Args) {
        let Some(entity) = self.get_entity(entity_id) else {
            self.log.warn(
                Some(entity_id.as_str()),
                format!("command '{command}' for unknown entity"),
            );
            return;
        };
        let key = (entity_id.0.clone(), command.to_string());
        let handler = self.command_handlers.borrow().get(&key).cloned();
        let Some(handler) = handler else {
            self.log.warn(
                Some(entity_id.as_str()),
                format!("no handler for command '{command}'"),
            );
            return;
        };
        if let Err(reason) = handler(&entity, args) {
            self.log.warn(
                Some(entity_id.as_str()),
                format!("command '{command}' failed: {reason}"),
            );
        }
    }

    // ── Requests ────────────────────────────────────────────────

    /// Register a named request handler (server side).
    pub fn register_request_handler(
        &self,
        name: &str,
        handler: impl Fn(serde_json::Value) -> Result<serde_json::Value, TransportError> + 'static,
    ) {
        self.request_handlers
            .borrow_mut()
            .insert(name.to_string(), Rc::new(handler));
    }

    /// Dispatch an inbound request to its registered handler.
    ///
    /// No registry borrow is held while the handler runs.
    pub fn handle_request(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let handler = self.request_handlers.borrow().get(name).cloned();
        let Some(handler) = handler else {
            return Err(TransportError::Rejected {
                reason: format!("no handler for request '{name}'"),
            });
        };
        handler(payload)
    }

    /// Issue a named request through the responder transport (client).
    ///
    /// Timeouts map to `Ok(None)` — the request is absent, not broken.
    pub fn request(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, TransportError> {
        let Some(responder) = self.transport.requests.clone() else {
            return Err(TransportError::Closed);
        };
        match responder.request(name, payload) {
            Ok(value) => Ok(Some(value)),
            Err(TransportError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ── Event buses ─────────────────────────────────────────────

    /// Get or create a named event bus.
    pub fn register_event_bus(&self, name: &str) -> Signal<Value> {
        self.buses
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Look up an existing event bus.
    pub fn get_event_bus(&self, name: &str) -> Option<Signal<Value>> {
        self.buses.borrow().get(name).cloned()
    }

    /// Fire a value on a named bus, creating the bus if needed.
    pub fn fire_event_bus(&self, name: &str, value: Value) {
        self.register_event_bus(name).fire(value);
    }

    /// Wait for the next fire on a bus, with an optional timeout.
    ///
    /// Cooperative: the callback runs from the bus fire, or from a
    /// scheduled timeout task with `None`. Exactly one of the two
    /// happens.
    pub fn await_event_bus(
        &self,
        name: &str,
        timeout: Option<f64>,
        callback: impl FnOnce(Option<Value>) + 'static,
    ) {
        let bus = self.register_event_bus(name);
        let slot: Rc<RefCell<Option<Box<dyn FnOnce(Option<Value>)>>>> =
            Rc::new(RefCell::new(Some(Box::new(callback))));

        let timeout_task = timeout.map(|_| self.scheduler.generate_key("bus_wait"));
        let connection = {
            let slot = slot.clone();
            let scheduler = self.scheduler.clone();
            let timeout_task = timeout_task.clone();
            bus.once(move |value: &Value| {
                if let Some(callback) = slot.borrow_mut().take() {
                    callback(Some(value.clone()));
                }
                if let Some(task) = &timeout_task {
                    scheduler.deschedule(task);
                }
            })
        };

        if let (Some(secs), Some(task)) = (timeout, timeout_task) {
            let result = self.scheduler.schedule(
                TaskSpec::new(task, move || {
                    if let Some(callback) = slot.borrow_mut().take() {
                        callback(None);
                    }
                    connection.disconnect();
                    Ok(())
                })
                .after(secs),
            );
            if let Err(e) = result {
                self.log
                    .warn(None, format!("await_event_bus timeout task: {e}"));
            }
        }
    }

    // ── Store maintenance ───────────────────────────────────────

    /// Install a recurring background task flushing the adapter's
    /// throttled writes.
    pub fn install_store_flush(&self, adapter: Rc<StoreAdapter>, interval_secs: f64) {
        let clock = self.scheduler.clock();
        let log = self.log.clone();
        let result = self.scheduler.schedule(
            TaskSpec::new("runtime:store_flush", move || {
                let report = adapter.flush_due(clock.now_us());
                if report.dropped > 0 {
                    log.error(
                        None,
                        format!("{} store writes dropped after retries", report.dropped),
                    );
                    return Err(TaskFailure::new("store writes dropped"));
                }
                Ok(())
            })
            .every(interval_secs),
        );
        if let Err(e) = result {
            self.log.warn(None, format!("store flush task: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_backends::LoopbackHub;
    use drover_core::{Clock, ManualClock, PropertyDef, Schema, TypeTag};
    use drover_entity::EntityClass;
    use drover_fsm::{MachineClass, Priority, State, StateCtx, StateDef, StateFault};
    use drover_sched::SchedConfig;
    use drover_test_utils::TestInstance;

    const FRAME: f64 = 1.0 / 60.0;

    fn door_class() -> Rc<EntityClass> {
        let schema = Schema::new()
            .with("IsOpen", PropertyDef::new(TypeTag::Bool).replicated())
            .with("Secret", PropertyDef::new(TypeTag::Number));
        EntityClass::new("Door", schema).with_attribute_apply().build()
    }

    struct Noop;
    impl State for Noop {}

    struct CountTicks;
    impl State for CountTicks {
        fn on_heartbeat(&mut self, ctx: &mut StateCtx, _dt: f64) -> Result<(), StateFault> {
            let n = ctx.get("ticks").and_then(|v| v.as_number()).unwrap_or(0.0);
            ctx.set("ticks", Value::Number(n + 1.0));
            Ok(())
        }
    }

    fn brain_class() -> Rc<MachineClass> {
        MachineClass::builder("Brain")
            .terminal_states(["Done"])
            .priority(Priority::Render)
            .register(|m| {
                m.add_state("Idle", StateDef::object(Noop)).unwrap();
                m.add_state("Count", StateDef::object(CountTicks)).unwrap();
            })
            .build()
    }

    fn registries() -> Registries {
        let mut reg = Registries::new();
        reg.add_entity_class(door_class());
        reg.add_machine_class(brain_class());
        reg
    }

    fn server(transport: TransportEndpoints) -> (Rc<Runtime>, ManualClock) {
        let (clock, driver) = Clock::manual();
        let scheduler = Rc::new(Scheduler::new(SchedConfig::default(), clock).unwrap());
        let rt = Runtime::with_scheduler(
            RuntimeConfig::server(),
            registries(),
            transport,
            scheduler,
        )
        .unwrap();
        (rt, driver)
    }

    fn drive(rt: &Runtime, driver: &ManualClock, frames: u32) {
        for _ in 0..frames {
            driver.advance_secs(FRAME);
            rt.run_frame();
        }
    }

    fn door_params(id: Option<&str>) -> CreateEntity {
        CreateEntity {
            entity_id: id.map(EntityId::from),
            entity_class: "Door".into(),
            instance: TestInstance::new("Door"),
            owner: None,
        }
    }

    #[test]
    fn entity_creation_is_idempotent_by_id() {
        let (rt, _driver) = server(TransportEndpoints::none());
        let a = rt.create_entity(door_params(Some("door_1"))).unwrap();
        let b = rt.create_entity(door_params(Some("door_1"))).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(rt.entities().len(), 1);
    }

    #[test]
    fn generated_ids_are_unique() {
        let (rt, _driver) = server(TransportEndpoints::none());
        let a = rt.create_entity(door_params(None)).unwrap();
        let b = rt.create_entity(door_params(None)).unwrap();
        assert_ne!(a.borrow().entity_id(), b.borrow().entity_id());
    }

    #[test]
    fn unknown_class_fails_creation() {
        let (rt, _driver) = server(TransportEndpoints::none());
        let result = rt.create_entity(CreateEntity {
            entity_id: None,
            entity_class: "Ghost".into(),
            instance: TestInstance::new("Ghost"),
            owner: None,
        });
        match result {
            Err(RegistryError::UnknownClass { kind, .. }) => assert_eq!(kind, "entity"),
            other => panic!("expected UnknownClass, got {other:?}"),
        }
    }

    #[test]
    fn commits_broadcast_only_replicated_fields() {
        let hub = LoopbackHub::shared();
        let transport = TransportEndpoints {
            broadcaster: Some(hub.clone()),
            ..TransportEndpoints::none()
        };
        let (rt, _driver) = server(transport);
        let entity = rt.create_entity(door_params(Some("door_1"))).unwrap();

        {
            let mut e = entity.borrow_mut();
            e.set("IsOpen", Value::Bool(true)).unwrap();
            e.set("Secret", Value::Number(7.0)).unwrap();
            e.commit(None).unwrap();
        }

        let broadcasts = hub.drain_broadcasts();
        assert_eq!(broadcasts.len(), 1);
        let b = &broadcasts[0];
        assert_eq!(b.channel, CHANNEL_ENTITY_UPDATE);
        assert_eq!(b.entity_id.as_str(), "door_1");
        assert_eq!(b.packet.len(), 1);
        assert_eq!(b.packet.get("IsOpen"), Some(&Value::Bool(true)));
        // Data still carries both fields.
        assert_eq!(
            entity.borrow().data().get("Secret"),
            Some(&Value::Number(7.0))
        );
    }

    #[test]
    fn commit_of_unreplicated_fields_broadcasts_nothing() {
        let hub = LoopbackHub::shared();
        let transport = TransportEndpoints {
            broadcaster: Some(hub.clone()),
            ..TransportEndpoints::none()
        };
        let (rt, _driver) = server(transport);
        let entity = rt.create_entity(door_params(Some("door_1"))).unwrap();
        entity
            .borrow_mut()
            .set("Secret", Value::Number(1.0))
            .unwrap();
        entity.borrow_mut().commit(None).unwrap();
        assert_eq!(hub.broadcast_depth(), 0);
    }

    #[test]
    fn machines_tick_at_their_priority() {
        let (rt, driver) = server(TransportEndpoints::none());
        let machine = rt
            .create_state_machine(CreateMachine {
                machine_id: Some(MachineId::from("brain_1")),
                machine_class: "Brain".into(),
                context: None,
                initial_state: "Count".into(),
                args: Args::new(),
            })
            .unwrap();

        drive(&rt, &driver, 10);
        let ticks = machine
            .borrow()
            .context_get("ticks")
            .and_then(|v| v.as_number())
            .unwrap_or(0.0);
        // Render priority ticks every frame after its stagger settles.
        assert!(ticks >= 7.0, "expected >= 7 ticks, got {ticks}");
    }

    #[test]
    fn machine_creation_is_idempotent_by_id() {
        let (rt, _driver) = server(TransportEndpoints::none());
        let make = |rt: &Runtime| {
            rt.create_state_machine(CreateMachine {
                machine_id: Some(MachineId::from("brain_1")),
                machine_class: "Brain".into(),
                context: None,
                initial_state: "Idle".into(),
                args: Args::new(),
            })
            .unwrap()
        };
        let a = make(&rt);
        let b = make(&rt);
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn finished_machine_is_reaped_from_registry() {
        let (rt, driver) = server(TransportEndpoints::none());
        let id = MachineId::from("brain_1");
        let machine = rt
            .create_state_machine(CreateMachine {
                machine_id: Some(id.clone()),
                machine_class: "Brain".into(),
                context: None,
                initial_state: "Idle".into(),
                args: Args::new(),
            })
            .unwrap();

        machine
            .borrow_mut()
            .change_state("Done", Args::new())
            .unwrap();
        assert!(rt.get_state_machine(&id).is_some(), "reap is deferred");

        drive(&rt, &driver, 40); // past the 30-frame reaper interval
        assert!(rt.get_state_machine(&id).is_none());
        assert!(
            !rt.scheduler().contains("fsm:brain_1"),
            "tick task must be descheduled"
        );
    }

    #[test]
    fn cancel_state_machine_removes_immediately() {
        let (rt, _driver) = server(TransportEndpoints::none());
        let id = MachineId::from("brain_1");
        rt.create_state_machine(CreateMachine {
            machine_id: Some(id.clone()),
            machine_class: "Brain".into(),
            context: None,
            initial_state: "Idle".into(),
            args: Args::new(),
        })
        .unwrap();

        assert!(rt.cancel_state_machine(&id));
        assert!(rt.get_state_machine(&id).is_none());
        assert!(!rt.cancel_state_machine(&id));
    }

    #[test]
    fn retry_preserves_shared_context() {
        let (rt, _driver) = server(TransportEndpoints::none());
        let id = MachineId::from("brain_1");
        let machine = rt
            .create_state_machine(CreateMachine {
                machine_id: Some(id.clone()),
                machine_class: "Brain".into(),
                context: None,
                initial_state: "Idle".into(),
                args: Args::new(),
            })
            .unwrap();
        machine
            .borrow()
            .context_set("progress", Value::Number(0.4));

        let retried = rt.retry_state_machine(&id).unwrap();
        assert!(!Rc::ptr_eq(&machine, &retried), "retry recreates");
        assert_eq!(
            retried.borrow().context_get("progress"),
            Some(Value::Number(0.4))
        );
        assert_eq!(retried.borrow().state(), Some("Idle"));
    }

    #[test]
    fn removed_instances_are_reaped() {
        let (rt, driver) = server(TransportEndpoints::none());
        let instance = TestInstance::new("Door");
        let id = EntityId::from("door_1");
        rt.create_entity(CreateEntity {
            entity_id: Some(id.clone()),
            entity_class: "Door".into(),
            instance: instance.clone(),
            owner: None,
        })
        .unwrap();

        instance.set_removed();
        drive(&rt, &driver, 40);
        assert!(rt.get_entity(&id).is_none());
    }

    #[test]
    fn pooling_reuses_the_entity_shell() {
        let (rt, _driver) = server(TransportEndpoints::none());
        let id = EntityId::from("door_1");
        let original = rt.create_entity(door_params(Some("door_1"))).unwrap();
        original
            .borrow_mut()
            .set("IsOpen", Value::Bool(true))
            .unwrap();
        original.borrow_mut().commit(None).unwrap();

        assert!(rt.pool_entity(&id));
        assert!(rt.get_entity(&id).is_none());
        assert_eq!(rt.pool_depth("Door"), 1);

        let reused = rt
            .get_pooled_entity(PoolParams {
                entity_class: "Door".into(),
                entity_id: Some(EntityId::from("door_2")),
                instance: TestInstance::new("Door"),
                owner: None,
            })
            .unwrap();
        assert!(Rc::ptr_eq(&original, &reused));
        assert_eq!(rt.pool_depth("Door"), 0);
        let reused = reused.borrow();
        assert!(reused.is_active());
        assert_eq!(reused.entity_id().as_str(), "door_2");
        assert!(reused.data().is_empty(), "pooled state must not leak");
    }

    #[test]
    fn empty_pool_falls_back_to_create() {
        let (rt, _driver) = server(TransportEndpoints::none());
        let fresh = rt
            .get_pooled_entity(PoolParams {
                entity_class: "Door".into(),
                entity_id: Some(EntityId::from("door_9")),
                instance: TestInstance::new("Door"),
                owner: None,
            })
            .unwrap();
        assert_eq!(fresh.borrow().entity_id().as_str(), "door_9");
        assert!(rt.get_entity(&EntityId::from("door_9")).is_some());
    }

    #[test]
    fn command_dispatch_routes_and_traps_failures() {
        let (rt, _driver) = server(TransportEndpoints::none());
        let id = EntityId::from("door_1");
        rt.create_entity(door_params(Some("door_1"))).unwrap();

        rt.register_command_handler(&id, "open", |entity, _args| {
            entity
                .borrow_mut()
                .set("IsOpen", Value::Bool(true))
                .map_err(|e| e.to_string())?;
            entity.borrow_mut().commit(None).map_err(|e| e.to_string())?;
            Ok(())
        });
        rt.register_command_handler(&id, "explode", |_entity, _args| {
            Err("not today".into())
        });

        rt.dispatch_command(&id, "open", &Args::new());
        let entity = rt.get_entity(&id).unwrap();
        assert_eq!(entity.borrow().data().get("IsOpen"), Some(&Value::Bool(true)));

        // A failing handler must not panic or poison the runtime.
        rt.dispatch_command(&id, "explode", &Args::new());
        rt.dispatch_command(&id, "missing", &Args::new());
        rt.dispatch_command(&EntityId::from("ghost"), "open", &Args::new());
    }

    #[test]
    fn server_role_ignores_send_command() {
        let hub = LoopbackHub::shared();
        let transport = TransportEndpoints {
            commands: Some(hub.clone()),
            ..TransportEndpoints::none()
        };
        let (rt, _driver) = server(transport);
        rt.send_command(&EntityId::from("door_1"), "open", &Args::new());
        assert!(hub.drain_commands().is_empty());
    }

    #[test]
    fn event_bus_await_fires_once() {
        let (rt, _driver) = server(TransportEndpoints::none());
        let got: Rc<RefCell<Vec<Option<Value>>>> = Rc::new(RefCell::new(Vec::new()));
        let got2 = got.clone();
        rt.await_event_bus("alarm", None, move |v| got2.borrow_mut().push(v));

        rt.fire_event_bus("alarm", Value::Text("north gate".into()));
        rt.fire_event_bus("alarm", Value::Text("south gate".into()));
        assert_eq!(
            *got.borrow(),
            vec![Some(Value::Text("north gate".into()))]
        );
    }

    #[test]
    fn event_bus_await_times_out_with_none() {
        let (rt, driver) = server(TransportEndpoints::none());
        let got: Rc<RefCell<Vec<Option<Value>>>> = Rc::new(RefCell::new(Vec::new()));
        let got2 = got.clone();
        rt.await_event_bus("alarm", Some(1.0), move |v| got2.borrow_mut().push(v));

        driver.advance_secs(1.5);
        rt.run_frame();
        assert_eq!(*got.borrow(), vec![None]);

        // A late fire must not double-deliver.
        rt.fire_event_bus("alarm", Value::Bool(true));
        assert_eq!(got.borrow().len(), 1);
    }

    #[test]
    fn event_bus_fire_before_timeout_cancels_timer() {
        let (rt, driver) = server(TransportEndpoints::none());
        let got: Rc<RefCell<Vec<Option<Value>>>> = Rc::new(RefCell::new(Vec::new()));
        let got2 = got.clone();
        rt.await_event_bus("alarm", Some(1.0), move |v| got2.borrow_mut().push(v));

        rt.fire_event_bus("alarm", Value::Number(1.0));
        driver.advance_secs(2.0);
        rt.run_frame();
        assert_eq!(*got.borrow(), vec![Some(Value::Number(1.0))]);
    }

    #[test]
    fn client_applies_known_updates_and_defers_unknown() {
        let (clock, _driver) = Clock::manual();
        let scheduler = Rc::new(Scheduler::new(SchedConfig::default(), clock).unwrap());
        let client = Runtime::with_scheduler(
            RuntimeConfig::client(),
            registries(),
            TransportEndpoints::none(),
            scheduler,
        )
        .unwrap();

        let instance = TestInstance::new("Door");
        let id = EntityId::from("door_1");
        client
            .create_entity(CreateEntity {
                entity_id: Some(id.clone()),
                entity_class: "Door".into(),
                instance: instance.clone(),
                owner: None,
            })
            .unwrap();

        let mut packet = Packet::new();
        packet.insert("IsOpen".into(), Value::Bool(true));
        client.apply_entity_update(&id, &packet);

        let entity = client.get_entity(&id).unwrap();
        assert_eq!(entity.borrow().data().get("IsOpen"), Some(&Value::Bool(true)));
        assert_eq!(instance.read("IsOpen"), Some(Value::Bool(true)));

        // Unknown entity: parked, no panic (no transport to sync with).
        client.apply_entity_update(&EntityId::from("door_2"), &packet);
    }

    #[test]
    fn inbound_validation_drops_bad_fields_when_enabled() {
        let (clock, _driver) = Clock::manual();
        let scheduler = Rc::new(Scheduler::new(SchedConfig::default(), clock).unwrap());
        let mut config = RuntimeConfig::client();
        config.validate_inbound = true;
        let client = Runtime::with_scheduler(
            config,
            registries(),
            TransportEndpoints::none(),
            scheduler,
        )
        .unwrap();

        let id = EntityId::from("door_1");
        client
            .create_entity(CreateEntity {
                entity_id: Some(id.clone()),
                entity_class: "Door".into(),
                instance: TestInstance::new("Door"),
                owner: None,
            })
            .unwrap();

        let mut packet = Packet::new();
        packet.insert("IsOpen".into(), Value::Number(9.0)); // wrong type
        packet.insert("Secret".into(), Value::Number(9.0)); // fine
        client.apply_entity_update(&id, &packet);

        let entity = client.get_entity(&id).unwrap();
        assert_eq!(entity.borrow().data().get("IsOpen"), None);
        assert_eq!(entity.borrow().data().get("Secret"), Some(&Value::Number(9.0)));
    }
}
