//! The entity proxy: staged writes, transactional commit, locking.

use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use drover_core::schema::InstanceResolver;
use drover_core::{
    CommitError, Disposable, EntityId, Instance, LogBuffer, OwnerId, Packet, Schema,
    SchemaViolation, Signal, Value,
};

use crate::class::EntityClass;

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// An exclusive mutation claim on an entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lock {
    /// The claiming owner.
    pub owner: OwnerId,
    /// Unix microseconds at acquisition.
    pub acquired_at: u64,
}

/// Serializable view of an entity for snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityView {
    /// Entity id.
    pub entity_id: EntityId,
    /// Class name.
    pub class_name: String,
    /// Owner, if any.
    pub owner: Option<OwnerId>,
    /// Current lock holder, if any.
    pub locked_by: Option<OwnerId>,
    /// Whether the entity is alive.
    pub alive: bool,
    /// Committed data.
    pub data: Packet,
}

/// A schema-validated proxy over one bound host object.
///
/// See the [crate docs](crate) for the staging/commit model.
pub struct Entity {
    entity_id: EntityId,
    class: Rc<EntityClass>,
    /// Per-entity schema; starts as the class schema and may be replaced
    /// via [`define_schema`](Self::define_schema).
    schema: Schema,
    instance: Rc<dyn Instance>,
    owner: Option<OwnerId>,
    data: Packet,
    pending: Packet,
    context: Packet,
    lock: Option<Lock>,
    managed: Vec<Disposable>,
    alive: bool,
    /// False while parked in an entity pool.
    active: bool,
    resolver: Option<Rc<dyn InstanceResolver>>,
    /// Fires once per successful commit with the exact change snapshot.
    pub state_updated: Signal<Packet>,
    /// Fires exactly once on destruction.
    pub destroyed: Signal<EntityId>,
    log: LogBuffer,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("entity_id", &self.entity_id)
            .field("owner", &self.owner)
            .field("alive", &self.alive)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl Entity {
    /// Bind a new entity of `class` to a host object.
    pub fn new(
        class: Rc<EntityClass>,
        entity_id: EntityId,
        instance: Rc<dyn Instance>,
        owner: Option<OwnerId>,
        log: LogBuffer,
    ) -> Self {
        let schema = class.schema.clone();
        Self {
            entity_id,
            class,
            schema,
            instance,
            owner,
            data: Packet::new(),
            pending: Packet::new(),
            context: Packet::new(),
            lock: None,
            managed: Vec::new(),
            alive: true,
            active: true,
            resolver: None,
            state_updated: Signal::new(),
            destroyed: Signal::new(),
            log,
        }
    }

    // ── Accessors ───────────────────────────────────────────────

    /// The entity's id.
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// The entity's class name.
    pub fn class_name(&self) -> &str {
        &self.class.name
    }

    /// The entity's class.
    pub fn class(&self) -> &Rc<EntityClass> {
        &self.class
    }

    /// The bound host object.
    pub fn instance(&self) -> &Rc<dyn Instance> {
        &self.instance
    }

    /// The entity's owner, if any.
    pub fn owner(&self) -> Option<&OwnerId> {
        self.owner.as_ref()
    }

    /// Whether the entity has not been destroyed.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Whether the entity is live and not parked in a pool.
    pub fn is_active(&self) -> bool {
        self.alive && self.active
    }

    /// The active schema (the spec's `valid_properties`).
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Committed data snapshot.
    pub fn data(&self) -> &Packet {
        &self.data
    }

    /// Staged (uncommitted) writes.
    pub fn pending(&self) -> &Packet {
        &self.pending
    }

    /// Replace the schema. Advanced use; staged writes validated under
    /// the old schema remain staged.
    pub fn define_schema(&mut self, schema: Schema) {
        self.schema = schema;
    }

    /// Install a hierarchy-aware `is_a` resolver for object-typed writes.
    pub fn set_resolver(&mut self, resolver: Rc<dyn InstanceResolver>) {
        self.resolver = Some(resolver);
    }

    /// Serializable view for snapshots.
    pub fn view(&self) -> EntityView {
        EntityView {
            entity_id: self.entity_id.clone(),
            class_name: self.class.name.clone(),
            owner: self.owner.clone(),
            locked_by: self.lock.as_ref().map(|l| l.owner.clone()),
            alive: self.alive,
            data: self.data.clone(),
        }
    }

    // ── Field access ────────────────────────────────────────────

    /// Read a field, resolving Pending → Data → Context → the bound
    /// object's attribute (schema-defined names only).
    ///
    /// A destroyed entity reads as absent.
    pub fn get(&self, name: &str) -> Option<Value> {
        if !self.is_active() {
            return None;
        }
        if let Some(v) = self.pending.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.data.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.context.get(name) {
            return Some(v.clone());
        }
        if self.schema.contains(name) {
            return self.instance.attribute(name);
        }
        None
    }

    /// Validate and stage a field write into the pending set.
    ///
    /// Rejected writes leave the pending set untouched and are logged.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), SchemaViolation> {
        if !self.is_active() {
            self.log.warn(
                Some(self.entity_id.as_str()),
                format!("write to '{name}' on a destroyed entity"),
            );
            return Err(SchemaViolation::EntityDestroyed);
        }
        if let Err(violation) = self
            .schema
            .check(name, &value, self.resolver.as_deref())
        {
            self.log.warn(
                Some(self.entity_id.as_str()),
                format!("rejected write: {violation}"),
            );
            return Err(violation);
        }
        self.pending.insert(name.to_string(), value);
        Ok(())
    }

    /// Stage a write of a host object reference, using the object's own
    /// `is_a` for the class check.
    pub fn set_instance(
        &mut self,
        name: &str,
        object: &dyn Instance,
    ) -> Result<(), SchemaViolation> {
        struct DirectResolver<'a>(&'a dyn Instance);
        impl InstanceResolver for DirectResolver<'_> {
            fn is_a(&self, id: drover_core::InstanceId, class: &str) -> bool {
                self.0.instance_id() == id && self.0.is_a(class)
            }
        }

        if !self.is_active() {
            return Err(SchemaViolation::EntityDestroyed);
        }
        let value = Value::Object(object.object_ref());
        let resolver = DirectResolver(object);
        if let Err(violation) = self.schema.check(name, &value, Some(&resolver)) {
            self.log.warn(
                Some(self.entity_id.as_str()),
                format!("rejected write: {violation}"),
            );
            return Err(violation);
        }
        self.pending.insert(name.to_string(), value);
        Ok(())
    }

    /// Write a context slot. Context is never validated, replicated, or
    /// persisted.
    pub fn set_context(&mut self, key: impl Into<String>, value: Value) {
        if !self.alive {
            return;
        }
        self.context.insert(key.into(), value);
    }

    /// Read a context slot.
    pub fn context_get(&self, key: &str) -> Option<Value> {
        self.context.get(key).cloned()
    }

    // ── Commit ──────────────────────────────────────────────────

    /// Commit the pending set.
    ///
    /// On success the exact pending snapshot is applied to the host
    /// object, merged into committed data, cleared, and fired once on
    /// `state_updated`; the snapshot is returned. On any failure the
    /// pending set is left intact and nothing fires.
    pub fn commit(&mut self, caller: Option<&OwnerId>) -> Result<Packet, CommitError> {
        let op = self.entity_id.0.clone();
        if !self.is_active() {
            self.log.warn(Some(&op), "commit on a destroyed or pooled entity");
            return Err(CommitError::Destroyed);
        }
        if self.instance.is_removed() {
            // The bound object vanished under us; the entity follows it.
            self.log
                .warn(Some(&op), "bound object removed; destroying entity");
            self.destroy();
            return Err(CommitError::Destroyed);
        }
        if self.pending.is_empty() {
            return Err(CommitError::NothingStaged);
        }
        let Some(apply) = self.class.apply.clone() else {
            self.log
                .warn(Some(&op), "commit on an entity class with no apply function");
            return Err(CommitError::NoApplier);
        };
        if let Some(lock) = &self.lock {
            if caller != Some(&lock.owner) {
                self.log.warn(
                    Some(&op),
                    format!("commit rejected; locked by '{}'", lock.owner),
                );
                return Err(CommitError::LockHeld {
                    owner: lock.owner.0.clone(),
                });
            }
        }

        let changes = self.pending.clone();
        if let Err(e) = apply(self.instance.as_ref(), &changes) {
            self.log.warn(Some(&op), format!("apply failed: {e}"));
            return Err(CommitError::ApplyFailed { reason: e.reason });
        }

        for (k, v) in &changes {
            self.data.insert(k.clone(), v.clone());
        }
        self.pending.clear();
        self.state_updated.fire(changes.clone());
        Ok(changes)
    }

    // ── Persistence hooks ───────────────────────────────────────

    /// The persist-flagged subset of committed data.
    pub fn serialize(&self) -> Packet {
        self.schema
            .iter()
            .filter(|(_, def)| def.persist)
            .filter_map(|(name, _)| {
                self.data.get(name).map(|v| (name.to_string(), v.clone()))
            })
            .collect()
    }

    /// Merge loaded values into committed data without applying them to
    /// the host object.
    pub fn deserialize(&mut self, data: &Packet) {
        if !self.alive {
            return;
        }
        for (k, v) in data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Merge a replication packet into committed data, bypassing schema
    /// validation (the server is authoritative), then apply it to the
    /// host object if the class has an apply function.
    pub fn apply_replica(&mut self, packet: &Packet) {
        if !self.alive {
            return;
        }
        for (k, v) in packet {
            self.data.insert(k.clone(), v.clone());
        }
        if let Some(apply) = self.class.apply.clone() {
            if let Err(e) = apply(self.instance.as_ref(), packet) {
                self.log.warn(
                    Some(self.entity_id.as_str()),
                    format!("replica apply failed: {e}"),
                );
            }
        }
    }

    // ── Locking ─────────────────────────────────────────────────

    /// Acquire (or refresh) the lock for `owner`.
    ///
    /// Fails if another owner holds it.
    pub fn acquire_lock(&mut self, owner: &OwnerId) -> bool {
        if !self.alive {
            return false;
        }
        match &self.lock {
            Some(lock) if lock.owner != *owner => false,
            _ => {
                self.lock = Some(Lock {
                    owner: owner.clone(),
                    acquired_at: unix_micros(),
                });
                true
            }
        }
    }

    /// Release the lock if `owner` holds it.
    pub fn release_lock(&mut self, owner: &OwnerId) -> bool {
        match &self.lock {
            Some(lock) if lock.owner == *owner => {
                self.lock = None;
                true
            }
            _ => false,
        }
    }

    /// The current lock holder, if any.
    pub fn lock_owner(&self) -> Option<&OwnerId> {
        self.lock.as_ref().map(|l| &l.owner)
    }

    // ── Pooling ─────────────────────────────────────────────────

    /// Park the entity for pool reuse.
    ///
    /// Disconnects all signal handlers, releases managed resources in
    /// LIFO order, and clears staged, committed, and context state. The
    /// entity stays alive; reads and writes are rejected until
    /// [`rebind`](Self::rebind).
    pub fn deactivate(&mut self) {
        if !self.alive {
            return;
        }
        self.active = false;
        self.state_updated.clear();
        self.destroyed.clear();
        for disposable in self.managed.drain(..).rev() {
            disposable.dispose();
        }
        self.pending.clear();
        self.data.clear();
        self.context.clear();
        self.lock = None;
    }

    /// Reactivate a pooled entity under a new identity and host object.
    pub fn rebind(
        &mut self,
        entity_id: EntityId,
        instance: Rc<dyn Instance>,
        owner: Option<OwnerId>,
    ) {
        if !self.alive {
            return;
        }
        self.entity_id = entity_id;
        self.instance = instance;
        self.owner = owner;
        self.active = true;
    }

    // ── Teardown ────────────────────────────────────────────────

    /// Register a disposable released (LIFO) on destruction.
    pub fn manage(&mut self, disposable: impl Into<Disposable>) {
        self.managed.push(disposable.into());
    }

    /// Destroy the entity. Idempotent.
    ///
    /// Fires `destroyed` once, releases managed resources in LIFO order,
    /// and invalidates all reads and writes.
    pub fn destroy(&mut self) {
        if !self.alive {
            return;
        }
        self.alive = false;
        self.destroyed.fire(self.entity_id.clone());
        for disposable in self.managed.drain(..).rev() {
            disposable.dispose();
        }
        self.pending.clear();
        self.data.clear();
        self.context.clear();
        self.lock = None;
        self.state_updated.clear();
        self.destroyed.clear();
    }
}
