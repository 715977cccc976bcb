//! Entity persistence: versioned envelopes over an abstract store.
//!
//! The payload written to the store is a JSON envelope whose `version`
//! field gates future migrations; [`PersistenceController::load`] is the
//! single place a version branch happens before data reaches an entity.

use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use drover_core::{EntityId, Packet, StoreError};
use drover_store::KvStore;

use crate::entity::Entity;

/// Current envelope version.
pub const ENVELOPE_VERSION: u32 = 1;

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The stored payload shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload format version.
    pub version: u32,
    /// Unix seconds at the time of the write.
    pub updated_at: u64,
    /// Persist-flagged entity fields.
    pub data: Packet,
    /// Caller-supplied metadata, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl Envelope {
    fn wrap(data: Packet, meta: Option<serde_json::Value>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            updated_at: unix_seconds(),
            data,
            meta,
        }
    }

    fn encode(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Encode {
            reason: e.to_string(),
        })
    }

    fn decode(payload: &str) -> Result<Self, StoreError> {
        serde_json::from_str(payload).map_err(|e| StoreError::Decode {
            reason: e.to_string(),
        })
    }
}

/// Saves and loads entity envelopes through a [`KvStore`].
pub struct PersistenceController {
    store: Rc<dyn KvStore>,
    key_prefix: Option<String>,
}

impl PersistenceController {
    /// Bind to a store with an optional key prefix.
    pub fn new(store: Rc<dyn KvStore>, key_prefix: Option<String>) -> Self {
        Self { store, key_prefix }
    }

    /// The store key for an entity id: `prefix + id`.
    pub fn key_for(&self, entity_id: &EntityId) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}{entity_id}"),
            None => entity_id.0.clone(),
        }
    }

    /// Persist the entity's persist-flagged fields under `key`.
    pub fn save(
        &self,
        entity: &Entity,
        key: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let envelope = Envelope::wrap(entity.serialize(), meta);
        self.store.write(key, envelope.encode()?)
    }

    /// Load `key` into the entity.
    ///
    /// Returns `Ok(None)` for a missing key (first run), or the stored
    /// `updated_at` on success. Values merge into committed data without
    /// running the class apply function.
    pub fn load(&self, entity: &mut Entity, key: &str) -> Result<Option<u64>, StoreError> {
        let Some(payload) = self.store.read(key)? else {
            return Ok(None);
        };
        let envelope = Envelope::decode(&payload)?;
        // Migration gate: branch here when the envelope format changes.
        match envelope.version {
            ENVELOPE_VERSION => {}
            other => {
                return Err(StoreError::Decode {
                    reason: format!("unsupported envelope version {other}"),
                })
            }
        }
        entity.deserialize(&envelope.data);
        Ok(Some(envelope.updated_at))
    }

    /// Atomically transform the stored envelope at `key`.
    ///
    /// A missing key starts from an empty envelope. The mutator sees the
    /// decoded envelope; `updated_at` is refreshed on write.
    pub fn update(
        &self,
        key: &str,
        mutator: impl FnOnce(&mut Envelope),
    ) -> Result<(), StoreError> {
        let mut envelope = match self.store.read(key)? {
            Some(payload) => Envelope::decode(&payload)?,
            None => Envelope::wrap(Packet::new(), None),
        };
        mutator(&mut envelope);
        envelope.updated_at = unix_seconds();
        self.store.write(key, envelope.encode()?)
    }

    /// Remove the stored envelope at `key`.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.store.remove(key)
    }
}
