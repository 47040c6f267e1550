//! # Entity Registry
//!
//! Cluster-wide online log: which node currently holds each persisted entity.
//! At most one entry exists per (DBID, entity type). A second `log_entity` for a
//! held record fails, leaves the entry alone and reports the existing holder.

use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::database::{Dbid, EntityTypeId, StoreResult};
use crate::logging::log_registry_operation;
use crate::messaging::Endpoint;

/// The node and in-process entity currently holding a record online
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityHolder {
    /// Component id of the holding node
    pub component_id: u64,
    /// Entity id local to the holding node
    pub entity_id: i32,
    /// Where the holding node can be reached
    pub endpoint: Endpoint,
}

impl EntityHolder {
    pub fn new(component_id: u64, entity_id: i32, endpoint: Endpoint) -> Self {
        Self {
            component_id,
            entity_id,
            endpoint,
        }
    }
}

impl fmt::Display for EntityHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.component_id, self.entity_id, self.endpoint)
    }
}

/// One online-log row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub dbid: Dbid,
    pub entity_type: EntityTypeId,
    pub holder: EntityHolder,
    pub logged_at: DateTime<Utc>,
}

/// Outcome of `log_entity`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutcome {
    /// The caller is now the holder
    Logged,
    /// Someone else holds the entity; nothing was changed
    AlreadyHeld(EntityHolder),
}

impl LogOutcome {
    pub fn is_logged(&self) -> bool {
        matches!(self, LogOutcome::Logged)
    }
}

/// Online log of held entities.
///
/// Calls return `StoreResult` so an implementation backed by the entity store
/// can surface connection loss to the fault detector.
pub trait EntityRegistry: Send + Sync {
    /// Insert iff no entry exists for `(dbid, entity_type)`
    fn log_entity(
        &self,
        dbid: Dbid,
        entity_type: EntityTypeId,
        holder: EntityHolder,
    ) -> StoreResult<LogOutcome>;

    /// Current holder, if any
    fn query_entity(&self, dbid: Dbid, entity_type: EntityTypeId)
        -> StoreResult<Option<EntityHolder>>;

    /// Remove the entry; erasing an absent entry is not an error.
    /// Returns whether an entry was removed.
    fn erase_entity(&self, dbid: Dbid, entity_type: EntityTypeId) -> StoreResult<bool>;
}

/// In-process registry backed by a sharded concurrent map.
///
/// DBIDs are allocated per entity type, so the type is part of the key.
#[derive(Debug, Default)]
pub struct InMemoryEntityRegistry {
    entries: DashMap<(Dbid, EntityTypeId), RegistryEntry>,
}

impl InMemoryEntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of one entry
    pub fn entry(&self, dbid: Dbid, entity_type: EntityTypeId) -> Option<RegistryEntry> {
        self.entries
            .get(&(dbid, entity_type))
            .map(|entry| entry.value().clone())
    }
}

impl EntityRegistry for InMemoryEntityRegistry {
    fn log_entity(
        &self,
        dbid: Dbid,
        entity_type: EntityTypeId,
        holder: EntityHolder,
    ) -> StoreResult<LogOutcome> {
        // The shard lock is held across check and insert
        let outcome = match self.entries.entry((dbid, entity_type)) {
            Entry::Occupied(existing) => LogOutcome::AlreadyHeld(existing.get().holder.clone()),
            Entry::Vacant(slot) => {
                slot.insert(RegistryEntry {
                    dbid,
                    entity_type,
                    holder: holder.clone(),
                    logged_at: Utc::now(),
                });
                LogOutcome::Logged
            }
        };

        match &outcome {
            LogOutcome::Logged => {
                log_registry_operation("log_entity", dbid, entity_type, Some(&holder.to_string()), "logged")
            }
            LogOutcome::AlreadyHeld(existing) => log_registry_operation(
                "log_entity",
                dbid,
                entity_type,
                Some(&existing.to_string()),
                "already_held",
            ),
        }
        Ok(outcome)
    }

    fn query_entity(
        &self,
        dbid: Dbid,
        entity_type: EntityTypeId,
    ) -> StoreResult<Option<EntityHolder>> {
        Ok(self
            .entries
            .get(&(dbid, entity_type))
            .map(|entry| entry.holder.clone()))
    }

    fn erase_entity(&self, dbid: Dbid, entity_type: EntityTypeId) -> StoreResult<bool> {
        let removed = self.entries.remove(&(dbid, entity_type)).is_some();
        debug!(dbid, entity_type, removed, "Registry erase");
        Ok(removed)
    }
}
