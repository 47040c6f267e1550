//! Entity persistence tasks.
//!
//! Tasks that name a record or a live entity are serialized on it; the lookup
//! style tasks that only read the registry run unserialized.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{claim, claim_as_holder};
use super::credentials::digest_matches;
use crate::constants::{AccountFlags, ComponentType};
use crate::database::{AccountTable, Dbid, EntityStore, EntityTypeId, QueryRows, StoreError};
use crate::execution::{CompletionContext, SerialKey, Task, TaskContext};
use crate::messaging::{OutboundMessage, QueryMode, Recipient, Reply};
use crate::registry::{EntityHolder, LogOutcome};
use crate::resilience::Fault;

/// Run an opaque command on behalf of a front-end or cell node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRawCommand {
    pub component_type: ComponentType,
    pub component_id: u64,
    /// 0 when the caller does not want the rows
    pub callback_id: u64,
    /// Serialize with other tasks of this live entity
    #[serde(default)]
    pub entity_id: Option<i32>,
    pub command: Vec<u8>,
    #[serde(skip)]
    error: Option<String>,
    #[serde(skip)]
    rows: QueryRows,
}

impl ExecuteRawCommand {
    pub fn new(
        component_type: ComponentType,
        component_id: u64,
        callback_id: u64,
        entity_id: Option<i32>,
        command: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            component_type,
            component_id,
            callback_id,
            entity_id,
            command: command.into(),
            error: None,
            rows: QueryRows::default(),
        }
    }
}

impl Task for ExecuteRawCommand {
    fn kind(&self) -> &'static str {
        "execute_raw_command"
    }

    fn serial_key(&self) -> Option<SerialKey> {
        self.entity_id
            .and_then(|entity_id| SerialKey::for_entity(0, entity_id))
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        self.rows = ctx.store(|store| store.query(&self.command))?;
        self.error = None;
        Ok(())
    }

    fn record_failure(&mut self, error: &StoreError) {
        self.error = Some(error.to_string());
    }

    fn completion(&self, _ctx: &CompletionContext<'_>) -> Option<Reply> {
        if self.callback_id == 0 {
            return None;
        }
        if !matches!(
            self.component_type,
            ComponentType::Baseapp | ComponentType::Cellapp
        ) {
            error!(
                component_type = %self.component_type,
                component_id = self.component_id,
                "Raw command results can only go to a baseapp or cellapp"
            );
            return None;
        }

        Some(Reply::to(
            Recipient::Component {
                component_type: self.component_type,
                component_id: self.component_id,
            },
            OutboundMessage::RawCommandResult {
                callback_id: self.callback_id,
                error: self.error.clone(),
                rows: self.rows.clone(),
            },
        ))
    }
}

/// Persist an entity blob, allocating a DBID on first write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteEntity {
    pub component_id: u64,
    pub entity_id: i32,
    /// 0 for an entity that has never been written
    pub dbid: Dbid,
    pub entity_type: EntityTypeId,
    pub callback_id: u64,
    /// `None` leaves the stored flag unchanged
    #[serde(default)]
    pub autoload: Option<bool>,
    pub payload: Vec<u8>,
    #[serde(skip)]
    written_dbid: Dbid,
    #[serde(skip)]
    claim_attempted: bool,
    #[serde(skip)]
    success: bool,
}

impl WriteEntity {
    pub fn new(
        component_id: u64,
        entity_id: i32,
        dbid: Dbid,
        entity_type: EntityTypeId,
        callback_id: u64,
        autoload: Option<bool>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            component_id,
            entity_id,
            dbid,
            entity_type,
            callback_id,
            autoload,
            payload,
            written_dbid: 0,
            claim_attempted: false,
            success: false,
        }
    }
}

impl Task for WriteEntity {
    fn kind(&self) -> &'static str {
        "write_entity"
    }

    fn serial_key(&self) -> Option<SerialKey> {
        SerialKey::for_entity(self.dbid, self.entity_id)
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        self.success = false;

        // An earlier attempt may have written the record before losing the
        // connection; writing again would allocate a second DBID.
        if self.written_dbid == 0 {
            self.written_dbid = ctx.store(|store| {
                store.write_entity(self.dbid, self.autoload, &self.payload, self.entity_type)
            })?;
        }

        if self.dbid == 0 {
            let holder = EntityHolder::new(self.component_id, self.entity_id, ctx.requester().clone());
            let outcome = claim(
                ctx,
                self.written_dbid,
                self.entity_type,
                &holder,
                &mut self.claim_attempted,
            )?;
            if let LogOutcome::AlreadyHeld(existing) = outcome {
                warn!(
                    dbid = self.written_dbid,
                    holder = %existing,
                    "Freshly written entity is already held online"
                );
                return Ok(());
            }
        }

        self.success = true;
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.success = false;
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::WriteEntityResult {
                entity_id: self.entity_id,
                dbid: if self.success { self.written_dbid } else { 0 },
                db_index: ctx.db_index,
                callback_id: self.callback_id,
                success: self.success,
            },
        ))
    }
}

/// Delete an entity record and its online entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveEntity {
    pub component_id: u64,
    pub entity_id: i32,
    pub dbid: Dbid,
    pub entity_type: EntityTypeId,
}

impl Task for RemoveEntity {
    fn kind(&self) -> &'static str {
        "remove_entity"
    }

    fn serial_key(&self) -> Option<SerialKey> {
        SerialKey::for_entity(self.dbid, self.entity_id)
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        ctx.registry(|registry| registry.erase_entity(self.dbid, self.entity_type))?;
        let removed = ctx.store(|store| store.remove_entity(self.dbid, self.entity_type))?;
        if !removed {
            debug!(dbid = self.dbid, "Removed entity had no record");
        }
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {}

    fn completion(&self, _ctx: &CompletionContext<'_>) -> Option<Reply> {
        None
    }
}

/// Load an entity by DBID and take it online for the requester
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEntity {
    #[serde(default)]
    pub mode: QueryMode,
    pub component_id: u64,
    pub entity_id: i32,
    pub dbid: Dbid,
    pub entity_type: EntityTypeId,
    pub callback_id: u64,
    #[serde(skip)]
    payload: Option<Vec<u8>>,
    #[serde(skip)]
    was_active: Option<EntityHolder>,
    #[serde(skip)]
    claim_attempted: bool,
    #[serde(skip)]
    success: bool,
}

impl QueryEntity {
    pub fn new(
        mode: QueryMode,
        component_id: u64,
        entity_id: i32,
        dbid: Dbid,
        entity_type: EntityTypeId,
        callback_id: u64,
    ) -> Self {
        Self {
            mode,
            component_id,
            entity_id,
            dbid,
            entity_type,
            callback_id,
            payload: None,
            was_active: None,
            claim_attempted: false,
            success: false,
        }
    }
}

impl Task for QueryEntity {
    fn kind(&self) -> &'static str {
        "query_entity"
    }

    fn serial_key(&self) -> Option<SerialKey> {
        SerialKey::for_entity(self.dbid, self.entity_id)
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        self.success = false;
        self.was_active = None;

        self.payload = ctx.store(|store| store.query_entity(self.dbid, self.entity_type))?;
        if self.payload.is_none() {
            return Ok(());
        }

        let holder = EntityHolder::new(self.component_id, self.entity_id, ctx.requester().clone());
        match claim(ctx, self.dbid, self.entity_type, &holder, &mut self.claim_attempted)? {
            LogOutcome::Logged => self.success = true,
            LogOutcome::AlreadyHeld(existing) => self.was_active = Some(existing),
        }
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.success = false;
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::QueryEntityResult {
                mode: self.mode,
                db_index: ctx.db_index,
                entity_type: self.entity_type,
                dbid: self.dbid,
                callback_id: self.callback_id,
                success: self.success,
                entity_id: self.entity_id,
                was_active: self.was_active.clone(),
                payload: if self.success { self.payload.clone() } else { None },
            },
        ))
    }
}

/// A node reports that it no longer holds an entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityOffline {
    pub dbid: Dbid,
    pub entity_type: EntityTypeId,
}

impl Task for EntityOffline {
    fn kind(&self) -> &'static str {
        "entity_offline"
    }

    fn serial_key(&self) -> Option<SerialKey> {
        SerialKey::for_entity(self.dbid, 0)
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        ctx.registry(|registry| registry.erase_entity(self.dbid, self.entity_type))?;
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {}

    fn completion(&self, _ctx: &CompletionContext<'_>) -> Option<Reply> {
        None
    }
}

/// Load the account entity for a session and take it online
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAccount {
    pub account_name: String,
    /// Checked only when `dbid` is 0
    #[serde(default)]
    pub password: String,
    pub component_id: u64,
    pub entity_id: i32,
    #[serde(default)]
    pub dbid: Dbid,
    #[serde(skip)]
    resolved_dbid: Dbid,
    #[serde(skip)]
    flags: AccountFlags,
    #[serde(skip)]
    deadline: u64,
    #[serde(skip)]
    payload: Option<Vec<u8>>,
    #[serde(skip)]
    error: Option<String>,
    #[serde(skip)]
    success: bool,
}

impl QueryAccount {
    pub fn new(
        account_name: impl Into<String>,
        password: impl Into<String>,
        component_id: u64,
        entity_id: i32,
        dbid: Dbid,
    ) -> Self {
        Self {
            account_name: account_name.into(),
            password: password.into(),
            component_id,
            entity_id,
            dbid,
            resolved_dbid: dbid,
            flags: AccountFlags::NORMAL,
            deadline: 0,
            payload: None,
            error: None,
            success: false,
        }
    }

    fn fail(&mut self, reason: &str) -> Result<(), Fault> {
        self.error = Some(reason.to_string());
        Ok(())
    }
}

impl Task for QueryAccount {
    fn kind(&self) -> &'static str {
        "query_account"
    }

    fn serial_key(&self) -> Option<SerialKey> {
        SerialKey::for_entity(self.dbid, self.entity_id)
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        self.success = false;
        self.error = None;

        if self.account_name.is_empty() {
            return self.fail("account name is empty");
        }

        let account = ctx.store(|store| store.query_account(&self.account_name))?;
        self.resolved_dbid = self.dbid;
        if let Some(account) = &account {
            self.flags = account.flags;
            self.deadline = account.deadline;
        }

        if self.dbid == 0 {
            let Some(account) = account else {
                return self.fail("account not found");
            };
            if account.dbid == 0 || !account.flags.is_normal() {
                return self.fail("account has no entity or is not active");
            }
            if !digest_matches(&account.password_digest, &self.password) {
                return self.fail("password mismatch");
            }
            self.resolved_dbid = account.dbid;
        }

        let entity_type = ctx.accounts().account_entity_type;
        let dbid = self.resolved_dbid;
        self.payload = ctx.store(|store| store.query_entity(dbid, entity_type))?;
        if self.payload.is_none() {
            return self.fail("account entity not found");
        }

        let holder = EntityHolder::new(self.component_id, self.entity_id, ctx.requester().clone());
        match claim_as_holder(ctx, dbid, entity_type, &holder)? {
            LogOutcome::Logged => self.success = true,
            LogOutcome::AlreadyHeld(existing) => {
                self.error = Some(format!("account entity is online at {existing}"));
            }
        }
        Ok(())
    }

    fn record_failure(&mut self, error: &StoreError) {
        self.success = false;
        self.error = Some(error.to_string());
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::QueryAccountResult {
                db_index: ctx.db_index,
                account_name: self.account_name.clone(),
                dbid: self.resolved_dbid,
                success: self.success,
                entity_id: self.entity_id,
                flags: self.flags,
                deadline: self.deadline,
                payload: if self.success { self.payload.clone() } else { None },
                error: self.error.clone(),
            },
        ))
    }
}

/// Delete a record unless some node holds it online
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteEntityByDbid {
    pub dbid: Dbid,
    pub entity_type: EntityTypeId,
    pub callback_id: u64,
    #[serde(skip)]
    holder: Option<EntityHolder>,
    #[serde(skip)]
    success: bool,
}

impl DeleteEntityByDbid {
    pub fn new(dbid: Dbid, entity_type: EntityTypeId, callback_id: u64) -> Self {
        Self {
            dbid,
            entity_type,
            callback_id,
            holder: None,
            success: false,
        }
    }
}

impl Task for DeleteEntityByDbid {
    fn kind(&self) -> &'static str {
        "delete_entity_by_dbid"
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        self.success = false;
        self.holder = ctx.registry(|registry| registry.query_entity(self.dbid, self.entity_type))?;
        if let Some(holder) = &self.holder {
            debug!(dbid = self.dbid, holder = %holder, "Refusing to delete an online entity");
            return Ok(());
        }
        self.success = ctx.store(|store| store.remove_entity(self.dbid, self.entity_type))?;
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.success = false;
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::DeleteEntityResult {
                success: self.success,
                holder: self.holder.clone(),
                callback_id: self.callback_id,
                entity_type: self.entity_type,
                dbid: self.dbid,
            },
        ))
    }
}

/// Report who holds a record, or whether it exists at all
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookUpEntityByDbid {
    pub dbid: Dbid,
    pub entity_type: EntityTypeId,
    pub callback_id: u64,
    #[serde(skip)]
    holder: Option<EntityHolder>,
    #[serde(skip)]
    success: bool,
}

impl LookUpEntityByDbid {
    pub fn new(dbid: Dbid, entity_type: EntityTypeId, callback_id: u64) -> Self {
        Self {
            dbid,
            entity_type,
            callback_id,
            holder: None,
            success: false,
        }
    }
}

impl Task for LookUpEntityByDbid {
    fn kind(&self) -> &'static str {
        "look_up_entity_by_dbid"
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        self.holder = ctx.registry(|registry| registry.query_entity(self.dbid, self.entity_type))?;
        self.success = match self.holder {
            Some(_) => true,
            None => ctx
                .store(|store| store.query_entity(self.dbid, self.entity_type))?
                .is_some(),
        };
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.success = false;
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::LookUpEntityResult {
                success: self.success,
                holder: self.holder.clone(),
                callback_id: self.callback_id,
                entity_type: self.entity_type,
                dbid: self.dbid,
            },
        ))
    }
}

/// Page through the DBIDs of autoload entities of one type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityAutoLoad {
    pub entity_type: EntityTypeId,
    pub start: usize,
    pub end: usize,
    #[serde(skip)]
    dbids: Vec<Dbid>,
}

impl EntityAutoLoad {
    pub fn new(entity_type: EntityTypeId, start: usize, end: usize) -> Self {
        Self {
            entity_type,
            start,
            end,
            dbids: Vec::new(),
        }
    }
}

impl Task for EntityAutoLoad {
    fn kind(&self) -> &'static str {
        "entity_auto_load"
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        self.dbids = ctx.store(|store| {
            store.query_autoload_entities(self.entity_type, self.start, self.end)
        })?;
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.dbids.clear();
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::AutoLoadResult {
                db_index: ctx.db_index,
                entity_type: self.entity_type,
                dbids: self.dbids.clone(),
            },
        ))
    }
}
