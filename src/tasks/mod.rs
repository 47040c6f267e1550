//! # Database Tasks
//!
//! The closed set of requests the database manager accepts. Each variant is a
//! struct holding the decoded request fields plus the results its background
//! phase produces; [`TaskRequest`] dispatches the [`Task`] contract to it.
//!
//! Requests arrive as JSON objects tagged by `task`:
//!
//! ```rust
//! use dbmgr_core::execution::Task;
//! use dbmgr_core::tasks::TaskRequest;
//!
//! let request = TaskRequest::decode(br#"{"task": "entity_offline", "dbid": 7, "entity_type": 2}"#)
//!     .unwrap();
//! assert_eq!(request.kind(), "entity_offline");
//! ```

pub mod account;
pub mod credentials;
pub mod entity;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};

use crate::constants::ServerErrorCode;
use crate::database::{Dbid, EntityTypeId, StoreError};
use crate::error::Result;
use crate::execution::{CompletionContext, SerialKey, Task, TaskContext};
use crate::messaging::Reply;
use crate::registry::{EntityHolder, LogOutcome};
use crate::resilience::Fault;

pub use account::{
    AccountLogin, ActivateAccount, BindEmail, ChangePassword, CreateAccount, CreateMailAccount,
    RequestBindEmail, RequestResetPassword, ResetPassword,
};
pub use entity::{
    DeleteEntityByDbid, EntityAutoLoad, EntityOffline, ExecuteRawCommand, LookUpEntityByDbid,
    QueryAccount, QueryEntity, RemoveEntity, WriteEntity,
};

/// Every request the database manager can run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskRequest {
    ExecuteRawCommand(ExecuteRawCommand),
    WriteEntity(WriteEntity),
    RemoveEntity(RemoveEntity),
    QueryEntity(QueryEntity),
    EntityOffline(EntityOffline),
    QueryAccount(QueryAccount),
    DeleteEntityByDbid(DeleteEntityByDbid),
    LookUpEntityByDbid(LookUpEntityByDbid),
    EntityAutoLoad(EntityAutoLoad),
    CreateAccount(CreateAccount),
    CreateMailAccount(CreateMailAccount),
    ActivateAccount(ActivateAccount),
    RequestResetPassword(RequestResetPassword),
    ResetPassword(ResetPassword),
    RequestBindEmail(RequestBindEmail),
    BindEmail(BindEmail),
    ChangePassword(ChangePassword),
    AccountLogin(AccountLogin),
}

macro_rules! each_task {
    ($request:expr, $task:ident => $body:expr) => {
        match $request {
            TaskRequest::ExecuteRawCommand($task) => $body,
            TaskRequest::WriteEntity($task) => $body,
            TaskRequest::RemoveEntity($task) => $body,
            TaskRequest::QueryEntity($task) => $body,
            TaskRequest::EntityOffline($task) => $body,
            TaskRequest::QueryAccount($task) => $body,
            TaskRequest::DeleteEntityByDbid($task) => $body,
            TaskRequest::LookUpEntityByDbid($task) => $body,
            TaskRequest::EntityAutoLoad($task) => $body,
            TaskRequest::CreateAccount($task) => $body,
            TaskRequest::CreateMailAccount($task) => $body,
            TaskRequest::ActivateAccount($task) => $body,
            TaskRequest::RequestResetPassword($task) => $body,
            TaskRequest::ResetPassword($task) => $body,
            TaskRequest::RequestBindEmail($task) => $body,
            TaskRequest::BindEmail($task) => $body,
            TaskRequest::ChangePassword($task) => $body,
            TaskRequest::AccountLogin($task) => $body,
        }
    };
}

impl TaskRequest {
    /// Decode a request payload; the payload is copied into owned fields
    pub fn decode(payload: &[u8]) -> Result<TaskRequest> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Task for TaskRequest {
    fn kind(&self) -> &'static str {
        each_task!(self, task => task.kind())
    }

    fn serial_key(&self) -> Option<SerialKey> {
        each_task!(self, task => task.serial_key())
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> std::result::Result<(), Fault> {
        each_task!(self, task => task.run_background(ctx))
    }

    fn record_failure(&mut self, error: &StoreError) {
        each_task!(self, task => task.record_failure(error))
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        each_task!(self, task => task.completion(ctx))
    }
}

/// Result code of a task whose background phase has not decided yet
pub(crate) fn unresolved() -> ServerErrorCode {
    ServerErrorCode::OpFailed
}

/// Log `holder` as the holder of `dbid`.
///
/// `attempted` is task-local progress. When an earlier attempt sent the same
/// claim and then lost the connection, the entry it finds may be its own; that
/// counts as logged.
pub(crate) fn claim(
    ctx: &TaskContext<'_>,
    dbid: Dbid,
    entity_type: EntityTypeId,
    holder: &EntityHolder,
    attempted: &mut bool,
) -> std::result::Result<LogOutcome, Fault> {
    let retried = *attempted;
    *attempted = true;

    let outcome = ctx.registry(|registry| registry.log_entity(dbid, entity_type, holder.clone()))?;
    Ok(match outcome {
        LogOutcome::AlreadyHeld(existing) if retried && existing == *holder => LogOutcome::Logged,
        other => other,
    })
}

/// Log `holder` as the holder of `dbid`, treating an entry already naming the
/// same holder as logged.
///
/// A login claims the account entity for its session; loading that entity
/// afterwards comes from the same holder and must not be refused.
pub(crate) fn claim_as_holder(
    ctx: &TaskContext<'_>,
    dbid: Dbid,
    entity_type: EntityTypeId,
    holder: &EntityHolder,
) -> std::result::Result<LogOutcome, Fault> {
    let outcome = ctx.registry(|registry| registry.log_entity(dbid, entity_type, holder.clone()))?;
    Ok(match outcome {
        LogOutcome::AlreadyHeld(existing) if existing == *holder => LogOutcome::Logged,
        other => other,
    })
}
