//! # Entity Store Contract
//!
//! The relational backend is an external collaborator. This module defines the
//! calls the task layer makes into it and the error those calls can raise.
//!
//! Every method is synchronous and may block on I/O. Callers are the dispatcher's
//! worker threads only, never the completion context.
//!
//! ## Tables
//!
//! - [`EntityStore`]: entity blobs keyed by DBID, plus opaque raw commands
//! - [`AccountTable`]: login name to account record index
//! - [`VerificationTable`]: pending one-time codes
//!
//! [`StoreBackend`] bundles the three so a task gets one handle to the backend.

pub mod error_codes;
pub mod memory;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{AccountFlags, VerificationPurpose};

pub use error_codes::MysqlErrorCode;
pub use memory::MemoryStore;

/// Surrogate key of a persisted entity record, 0 means "not yet persisted"
pub type Dbid = u64;

/// Identifier of an entity type (script module) that fixes a blob's shape
pub type EntityTypeId = u16;

/// Rows returned by a raw command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRows {
    pub affected_rows: u64,
    pub rows: Vec<Vec<Option<String>>>,
}

/// A login-name index row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub name: String,
    /// Hex digest of the credential, never the credential itself
    pub password_digest: String,
    pub email: String,
    pub flags: AccountFlags,
    /// Unix seconds after which the account expires, 0 for never
    pub deadline: u64,
    /// Entity backing the account, 0 until activated
    pub dbid: Dbid,
    /// Opaque client payload captured at registration
    pub datas: Vec<u8>,
    pub login_count: u64,
}

/// A pending one-time code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub purpose: VerificationPurpose,
    pub account_name: String,
    pub code: String,
    /// Email address for bind/reset, the requested address for account creation
    pub email: String,
    /// Credential digest to install on activation, if the purpose needs one
    pub password_digest: Option<String>,
}

/// Errors raised by a backend call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend connection is gone; the call may be retried after reconnect
    #[error("Connection to backend lost: {reason}")]
    ConnectionLost { reason: String },

    /// Backend rejected the call; `code` is the client error number when known
    #[error("Backend error {code:?}: {message}")]
    Backend { code: Option<u32>, message: String },

    /// Backend does not implement the requested call
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A row that must exist is missing
    #[error("Missing row: {0}")]
    MissingRow(String),
}

impl StoreError {
    pub fn backend(code: u32, message: impl Into<String>) -> Self {
        StoreError::Backend {
            code: Some(code),
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable read/write of entity blobs
pub trait EntityStore: Send + Sync {
    /// Backend name, used in log output
    fn name(&self) -> &str;

    /// Index of this backend when a cluster runs several databases
    fn db_index(&self) -> u16 {
        0
    }

    /// Run an opaque command
    fn query(&self, command: &[u8]) -> StoreResult<QueryRows>;

    /// Insert (dbid 0) or update an entity blob; returns the record's DBID
    fn write_entity(
        &self,
        dbid: Dbid,
        autoload: Option<bool>,
        payload: &[u8],
        entity_type: EntityTypeId,
    ) -> StoreResult<Dbid>;

    /// Read an entity blob, `None` when the record does not exist
    fn query_entity(&self, dbid: Dbid, entity_type: EntityTypeId) -> StoreResult<Option<Vec<u8>>>;

    /// Delete an entity record; returns whether it existed
    fn remove_entity(&self, dbid: Dbid, entity_type: EntityTypeId) -> StoreResult<bool>;

    /// DBIDs of autoload entities of one type, paged by `[start, end)`
    fn query_autoload_entities(
        &self,
        entity_type: EntityTypeId,
        start: usize,
        end: usize,
    ) -> StoreResult<Vec<Dbid>>;

    /// Re-establish the backend connection
    fn reconnect(&self) -> StoreResult<()>;
}

/// Login-name index of accounts
pub trait AccountTable: Send + Sync {
    fn query_account(&self, name: &str) -> StoreResult<Option<AccountRecord>>;

    /// Insert or replace the row for `record.name`
    fn log_account(&self, record: &AccountRecord) -> StoreResult<()>;

    fn set_flags_deadline(&self, name: &str, flags: AccountFlags, deadline: u64) -> StoreResult<bool>;

    fn update_password(&self, name: &str, password_digest: &str) -> StoreResult<bool>;

    fn update_login_count(&self, name: &str, dbid: Dbid) -> StoreResult<bool>;

    fn set_email(&self, name: &str, email: &str) -> StoreResult<bool>;

    /// Point an account row at its backing entity
    fn set_dbid(&self, name: &str, dbid: Dbid) -> StoreResult<bool>;
}

/// Pending one-time codes
pub trait VerificationTable: Send + Sync {
    fn log_verification(&self, record: &VerificationRecord) -> StoreResult<()>;

    /// Remove and return the code if it exists with the given purpose.
    /// Two callers racing on one code: exactly one gets `Some`.
    fn take_verification(
        &self,
        code: &str,
        purpose: VerificationPurpose,
    ) -> StoreResult<Option<VerificationRecord>>;
}

/// One handle onto every table a task may touch
pub trait StoreBackend: EntityStore + AccountTable + VerificationTable {}

impl<T> StoreBackend for T where T: EntityStore + AccountTable + VerificationTable {}
