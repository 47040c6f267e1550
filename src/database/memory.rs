//! In-memory backend implementing every store table.
//!
//! Used by tests and by embedders that do not need durability. All tables sit
//! behind one lock so multi-table calls (such as taking a verification code)
//! are atomic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    AccountRecord, AccountTable, Dbid, EntityStore, EntityTypeId, QueryRows, StoreError,
    StoreResult, VerificationRecord, VerificationTable,
};
use crate::constants::{AccountFlags, VerificationPurpose};

type CommandHandler = Arc<dyn Fn(&[u8]) -> StoreResult<QueryRows> + Send + Sync>;

#[derive(Debug, Clone)]
struct EntityRow {
    entity_type: EntityTypeId,
    autoload: bool,
    payload: Vec<u8>,
}

struct Inner {
    next_dbid: Dbid,
    entities: BTreeMap<Dbid, EntityRow>,
    accounts: HashMap<String, AccountRecord>,
    verifications: HashMap<String, VerificationRecord>,
    reconnects: u64,
}

/// In-memory store for testing and embedding.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    command_handler: Option<CommandHandler>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_dbid: 1,
                entities: BTreeMap::new(),
                accounts: HashMap::new(),
                verifications: HashMap::new(),
                reconnects: 0,
            }),
            command_handler: None,
        }
    }

    /// Answer raw commands with `handler` instead of rejecting them
    pub fn with_command_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[u8]) -> StoreResult<QueryRows> + Send + Sync + 'static,
    {
        self.command_handler = Some(Arc::new(handler));
        self
    }

    /// Number of `reconnect` calls seen
    pub fn reconnect_count(&self) -> u64 {
        self.inner.lock().reconnects
    }

    pub fn entity_count(&self) -> usize {
        self.inner.lock().entities.len()
    }

    pub fn pending_verifications(&self) -> usize {
        self.inner.lock().verifications.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn query(&self, command: &[u8]) -> StoreResult<QueryRows> {
        match &self.command_handler {
            Some(handler) => handler(command),
            None => Err(StoreError::Unsupported(
                "raw commands are not supported by the in-memory store".to_string(),
            )),
        }
    }

    fn write_entity(
        &self,
        dbid: Dbid,
        autoload: Option<bool>,
        payload: &[u8],
        entity_type: EntityTypeId,
    ) -> StoreResult<Dbid> {
        let mut inner = self.inner.lock();
        if dbid == 0 {
            let dbid = inner.next_dbid;
            inner.next_dbid += 1;
            inner.entities.insert(
                dbid,
                EntityRow {
                    entity_type,
                    autoload: autoload.unwrap_or(false),
                    payload: payload.to_vec(),
                },
            );
            return Ok(dbid);
        }

        let row = inner
            .entities
            .get_mut(&dbid)
            .ok_or_else(|| StoreError::MissingRow(format!("entity {dbid}")))?;
        row.entity_type = entity_type;
        row.payload = payload.to_vec();
        if let Some(autoload) = autoload {
            row.autoload = autoload;
        }
        Ok(dbid)
    }

    fn query_entity(&self, dbid: Dbid, entity_type: EntityTypeId) -> StoreResult<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        Ok(inner
            .entities
            .get(&dbid)
            .filter(|row| row.entity_type == entity_type)
            .map(|row| row.payload.clone()))
    }

    fn remove_entity(&self, dbid: Dbid, entity_type: EntityTypeId) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let matches = inner
            .entities
            .get(&dbid)
            .is_some_and(|row| row.entity_type == entity_type);
        if matches {
            inner.entities.remove(&dbid);
        }
        Ok(matches)
    }

    fn query_autoload_entities(
        &self,
        entity_type: EntityTypeId,
        start: usize,
        end: usize,
    ) -> StoreResult<Vec<Dbid>> {
        let inner = self.inner.lock();
        Ok(inner
            .entities
            .iter()
            .filter(|(_, row)| row.autoload && row.entity_type == entity_type)
            .map(|(dbid, _)| *dbid)
            .skip(start)
            .take(end.saturating_sub(start))
            .collect())
    }

    fn reconnect(&self) -> StoreResult<()> {
        self.inner.lock().reconnects += 1;
        Ok(())
    }
}

impl AccountTable for MemoryStore {
    fn query_account(&self, name: &str) -> StoreResult<Option<AccountRecord>> {
        Ok(self.inner.lock().accounts.get(name).cloned())
    }

    fn log_account(&self, record: &AccountRecord) -> StoreResult<()> {
        self.inner
            .lock()
            .accounts
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn set_flags_deadline(&self, name: &str, flags: AccountFlags, deadline: u64) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        Ok(match inner.accounts.get_mut(name) {
            Some(account) => {
                account.flags = flags;
                account.deadline = deadline;
                true
            }
            None => false,
        })
    }

    fn update_password(&self, name: &str, password_digest: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        Ok(match inner.accounts.get_mut(name) {
            Some(account) => {
                account.password_digest = password_digest.to_string();
                true
            }
            None => false,
        })
    }

    fn update_login_count(&self, name: &str, dbid: Dbid) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        Ok(match inner.accounts.get_mut(name) {
            Some(account) if account.dbid == dbid => {
                account.login_count += 1;
                true
            }
            _ => false,
        })
    }

    fn set_email(&self, name: &str, email: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        Ok(match inner.accounts.get_mut(name) {
            Some(account) => {
                account.email = email.to_string();
                true
            }
            None => false,
        })
    }

    fn set_dbid(&self, name: &str, dbid: Dbid) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        Ok(match inner.accounts.get_mut(name) {
            Some(account) => {
                account.dbid = dbid;
                true
            }
            None => false,
        })
    }
}

impl VerificationTable for MemoryStore {
    fn log_verification(&self, record: &VerificationRecord) -> StoreResult<()> {
        self.inner
            .lock()
            .verifications
            .insert(record.code.clone(), record.clone());
        Ok(())
    }

    fn take_verification(
        &self,
        code: &str,
        purpose: VerificationPurpose,
    ) -> StoreResult<Option<VerificationRecord>> {
        let mut inner = self.inner.lock();
        let purpose_matches = inner
            .verifications
            .get(code)
            .is_some_and(|record| record.purpose == purpose);
        if !purpose_matches {
            return Ok(None);
        }
        Ok(inner.verifications.remove(code))
    }
}
