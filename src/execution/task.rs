//! # Task Envelope
//!
//! A task has two phases. The background phase runs on a worker thread and may
//! block on the entity store; it ends DONE or RETRY. The completion phase runs
//! on the single completion context and produces at most one [`Reply`].
//!
//! [`DbTask`] wraps a decoded [`TaskRequest`] with its identity, requester and
//! lifecycle state. Background results live in the request's own fields, so a
//! retried attempt sees the progress of the previous one.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::AccountsConfig;
use crate::database::{Dbid, StoreBackend, StoreError, StoreResult};
use crate::logging::log_task_operation;
use crate::messaging::{Endpoint, Reply};
use crate::registry::EntityRegistry;
use crate::resilience::{ConnectionFaultDetector, Fault};
use crate::state_machine::TaskState;
use crate::tasks::TaskRequest;

pub type TaskId = u64;

/// Key under which entity-scoped tasks are serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialKey {
    /// A persisted record
    Dbid(Dbid),
    /// A live entity that has no record yet
    Entity(i32),
}

impl SerialKey {
    /// DBID when persisted, otherwise the live entity id, otherwise none
    pub fn for_entity(dbid: Dbid, entity_id: i32) -> Option<SerialKey> {
        if dbid > 0 {
            Some(SerialKey::Dbid(dbid))
        } else if entity_id > 0 {
            Some(SerialKey::Entity(entity_id))
        } else {
            None
        }
    }
}

impl fmt::Display for SerialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialKey::Dbid(dbid) => write!(f, "dbid:{dbid}"),
            SerialKey::Entity(entity_id) => write!(f, "entity:{entity_id}"),
        }
    }
}

/// How a background attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundOutcome {
    /// Ready for the completion phase
    Done,
    /// Connection was lost; run the background phase again
    Retry,
}

/// Behavior every task kind provides
pub trait Task: Send + fmt::Debug {
    fn kind(&self) -> &'static str;

    /// Serialization key; `None` runs as soon as a worker is free
    fn serial_key(&self) -> Option<SerialKey> {
        None
    }

    /// Store work. Logical failures may be recorded in the task's own result
    /// fields and return `Ok`; store errors propagate as a [`Fault`].
    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault>;

    /// Record a store error the fault detector classified as logical
    fn record_failure(&mut self, error: &StoreError);

    /// Build the result message, if the caller expects one
    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply>;
}

/// Long-lived collaborators shared by every task
#[derive(Clone)]
pub struct DbServices {
    store: Arc<dyn StoreBackend>,
    registry: Arc<dyn EntityRegistry>,
    detector: Arc<ConnectionFaultDetector>,
    accounts: AccountsConfig,
}

impl DbServices {
    pub fn new(
        store: Arc<dyn StoreBackend>,
        registry: Arc<dyn EntityRegistry>,
        detector: Arc<ConnectionFaultDetector>,
        accounts: AccountsConfig,
    ) -> Self {
        Self {
            store,
            registry,
            detector,
            accounts,
        }
    }

    pub fn store(&self) -> &Arc<dyn StoreBackend> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<dyn EntityRegistry> {
        &self.registry
    }

    pub fn detector(&self) -> &Arc<ConnectionFaultDetector> {
        &self.detector
    }

    pub fn accounts(&self) -> &AccountsConfig {
        &self.accounts
    }

    pub fn db_index(&self) -> u16 {
        self.store.db_index()
    }
}

impl fmt::Debug for DbServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbServices")
            .field("store", &self.store.name())
            .field("db_index", &self.store.db_index())
            .field("detector", &self.detector)
            .field("accounts", &self.accounts)
            .finish()
    }
}

/// What a background phase may touch
pub struct TaskContext<'a> {
    services: &'a DbServices,
    requester: &'a Endpoint,
}

impl<'a> TaskContext<'a> {
    pub fn new(services: &'a DbServices, requester: &'a Endpoint) -> Self {
        Self {
            services,
            requester,
        }
    }

    pub fn requester(&self) -> &Endpoint {
        self.requester
    }

    pub fn accounts(&self) -> &AccountsConfig {
        &self.services.accounts
    }

    /// Run one store call; failures are classified by the fault detector
    pub fn store<T>(&self, call: impl FnOnce(&dyn StoreBackend) -> StoreResult<T>) -> Result<T, Fault> {
        let store = self.services.store.as_ref();
        let generation = self.services.detector.generation();
        call(store).map_err(|error| self.services.detector.inspect(store, generation, error))
    }

    /// Run one registry call; a lost connection reconnects the shared backend
    pub fn registry<T>(
        &self,
        call: impl FnOnce(&dyn EntityRegistry) -> StoreResult<T>,
    ) -> Result<T, Fault> {
        let generation = self.services.detector.generation();
        call(self.services.registry.as_ref()).map_err(|error| {
            self.services
                .detector
                .inspect(self.services.store.as_ref(), generation, error)
        })
    }
}

/// What a completion phase may read
pub struct CompletionContext<'a> {
    pub requester: &'a Endpoint,
    pub db_index: u16,
}

/// A submitted task owned by the dispatcher until its completion phase returns
#[derive(Debug)]
pub struct DbTask {
    id: TaskId,
    requester: Endpoint,
    request: TaskRequest,
    serial_key: Option<SerialKey>,
    state: TaskState,
    attempts: u32,
    submitted_at: DateTime<Utc>,
}

impl DbTask {
    pub fn new(id: TaskId, requester: Endpoint, request: TaskRequest) -> Self {
        // Fixed at admission so release always frees the slot that was taken
        let serial_key = request.serial_key();
        Self {
            id,
            requester,
            request,
            serial_key,
            state: TaskState::Pending,
            attempts: 0,
            submitted_at: Utc::now(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn requester(&self) -> &Endpoint {
        &self.requester
    }

    pub fn request(&self) -> &TaskRequest {
        &self.request
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Background attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Milliseconds since submission, covering queueing, retries and the completion wait
    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.submitted_at).num_milliseconds().max(0) as u64
    }

    pub fn kind(&self) -> &'static str {
        self.request.kind()
    }

    pub fn serial_key(&self) -> Option<SerialKey> {
        self.serial_key
    }

    /// Run one background attempt on the calling (worker) thread
    pub fn run_background(&mut self, services: &DbServices) -> BackgroundOutcome {
        if let Err(e) = self.state.transition(TaskState::Running) {
            error!(task_id = self.id, error = %e, "Background phase started from an illegal state");
            return BackgroundOutcome::Done;
        }
        self.attempts += 1;

        let ctx = TaskContext::new(services, &self.requester);
        match self.request.run_background(&ctx) {
            Ok(()) => BackgroundOutcome::Done,
            Err(Fault::Transient) => {
                self.state = TaskState::Retry;
                warn!(
                    task_id = self.id,
                    task_kind = self.kind(),
                    attempts = self.attempts,
                    "🔁 Background phase lost the backend connection, task will retry"
                );
                BackgroundOutcome::Retry
            }
            Err(Fault::Logical(store_error)) => {
                log_task_operation(
                    "background",
                    self.id,
                    self.kind(),
                    self.serial_key().map(|key| key.to_string()).as_deref(),
                    "failed",
                    Some(&store_error.to_string()),
                );
                self.request.record_failure(&store_error);
                BackgroundOutcome::Done
            }
        }
    }

    /// Run the completion phase; the task is terminal afterwards
    pub fn complete(&mut self, db_index: u16) -> Option<Reply> {
        if let Err(e) = self.state.transition(TaskState::Completed) {
            error!(task_id = self.id, error = %e, "Completion phase reached from an illegal state");
        }
        let ctx = CompletionContext {
            requester: &self.requester,
            db_index,
        };
        self.request.completion(&ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::database::MemoryStore;
    use crate::registry::InMemoryEntityRegistry;
    use crate::tasks::entity::EntityOffline;

    fn services() -> DbServices {
        DbServices::new(
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryEntityRegistry::new()),
            Arc::new(ConnectionFaultDetector::new(RetryConfig::default())),
            AccountsConfig::default(),
        )
    }

    #[test]
    fn test_serial_key_prefers_dbid() {
        assert_eq!(SerialKey::for_entity(7, 3), Some(SerialKey::Dbid(7)));
        assert_eq!(SerialKey::for_entity(0, 3), Some(SerialKey::Entity(3)));
        assert_eq!(SerialKey::for_entity(0, 0), None);
        assert_eq!(SerialKey::Dbid(7).to_string(), "dbid:7");
    }

    #[test]
    fn test_envelope_lifecycle() {
        let services = services();
        let mut task = DbTask::new(
            1,
            Endpoint::new("baseapp-1"),
            TaskRequest::EntityOffline(EntityOffline {
                dbid: 9,
                entity_type: 1,
            }),
        );
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.serial_key(), Some(SerialKey::Dbid(9)));

        assert_eq!(task.run_background(&services), BackgroundOutcome::Done);
        assert_eq!(task.state(), TaskState::Running);
        assert_eq!(task.attempts(), 1);

        assert!(task.complete(services.db_index()).is_none());
        assert!(task.state().is_terminal());
        assert!(task.submitted_at() <= Utc::now());
        assert!(task.elapsed_ms() < 60_000);
    }
}
