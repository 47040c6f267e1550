//! Shared fixtures for the dispatcher integration tests.
//!
//! [`TestCluster`] starts a real [`Dispatcher`] over an in-memory store and
//! registry. Both are wrapped so a test can drop the "connection" on demand,
//! either before a call reaches the backend or after it was applied and only
//! the reply was lost.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dbmgr_core::config::DbmgrConfig;
use dbmgr_core::constants::{AccountFlags, VerificationPurpose};
use dbmgr_core::database::{
    AccountRecord, AccountTable, Dbid, EntityStore, EntityTypeId, MemoryStore, QueryRows,
    StoreBackend, StoreError, StoreResult, VerificationRecord, VerificationTable,
};
use dbmgr_core::execution::{Dispatcher, TaskId};
use dbmgr_core::messaging::{ChannelResultSink, Endpoint, OutboundMessage, ResultSink};
use dbmgr_core::registry::{EntityHolder, EntityRegistry, InMemoryEntityRegistry, LogOutcome};
use dbmgr_core::tasks::TaskRequest;
use tokio::sync::mpsc::UnboundedReceiver;

/// Initialize test logging once; later calls are no-ops
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("dbmgr_core=debug")
        .with_test_writer()
        .try_init();
}

/// Connection faults queued for the next backend calls
#[derive(Debug, Default)]
pub struct FaultPlan {
    pass: AtomicUsize,
    down: AtomicBool,
    fail_before: AtomicUsize,
    fail_after: AtomicUsize,
    injected: AtomicUsize,
}

impl FaultPlan {
    /// Let the next `calls` backend calls through before any queued fault fires
    pub fn pass_next_calls(&self, calls: usize) {
        self.pass.store(calls, Ordering::SeqCst);
    }

    /// While down, every call and every reconnect fails
    pub fn set_backend_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }
    /// The next `calls` backend calls fail without being applied
    pub fn drop_next_calls(&self, calls: usize) {
        self.fail_before.store(calls, Ordering::SeqCst);
    }

    /// The next `calls` backend calls are applied, then report a lost connection
    pub fn drop_next_replies(&self, calls: usize) {
        self.fail_after.store(calls, Ordering::SeqCst);
    }

    /// Faults injected so far
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn lost(&self, when: &str) -> StoreError {
        self.injected.fetch_add(1, Ordering::SeqCst);
        StoreError::ConnectionLost {
            reason: format!("injected fault {when} call"),
        }
    }

    fn guard<T>(&self, call: impl FnOnce() -> StoreResult<T>) -> StoreResult<T> {
        if self.is_down() {
            return Err(self.lost("while down, before"));
        }
        if Self::take(&self.pass) {
            return call();
        }
        if Self::take(&self.fail_before) {
            return Err(self.lost("before"));
        }
        let result = call()?;
        if Self::take(&self.fail_after) {
            return Err(self.lost("after"));
        }
        Ok(result)
    }
}

/// [`MemoryStore`] behind an unreliable connection
pub struct FlakyStore {
    pub inner: MemoryStore,
    plan: Arc<FaultPlan>,
}

impl FlakyStore {
    pub fn new(plan: Arc<FaultPlan>) -> Self {
        Self {
            inner: MemoryStore::new(),
            plan,
        }
    }
}

impl EntityStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky-memory"
    }

    fn query(&self, command: &[u8]) -> StoreResult<QueryRows> {
        self.plan.guard(|| self.inner.query(command))
    }

    fn write_entity(
        &self,
        dbid: Dbid,
        autoload: Option<bool>,
        payload: &[u8],
        entity_type: EntityTypeId,
    ) -> StoreResult<Dbid> {
        self.plan
            .guard(|| self.inner.write_entity(dbid, autoload, payload, entity_type))
    }

    fn query_entity(&self, dbid: Dbid, entity_type: EntityTypeId) -> StoreResult<Option<Vec<u8>>> {
        self.plan.guard(|| self.inner.query_entity(dbid, entity_type))
    }

    fn remove_entity(&self, dbid: Dbid, entity_type: EntityTypeId) -> StoreResult<bool> {
        self.plan.guard(|| self.inner.remove_entity(dbid, entity_type))
    }

    fn query_autoload_entities(
        &self,
        entity_type: EntityTypeId,
        start: usize,
        end: usize,
    ) -> StoreResult<Vec<Dbid>> {
        self.plan
            .guard(|| self.inner.query_autoload_entities(entity_type, start, end))
    }

    fn reconnect(&self) -> StoreResult<()> {
        self.inner.reconnect()?;
        if self.plan.is_down() {
            return Err(StoreError::ConnectionLost {
                reason: "backend still unreachable".to_string(),
            });
        }
        Ok(())
    }
}

impl AccountTable for FlakyStore {
    fn query_account(&self, name: &str) -> StoreResult<Option<AccountRecord>> {
        self.plan.guard(|| self.inner.query_account(name))
    }

    fn log_account(&self, record: &AccountRecord) -> StoreResult<()> {
        self.plan.guard(|| self.inner.log_account(record))
    }

    fn set_flags_deadline(&self, name: &str, flags: AccountFlags, deadline: u64) -> StoreResult<bool> {
        self.plan
            .guard(|| self.inner.set_flags_deadline(name, flags, deadline))
    }

    fn update_password(&self, name: &str, password_digest: &str) -> StoreResult<bool> {
        self.plan
            .guard(|| self.inner.update_password(name, password_digest))
    }

    fn update_login_count(&self, name: &str, dbid: Dbid) -> StoreResult<bool> {
        self.plan.guard(|| self.inner.update_login_count(name, dbid))
    }

    fn set_email(&self, name: &str, email: &str) -> StoreResult<bool> {
        self.plan.guard(|| self.inner.set_email(name, email))
    }

    fn set_dbid(&self, name: &str, dbid: Dbid) -> StoreResult<bool> {
        self.plan.guard(|| self.inner.set_dbid(name, dbid))
    }
}

impl VerificationTable for FlakyStore {
    fn log_verification(&self, record: &VerificationRecord) -> StoreResult<()> {
        self.plan.guard(|| self.inner.log_verification(record))
    }

    fn take_verification(
        &self,
        code: &str,
        purpose: VerificationPurpose,
    ) -> StoreResult<Option<VerificationRecord>> {
        self.plan.guard(|| self.inner.take_verification(code, purpose))
    }
}

/// [`InMemoryEntityRegistry`] sharing the store's unreliable connection
pub struct FlakyRegistry {
    pub inner: InMemoryEntityRegistry,
    plan: Arc<FaultPlan>,
}

impl EntityRegistry for FlakyRegistry {
    fn log_entity(
        &self,
        dbid: Dbid,
        entity_type: EntityTypeId,
        holder: EntityHolder,
    ) -> StoreResult<LogOutcome> {
        self.plan
            .guard(|| self.inner.log_entity(dbid, entity_type, holder))
    }

    fn query_entity(&self, dbid: Dbid, entity_type: EntityTypeId) -> StoreResult<Option<EntityHolder>> {
        self.plan.guard(|| self.inner.query_entity(dbid, entity_type))
    }

    fn erase_entity(&self, dbid: Dbid, entity_type: EntityTypeId) -> StoreResult<bool> {
        self.plan.guard(|| self.inner.erase_entity(dbid, entity_type))
    }
}

/// A running dispatcher with every collaborator reachable from the test
pub struct TestCluster {
    pub dispatcher: Dispatcher,
    pub sink: Arc<ChannelResultSink>,
    pub store: Arc<FlakyStore>,
    pub registry: Arc<FlakyRegistry>,
    pub faults: Arc<FaultPlan>,
}

impl TestCluster {
    pub fn start() -> Self {
        Self::start_with(DbmgrConfig::default())
    }

    pub fn start_with(config: DbmgrConfig) -> Self {
        init_test_logging();

        let faults = Arc::new(FaultPlan::default());
        let store = Arc::new(FlakyStore::new(Arc::clone(&faults)));
        let registry = Arc::new(FlakyRegistry {
            inner: InMemoryEntityRegistry::new(),
            plan: Arc::clone(&faults),
        });
        let sink = Arc::new(ChannelResultSink::new());

        let dispatcher = Dispatcher::start(
            &config,
            Arc::clone(&store) as Arc<dyn StoreBackend>,
            Arc::clone(&registry) as Arc<dyn EntityRegistry>,
            Arc::clone(&sink) as Arc<dyn ResultSink>,
        );

        Self {
            dispatcher,
            sink,
            store,
            registry,
            faults,
        }
    }

    pub fn connect(&self, endpoint: &str) -> UnboundedReceiver<OutboundMessage> {
        self.sink.connect(Endpoint::new(endpoint))
    }

    pub async fn submit(&self, requester: &str, request: TaskRequest) -> TaskId {
        self.dispatcher
            .submit(Endpoint::new(requester), request)
            .await
            .expect("dispatcher accepts tasks")
    }

    /// Submit and wait for the one reply addressed to `requester`
    pub async fn call(
        &self,
        requester: &str,
        inbox: &mut UnboundedReceiver<OutboundMessage>,
        request: TaskRequest,
    ) -> OutboundMessage {
        self.submit(requester, request).await;
        next_message(inbox).await
    }
}

/// Next message on `inbox`, failing the test after a generous timeout
pub async fn next_message(inbox: &mut UnboundedReceiver<OutboundMessage>) -> OutboundMessage {
    tokio::time::timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("reply within five seconds")
        .expect("sink channel open")
}
