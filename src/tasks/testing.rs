//! Runs a task's two phases inline against in-memory collaborators.

use std::sync::Arc;

use crate::config::{AccountsConfig, RetryConfig};
use crate::database::{MemoryStore, StoreBackend};
use crate::execution::{CompletionContext, DbServices, Task, TaskContext};
use crate::messaging::{Endpoint, OutboundMessage};
use crate::registry::{EntityRegistry, InMemoryEntityRegistry};
use crate::resilience::{ConnectionFaultDetector, Fault};

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub registry: Arc<InMemoryEntityRegistry>,
    pub services: DbServices,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_accounts(AccountsConfig::default())
    }

    pub fn with_accounts(accounts: AccountsConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(InMemoryEntityRegistry::new());
        let services = DbServices::new(
            Arc::clone(&store) as Arc<dyn StoreBackend>,
            Arc::clone(&registry) as Arc<dyn EntityRegistry>,
            Arc::new(ConnectionFaultDetector::new(RetryConfig::default())),
            accounts,
        );
        Self {
            store,
            registry,
            services,
        }
    }

    /// Background phase then completion phase; returns the message, if any
    pub fn run<T: Task>(&self, task: &mut T, requester: &str) -> Option<OutboundMessage> {
        let requester = Endpoint::new(requester);
        let ctx = TaskContext::new(&self.services, &requester);
        match task.run_background(&ctx) {
            Ok(()) => {}
            Err(Fault::Logical(error)) => task.record_failure(&error),
            Err(Fault::Transient) => panic!("in-memory store never loses its connection"),
        }
        let completion = CompletionContext {
            requester: &requester,
            db_index: 0,
        };
        task.completion(&completion).map(|reply| reply.message)
    }
}
