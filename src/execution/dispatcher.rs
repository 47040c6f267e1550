//! # Task Dispatcher
//!
//! Accepts tasks from any thread, runs background phases on a bounded worker
//! pool and funnels every finished task through one completion loop.
//!
//! ## Architecture
//!
//! ```text
//! submit() → inbound queue → [serializer] → worker (spawn_blocking, semaphore)
//!                                 ▲                     │ DONE      │ RETRY
//!                                 │                     ▼           └→ backoff, rerun
//!                                 └──── release ── completion loop → ResultSink
//! ```
//!
//! A task's entity slot is released only after its completion phase has run,
//! so the next task for the same entity observes every effect of the previous
//! one, including the result it sent.
//!
//! A worker that panics is reported to the completion loop as aborted; its
//! slot is released and no result is sent.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use dbmgr_core::config::DbmgrConfig;
//! use dbmgr_core::database::MemoryStore;
//! use dbmgr_core::execution::Dispatcher;
//! use dbmgr_core::messaging::{ChannelResultSink, Endpoint};
//! use dbmgr_core::registry::InMemoryEntityRegistry;
//!
//! # tokio_test::block_on(async {
//! let sink = Arc::new(ChannelResultSink::new());
//! let mut inbox = sink.connect(Endpoint::new("baseapp-1"));
//! let dispatcher = Dispatcher::start(
//!     &DbmgrConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(InMemoryEntityRegistry::new()),
//!     sink,
//! );
//!
//! let payload = br#"{"task": "entity_auto_load", "entity_type": 2, "start": 0, "end": 10}"#;
//! dispatcher
//!     .submit_payload(Endpoint::new("baseapp-1"), payload)
//!     .await
//!     .unwrap();
//!
//! let reply = inbox.recv().await.unwrap();
//! assert!(reply.result_code().is_success());
//! dispatcher.shutdown().await;
//! # });
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::serializer::{Admission, TaskSerializer};
use super::task::{BackgroundOutcome, DbServices, DbTask, SerialKey, TaskId};
use crate::config::DbmgrConfig;
use crate::database::StoreBackend;
use crate::error::DispatchError;
use crate::logging::{log_error, log_task_operation};
use crate::messaging::{Endpoint, ResultSink};
use crate::registry::EntityRegistry;
use crate::resilience::ConnectionFaultDetector;
use crate::tasks::TaskRequest;

/// Events consumed by the completion loop
#[derive(Debug)]
enum CompletionEvent {
    /// Background phase ended DONE
    Finished(DbTask),
    /// Background phase panicked; release the slot without a result
    Aborted {
        task_id: TaskId,
        key: Option<SerialKey>,
    },
    Shutdown,
}

/// State shared by the loops and workers
struct DispatcherShared {
    services: DbServices,
    serializer: TaskSerializer<DbTask>,
    semaphore: Arc<Semaphore>,
    completion_sender: mpsc::Sender<CompletionEvent>,
    /// Admitted tasks whose completion phase has not run yet
    in_flight: AtomicUsize,
    idle: Notify,
}

impl DispatcherShared {
    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Runs database tasks for one backend
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
    inbound: RwLock<Option<mpsc::Sender<DbTask>>>,
    inbound_capacity: usize,
    next_task_id: AtomicU64,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("services", &self.shared.services)
            .field("inbound_capacity", &self.inbound_capacity)
            .field("in_flight", &self.in_flight())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

impl Dispatcher {
    /// Start the inbound and completion loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &DbmgrConfig,
        store: Arc<dyn StoreBackend>,
        registry: Arc<dyn EntityRegistry>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let detector = Arc::new(ConnectionFaultDetector::new(config.retry.clone()));
        let services = DbServices::new(store, registry, detector, config.accounts.clone());

        let dispatcher_config = &config.dispatcher;
        let (inbound_sender, inbound_receiver) =
            mpsc::channel(dispatcher_config.inbound_queue_capacity);
        let (completion_sender, completion_receiver) =
            mpsc::channel(dispatcher_config.completion_queue_capacity);

        let shared = Arc::new(DispatcherShared {
            services,
            serializer: TaskSerializer::new(),
            semaphore: Arc::new(Semaphore::new(dispatcher_config.worker_count)),
            completion_sender,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        info!(
            backend = shared.services.store().name(),
            db_index = shared.services.db_index(),
            worker_count = dispatcher_config.worker_count,
            inbound_capacity = dispatcher_config.inbound_queue_capacity,
            "🚀 Database task dispatcher starting"
        );

        let inbound_loop = tokio::spawn(Self::run_inbound(Arc::clone(&shared), inbound_receiver));
        let completion_loop = tokio::spawn(Self::run_completion(
            Arc::clone(&shared),
            completion_receiver,
            sink,
        ));

        Self {
            shared,
            inbound: RwLock::new(Some(inbound_sender)),
            inbound_capacity: dispatcher_config.inbound_queue_capacity,
            next_task_id: AtomicU64::new(1),
            loops: Mutex::new(vec![inbound_loop, completion_loop]),
        }
    }

    /// Submit a task, waiting for inbound capacity
    pub async fn submit(
        &self,
        requester: Endpoint,
        request: TaskRequest,
    ) -> Result<TaskId, DispatchError> {
        let sender = self.sender()?;
        let task = self.envelope(requester, request);
        let task_id = task.id();

        if sender.send(task).await.is_err() {
            self.shared.finish_one();
            return Err(DispatchError::ShutDown);
        }
        Ok(task_id)
    }

    /// Submit a task without waiting; a full inbound queue is reported to the caller
    pub fn try_submit(
        &self,
        requester: Endpoint,
        request: TaskRequest,
    ) -> Result<TaskId, DispatchError> {
        let sender = self.sender()?;
        let task = self.envelope(requester, request);
        let task_id = task.id();

        match sender.try_send(task) {
            Ok(()) => Ok(task_id),
            Err(TrySendError::Full(_)) => {
                self.shared.finish_one();
                warn!(
                    capacity = self.inbound_capacity,
                    "Inbound task queue is full, rejecting task"
                );
                Err(DispatchError::QueueFull {
                    capacity: self.inbound_capacity,
                })
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.finish_one();
                Err(DispatchError::ShutDown)
            }
        }
    }

    /// Decode a request payload and submit it
    pub async fn submit_payload(
        &self,
        requester: Endpoint,
        payload: &[u8],
    ) -> Result<TaskId, DispatchError> {
        let request = TaskRequest::decode(payload).map_err(|e| {
            warn!(requester = %requester, error = %e, "Dropping undecodable task request");
            DispatchError::MalformedRequest(e.to_string())
        })?;
        self.submit(requester, request).await
    }

    /// Wait until every admitted task has run its completion phase
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting tasks, drain the ones already admitted and stop the loops
    pub async fn shutdown(&self) {
        let sender = self.inbound.write().take();
        if sender.is_none() {
            debug!("Dispatcher already shut down");
            return;
        }
        drop(sender);

        info!(
            in_flight = self.in_flight(),
            "🛑 Dispatcher draining in-flight tasks"
        );
        self.wait_idle().await;

        if self
            .shared
            .completion_sender
            .send(CompletionEvent::Shutdown)
            .await
            .is_err()
        {
            warn!("Completion loop already stopped");
        }

        let loops = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatcher loop ended abnormally");
            }
        }
        info!("✅ Dispatcher stopped");
    }

    pub fn is_accepting(&self) -> bool {
        self.inbound.read().is_some()
    }

    /// Tasks admitted but not yet completed, including queued ones
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Entities with a task currently in flight
    pub fn busy_entities(&self) -> usize {
        self.shared.serializer.busy_keys()
    }

    pub fn detector(&self) -> &Arc<ConnectionFaultDetector> {
        self.shared.services.detector()
    }

    pub fn services(&self) -> &DbServices {
        &self.shared.services
    }

    fn sender(&self) -> Result<mpsc::Sender<DbTask>, DispatchError> {
        self.inbound.read().clone().ok_or(DispatchError::ShutDown)
    }

    fn envelope(&self, requester: Endpoint, request: TaskRequest) -> DbTask {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        DbTask::new(task_id, requester, request)
    }

    async fn run_inbound(shared: Arc<DispatcherShared>, mut receiver: mpsc::Receiver<DbTask>) {
        while let Some(task) = receiver.recv().await {
            let task_id = task.id();
            let kind = task.kind();
            let key = task.serial_key();

            match shared.serializer.admit(key, task) {
                Admission::Run(task) => {
                    log_task_operation(
                        "admit",
                        task_id,
                        kind,
                        key.map(|k| k.to_string()).as_deref(),
                        "running",
                        None,
                    );
                    Self::spawn_worker(&shared, task);
                }
                Admission::Queued { position } => {
                    log_task_operation(
                        "admit",
                        task_id,
                        kind,
                        key.map(|k| k.to_string()).as_deref(),
                        "queued",
                        Some(&format!("position {position}")),
                    );
                }
            }
        }
        debug!("Inbound queue closed, inbound loop exiting");
    }

    fn spawn_worker(shared: &Arc<DispatcherShared>, task: DbTask) {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let task_id = task.id();
            let key = task.serial_key();
            let mut task = task;

            loop {
                let permit = match Arc::clone(&shared.semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!(task_id, error = %e, "Worker semaphore closed");
                        Self::report(&shared, CompletionEvent::Aborted { task_id, key }).await;
                        return;
                    }
                };

                let services = shared.services.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    let outcome = task.run_background(&services);
                    (task, outcome)
                })
                .await;

                // Free the worker before waiting on the completion queue
                drop(permit);

                match joined {
                    Ok((finished, BackgroundOutcome::Done)) => {
                        Self::report(&shared, CompletionEvent::Finished(finished)).await;
                        return;
                    }
                    Ok((retrying, BackgroundOutcome::Retry)) => {
                        task = retrying;
                        let delay = shared.services.detector().retry_delay();
                        debug!(
                            task_id,
                            attempts = task.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            "Re-running background phase"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(join_error) => {
                        let panic_message = if join_error.is_panic() {
                            "background phase panicked"
                        } else {
                            "background phase was cancelled"
                        };
                        log_error(
                            "dispatcher",
                            "background_phase",
                            panic_message,
                            Some(&format!("task {task_id}: {join_error}")),
                        );
                        Self::report(&shared, CompletionEvent::Aborted { task_id, key }).await;
                        return;
                    }
                }
            }
        });
    }

    async fn report(shared: &Arc<DispatcherShared>, event: CompletionEvent) {
        if let Err(mpsc::error::SendError(event)) = shared.completion_sender.send(event).await {
            error!(event = ?event, "Completion loop is gone, task dropped");
            shared.finish_one();
        }
    }

    async fn run_completion(
        shared: Arc<DispatcherShared>,
        mut receiver: mpsc::Receiver<CompletionEvent>,
        sink: Arc<dyn ResultSink>,
    ) {
        let db_index = shared.services.db_index();

        while let Some(event) = receiver.recv().await {
            match event {
                CompletionEvent::Finished(mut task) => {
                    let key = task.serial_key();
                    let reply = task.complete(db_index);

                    let status = match reply {
                        Some(reply) => {
                            let message_name = reply.message.name();
                            match sink.send(&reply.recipient, reply.message) {
                                Ok(()) => "replied",
                                Err(e) => {
                                    error!(
                                        task_id = task.id(),
                                        message = message_name,
                                        error = %e,
                                        "Result dropped, recipient unreachable"
                                    );
                                    "reply_dropped"
                                }
                            }
                        }
                        None => "completed",
                    };
                    log_task_operation(
                        "complete",
                        task.id(),
                        task.kind(),
                        key.map(|k| k.to_string()).as_deref(),
                        status,
                        Some(&format!(
                            "attempts {}, {}ms since submit",
                            task.attempts(),
                            task.elapsed_ms()
                        )),
                    );
                    drop(task);

                    Self::release(&shared, key);
                    shared.finish_one();
                }
                CompletionEvent::Aborted { task_id, key } => {
                    warn!(task_id, "Releasing slot of aborted task");
                    Self::release(&shared, key);
                    shared.finish_one();
                }
                CompletionEvent::Shutdown => break,
            }
        }
        debug!("Completion loop exiting");
    }

    fn release(shared: &Arc<DispatcherShared>, key: Option<SerialKey>) {
        let Some(key) = key else {
            return;
        };
        if let Some(next) = shared.serializer.release(&key) {
            debug!(key = %key, task_id = next.id(), "Starting next queued task");
            Self::spawn_worker(shared, next);
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for handle in self.loops.get_mut().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryStore;
    use crate::messaging::{ChannelResultSink, OutboundMessage};
    use crate::registry::InMemoryEntityRegistry;
    use crate::tasks::entity::WriteEntity;

    fn write(entity_id: i32, callback_id: u64) -> TaskRequest {
        TaskRequest::WriteEntity(WriteEntity::new(
            1,
            entity_id,
            0,
            1,
            callback_id,
            None,
            b"blob".to_vec(),
        ))
    }

    #[tokio::test]
    async fn test_submit_runs_and_replies() {
        let sink = Arc::new(ChannelResultSink::new());
        let requester = Endpoint::new("baseapp-1");
        let mut inbox = sink.connect(requester.clone());

        let dispatcher = Dispatcher::start(
            &DbmgrConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryEntityRegistry::new()),
            sink,
        );
        dispatcher.submit(requester, write(5, 77)).await.unwrap();
        dispatcher.wait_idle().await;

        match inbox.recv().await.unwrap() {
            OutboundMessage::WriteEntityResult {
                callback_id,
                success,
                dbid,
                ..
            } => {
                assert_eq!(callback_id, 77);
                assert!(success);
                assert!(dbid > 0);
            }
            other => panic!("unexpected message {other:?}"),
        }
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let dispatcher = Dispatcher::start(
            &DbmgrConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryEntityRegistry::new()),
            Arc::new(ChannelResultSink::new()),
        );
        dispatcher.shutdown().await;
        assert!(!dispatcher.is_accepting());

        let err = dispatcher
            .submit(Endpoint::new("baseapp-1"), write(1, 0))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::ShutDown);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected() {
        let dispatcher = Dispatcher::start(
            &DbmgrConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryEntityRegistry::new()),
            Arc::new(ChannelResultSink::new()),
        );
        let err = dispatcher
            .submit_payload(Endpoint::new("baseapp-1"), b"{\"task\": \"no_such_task\"}")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MalformedRequest(_)));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_try_submit_reports_full_queue() {
        let sink = Arc::new(ChannelResultSink::new());
        let requester = Endpoint::new("baseapp-1");
        let mut inbox = sink.connect(requester.clone());

        let mut config = DbmgrConfig::default();
        config.dispatcher.inbound_queue_capacity = 2;
        let dispatcher = Dispatcher::start(
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryEntityRegistry::new()),
            sink,
        );

        // The inbound loop cannot drain until this test yields
        dispatcher.try_submit(requester.clone(), write(1, 1)).unwrap();
        dispatcher.try_submit(requester.clone(), write(2, 2)).unwrap();
        let err = dispatcher.try_submit(requester, write(3, 3)).unwrap_err();
        assert_eq!(err, DispatchError::QueueFull { capacity: 2 });
        assert_eq!(dispatcher.in_flight(), 2);

        dispatcher.wait_idle().await;
        assert_eq!(dispatcher.in_flight(), 0);
        let mut callbacks = Vec::new();
        for _ in 0..2 {
            match inbox.recv().await.unwrap() {
                OutboundMessage::WriteEntityResult { callback_id, .. } => callbacks.push(callback_id),
                other => panic!("unexpected message {other:?}"),
            }
        }
        callbacks.sort_unstable();
        assert_eq!(callbacks, vec![1, 2]);
        assert!(inbox.try_recv().is_err());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_recipient_does_not_stall_dispatch() {
        let dispatcher = Dispatcher::start(
            &DbmgrConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryEntityRegistry::new()),
            Arc::new(ChannelResultSink::new()),
        );
        for callback_id in 1..=4u64 {
            dispatcher
                .submit(Endpoint::new("gone"), write(7, callback_id))
                .await
                .unwrap();
        }
        dispatcher.wait_idle().await;
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(dispatcher.busy_entities(), 0);
        dispatcher.shutdown().await;
    }
}
