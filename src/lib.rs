#![allow(clippy::doc_markdown)] // Allow technical terms like MySQL, DBID in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Database Manager Core
//!
//! Database-access core of a clustered game server. Front-end processes submit
//! requests (write an entity, look one up, create an account, log in) and get a
//! typed result back once the request has run against the persistent store.
//!
//! ## Architecture
//!
//! Every request is a task with two phases:
//!
//! - a **background phase** on a worker thread, the only place store calls are made;
//! - a **completion phase** on the single completion loop, which builds the reply
//!   and hands it to the [`ResultSink`](messaging::ResultSink).
//!
//! A lost backend connection does not fail the task. The
//! [`ConnectionFaultDetector`](resilience::ConnectionFaultDetector) reconnects and
//! the dispatcher re-runs the background phase, so callers never see the fault.
//! Tasks that touch the same entity are run one at a time, in submission order,
//! by the [`TaskSerializer`](execution::TaskSerializer). The
//! [`EntityRegistry`](registry::EntityRegistry) records which node holds an
//! entity online and guarantees there is at most one.
//!
//! ## Module Organization
//!
//! - [`execution`] - Task contract, dispatcher and per-entity serializer
//! - [`tasks`] - The request set: entity tasks and the account lifecycle
//! - [`database`] - Store traits and the in-memory backend
//! - [`registry`] - Online log of held entities
//! - [`resilience`] - Connection fault classification and reconnect
//! - [`messaging`] - Typed results and where they are sent
//! - [`state_machine`] - Task lifecycle states
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured console and JSON file logging
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use dbmgr_core::config::DbmgrConfig;
//! use dbmgr_core::database::MemoryStore;
//! use dbmgr_core::execution::Dispatcher;
//! use dbmgr_core::messaging::{ChannelResultSink, Endpoint};
//! use dbmgr_core::registry::InMemoryEntityRegistry;
//! use dbmgr_core::tasks::{CreateAccount, TaskRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sink = Arc::new(ChannelResultSink::new());
//! let mut replies = sink.connect(Endpoint::new("loginapp-1"));
//!
//! let dispatcher = Dispatcher::start(
//!     &DbmgrConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(InMemoryEntityRegistry::new()),
//!     sink,
//! );
//!
//! let request = TaskRequest::CreateAccount(CreateAccount::new("alice", "secret", Vec::new()));
//! dispatcher.submit(Endpoint::new("loginapp-1"), request).await?;
//!
//! if let Some(reply) = replies.recv().await {
//!     println!("create_account -> {}", reply.result_code());
//! }
//! dispatcher.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod execution;
pub mod logging;
pub mod messaging;
pub mod registry;
pub mod resilience;
pub mod state_machine;
pub mod tasks;

pub use config::{AccountsConfig, DbmgrConfig, DispatcherConfig, RetryConfig};
pub use constants::{AccountFlags, AccountType, ComponentType, ServerErrorCode};
pub use error::{DbmgrError, DispatchError, Result};
pub use execution::{Dispatcher, TaskId};
pub use messaging::{Endpoint, OutboundMessage};
pub use tasks::TaskRequest;
