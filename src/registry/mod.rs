//! # Registry Infrastructure
//!
//! The entity registry ("online log") enforces the single-active-instance rule
//! for persisted entities: loading, logging in and destructive by-DBID tasks all
//! consult it before acting.
//!
//! ## Usage
//!
//! ```rust
//! use dbmgr_core::messaging::Endpoint;
//! use dbmgr_core::registry::{EntityHolder, EntityRegistry, InMemoryEntityRegistry, LogOutcome};
//!
//! let registry = InMemoryEntityRegistry::new();
//! let node_a = EntityHolder::new(1, 100, Endpoint::new("10.0.0.1:20015"));
//! let node_b = EntityHolder::new(2, 200, Endpoint::new("10.0.0.2:20015"));
//!
//! assert_eq!(registry.log_entity(7, 1, node_a.clone()).unwrap(), LogOutcome::Logged);
//! assert_eq!(
//!     registry.log_entity(7, 1, node_b).unwrap(),
//!     LogOutcome::AlreadyHeld(node_a)
//! );
//! ```

pub mod entity_registry;

pub use entity_registry::{
    EntityHolder, EntityRegistry, InMemoryEntityRegistry, LogOutcome, RegistryEntry,
};
