//! # Resilience Module
//!
//! Keeps transient backend connectivity loss from turning into user-visible
//! failures. Store errors are classified; connection-loss errors reconnect the
//! backend and send the task back for another background attempt.
//!
//! ## Usage
//!
//! ```rust
//! use dbmgr_core::database::{MemoryStore, StoreError};
//! use dbmgr_core::resilience::{ConnectionFaultDetector, Fault};
//!
//! let store = MemoryStore::new();
//! let detector = ConnectionFaultDetector::default();
//!
//! let snapshot = detector.generation();
//! let fault = detector.inspect(
//!     &store,
//!     snapshot,
//!     StoreError::ConnectionLost { reason: "server has gone away".to_string() },
//! );
//! assert_eq!(fault, Fault::Transient);
//! assert_eq!(store.reconnect_count(), 1);
//! ```

pub mod fault_detector;

pub use fault_detector::{ConnectionFaultDetector, ConnectionHealth, Fault, FaultClass};
