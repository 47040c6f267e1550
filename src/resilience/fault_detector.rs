//! # Connection Fault Detector
//!
//! Splits backend failures into transient connectivity loss and logical failures.
//! A transient failure triggers the backend's reconnect procedure and turns the
//! calling task's background phase into a RETRY.
//!
//! ## Reconnect once per loss
//!
//! Every worker snapshots the detector's connection generation before it calls
//! into the store. When several workers fail on the same dropped connection they
//! all carry the same snapshot; the first one through the reconnect lock calls
//! `reconnect()` and advances the generation, the rest see the newer generation
//! and skip straight to RETRY.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::database::{EntityStore, MysqlErrorCode, StoreError};
use crate::logging::log_database_operation;

/// How a store failure must be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    /// Connection-loss class; retried after reconnect, never surfaced
    Transient,
    /// Surfaced to the caller as a failure and never retried
    Logical,
}

/// Result of handing a failed store call to the detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Background phase must report RETRY
    Transient,
    /// Background phase must record the failure and report DONE
    Logical(StoreError),
}

impl Fault {
    pub fn is_transient(&self) -> bool {
        matches!(self, Fault::Transient)
    }
}

/// Observed health of the backend connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionHealth {
    Healthy = 0,
    Reconnecting = 1,
    Down = 2,
}

impl From<u8> for ConnectionHealth {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionHealth::Healthy,
            1 => ConnectionHealth::Reconnecting,
            _ => ConnectionHealth::Down,
        }
    }
}

/// Detects connection loss and drives reconnection of one backend
#[derive(Debug)]
pub struct ConnectionFaultDetector {
    retry: RetryConfig,
    generation: AtomicU64,
    consecutive_failures: AtomicU32,
    total_reconnects: AtomicU64,
    health: AtomicU8,
    reconnect_lock: Mutex<()>,
}

impl ConnectionFaultDetector {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            generation: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            total_reconnects: AtomicU64::new(0),
            health: AtomicU8::new(ConnectionHealth::Healthy as u8),
            reconnect_lock: Mutex::new(()),
        }
    }

    /// Classify a store error without side effects
    pub fn classify(error: &StoreError) -> FaultClass {
        match error {
            StoreError::ConnectionLost { .. } => FaultClass::Transient,
            StoreError::Backend {
                code: Some(code), ..
            } if MysqlErrorCode::is_lost_connection(*code) => FaultClass::Transient,
            _ => FaultClass::Logical,
        }
    }

    pub fn is_transient(error: &StoreError) -> bool {
        Self::classify(error) == FaultClass::Transient
    }

    /// Connection generation to snapshot before calling into the store
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn health(&self) -> ConnectionHealth {
        ConnectionHealth::from(self.health.load(Ordering::Acquire))
    }

    /// Reconnect attempts made over the detector's lifetime
    pub fn total_reconnects(&self) -> u64 {
        self.total_reconnects.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Delay a RETRY must wait before its next background attempt.
    ///
    /// Never below the base delay: a reconnect can succeed while calls on the
    /// new connection keep failing.
    pub fn retry_delay(&self) -> Duration {
        let floor = Duration::from_millis(self.retry.reconnect_base_delay_ms);
        self.retry
            .delay_for_attempt(self.consecutive_failures())
            .max(floor)
    }

    /// Inspect a failed call made while `observed_generation` was current.
    ///
    /// Transient errors reconnect `store` at most once per generation and yield
    /// [`Fault::Transient`]; anything else is returned as [`Fault::Logical`].
    pub fn inspect<S: EntityStore + ?Sized>(
        &self,
        store: &S,
        observed_generation: u64,
        error: StoreError,
    ) -> Fault {
        if Self::classify(&error) == FaultClass::Logical {
            debug!(backend = store.name(), error = %error, "Logical store failure");
            return Fault::Logical(error);
        }

        let _guard = self.reconnect_lock.lock();
        if self.generation() != observed_generation {
            debug!(
                backend = store.name(),
                observed_generation,
                current_generation = self.generation(),
                "🔁 Connection already re-established by another worker"
            );
            return Fault::Transient;
        }

        warn!(
            backend = store.name(),
            db_index = store.db_index(),
            error = %error,
            "🔌 Backend connection lost, reconnecting"
        );
        self.health
            .store(ConnectionHealth::Reconnecting as u8, Ordering::Release);
        self.total_reconnects.fetch_add(1, Ordering::AcqRel);

        let started = Instant::now();
        let reconnected = store.reconnect();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        log_database_operation(
            "reconnect",
            store.name(),
            None,
            if reconnected.is_ok() { "ok" } else { "failed" },
            Some(elapsed_ms),
            reconnected.as_ref().err().map(ToString::to_string).as_deref(),
        );

        match reconnected {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.health
                    .store(ConnectionHealth::Healthy as u8, Ordering::Release);
                info!(backend = store.name(), "🟢 Backend connection re-established");
            }
            Err(reconnect_error) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                self.health
                    .store(ConnectionHealth::Down as u8, Ordering::Release);
                error!(
                    backend = store.name(),
                    consecutive_failures = failures,
                    retry_in_ms = self.retry.delay_for_attempt(failures).as_millis() as u64,
                    error = %reconnect_error,
                    "🔴 Backend reconnect failed"
                );
            }
        }

        // Failed attempts advance the generation too, so the next failing call
        // after the backoff makes a fresh attempt.
        self.generation.fetch_add(1, Ordering::AcqRel);
        Fault::Transient
    }
}

impl Default for ConnectionFaultDetector {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
