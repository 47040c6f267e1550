//! # Database Manager Configuration
//!
//! Typed configuration for the dispatcher, the reconnect backoff and account
//! policy. Every section has working defaults, so an embedded dispatcher can be
//! built from `DbmgrConfig::default()` and a deployed one from a TOML file.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dbmgr_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load_from_file("config/dbmgr.toml", "production")?;
//! let workers = manager.config().dispatcher.worker_count;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{AccountFlags, AccountType};
use crate::database::EntityTypeId;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring dbmgr.toml
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DbmgrConfig {
    /// Worker pool and queue sizing
    pub dispatcher: DispatcherConfig,

    /// Pacing of re-submissions after a lost backend connection
    pub retry: RetryConfig,

    /// Account creation and login policy
    pub accounts: AccountsConfig,
}

impl DbmgrConfig {
    /// Reject values the dispatcher cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.dispatcher.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.worker_count",
                self.dispatcher.worker_count,
                "at least one worker is required",
            ));
        }
        if self.dispatcher.inbound_queue_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.inbound_queue_capacity",
                self.dispatcher.inbound_queue_capacity,
                "queue capacity must be positive",
            ));
        }
        if self.dispatcher.completion_queue_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.completion_queue_capacity",
                self.dispatcher.completion_queue_capacity,
                "queue capacity must be positive",
            ));
        }
        if self.retry.reconnect_base_delay_ms > self.retry.reconnect_max_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "retry.reconnect_base_delay_ms",
                self.retry.reconnect_base_delay_ms,
                "base delay exceeds retry.reconnect_max_delay_ms",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "retry.backoff_multiplier",
                self.retry.backoff_multiplier,
                "multiplier must be >= 1.0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of background phases allowed to run at once
    pub worker_count: usize,
    /// Tasks accepted but not yet handed to the serializer
    pub inbound_queue_capacity: usize,
    /// Finished background phases waiting for the completion context
    pub completion_queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            inbound_queue_capacity: 1024,
            completion_queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Delay before the given (1-based) consecutive failed reconnect is retried
    pub fn delay_for_attempt(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = consecutive_failures.saturating_sub(1).min(32) as i32;
        let millis = (self.reconnect_base_delay_ms as f64) * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.reconnect_max_delay_ms as f64) as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Flags given to accounts created without a verification step
    pub default_flags: AccountFlags,
    /// Account lifetime in seconds, 0 means no expiry
    pub default_deadline_secs: u64,
    pub account_type: AccountType,
    /// Create unknown accounts on first login
    pub auto_create_on_not_found: bool,
    /// Create unknown accounts on first login when the external authenticator vouched
    pub auto_create_on_external_auth: bool,
    /// An external authenticator sits in front of the login gateway
    pub external_authenticator_enabled: bool,
    /// Entity type of the entity backing every account
    pub account_entity_type: EntityTypeId,
}

impl AccountsConfig {
    /// Whether a login for an unknown account may create it.
    ///
    /// The two switches are independent: either one allows creation.
    pub fn auto_create_allowed(&self, vouched: bool) -> bool {
        self.auto_create_on_not_found
            || (self.auto_create_on_external_auth && self.external_authenticator_enabled && vouched)
    }

    /// Whether the stored digest check can be skipped for this login
    pub fn skip_digest_check(&self, vouched: bool) -> bool {
        self.external_authenticator_enabled && vouched
    }

    /// Absolute deadline for an account created now, 0 for never
    pub fn deadline_from_now(&self) -> u64 {
        if self.default_deadline_secs == 0 {
            return 0;
        }
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        now.saturating_add(self.default_deadline_secs)
    }
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            default_flags: AccountFlags::NORMAL,
            default_deadline_secs: 0,
            account_type: AccountType::Normal,
            auto_create_on_not_found: false,
            auto_create_on_external_auth: true,
            external_authenticator_enabled: false,
            account_entity_type: 1,
        }
    }
}
