//! Error types for the database manager core.
//!
//! Business failures (bad credential, duplicate account, entity already online)
//! are never errors at this level: they travel as a [`ServerErrorCode`] inside the
//! task result. The types here cover the plumbing around them.
//!
//! [`ServerErrorCode`]: crate::constants::ServerErrorCode

use thiserror::Error;

pub use crate::config::ConfigurationError;
pub use crate::database::StoreError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DbmgrError {
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),
    #[error("Dispatch error: {0}")]
    DispatchError(#[from] DispatchError),
    #[error("Decode error: {0}")]
    DecodeError(String),
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl From<serde_json::Error> for DbmgrError {
    fn from(error: serde_json::Error) -> Self {
        DbmgrError::DecodeError(format!("JSON request payload error: {error}"))
    }
}

/// Failures raised while admitting or routing a task
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Inbound queue is full ({capacity} pending tasks)")]
    QueueFull { capacity: usize },
    #[error("Dispatcher is shut down")]
    ShutDown,
    #[error("Request payload could not be decoded: {0}")]
    MalformedRequest(String),
}

pub type Result<T> = std::result::Result<T, DbmgrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DbmgrError::InvalidStateTransition {
            from: "completed".to_string(),
            to: "running".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from completed to running"
        );

        let err: DbmgrError = DispatchError::QueueFull { capacity: 8 }.into();
        assert_eq!(
            err.to_string(),
            "Dispatch error: Inbound queue is full (8 pending tasks)"
        );
    }

    #[test]
    fn test_json_error_becomes_decode_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: DbmgrError = json_err.into();
        assert!(matches!(err, DbmgrError::DecodeError(_)));
    }
}
