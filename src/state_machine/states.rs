use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DbmgrError;

/// Completion state of a database task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Admitted, waiting for its entity slot or a free worker
    Pending,
    /// Background phase is executing on a worker
    Running,
    /// Completion phase has run; the task is about to be dropped
    Completed,
    /// Background phase hit a lost connection and will be re-run
    Retry,
}

impl TaskState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Check if this is an active state (task occupies a worker)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Legal edges of the task lifecycle
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Retry)
                | (Self::Running, Self::Completed)
                | (Self::Retry, Self::Running)
        )
    }

    /// Move to `next`, rejecting edges the lifecycle does not allow
    pub fn transition(&mut self, next: TaskState) -> Result<(), DbmgrError> {
        if !self.can_transition_to(next) {
            return Err(DbmgrError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "retry" => Ok(Self::Retry),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

/// Default state for newly admitted tasks
impl Default for TaskState {
    fn default() -> Self {
        Self::Pending
    }
}
