//! # Task Execution
//!
//! The two-phase task envelope, per-entity admission ordering and the
//! dispatcher that drives both.

pub mod dispatcher;
pub mod serializer;
pub mod task;

pub use dispatcher::Dispatcher;
pub use serializer::{Admission, TaskSerializer};
pub use task::{
    BackgroundOutcome, CompletionContext, DbServices, DbTask, SerialKey, Task, TaskContext, TaskId,
};
