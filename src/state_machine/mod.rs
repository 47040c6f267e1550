// State machine module for database task execution
//
// Tracks where a task is in its two-phase life: admitted, running its
// background phase, waiting to be re-run after a lost connection, or done.

pub mod states;

pub use states::TaskState;
