//! # Per-Entity Task Serializer
//!
//! FIFO admission keyed by [`SerialKey`]. A key present in the map is busy: one
//! task holding it is in flight and the queue holds the ones waiting behind it.
//! The lock is held only for the map mutation, never across store calls.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::task::SerialKey;

/// Result of admitting a task
#[derive(Debug)]
pub enum Admission<T> {
    /// The caller must start the task now
    Run(T),
    /// The task waits behind `position` others for the same key
    Queued { position: usize },
}

/// Ordered admission of tasks that share an entity
#[derive(Debug)]
pub struct TaskSerializer<T> {
    queues: Mutex<HashMap<SerialKey, VecDeque<T>>>,
}

impl<T> TaskSerializer<T> {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a task. Tasks without a key always run.
    pub fn admit(&self, key: Option<SerialKey>, task: T) -> Admission<T> {
        let Some(key) = key else {
            return Admission::Run(task);
        };

        let mut queues = self.queues.lock();
        match queues.get_mut(&key) {
            Some(waiting) => {
                waiting.push_back(task);
                Admission::Queued {
                    position: waiting.len(),
                }
            }
            None => {
                queues.insert(key, VecDeque::new());
                Admission::Run(task)
            }
        }
    }

    /// Called once the in-flight task for `key` has finished its completion
    /// phase. Returns the next task to start; the key stays busy while one is
    /// returned and is cleared otherwise.
    pub fn release(&self, key: &SerialKey) -> Option<T> {
        let mut queues = self.queues.lock();
        let next = queues.get_mut(key).and_then(VecDeque::pop_front);
        if next.is_none() {
            queues.remove(key);
        }
        next
    }

    pub fn is_busy(&self, key: &SerialKey) -> bool {
        self.queues.lock().contains_key(key)
    }

    /// Tasks waiting behind the in-flight one for `key`
    pub fn queued(&self, key: &SerialKey) -> usize {
        self.queues.lock().get(key).map_or(0, VecDeque::len)
    }

    /// Number of keys with a task in flight
    pub fn busy_keys(&self) -> usize {
        self.queues.lock().len()
    }
}

impl<T> Default for TaskSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}
