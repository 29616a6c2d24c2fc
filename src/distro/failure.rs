//! Failure Handler
//!
//! A failed batch is never resubmitted whole. It is split into one retry task
//! per resource key so that keys can succeed independently and re-batch with
//! newer, unrelated updates once their retry delay passes.

use super::delay::DelayTaskEngine;
use super::types::{CombinedKey, DistroKey, SyncAction};

use std::sync::Arc;

pub struct FailureHandler {
    engine: Arc<DelayTaskEngine>,
}

impl FailureHandler {
    pub fn new(engine: Arc<DelayTaskEngine>) -> Self {
        Self { engine }
    }

    /// Re-enqueues every key of `key` as its own delayed task and returns them.
    pub fn retry(&self, key: &CombinedKey, action: SyncAction) -> Vec<DistroKey> {
        let tasks = key.split();
        for task in &tasks {
            self.engine.add_retry_task(task.clone(), action);
        }

        tracing::warn!(
            "Sync batch #{} to {} failed, split into {} retry task(s)",
            key.sequence,
            key.target(),
            tasks.len()
        );
        tasks
    }
}
