//! Per-job-run counters.
//!
//! Modeled as an ordered mapping of counter name to `i64` rather than a
//! fixed struct, because counter keys are extended per task type (a
//! `<key><TaskType>` suffixed variant alongside the overall `<key>`) and by
//! log-payload-derived aggregates that this crate does not exhaustively
//! enumerate. `BTreeMap` gives deterministic iteration for row writes and
//! logging without needing a separate ordered-map dependency.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::task::TaskType;

pub const TOTAL_TASKS: &str = "TotalTasks";
pub const TASKS_COMPLETED: &str = "TasksCompleted";
pub const TASKS_FAILED: &str = "TasksFailed";
pub const TASKS_QUEUED: &str = "TasksQueued";
pub const TASKS_UNQUEUED: &str = "TasksUnqueued";

/// Recognized log-payload aggregate keys (§6, "Recognized counter keys").
pub const RECOGNIZED_PAYLOAD_KEYS: &[&str] = &[
    "bytesFound",
    "filesFound",
    "fileStatErrors",
    "bytesCopied",
    "srcBytes",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters(pub BTreeMap<String, i64>);

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> i64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    pub fn add(&mut self, key: impl Into<String>, delta: i64) {
        if delta == 0 {
            return;
        }
        *self.0.entry(key.into()).or_insert(0) += delta;
    }

    pub fn total_tasks(&self) -> i64 {
        self.get(TOTAL_TASKS)
    }

    pub fn tasks_completed(&self) -> i64 {
        self.get(TASKS_COMPLETED)
    }

    pub fn tasks_failed(&self) -> i64 {
        self.get(TASKS_FAILED)
    }

    /// Bucket counter name for a given status, e.g. `TasksQueued`.
    pub fn status_bucket(status: crate::task::TaskStatus) -> &'static str {
        use crate::task::TaskStatus::*;
        match status {
            Unqueued => TASKS_UNQUEUED,
            Queued => TASKS_QUEUED,
            Failed => TASKS_FAILED,
            Succeeded => TASKS_COMPLETED,
        }
    }

    /// `<key><TaskType>` suffixed variant, e.g. `TasksQueuedList`.
    pub fn per_type_key(key: &str, task_type: TaskType) -> String {
        format!("{key}{task_type}")
    }

    /// Checks the invariant `TotalTasks = Unqueued + Queued + Completed + Failed`.
    pub fn satisfies_total_invariant(&self) -> bool {
        self.total_tasks()
            == self.get(TASKS_UNQUEUED) + self.get(TASKS_QUEUED) + self.tasks_completed() + self.tasks_failed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    #[test]
    fn add_accumulates_and_zero_delta_is_noop() {
        let mut c = Counters::new();
        c.add(TOTAL_TASKS, 3);
        c.add(TOTAL_TASKS, 0);
        c.add(TOTAL_TASKS, -1);
        assert_eq!(c.get(TOTAL_TASKS), 2);
    }

    #[test]
    fn status_bucket_matches_spec_names() {
        assert_eq!(Counters::status_bucket(TaskStatus::Unqueued), TASKS_UNQUEUED);
        assert_eq!(Counters::status_bucket(TaskStatus::Succeeded), TASKS_COMPLETED);
    }

    #[test]
    fn total_invariant_holds_for_balanced_counters() {
        let mut c = Counters::new();
        c.add(TOTAL_TASKS, 4);
        c.add(TASKS_UNQUEUED, 2);
        c.add(TASKS_QUEUED, 1);
        c.add(TASKS_COMPLETED, 1);
        assert!(c.satisfies_total_invariant());
    }

    #[test]
    fn total_invariant_detects_imbalance() {
        let mut c = Counters::new();
        c.add(TOTAL_TASKS, 4);
        c.add(TASKS_UNQUEUED, 1);
        assert!(!c.satisfies_total_invariant());
    }
}
