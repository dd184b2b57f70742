//! Shared commit algorithm (§4.1 step 2) used identically by the in-memory
//! and Postgres-backed stores. Both call [`process_update`] once per
//! `TaskUpdate`, inside whatever transaction their backend uses, so the
//! decision of what to write is made in exactly one place.

use std::hash::Hasher;

use chrono::{DateTime, Utc};
use dcp_types::{Counters, Task, TaskStatus};
use fnv::FnvHasher;

use crate::error::StoreError;
use crate::model::{LogEntryRow, NewTask, TaskUpdate, UpdateOutcome};

/// The concrete writes a backend must apply for one `Applied` update.
pub struct AppliedUpdate {
    pub task: Task,
    pub log_entry: LogEntryRow,
    pub new_tasks: Vec<NewTask>,
    /// Deltas to apply to the owning job run's counters. Does not include
    /// the counters for `new_tasks` themselves; callers add
    /// `new_task_counter_deltas` for each inserted successor.
    pub counter_deltas: Counters,
}

/// Counter deltas for inserting a single brand-new (always `Unqueued`) task.
pub fn new_task_counter_deltas(task_type: dcp_types::TaskType) -> Counters {
    let mut c = Counters::new();
    c.add(dcp_types::counters::TOTAL_TASKS, 1);
    c.add(dcp_types::counters::TASKS_UNQUEUED, 1);
    c.add(
        Counters::per_type_key(dcp_types::counters::TOTAL_TASKS, task_type),
        1,
    );
    c.add(
        Counters::per_type_key(dcp_types::counters::TASKS_UNQUEUED, task_type),
        1,
    );
    c
}

/// Evaluate one `TaskUpdate` against the pre-image `Task` row and decide
/// what, if anything, to write.
///
/// `pre` must be the row as currently stored (read inside the same
/// transaction the caller will write back into).
pub fn process_update(
    mut update: TaskUpdate,
    pre: &Task,
    now: DateTime<Utc>,
) -> Result<(UpdateOutcome, Option<AppliedUpdate>), StoreError> {
    if update.resolved_spec.is_none() {
        update.resolved_spec = Some(pre.spec.clone());
    }

    if let Some(semantics) = update.semantics.clone() {
        let stored_spec = pre.spec.clone();
        let should_write = semantics.apply(&stored_spec, &mut update)?;
        if !should_write {
            return Ok((UpdateOutcome::DroppedBySemantics, None));
        }
    }

    if !update.new_tasks.is_empty() && update.proposed_status != TaskStatus::Succeeded {
        return Err(StoreError::SuccessorsRequireSuccess {
            task_id: update.task_id.clone(),
            status: update.proposed_status,
            successor_count: update.new_tasks.len(),
        });
    }

    if update.proposed_status <= pre.status {
        return Ok((UpdateOutcome::SkippedNotMonotonic, None));
    }

    let mut counter_deltas = Counters::new();
    let pre_bucket = Counters::status_bucket(pre.status);
    let post_bucket = Counters::status_bucket(update.proposed_status);
    counter_deltas.add(pre_bucket, -1);
    counter_deltas.add(post_bucket, 1);
    counter_deltas.add(Counters::per_type_key(pre_bucket, pre.task_type), -1);
    counter_deltas.add(Counters::per_type_key(post_bucket, pre.task_type), 1);

    if let Some(payload) = &update.log_payload {
        for key in dcp_types::counters::RECOGNIZED_PAYLOAD_KEYS {
            if let Some(v) = dcp_types::value::get_i64(payload, key) {
                counter_deltas.add(*key, v);
            }
        }
    }

    let new_spec = update.resolved_spec.clone().unwrap_or_else(|| pre.spec.clone());
    let mut task = pre.clone();
    task.status = update.proposed_status;
    task.failure_type = update.failure_type;
    task.failure_message = update.failure_message.clone();
    task.spec = new_spec;
    task.last_modified_at = now;

    let log_payload = update.log_payload.clone().unwrap_or_default();
    let log_entry = LogEntryRow {
        task_id: update.task_id.clone(),
        log_entry_id: log_entry_id(&log_payload, now),
        creation_time: now,
        current_status: task.status,
        previous_status: pre.status,
        failure_message: task.failure_message.clone(),
        payload: log_payload,
        processed: false,
    };

    Ok((
        UpdateOutcome::Applied,
        Some(AppliedUpdate {
            task,
            log_entry,
            new_tasks: update.new_tasks,
            counter_deltas,
        }),
    ))
}

/// FNV-1a hash of the log payload's canonical JSON bytes concatenated with
/// the commit timestamp, used as a stable, collision-resistant id for a log
/// entry row without a database-assigned sequence.
fn log_entry_id(payload: &dcp_types::JsonMap, now: DateTime<Utc>) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(dcp_types::value::to_spec_string(payload).as_bytes());
    hasher.write(&now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcp_types::{FailureType, JsonMap, TaskId, TaskType};
    use serde_json::json;

    fn task_id() -> TaskId {
        "projects/p/jobConfigs/c/jobRuns/r/tasks/t".parse().unwrap()
    }

    fn pre_task(status: TaskStatus) -> Task {
        Task {
            id: task_id(),
            task_type: TaskType::Copy,
            spec: JsonMap::new(),
            status,
            failure_type: None,
            failure_message: None,
            created_at: Utc::now(),
            last_modified_at: Utc::now(),
        }
    }

    #[test]
    fn applies_forward_transition_with_counter_deltas() {
        let pre = pre_task(TaskStatus::Queued);
        let update = TaskUpdate::new(task_id(), TaskStatus::Succeeded);
        let (outcome, applied) = process_update(update, &pre, Utc::now()).unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied);
        let applied = applied.unwrap();
        assert_eq!(applied.task.status, TaskStatus::Succeeded);
        assert_eq!(
            applied.counter_deltas.get(dcp_types::counters::TASKS_QUEUED),
            -1
        );
        assert_eq!(
            applied.counter_deltas.get(dcp_types::counters::TASKS_COMPLETED),
            1
        );
    }

    #[test]
    fn skips_non_monotonic_transition() {
        let pre = pre_task(TaskStatus::Succeeded);
        let update = TaskUpdate::new(task_id(), TaskStatus::Queued);
        let (outcome, applied) = process_update(update, &pre, Utc::now()).unwrap();
        assert_eq!(outcome, UpdateOutcome::SkippedNotMonotonic);
        assert!(applied.is_none());
    }

    #[test]
    fn rejects_successors_without_success() {
        let pre = pre_task(TaskStatus::Queued);
        let update = TaskUpdate::new(task_id(), TaskStatus::Failed)
            .with_failure(FailureType::Other(1), "boom")
            .with_new_tasks(vec![NewTask::new("x", TaskType::Copy, JsonMap::new())]);
        let err = process_update(update, &pre, Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::SuccessorsRequireSuccess { .. }));
    }

    #[test]
    fn applies_recognized_payload_keys_into_counters() {
        let pre = pre_task(TaskStatus::Queued);
        let mut payload = JsonMap::new();
        payload.insert("bytesCopied".to_string(), json!(2048));
        let update = TaskUpdate::new(task_id(), TaskStatus::Succeeded).with_log_payload(payload);
        let (_, applied) = process_update(update, &pre, Utc::now()).unwrap();
        assert_eq!(applied.unwrap().counter_deltas.get("bytesCopied"), 2048);
    }

    #[test]
    fn log_entry_id_is_stable_for_same_payload_and_time() {
        let mut payload = JsonMap::new();
        payload.insert("bytesCopied".to_string(), json!(10));
        let now = Utc::now();
        let a = log_entry_id(&payload, now);
        let b = log_entry_id(&payload, now);
        assert_eq!(a, b);
    }
}
