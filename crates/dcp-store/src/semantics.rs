//! Task-specific transactional semantics (§4.2), evaluated inside
//! `CommitUpdates` before the monotonic-status check.
//!
//! Modeled as a closed enum rather than `dyn Trait`: the set of
//! implementations is fixed and known at compile time, so enum dispatch
//! avoids an allocation and a vtable indirection on the commit hot path —
//! the same tradeoff the reference messaging layer makes for
//! `MessagingProvider`/`MessageRouterKind`.

use dcp_types::value::{get_i64, require_i64, FieldError};
use dcp_types::{FailureType, JsonMap, TaskStatus};

use crate::error::StoreError;
use crate::model::TaskUpdate;

pub const EXPECTED_GENERATION_NUM: &str = "expected_generation_num";
pub const BYTE_OFFSET: &str = "byte_offset";

#[derive(Debug, Clone)]
pub enum TransactionalSemantics {
    /// Re-issues a Copy/List task when the object it read no longer matches
    /// the generation it was issued against.
    FileIntegrity { expected_generation_num: i64 },
    /// CAS on a ProcessList task's stream position, so a redelivered
    /// completion cannot double-apply its successors.
    ListingFileProgress {
        expected_byte_offset: i64,
        byte_offset_for_next_iteration: i64,
    },
}

impl TransactionalSemantics {
    /// Returns `shouldWrite`. On `Ok(false)` the caller must discard the
    /// update entirely (no mutation, no log, no successors, no counters).
    pub fn apply(
        &self,
        stored_spec: &JsonMap,
        update: &mut TaskUpdate,
    ) -> Result<bool, StoreError> {
        match self {
            TransactionalSemantics::FileIntegrity {
                expected_generation_num,
            } => apply_file_integrity(*expected_generation_num, stored_spec, update),
            TransactionalSemantics::ListingFileProgress {
                expected_byte_offset,
                byte_offset_for_next_iteration,
            } => apply_listing_progress(
                *expected_byte_offset,
                *byte_offset_for_next_iteration,
                stored_spec,
                update,
            ),
        }
    }
}

fn field_err(task: &TaskUpdate, source: FieldError) -> StoreError {
    StoreError::Field {
        task_id: task.task_id.clone(),
        source,
    }
}

fn apply_file_integrity(
    current_generation: i64,
    stored_spec: &JsonMap,
    update: &mut TaskUpdate,
) -> Result<bool, StoreError> {
    let needs_reissue_check = update.proposed_status == TaskStatus::Succeeded
        || (update.proposed_status == TaskStatus::Failed
            && update
                .failure_type
                .map(FailureType::is_reissuable)
                .unwrap_or(false));

    let mut resolved = stored_spec.clone();

    if !needs_reissue_check {
        // Failed for any other reason: leave failed, drop successors.
        update.new_tasks.clear();
        update.resolved_spec = Some(resolved);
        return Ok(true);
    }

    let stored_generation = require_i64(stored_spec, EXPECTED_GENERATION_NUM)
        .map_err(|e| field_err(update, e))?;
    let agent_generation = update
        .original_task_params
        .as_ref()
        .and_then(|params| get_i64(params, EXPECTED_GENERATION_NUM));

    let stale = agent_generation != Some(stored_generation);

    if stale {
        resolved.insert(
            EXPECTED_GENERATION_NUM.to_string(),
            serde_json::Value::from(current_generation),
        );
        update.resolved_spec = Some(resolved);
        update.proposed_status = TaskStatus::Unqueued;
        update.failure_type = None;
        update.failure_message = None;
        update.new_tasks.clear();
    } else {
        update.resolved_spec = Some(resolved);
    }

    Ok(true)
}

fn apply_listing_progress(
    expected_byte_offset: i64,
    byte_offset_for_next_iteration: i64,
    stored_spec: &JsonMap,
    update: &mut TaskUpdate,
) -> Result<bool, StoreError> {
    let stored_offset =
        require_i64(stored_spec, BYTE_OFFSET).map_err(|e| field_err(update, e))?;

    if stored_offset != expected_byte_offset {
        return Ok(false);
    }

    let mut resolved = stored_spec.clone();
    resolved.insert(
        BYTE_OFFSET.to_string(),
        serde_json::Value::from(byte_offset_for_next_iteration),
    );
    update.resolved_spec = Some(resolved);
    update.failure_type = None;
    update.failure_message = None;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcp_types::TaskId;
    use serde_json::json;

    fn map(v: serde_json::Value) -> JsonMap {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn task_id() -> TaskId {
        "projects/p/jobConfigs/c/jobRuns/r/tasks/t".parse().unwrap()
    }

    #[test]
    fn file_integrity_keeps_success_when_generation_matches() {
        let stored = map(json!({"expected_generation_num": 5}));
        let mut update = TaskUpdate::new(task_id(), TaskStatus::Succeeded)
            .with_original_task_params(map(json!({"expected_generation_num": 5})))
            .with_new_tasks(vec![]);
        let semantics = TransactionalSemantics::FileIntegrity {
            expected_generation_num: 5,
        };
        let should_write = semantics.apply(&stored, &mut update).unwrap();
        assert!(should_write);
        assert_eq!(update.proposed_status, TaskStatus::Succeeded);
    }

    #[test]
    fn file_integrity_reissues_on_stale_generation() {
        let stored = map(json!({"expected_generation_num": 5}));
        let mut update = TaskUpdate::new(task_id(), TaskStatus::Succeeded)
            .with_original_task_params(map(json!({"expected_generation_num": 3})));
        let semantics = TransactionalSemantics::FileIntegrity {
            expected_generation_num: 9,
        };
        let should_write = semantics.apply(&stored, &mut update).unwrap();
        assert!(should_write);
        assert_eq!(update.proposed_status, TaskStatus::Unqueued);
        assert!(update.new_tasks.is_empty());
        assert_eq!(
            update.resolved_spec.unwrap().get(EXPECTED_GENERATION_NUM),
            Some(&serde_json::Value::from(9))
        );
    }

    #[test]
    fn file_integrity_reissues_on_missing_agent_generation() {
        let stored = map(json!({"expected_generation_num": 5}));
        let mut update = TaskUpdate::new(task_id(), TaskStatus::Succeeded);
        let semantics = TransactionalSemantics::FileIntegrity {
            expected_generation_num: 9,
        };
        assert!(semantics.apply(&stored, &mut update).unwrap());
        assert_eq!(update.proposed_status, TaskStatus::Unqueued);
    }

    #[test]
    fn file_integrity_reissues_on_reissuable_failure() {
        let stored = map(json!({"expected_generation_num": 5}));
        let mut update = TaskUpdate::new(task_id(), TaskStatus::Failed)
            .with_failure(FailureType::FileModified, "object changed")
            .with_original_task_params(map(json!({"expected_generation_num": 1})));
        let semantics = TransactionalSemantics::FileIntegrity {
            expected_generation_num: 2,
        };
        assert!(semantics.apply(&stored, &mut update).unwrap());
        assert_eq!(update.proposed_status, TaskStatus::Unqueued);
        assert!(update.failure_type.is_none());
    }

    #[test]
    fn file_integrity_leaves_non_reissuable_failure_failed() {
        let stored = map(json!({"expected_generation_num": 5}));
        let mut update = TaskUpdate::new(task_id(), TaskStatus::Failed)
            .with_failure(FailureType::Other(77), "permission denied")
            .with_new_tasks(vec![]);
        let semantics = TransactionalSemantics::FileIntegrity {
            expected_generation_num: 5,
        };
        assert!(semantics.apply(&stored, &mut update).unwrap());
        assert_eq!(update.proposed_status, TaskStatus::Failed);
    }

    #[test]
    fn listing_progress_advances_offset_on_match() {
        let stored = map(json!({"byte_offset": 1000}));
        let mut update = TaskUpdate::new(task_id(), TaskStatus::Succeeded);
        let semantics = TransactionalSemantics::ListingFileProgress {
            expected_byte_offset: 1000,
            byte_offset_for_next_iteration: 1500,
        };
        assert!(semantics.apply(&stored, &mut update).unwrap());
        assert_eq!(
            update.resolved_spec.unwrap().get(BYTE_OFFSET),
            Some(&serde_json::Value::from(1500))
        );
    }

    #[test]
    fn listing_progress_drops_update_on_stale_offset() {
        let stored = map(json!({"byte_offset": 1500}));
        let mut update = TaskUpdate::new(task_id(), TaskStatus::Succeeded);
        let semantics = TransactionalSemantics::ListingFileProgress {
            expected_byte_offset: 1000,
            byte_offset_for_next_iteration: 1500,
        };
        assert!(!semantics.apply(&stored, &mut update).unwrap());
    }
}
