//! Copy task completion handler (§4.3). Leaf task type: never emits
//! successors.

use dcp_store::{TaskUpdate, TransactionalSemantics};
use dcp_types::value::require_str;
use dcp_types::{Task, TaskStatus};

use super::{field_error, CompletionMessage, ObjectStore};
use crate::error::EngineError;

pub async fn handle(
    task: &Task,
    message: &CompletionMessage,
    object_store: &dyn ObjectStore,
) -> Result<TaskUpdate, EngineError> {
    let task_id = message.task_id()?;
    let status = message.proposed_status(&task_id)?;

    let bucket = require_str(&task.spec, "dst_bucket").map_err(|e| field_error(&task_id, e))?;
    let object = require_str(&task.spec, "dst_object").map_err(|e| field_error(&task_id, e))?;

    let mut update = TaskUpdate::new(task_id.clone(), status);
    if let Some(params) = &message.task_params {
        update = update.with_original_task_params(params.clone());
    }
    if let Some(payload) = &message.log_entry {
        update = update.with_log_payload(payload.clone());
    }

    if status == TaskStatus::Failed {
        update = update.with_failure(
            message.failure_type(),
            message.failure_message.clone().unwrap_or_default(),
        );
    }

    let needs_reissue_check = status == TaskStatus::Succeeded
        || (status == TaskStatus::Failed && message.failure_type().is_reissuable());

    if needs_reissue_check {
        let generation = object_store.generation_or_zero(bucket, object).await?;
        update = update.with_semantics(TransactionalSemantics::FileIntegrity {
            expected_generation_num: generation,
        });
    }

    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcp_objectstore::MemoryObjectStore;
    use dcp_types::{JsonMap, TaskType};
    use serde_json::json;

    fn task() -> Task {
        let mut spec = JsonMap::new();
        spec.insert("src_file".to_string(), json!("a/b.txt"));
        spec.insert("dst_bucket".to_string(), json!("dst"));
        spec.insert("dst_object".to_string(), json!("a/b.txt"));
        spec.insert("expected_generation_num".to_string(), json!(0));
        Task {
            id: "projects/p/jobConfigs/c/jobRuns/r/tasks/file/a".parse().unwrap(),
            task_type: TaskType::Copy,
            spec,
            status: TaskStatus::Queued,
            failure_type: None,
            failure_message: None,
            created_at: chrono::Utc::now(),
            last_modified_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn success_attaches_file_integrity_and_no_successors() {
        let store = MemoryObjectStore::new();
        store.put("dst", "a/b.txt", b"data".to_vec(), 7);
        let message = CompletionMessage::parse(
            br#"{"taskRelativeResourceName":"projects/p/jobConfigs/c/jobRuns/r/tasks/file/a","status":"SUCCESS","task_params":{"expected_generation_num":0}}"#,
        )
        .unwrap();
        let update = handle(&task(), &message, &store).await.unwrap();
        assert_eq!(update.proposed_status, TaskStatus::Succeeded);
        assert!(update.new_tasks.is_empty());
        assert!(matches!(
            update.semantics,
            Some(TransactionalSemantics::FileIntegrity { expected_generation_num: 7 })
        ));
    }
}
