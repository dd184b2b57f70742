//! List task completion handler (§4.3).

use dcp_store::{NewTask, TaskUpdate, TransactionalSemantics};
use dcp_types::value::require_str;
use dcp_types::{Task, TaskStatus, TaskType};
use serde_json::json;

use super::{deterministic_id, field_error, CompletionMessage, ObjectStore};
use crate::error::EngineError;

pub async fn handle(
    task: &Task,
    message: &CompletionMessage,
    object_store: &dyn ObjectStore,
) -> Result<TaskUpdate, EngineError> {
    let task_id = message.task_id()?;
    let status = message.proposed_status(&task_id)?;

    let bucket =
        require_str(&task.spec, "dst_list_result_bucket").map_err(|e| field_error(&task_id, e))?;
    let object =
        require_str(&task.spec, "dst_list_result_object").map_err(|e| field_error(&task_id, e))?;

    let mut update = TaskUpdate::new(task_id.clone(), status);
    if let Some(params) = &message.task_params {
        update = update.with_original_task_params(params.clone());
    }
    if let Some(payload) = &message.log_entry {
        update = update.with_log_payload(payload.clone());
    }

    let needs_reissue_check = status == TaskStatus::Succeeded
        || (status == TaskStatus::Failed && message.failure_type().is_reissuable());

    if status == TaskStatus::Failed {
        update = update.with_failure(
            message.failure_type(),
            message.failure_message.clone().unwrap_or_default(),
        );
    }

    if needs_reissue_check {
        let generation = object_store.generation_or_zero(bucket, object).await?;
        update = update.with_semantics(TransactionalSemantics::FileIntegrity {
            expected_generation_num: generation,
        });
    }

    if status == TaskStatus::Succeeded {
        let src_directory =
            require_str(&task.spec, "src_directory").map_err(|e| field_error(&task_id, e))?;
        let mut successor_spec = dcp_types::JsonMap::new();
        successor_spec.insert("dst_list_result_bucket".to_string(), json!(bucket));
        successor_spec.insert("dst_list_result_object".to_string(), json!(object));
        successor_spec.insert("src_directory".to_string(), json!(src_directory));
        successor_spec.insert("byte_offset".to_string(), json!(0));

        let successor_id = format!("processlist/{}", deterministic_id(&[bucket, object]));
        update = update.with_new_tasks(vec![NewTask::new(
            successor_id,
            TaskType::ProcessList,
            successor_spec,
        )]);
    }

    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcp_objectstore::MemoryObjectStore;
    use dcp_types::JsonMap;

    fn task_with_spec(spec: JsonMap) -> Task {
        Task {
            id: "projects/p/jobConfigs/c/jobRuns/r/tasks/root-list".parse().unwrap(),
            task_type: TaskType::List,
            spec,
            status: TaskStatus::Queued,
            failure_type: None,
            failure_message: None,
            created_at: chrono::Utc::now(),
            last_modified_at: chrono::Utc::now(),
        }
    }

    fn spec() -> JsonMap {
        let mut m = JsonMap::new();
        m.insert("dst_list_result_bucket".to_string(), json!("dst"));
        m.insert("dst_list_result_object".to_string(), json!("listing/obj"));
        m.insert("src_directory".to_string(), json!("srcdir"));
        m.insert("expected_generation_num".to_string(), json!(0));
        m
    }

    fn success_message() -> CompletionMessage {
        CompletionMessage::parse(
            br#"{"taskRelativeResourceName":"projects/p/jobConfigs/c/jobRuns/r/tasks/root-list","status":"SUCCESS","task_params":{"expected_generation_num":0}}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn success_emits_one_process_list_successor() {
        let store = MemoryObjectStore::new();
        store.put("dst", "listing/obj", b"junkID\n".to_vec(), 3);
        let task = task_with_spec(spec());
        let update = handle(&task, &success_message(), &store).await.unwrap();
        assert_eq!(update.proposed_status, TaskStatus::Succeeded);
        assert_eq!(update.new_tasks.len(), 1);
        assert_eq!(update.new_tasks[0].task_type, TaskType::ProcessList);
        assert!(matches!(
            update.semantics,
            Some(TransactionalSemantics::FileIntegrity { expected_generation_num: 3 })
        ));
    }

    #[tokio::test]
    async fn non_reissuable_failure_attaches_no_semantics() {
        let store = MemoryObjectStore::new();
        let task = task_with_spec(spec());
        let message = CompletionMessage::parse(
            br#"{"taskRelativeResourceName":"projects/p/jobConfigs/c/jobRuns/r/tasks/root-list","status":"FAILED","failure_type":77,"failure_message":"boom"}"#,
        )
        .unwrap();
        let update = handle(&task, &message, &store).await.unwrap();
        assert_eq!(update.proposed_status, TaskStatus::Failed);
        assert!(update.new_tasks.is_empty());
        assert!(update.semantics.is_none());
    }

    #[tokio::test]
    async fn missing_required_field_is_a_handler_error() {
        let store = MemoryObjectStore::new();
        let task = task_with_spec(JsonMap::new());
        let err = handle(&task, &success_message(), &store).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingParams { .. }));
    }
}
