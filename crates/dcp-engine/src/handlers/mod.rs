//! Message handlers (§4.3): one per `TaskType`, each turning a completion
//! message plus the task's current stored row into a `TaskUpdate`.
//!
//! Shared contract: parse the task identity and status off the completion
//! message, validate the parameters the handler needs, and produce the
//! `TaskUpdate` the batcher will later submit to `CommitUpdates`. Handlers
//! never talk to the store directly — the caller supplies the task's
//! current row and the owning job's spec.

mod copy;
mod list;
mod process_list;

use std::hash::Hasher;

use dcp_objectstore::{ListingFileReader, ObjectMetadataReader};
use dcp_types::{FailureType, JsonMap, Task, TaskId, TaskStatus, TaskType};
use fnv::FnvHasher;
use serde::Deserialize;

use crate::error::EngineError;

/// Everything a handler needs to read from the destination object store.
/// Blanket-implemented for any type carrying both reader capabilities, so
/// handlers take `&dyn ObjectStore` rather than naming both traits.
pub trait ObjectStore: ObjectMetadataReader + ListingFileReader {}
impl<T: ObjectMetadataReader + ListingFileReader + ?Sized> ObjectStore for T {}

/// The inbound completion message (§6): `{taskRelativeResourceName, status,
/// failure_type, failure_message, log_entry, task_params}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionMessage {
    #[serde(rename = "taskRelativeResourceName")]
    pub task_relative_resource_name: String,
    pub status: String,
    #[serde(default)]
    pub failure_type: Option<i32>,
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub log_entry: Option<JsonMap>,
    #[serde(default)]
    pub task_params: Option<JsonMap>,
}

impl CompletionMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(bytes).map_err(EngineError::MalformedMessage)
    }

    pub fn task_id(&self) -> Result<TaskId, EngineError> {
        Ok(self.task_relative_resource_name.parse()?)
    }

    /// `"SUCCESS"` -> `Succeeded`, `"FAILED"` -> `Failed`; anything else is
    /// rejected rather than silently defaulted.
    pub fn proposed_status(&self, task_id: &TaskId) -> Result<TaskStatus, EngineError> {
        match self.status.as_str() {
            "SUCCESS" => Ok(TaskStatus::Succeeded),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(EngineError::UnrecognizedStatus {
                task_id: task_id.clone(),
                status: other.to_string(),
            }),
        }
    }

    pub fn failure_type(&self) -> FailureType {
        FailureType::from_i32(self.failure_type.unwrap_or(0))
    }
}

/// Dispatch to the handler for `task.task_type`.
pub async fn handle(
    task: &Task,
    job_spec: &JsonMap,
    message: &CompletionMessage,
    object_store: &dyn ObjectStore,
    working_space_prefix: &str,
) -> Result<dcp_store::TaskUpdate, EngineError> {
    match task.task_type {
        TaskType::List => list::handle(task, message, object_store).await,
        TaskType::ProcessList => {
            process_list::handle(task, job_spec, message, object_store, working_space_prefix).await
        }
        TaskType::Copy => copy::handle(task, message, object_store).await,
    }
}

/// Convert a stored-spec field error into the error a handler surfaces:
/// a missing/malformed task parameter is a configuration bug (§7), not a
/// transient failure.
pub(crate) fn field_error(task_id: &TaskId, err: dcp_types::value::FieldError) -> EngineError {
    use dcp_types::value::FieldError;
    let field = match err {
        FieldError::Missing(field) => field,
        FieldError::WrongType { field, .. } => field,
    };
    EngineError::MissingParams {
        task_id: task_id.clone(),
        field,
    }
}

/// A short, stable hex id derived from `parts`, used where a successor's
/// task id must be deterministic across redeliveries rather than random
/// (§4.3: continuation ProcessList tasks, nested-listing List tasks).
pub fn deterministic_id(parts: &[&str]) -> String {
    let mut hasher = FnvHasher::default();
    for part in parts {
        hasher.write(part.as_bytes());
        hasher.write(b"\0");
    }
    format!("{:016x}", hasher.finish())
}
