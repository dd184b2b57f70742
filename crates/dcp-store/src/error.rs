use dcp_types::value::FieldError;
use dcp_types::{IdError, TaskId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("job run {0} not found")]
    JobRunNotFound(String),

    #[error("job spec for {0} not found")]
    JobSpecNotFound(String),

    #[error("commit rejected: task {task_id} proposes status {status} with {successor_count} successors; successors are only legal alongside a Succeeded post-image")]
    SuccessorsRequireSuccess {
        task_id: TaskId,
        status: dcp_types::TaskStatus,
        successor_count: usize,
    },

    #[error("task {task_id} of unknown type during queuing: {task_type}")]
    UnknownTaskTypeForRouting { task_id: TaskId, task_type: String },

    #[error("identity parse error: {0}")]
    Id(#[from] IdError),

    #[error("task-spec field error on {task_id}: {source}")]
    Field {
        task_id: TaskId,
        #[source]
        source: FieldError,
    },

    #[error("task-spec JSON error on {task_id}: {source}")]
    Json {
        task_id: TaskId,
        #[source]
        source: serde_json::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("bus publish failed while queuing: {0}")]
    Publish(String),
}
