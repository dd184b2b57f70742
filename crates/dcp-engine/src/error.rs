//! `dcp_engine::EngineError` (§4.10): handler, cache, and loop failures,
//! composed from the lower crates' errors via `#[from]`.

use dcp_types::{IdError, TaskId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("completion message failed to parse as JSON: {0}")]
    MalformedMessage(#[source] serde_json::Error),

    #[error("completion message for {task_id} is missing required field '{field}'")]
    MissingParams { task_id: TaskId, field: String },

    #[error("completion message for {task_id} has unrecognized status '{status}'")]
    UnrecognizedStatus { task_id: TaskId, status: String },

    #[error("task {task_id} has no registered handler for task type {task_type}")]
    NoHandlerForTaskType {
        task_id: TaskId,
        task_type: dcp_types::TaskType,
    },

    #[error("identity parse error: {0}")]
    Id(#[from] IdError),

    #[error("task-spec field error: {0}")]
    Field(#[from] dcp_types::value::FieldError),

    #[error(transparent)]
    Store(#[from] dcp_store::StoreError),

    #[error(transparent)]
    Bus(#[from] dcp_bus::BusError),

    #[error(transparent)]
    ObjectStore(#[from] dcp_objectstore::ObjectStoreError),

    #[error("batcher flush failed after exhausting retries: {0}")]
    FlushExhausted(#[source] Box<EngineError>),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
