//! Task, task-type, status, and failure-type vocabulary.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::TaskId;
use crate::value::JsonMap;

/// `TaskType` selects which handler and which task-specific semantics apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum TaskType {
    List,
    ProcessList,
    Copy,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::List => "List",
            TaskType::ProcessList => "ProcessList",
            TaskType::Copy => "Copy",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown task type '{0}'")]
pub struct UnknownTaskType(pub String);

impl FromStr for TaskType {
    type Err = UnknownTaskType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "List" => Ok(TaskType::List),
            "ProcessList" => Ok(TaskType::ProcessList),
            "Copy" => Ok(TaskType::Copy),
            other => Err(UnknownTaskType(other.to_string())),
        }
    }
}

/// Task status under the monotonic partial order
/// `Unqueued < Queued < Failed < Succeeded`.
///
/// Declaration order is significant: the derived `PartialOrd`/`Ord`
/// implementations follow it directly, so this ordering *is* the monotonic
/// order enforced by `CommitUpdates`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Unqueued,
    Queued,
    Failed,
    Succeeded,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Unqueued => "UNQUEUED",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Succeeded => "SUCCEEDED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown task status '{0}'")]
pub struct UnknownTaskStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownTaskStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNQUEUED" => Ok(TaskStatus::Unqueued),
            "QUEUED" => Ok(TaskStatus::Queued),
            "FAILED" => Ok(TaskStatus::Failed),
            "SUCCEEDED" => Ok(TaskStatus::Succeeded),
            other => Err(UnknownTaskStatus(other.to_string())),
        }
    }
}

/// Failure-type vocabulary. Three variants are "re-issuable" by
/// `FileIntegrity` semantics; everything else is opaque but round-trips
/// through its original wire integer via [`FailureType::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    Unspecified,
    FileModified,
    Md5Mismatch,
    PreconditionFailure,
    Other(i32),
}

impl FailureType {
    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => FailureType::Unspecified,
            1 => FailureType::FileModified,
            2 => FailureType::Md5Mismatch,
            3 => FailureType::PreconditionFailure,
            other => FailureType::Other(other),
        }
    }

    pub fn to_i32(self) -> i32 {
        match self {
            FailureType::Unspecified => 0,
            FailureType::FileModified => 1,
            FailureType::Md5Mismatch => 2,
            FailureType::PreconditionFailure => 3,
            FailureType::Other(v) => v,
        }
    }

    /// Failure types for which `FileIntegrity` re-issues the task rather
    /// than leaving it `Failed`.
    pub fn is_reissuable(self) -> bool {
        matches!(
            self,
            FailureType::FileModified | FailureType::Md5Mismatch | FailureType::PreconditionFailure
        )
    }
}

/// A durable task row (the store's view, shared by handlers and semantics).
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub spec: JsonMap,
    pub status: TaskStatus,
    pub failure_type: Option<FailureType>,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl Task {
    /// A brand-new task row, as inserted by `InsertNewTasks` inside a commit.
    pub fn new_unqueued(id: TaskId, task_type: TaskType, spec: JsonMap, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_type,
            spec,
            status: TaskStatus::Unqueued,
            failure_type: None,
            failure_message: None,
            created_at: now,
            last_modified_at: now,
        }
    }
}
