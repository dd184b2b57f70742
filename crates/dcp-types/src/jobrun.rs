//! `JobRun` status, derived deterministically from its `Counters` (§3 invariant).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::counters::Counters;
use crate::ids::JobRunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobRunStatus {
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
}

impl fmt::Display for JobRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobRunStatus::NotStarted => "NOT_STARTED",
            JobRunStatus::InProgress => "IN_PROGRESS",
            JobRunStatus::Succeeded => "SUCCEEDED",
            JobRunStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown job run status '{0}'")]
pub struct UnknownJobRunStatus(pub String);

impl FromStr for JobRunStatus {
    type Err = UnknownJobRunStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(JobRunStatus::NotStarted),
            "IN_PROGRESS" => Ok(JobRunStatus::InProgress),
            "SUCCEEDED" => Ok(JobRunStatus::Succeeded),
            "FAILED" => Ok(JobRunStatus::Failed),
            other => Err(UnknownJobRunStatus(other.to_string())),
        }
    }
}

impl JobRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobRunStatus::Succeeded | JobRunStatus::Failed)
    }

    /// Derive status from counters per §3:
    /// `NotStarted` if `TotalTasks=0`; `Succeeded` if `TotalTasks=TasksCompleted`;
    /// `Failed` if `TotalTasks=TasksCompleted+TasksFailed` and `TasksFailed>0`;
    /// otherwise `InProgress`.
    pub fn derive(counters: &Counters) -> Self {
        let total = counters.total_tasks();
        let completed = counters.tasks_completed();
        let failed = counters.tasks_failed();

        if total == 0 {
            JobRunStatus::NotStarted
        } else if total == completed {
            JobRunStatus::Succeeded
        } else if total == completed + failed && failed > 0 {
            JobRunStatus::Failed
        } else {
            JobRunStatus::InProgress
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRun {
    pub id: JobRunId,
    pub counters: Counters,
    pub status: JobRunStatus,
    pub finish_time: Option<DateTime<Utc>>,
}

impl JobRun {
    pub fn new(id: JobRunId) -> Self {
        Self {
            id,
            counters: Counters::new(),
            status: JobRunStatus::NotStarted,
            finish_time: None,
        }
    }

    /// Re-derive `status` from `counters`, stamping `finish_time` on the
    /// transition into a terminal status and reporting whether that
    /// transition just happened (callers use this to fire the log-export
    /// notification).
    pub fn refresh_status(&mut self, now: DateTime<Utc>) -> bool {
        let new_status = JobRunStatus::derive(&self.counters);
        let became_terminal = new_status != self.status && new_status.is_terminal();
        if new_status != self.status {
            self.status = new_status;
            if new_status.is_terminal() {
                self.finish_time = Some(now);
            }
        }
        became_terminal
    }
}
