//! Ephemeral types exchanged between handlers, the batcher, and the store.

use chrono::{DateTime, Utc};
use dcp_types::{JsonMap, ProjectId, TaskId, TaskStatus, TaskType};

use crate::semantics::TransactionalSemantics;

/// A project's bus-resource directory (§3 `ProjectInfo`): the queue topics
/// its tasks are routed to and the subscriptions its completions arrive on,
/// plus the `retired` flag the resource cleaner acts on.
#[derive(Debug, Clone)]
pub struct ProjectInfo {
    pub project_id: ProjectId,
    pub list_topic: String,
    pub copy_topic: String,
    pub list_progress_subscription: String,
    pub copy_progress_subscription: String,
    pub retired: bool,
}

/// A successor task to insert, relative to the parent's job run.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Task id suffix (the `<t>` segment); combined with the parent's
    /// `(project, configID, runID)` to form the full [`TaskId`].
    pub task_id: String,
    pub task_type: TaskType,
    pub spec: JsonMap,
}

impl NewTask {
    pub fn new(task_id: impl Into<String>, task_type: TaskType, spec: JsonMap) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            spec,
        }
    }
}

/// Produced by a message handler; consumed by exactly one `CommitUpdates` call.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub proposed_status: TaskStatus,
    pub failure_type: Option<dcp_types::FailureType>,
    pub failure_message: Option<String>,
    /// The log-entry payload (worker log / counters source), if this update
    /// should produce a log-entry row.
    pub log_payload: Option<JsonMap>,
    /// The task-spec parameters the agent actually saw when it ran the
    /// task, as reported on the completion message. `None` when the
    /// handler does not need it (e.g. the task does not carry
    /// generation-sensitive semantics).
    pub original_task_params: Option<JsonMap>,
    pub new_tasks: Vec<NewTask>,
    pub semantics: Option<TransactionalSemantics>,
    /// Working copy of the task's spec. The store fills this in from the
    /// stored row before evaluating `semantics`; handlers normally leave it
    /// `None` since they do not know the stored spec (§4.1 step 2).
    pub resolved_spec: Option<JsonMap>,
}

impl TaskUpdate {
    pub fn new(task_id: TaskId, proposed_status: TaskStatus) -> Self {
        Self {
            task_id,
            proposed_status,
            failure_type: None,
            failure_message: None,
            log_payload: None,
            original_task_params: None,
            new_tasks: Vec::new(),
            semantics: None,
            resolved_spec: None,
        }
    }

    pub fn with_failure(
        mut self,
        failure_type: dcp_types::FailureType,
        failure_message: impl Into<String>,
    ) -> Self {
        self.failure_type = Some(failure_type);
        self.failure_message = Some(failure_message.into());
        self
    }

    pub fn with_log_payload(mut self, payload: JsonMap) -> Self {
        self.log_payload = Some(payload);
        self
    }

    pub fn with_original_task_params(mut self, params: JsonMap) -> Self {
        self.original_task_params = Some(params);
        self
    }

    pub fn with_new_tasks(mut self, new_tasks: Vec<NewTask>) -> Self {
        self.new_tasks = new_tasks;
        self
    }

    pub fn with_semantics(mut self, semantics: TransactionalSemantics) -> Self {
        self.semantics = Some(semantics);
        self
    }
}

/// A collection of updates submitted to one `CommitUpdates` call. Keyed
/// internally by task identity so the batcher's "higher post-status wins"
/// merge rule (§4.4) is cheap to apply before committing.
#[derive(Debug, Clone, Default)]
pub struct CommitCollection {
    pub updates: Vec<TaskUpdate>,
}

impl CommitCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, update: TaskUpdate) {
        self.updates.push(update);
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }
}

/// A durable log-entry row, as inserted by every committed transition.
#[derive(Debug, Clone)]
pub struct LogEntryRow {
    pub task_id: TaskId,
    pub log_entry_id: u64,
    pub creation_time: DateTime<Utc>,
    pub current_status: TaskStatus,
    pub previous_status: TaskStatus,
    pub failure_message: Option<String>,
    pub payload: JsonMap,
    pub processed: bool,
}

/// Per-update outcome, used by callers (tests, the batcher) to assert on
/// what a commit actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update was applied: the task's status and spec were written, its
    /// successors (if any) inserted, and a log-entry row appended.
    Applied,
    /// `TransactionalSemantics::apply` returned `shouldWrite = false`; the
    /// update was dropped entirely.
    DroppedBySemantics,
    /// The proposed status was not strictly greater than the stored status
    /// under the monotonic order; the update was silently ignored.
    SkippedNotMonotonic,
}

#[derive(Debug, Clone, Default)]
pub struct CommitReport {
    pub outcomes: Vec<(TaskId, UpdateOutcome)>,
    pub job_runs_changed_to_terminal: Vec<dcp_types::JobRunId>,
}
