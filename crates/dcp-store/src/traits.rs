//! The `TaskStore` seam (§4.1): the sole writer of task state, the sole
//! reader a handler or the batcher ever talks to. Both backends implement
//! this identically from the caller's point of view; only durability
//! differs.

use async_trait::async_trait;
use dcp_types::{JobRunId, JsonMap, ProjectId, Task, TaskId, TaskType};

use crate::error::StoreError;
use crate::model::{CommitCollection, CommitReport, LogEntryRow, ProjectInfo};

/// How `QueueUnqueuedTasks` should route a claimed task onto the bus.
#[async_trait]
pub trait TaskRouter: Send + Sync {
    /// Publish `task` to whichever topic its `task_type` maps to.
    async fn route(&self, task: &Task) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// The job-level spec a handler needs to resolve relative paths and
    /// defaults (§4.9's `JobConfig`, cached by callers per §4.5 — the store
    /// itself does no caching).
    async fn get_job_spec(&self, job_config_id: &str) -> Result<JsonMap, StoreError>;

    async fn get_task_spec(&self, task_id: &TaskId) -> Result<JsonMap, StoreError>;

    async fn get_task(&self, task_id: &TaskId) -> Result<Task, StoreError>;

    /// Insert the first, `Unqueued` task of a job run (e.g. its root `List`
    /// task). Outside this bootstrap, every other task is created as a
    /// successor inside `commit_updates`.
    async fn insert_root_task(
        &self,
        job_run_id: &JobRunId,
        task_id: &TaskId,
        task_type: TaskType,
        spec: JsonMap,
    ) -> Result<(), StoreError>;

    /// Claim up to `max` `Unqueued` tasks, transition them to `Queued`, and
    /// hand each to `router` before the claiming transaction commits. A
    /// router failure aborts that task's claim (it remains `Unqueued`) but
    /// does not fail the whole batch. Returns the number actually queued.
    async fn queue_unqueued_tasks(
        &self,
        job_run_id: &JobRunId,
        max: usize,
        router: &dyn TaskRouter,
    ) -> Result<usize, StoreError>;

    /// Apply a batch of `TaskUpdate`s as independent single-task
    /// transactions (§4.4: the batcher merges same-task duplicates down to
    /// one "highest status wins" update per task before calling this, so
    /// this method itself assumes at most one update per task id).
    async fn commit_updates(&self, updates: CommitCollection) -> Result<CommitReport, StoreError>;

    async fn count_unprocessed_logs(&self, job_run_id: &JobRunId) -> Result<i64, StoreError>;

    async fn fetch_unprocessed_logs(
        &self,
        job_run_id: &JobRunId,
        max: usize,
    ) -> Result<Vec<LogEntryRow>, StoreError>;

    async fn mark_logs_processed(
        &self,
        job_run_id: &JobRunId,
        log_entry_ids: &[u64],
    ) -> Result<(), StoreError>;

    /// All distinct `(project, jobConfig, jobRun)` triples with at least one
    /// `Unqueued` task, used by the queuer to find work without scanning
    /// every known run.
    async fn list_runs_with_unqueued_tasks(&self) -> Result<Vec<JobRunId>, StoreError>;

    /// All job runs with at least one unprocessed log-entry row, used by
    /// the log-export driver in place of scanning every known run.
    async fn list_runs_with_unprocessed_logs(&self) -> Result<Vec<JobRunId>, StoreError>;

    /// Every task type this store knows how to route, used by the receiver
    /// to size its subscription fan-out.
    fn known_task_types(&self) -> &'static [TaskType];

    /// Delete a completed job run's task rows and log entries, used by the
    /// resource cleaner once its retention window has passed.
    async fn delete_job_run(&self, job_run_id: &JobRunId) -> Result<(), StoreError>;

    /// Active projects' bus directories, used by the round-robin receiver to
    /// discover which completion subscription to listen on per project.
    async fn list_receiver_projects(&self) -> Result<Vec<ProjectInfo>, StoreError>;

    /// Up to `page_size` retired projects whose bus resources the resource
    /// cleaner should attempt to tear down.
    async fn list_unused_projects(&self, page_size: usize) -> Result<Vec<ProjectInfo>, StoreError>;

    /// Remove a project's directory row once every one of its bus resources
    /// is confirmed gone.
    async fn delete_project(&self, project_id: &ProjectId) -> Result<(), StoreError>;
}
