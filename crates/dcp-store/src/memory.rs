//! In-memory `TaskStore`, used by engine and handler tests. Mirrors the
//! Postgres backend's semantics exactly (same `commit::process_update` call)
//! but keeps state behind a single `tokio::sync::Mutex` rather than a
//! database transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dcp_types::{Counters, JobRun, JobRunId, JsonMap, ProjectId, Task, TaskId, TaskStatus, TaskType};
use tokio::sync::Mutex;

use crate::commit::{new_task_counter_deltas, process_update};
use crate::error::StoreError;
use crate::model::{CommitCollection, CommitReport, LogEntryRow, NewTask, ProjectInfo, UpdateOutcome};
use crate::traits::{TaskRouter, TaskStore};

const KNOWN_TASK_TYPES: &[TaskType] = &[TaskType::List, TaskType::ProcessList, TaskType::Copy];

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    job_runs: HashMap<JobRunId, JobRun>,
    job_specs: HashMap<String, JsonMap>,
    logs: HashMap<JobRunId, Vec<LogEntryRow>>,
    projects: HashMap<ProjectId, ProjectInfo>,
}

#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a job spec for `get_job_spec`, as the queuer's config loader
    /// would do after reading the job config table.
    pub async fn put_job_spec(&self, job_config_id: impl Into<String>, spec: JsonMap) {
        self.inner.lock().await.job_specs.insert(job_config_id.into(), spec);
    }

    /// Seed a project's bus directory, as the project bootstrap glue (out of
    /// scope here) would do when a project is first registered.
    pub async fn put_project(&self, info: ProjectInfo) {
        self.inner.lock().await.projects.insert(info.project_id.clone(), info);
    }

    fn insert_task_locked(inner: &mut Inner, job_run_id: &JobRunId, task: Task) {
        let run = inner
            .job_runs
            .entry(job_run_id.clone())
            .or_insert_with(|| JobRun::new(job_run_id.clone()));
        for (k, v) in new_task_counter_deltas(task.task_type).0 {
            run.counters.add(k, v);
        }
        inner.tasks.insert(task.id.clone(), task);
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get_job_spec(&self, job_config_id: &str) -> Result<JsonMap, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .job_specs
            .get(job_config_id)
            .cloned()
            .ok_or_else(|| StoreError::JobSpecNotFound(job_config_id.to_string()))
    }

    async fn get_task_spec(&self, task_id: &TaskId) -> Result<JsonMap, StoreError> {
        Ok(self.get_task(task_id).await?.spec)
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Task, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound(task_id.clone()))
    }

    async fn insert_root_task(
        &self,
        job_run_id: &JobRunId,
        task_id: &TaskId,
        task_type: TaskType,
        spec: JsonMap,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let task = Task::new_unqueued(task_id.clone(), task_type, spec, Utc::now());
        Self::insert_task_locked(&mut inner, job_run_id, task);
        Ok(())
    }

    async fn queue_unqueued_tasks(
        &self,
        job_run_id: &JobRunId,
        max: usize,
        router: &dyn TaskRouter,
    ) -> Result<usize, StoreError> {
        let candidates: Vec<TaskId> = {
            let inner = self.inner.lock().await;
            inner
                .tasks
                .values()
                .filter(|t| t.id.job_run_id() == *job_run_id && t.status == TaskStatus::Unqueued)
                .take(max)
                .map(|t| t.id.clone())
                .collect()
        };

        let mut queued = 0;
        for task_id in candidates {
            let task = {
                let inner = self.inner.lock().await;
                inner.tasks.get(&task_id).cloned()
            };
            let Some(task) = task else { continue };
            if router.route(&task).await.is_err() {
                continue;
            }
            let mut inner = self.inner.lock().await;
            if let Some(stored) = inner.tasks.get_mut(&task_id) {
                if stored.status == TaskStatus::Unqueued {
                    let now = Utc::now();
                    stored.status = TaskStatus::Queued;
                    stored.last_modified_at = now;
                    if let Some(run) = inner.job_runs.get_mut(job_run_id) {
                        run.counters.add(dcp_types::counters::TASKS_UNQUEUED, -1);
                        run.counters.add(dcp_types::counters::TASKS_QUEUED, 1);
                        run.counters.add(
                            Counters::per_type_key(dcp_types::counters::TASKS_UNQUEUED, task.task_type),
                            -1,
                        );
                        run.counters.add(
                            Counters::per_type_key(dcp_types::counters::TASKS_QUEUED, task.task_type),
                            1,
                        );
                        run.refresh_status(now);
                    }
                    queued += 1;
                }
            }
        }
        Ok(queued)
    }

    async fn commit_updates(&self, updates: CommitCollection) -> Result<CommitReport, StoreError> {
        let mut report = CommitReport::default();
        let now = Utc::now();

        for update in updates.updates {
            let task_id = update.task_id.clone();
            let job_run_id = task_id.job_run_id();

            let mut inner = self.inner.lock().await;
            let pre = match inner.tasks.get(&task_id) {
                Some(t) => t.clone(),
                None => {
                    return Err(StoreError::TaskNotFound(task_id));
                }
            };
            drop(inner);

            let (outcome, applied) = process_update(update, &pre, now)?;
            report.outcomes.push((task_id.clone(), outcome));

            let Some(applied) = applied else { continue };

            let mut inner = self.inner.lock().await;
            inner.tasks.insert(task_id.clone(), applied.task);
            inner
                .logs
                .entry(job_run_id.clone())
                .or_default()
                .push(applied.log_entry);

            if let Some(run) = inner.job_runs.get_mut(&job_run_id) {
                for (k, v) in applied.counter_deltas.0 {
                    run.counters.add(k, v);
                }
            }

            for new_task in applied.new_tasks {
                let full_id = TaskId::new(
                    task_id.project.clone(),
                    task_id.config_id.clone(),
                    task_id.run_id.clone(),
                    new_task.task_id,
                );
                let task = Task::new_unqueued(full_id, new_task.task_type, new_task.spec, now);
                Self::insert_task_locked(&mut inner, &job_run_id, task);
            }

            if let Some(run) = inner.job_runs.get_mut(&job_run_id) {
                if run.refresh_status(now) {
                    report.job_runs_changed_to_terminal.push(job_run_id.clone());
                }
            }
        }

        Ok(report)
    }

    async fn count_unprocessed_logs(&self, job_run_id: &JobRunId) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .logs
            .get(job_run_id)
            .map(|logs| logs.iter().filter(|l| !l.processed).count() as i64)
            .unwrap_or(0))
    }

    async fn fetch_unprocessed_logs(
        &self,
        job_run_id: &JobRunId,
        max: usize,
    ) -> Result<Vec<LogEntryRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .logs
            .get(job_run_id)
            .map(|logs| {
                logs.iter()
                    .filter(|l| !l.processed)
                    .take(max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_logs_processed(
        &self,
        job_run_id: &JobRunId,
        log_entry_ids: &[u64],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(logs) = inner.logs.get_mut(job_run_id) {
            for entry in logs.iter_mut() {
                if log_entry_ids.contains(&entry.log_entry_id) {
                    entry.processed = true;
                }
            }
        }
        Ok(())
    }

    async fn list_runs_with_unqueued_tasks(&self) -> Result<Vec<JobRunId>, StoreError> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<JobRunId> = inner
            .job_runs
            .iter()
            .filter(|(_, run)| run.counters.get(dcp_types::counters::TASKS_UNQUEUED) > 0)
            .map(|(id, _)| id.clone())
            .collect();
        runs.sort();
        Ok(runs)
    }

    async fn list_runs_with_unprocessed_logs(&self) -> Result<Vec<JobRunId>, StoreError> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<JobRunId> = inner
            .logs
            .iter()
            .filter(|(_, logs)| logs.iter().any(|l| !l.processed))
            .map(|(id, _)| id.clone())
            .collect();
        runs.sort();
        Ok(runs)
    }

    fn known_task_types(&self) -> &'static [TaskType] {
        KNOWN_TASK_TYPES
    }

    async fn delete_job_run(&self, job_run_id: &JobRunId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.tasks.retain(|id, _| id.job_run_id() != *job_run_id);
        inner.job_runs.remove(job_run_id);
        inner.logs.remove(job_run_id);
        Ok(())
    }

    async fn list_receiver_projects(&self) -> Result<Vec<ProjectInfo>, StoreError> {
        let inner = self.inner.lock().await;
        let mut projects: Vec<ProjectInfo> = inner
            .projects
            .values()
            .filter(|p| !p.retired)
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        Ok(projects)
    }

    async fn list_unused_projects(&self, page_size: usize) -> Result<Vec<ProjectInfo>, StoreError> {
        let inner = self.inner.lock().await;
        let mut projects: Vec<ProjectInfo> = inner
            .projects
            .values()
            .filter(|p| p.retired)
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        projects.truncate(page_size);
        Ok(projects)
    }

    async fn delete_project(&self, project_id: &ProjectId) -> Result<(), StoreError> {
        self.inner.lock().await.projects.remove(project_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcp_types::FailureType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job_run_id() -> JobRunId {
        "projects/p/jobConfigs/c/jobRuns/r".parse().unwrap()
    }

    fn task_id(name: &str) -> TaskId {
        TaskId::new("p", "c", "r", name)
    }

    struct CountingRouter(AtomicUsize);

    #[async_trait]
    impl TaskRouter for CountingRouter {
        async fn route(&self, _task: &Task) -> Result<(), StoreError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn insert_and_queue_root_task() {
        let store = MemoryTaskStore::new();
        store
            .insert_root_task(&job_run_id(), &task_id("root"), TaskType::List, JsonMap::new())
            .await
            .unwrap();

        let router = CountingRouter(AtomicUsize::new(0));
        let queued = store.queue_unqueued_tasks(&job_run_id(), 10, &router).await.unwrap();
        assert_eq!(queued, 1);
        assert_eq!(router.0.load(Ordering::SeqCst), 1);

        let task = store.get_task(&task_id("root")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn commit_success_inserts_successors_and_updates_counters() {
        let store = MemoryTaskStore::new();
        store
            .insert_root_task(&job_run_id(), &task_id("root"), TaskType::List, JsonMap::new())
            .await
            .unwrap();

        let mut collection = CommitCollection::new();
        collection.push(
            crate::model::TaskUpdate::new(task_id("root"), TaskStatus::Succeeded).with_new_tasks(
                vec![NewTask::new("child", TaskType::Copy, JsonMap::new())],
            ),
        );
        let report = store.commit_updates(collection).await.unwrap();
        assert_eq!(report.outcomes, vec![(task_id("root"), UpdateOutcome::Applied)]);

        let child = store.get_task(&task_id("child")).await.unwrap();
        assert_eq!(child.status, TaskStatus::Unqueued);

        let run_status = store.list_runs_with_unqueued_tasks().await.unwrap();
        assert_eq!(run_status, vec![job_run_id()]);
    }

    #[tokio::test]
    async fn job_run_becomes_failed_when_all_terminal_with_a_failure() {
        let store = MemoryTaskStore::new();
        store
            .insert_root_task(&job_run_id(), &task_id("only"), TaskType::Copy, JsonMap::new())
            .await
            .unwrap();

        let mut collection = CommitCollection::new();
        collection.push(
            crate::model::TaskUpdate::new(task_id("only"), TaskStatus::Failed)
                .with_failure(FailureType::Other(500), "boom"),
        );
        let report = store.commit_updates(collection).await.unwrap();
        assert_eq!(report.job_runs_changed_to_terminal, vec![job_run_id()]);
    }

    #[tokio::test]
    async fn lists_active_and_retired_projects_separately() {
        let store = MemoryTaskStore::new();
        store
            .put_project(crate::model::ProjectInfo {
                project_id: dcp_types::ProjectId::new("active"),
                list_topic: "list".into(),
                copy_topic: "copy".into(),
                list_progress_subscription: "list-progress".into(),
                copy_progress_subscription: "copy-progress".into(),
                retired: false,
            })
            .await;
        store
            .put_project(crate::model::ProjectInfo {
                project_id: dcp_types::ProjectId::new("retired"),
                list_topic: "list".into(),
                copy_topic: "copy".into(),
                list_progress_subscription: "list-progress".into(),
                copy_progress_subscription: "copy-progress".into(),
                retired: true,
            })
            .await;

        let active = store.list_receiver_projects().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].project_id.project, "active");

        let retired = store.list_unused_projects(10).await.unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].project_id.project, "retired");

        store.delete_project(&dcp_types::ProjectId::new("retired")).await.unwrap();
        assert!(store.list_unused_projects(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_job_run_clears_all_state() {
        let store = MemoryTaskStore::new();
        store
            .insert_root_task(&job_run_id(), &task_id("root"), TaskType::List, JsonMap::new())
            .await
            .unwrap();
        store.delete_job_run(&job_run_id()).await.unwrap();
        assert!(store.get_task(&task_id("root")).await.is_err());
    }
}
