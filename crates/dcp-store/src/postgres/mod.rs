//! Postgres-backed `TaskStore`. Applies the same [`crate::commit`] algorithm
//! as [`crate::memory::MemoryTaskStore`], but each `CommitUpdates` call and
//! each `QueueUnqueuedTasks` claim runs inside one `sqlx::Transaction` so a
//! router or downstream failure leaves the row exactly as it was.

mod commit;
mod logexport;
mod projects;
mod queue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dcp_types::{JobRunId, JsonMap, ProjectId, Task, TaskId, TaskStatus, TaskType};
use sqlx::PgPool;

use crate::error::StoreError;
use crate::model::{CommitCollection, CommitReport, LogEntryRow, ProjectInfo};
use crate::traits::{TaskRouter, TaskStore};

const KNOWN_TASK_TYPES: &[TaskType] = &[TaskType::List, TaskType::ProcessList, TaskType::Copy];

pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskRow {
    pub id: String,
    pub job_run_id: String,
    pub task_type: String,
    pub spec: serde_json::Value,
    pub status: String,
    pub failure_type: Option<i32>,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl TaskRow {
    pub(crate) fn into_task(self) -> Result<Task, StoreError> {
        let id: TaskId = self.id.parse()?;
        let task_type: TaskType = self
            .task_type
            .parse()
            .map_err(|_| StoreError::UnknownTaskTypeForRouting {
                task_id: id.clone(),
                task_type: self.task_type,
            })?;
        let status: TaskStatus = self.status.parse().map_err(|_| {
            StoreError::Database(sqlx::Error::Decode(
                format!("unknown task status '{}'", self.status).into(),
            ))
        })?;
        let spec = match self.spec {
            serde_json::Value::Object(m) => m,
            _ => dcp_types::JsonMap::new(),
        };
        Ok(Task {
            id,
            task_type,
            spec,
            status,
            failure_type: self.failure_type.map(dcp_types::FailureType::from_i32),
            failure_message: self.failure_message,
            created_at: self.created_at,
            last_modified_at: self.last_modified_at,
        })
    }
}

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn get_job_spec(&self, job_config_id: &str) -> Result<JsonMap, StoreError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT spec FROM job_specs WHERE job_config_id = $1")
                .bind(job_config_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((serde_json::Value::Object(m),)) => Ok(m),
            Some(_) | None => Err(StoreError::JobSpecNotFound(job_config_id.to_string())),
        }
    }

    async fn get_task_spec(&self, task_id: &TaskId) -> Result<JsonMap, StoreError> {
        Ok(self.get_task(task_id).await?.spec)
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Task, StoreError> {
        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT id, job_run_id, task_type, spec, status, failure_type, failure_message, \
             created_at, last_modified_at FROM tasks WHERE id = $1",
        )
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::TaskNotFound(task_id.clone()))?
            .into_task()
    }

    async fn insert_root_task(
        &self,
        job_run_id: &JobRunId,
        task_id: &TaskId,
        task_type: TaskType,
        spec: JsonMap,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO job_runs (id, counters) VALUES ($1, '{}') \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(job_run_id.to_string())
        .execute(&mut *tx)
        .await?;

        let created_at = now();
        sqlx::query(
            "INSERT INTO tasks (id, job_run_id, task_type, spec, status, created_at, \
             last_modified_at) VALUES ($1, $2, $3, $4, 'UNQUEUED', $5, $5)",
        )
        .bind(task_id.to_string())
        .bind(job_run_id.to_string())
        .bind(task_type.to_string())
        .bind(serde_json::Value::Object(spec))
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE job_runs SET counters = jsonb_set(\
                jsonb_set(counters, '{TotalTasks}', \
                    to_jsonb(COALESCE((counters->>'TotalTasks')::bigint, 0) + 1)), \
                '{TasksUnqueued}', \
                to_jsonb(COALESCE((counters->>'TasksUnqueued')::bigint, 0) + 1)) \
             WHERE id = $1",
        )
        .bind(job_run_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn queue_unqueued_tasks(
        &self,
        job_run_id: &JobRunId,
        max: usize,
        router: &dyn TaskRouter,
    ) -> Result<usize, StoreError> {
        queue::queue_unqueued_tasks(&self.pool, job_run_id, max, router).await
    }

    async fn commit_updates(&self, updates: CommitCollection) -> Result<CommitReport, StoreError> {
        commit::commit_updates(&self.pool, updates).await
    }

    async fn count_unprocessed_logs(&self, job_run_id: &JobRunId) -> Result<i64, StoreError> {
        logexport::count_unprocessed_logs(&self.pool, job_run_id).await
    }

    async fn fetch_unprocessed_logs(
        &self,
        job_run_id: &JobRunId,
        max: usize,
    ) -> Result<Vec<LogEntryRow>, StoreError> {
        logexport::fetch_unprocessed_logs(&self.pool, job_run_id, max).await
    }

    async fn mark_logs_processed(
        &self,
        job_run_id: &JobRunId,
        log_entry_ids: &[u64],
    ) -> Result<(), StoreError> {
        logexport::mark_logs_processed(&self.pool, job_run_id, log_entry_ids).await
    }

    async fn list_runs_with_unqueued_tasks(&self) -> Result<Vec<JobRunId>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT job_run_id FROM tasks WHERE status = 'UNQUEUED'",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(s,)| s.parse().map_err(StoreError::from))
            .collect()
    }

    async fn list_runs_with_unprocessed_logs(&self) -> Result<Vec<JobRunId>, StoreError> {
        logexport::list_runs_with_unprocessed_logs(&self.pool).await
    }

    fn known_task_types(&self) -> &'static [TaskType] {
        KNOWN_TASK_TYPES
    }

    async fn delete_job_run(&self, job_run_id: &JobRunId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM log_entries WHERE job_run_id = $1")
            .bind(job_run_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tasks WHERE job_run_id = $1")
            .bind(job_run_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM job_runs WHERE id = $1")
            .bind(job_run_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_receiver_projects(&self) -> Result<Vec<ProjectInfo>, StoreError> {
        projects::list_receiver_projects(&self.pool).await
    }

    async fn list_unused_projects(&self, page_size: usize) -> Result<Vec<ProjectInfo>, StoreError> {
        projects::list_unused_projects(&self.pool, page_size).await
    }

    async fn delete_project(&self, project_id: &ProjectId) -> Result<(), StoreError> {
        projects::delete_project(&self.pool, project_id).await
    }
}
