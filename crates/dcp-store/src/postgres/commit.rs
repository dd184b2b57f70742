use dcp_types::{Counters, JobRunId, TaskId};
use sqlx::PgPool;
use tracing::{instrument, warn};

use super::{now, TaskRow};
use crate::commit::{new_task_counter_deltas, process_update};
use crate::error::StoreError;
use crate::model::{CommitCollection, CommitReport, UpdateOutcome};

#[instrument(skip(pool, updates), fields(update_count = updates.len()))]
pub(crate) async fn commit_updates(
    pool: &PgPool,
    updates: CommitCollection,
) -> Result<CommitReport, StoreError> {
    let mut report = CommitReport::default();

    for update in updates.updates {
        let task_id = update.task_id.clone();
        let job_run_id = task_id.job_run_id();
        let mut tx = pool.begin().await?;

        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT id, job_run_id, task_type, spec, status, failure_type, failure_message, \
             created_at, last_modified_at FROM tasks WHERE id = $1 FOR UPDATE",
        )
        .bind(task_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::TaskNotFound(task_id));
        };
        let pre = row.into_task()?;

        let commit_now = now();
        let (outcome, applied) = process_update(update, &pre, commit_now)?;
        report.outcomes.push((task_id.clone(), outcome.clone()));

        let Some(applied) = applied else {
            if outcome == UpdateOutcome::SkippedNotMonotonic {
                warn!(task_id = %task_id, "received non-monotonic status update, ignoring");
            }
            tx.rollback().await?;
            continue;
        };

        sqlx::query(
            "UPDATE tasks SET status = $1, spec = $2, failure_type = $3, failure_message = $4, \
             last_modified_at = $5 WHERE id = $6",
        )
        .bind(applied.task.status.to_string())
        .bind(serde_json::Value::Object(applied.task.spec.clone()))
        .bind(applied.task.failure_type.map(|f| f.to_i32()))
        .bind(&applied.task.failure_message)
        .bind(applied.task.last_modified_at)
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO log_entries (job_run_id, log_entry_id, task_id, creation_time, \
             current_status, previous_status, failure_message, payload, processed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE) \
             ON CONFLICT (job_run_id, log_entry_id) DO NOTHING",
        )
        .bind(job_run_id.to_string())
        .bind(applied.log_entry.log_entry_id as i64)
        .bind(task_id.to_string())
        .bind(applied.log_entry.creation_time)
        .bind(applied.log_entry.current_status.to_string())
        .bind(applied.log_entry.previous_status.to_string())
        .bind(&applied.log_entry.failure_message)
        .bind(serde_json::Value::Object(applied.log_entry.payload.clone()))
        .execute(&mut *tx)
        .await?;

        let mut counter_deltas = applied.counter_deltas;

        for new_task in applied.new_tasks {
            let full_id = TaskId::new(
                task_id.project.clone(),
                task_id.config_id.clone(),
                task_id.run_id.clone(),
                new_task.task_id,
            );
            sqlx::query(
                "INSERT INTO tasks (id, job_run_id, task_type, spec, status, created_at, \
                 last_modified_at) VALUES ($1, $2, $3, $4, 'UNQUEUED', $5, $5)",
            )
            .bind(full_id.to_string())
            .bind(job_run_id.to_string())
            .bind(new_task.task_type.to_string())
            .bind(serde_json::Value::Object(new_task.spec))
            .bind(commit_now)
            .execute(&mut *tx)
            .await?;

            for (k, v) in new_task_counter_deltas(new_task.task_type).0 {
                counter_deltas.add(k, v);
            }
        }

        apply_counter_deltas(&mut tx, &job_run_id, &counter_deltas).await?;

        if refresh_job_run_status(&mut tx, &job_run_id, commit_now).await? {
            report.job_runs_changed_to_terminal.push(job_run_id.clone());
        }

        tx.commit().await?;
    }

    Ok(report)
}

pub(crate) async fn apply_counter_deltas(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job_run_id: &JobRunId,
    deltas: &Counters,
) -> Result<(), StoreError> {
    if deltas.0.is_empty() {
        return Ok(());
    }
    let current: Option<(serde_json::Value,)> =
        sqlx::query_as("SELECT counters FROM job_runs WHERE id = $1 FOR UPDATE")
            .bind(job_run_id.to_string())
            .fetch_optional(&mut **tx)
            .await?;

    let mut counters = match current {
        Some((serde_json::Value::Object(m),)) => counters_from_json(&m),
        _ => Counters::new(),
    };
    for (k, v) in &deltas.0 {
        counters.add(k.clone(), *v);
    }

    sqlx::query(
        "INSERT INTO job_runs (id, counters) VALUES ($1, $2) \
         ON CONFLICT (id) DO UPDATE SET counters = EXCLUDED.counters",
    )
    .bind(job_run_id.to_string())
    .bind(counters_to_json(&counters))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub(crate) async fn refresh_job_run_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job_run_id: &JobRunId,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<bool, StoreError> {
    let row: Option<(serde_json::Value, String)> =
        sqlx::query_as("SELECT counters, status FROM job_runs WHERE id = $1")
            .bind(job_run_id.to_string())
            .fetch_optional(&mut **tx)
            .await?;

    let Some((counters_json, status_str)) = row else {
        return Ok(false);
    };
    let counters = match counters_json {
        serde_json::Value::Object(m) => counters_from_json(&m),
        _ => Counters::new(),
    };
    let pre_status: dcp_types::JobRunStatus = status_str.parse().unwrap_or(dcp_types::JobRunStatus::NotStarted);
    let new_status = dcp_types::JobRunStatus::derive(&counters);
    let became_terminal = new_status != pre_status && new_status.is_terminal();

    if new_status != pre_status {
        if became_terminal {
            sqlx::query("UPDATE job_runs SET status = $1, finish_time = $2 WHERE id = $3")
                .bind(new_status.to_string())
                .bind(now)
                .bind(job_run_id.to_string())
                .execute(&mut **tx)
                .await?;
        } else {
            sqlx::query("UPDATE job_runs SET status = $1 WHERE id = $2")
                .bind(new_status.to_string())
                .bind(job_run_id.to_string())
                .execute(&mut **tx)
                .await?;
        }
    }

    Ok(became_terminal)
}

fn counters_from_json(m: &dcp_types::JsonMap) -> Counters {
    let mut c = Counters::new();
    for (k, v) in m {
        if let Some(n) = v.as_i64() {
            c.add(k.clone(), n);
        }
    }
    c
}

fn counters_to_json(c: &Counters) -> serde_json::Value {
    let map: dcp_types::JsonMap = c
        .0
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::from(*v)))
        .collect();
    serde_json::Value::Object(map)
}
