use dcp_types::{Counters, JobRunId};
use sqlx::PgPool;
use tracing::{instrument, warn};

use super::commit::{apply_counter_deltas, refresh_job_run_status};
use super::{now, TaskRow};
use crate::error::StoreError;
use crate::traits::TaskRouter;

#[instrument(skip(pool, router), fields(job_run_id = %job_run_id, max))]
pub(crate) async fn queue_unqueued_tasks(
    pool: &PgPool,
    job_run_id: &JobRunId,
    max: usize,
    router: &dyn TaskRouter,
) -> Result<usize, StoreError> {
    let rows: Vec<TaskRow> = sqlx::query_as(
        "SELECT id, job_run_id, task_type, spec, status, failure_type, failure_message, \
         created_at, last_modified_at FROM tasks \
         WHERE job_run_id = $1 AND status = 'UNQUEUED' LIMIT $2",
    )
    .bind(job_run_id.to_string())
    .bind(max as i64)
    .fetch_all(pool)
    .await?;

    let mut queued = 0;
    for row in rows {
        let task_id_str = row.id.clone();
        let task = row.into_task()?;

        let mut tx = pool.begin().await?;
        let locked: Option<(String,)> =
            sqlx::query_as("SELECT status FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(&task_id_str)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((status,)) = locked else {
            tx.rollback().await?;
            continue;
        };
        if status != "UNQUEUED" {
            tx.rollback().await?;
            continue;
        }

        if let Err(e) = router.route(&task).await {
            warn!(task_id = %task_id_str, error = %e, "routing claimed task failed, leaving unqueued");
            tx.rollback().await?;
            continue;
        }

        sqlx::query("UPDATE tasks SET status = 'QUEUED', last_modified_at = $1 WHERE id = $2")
            .bind(now())
            .bind(&task_id_str)
            .execute(&mut *tx)
            .await?;

        let mut deltas = Counters::new();
        deltas.add(dcp_types::counters::TASKS_UNQUEUED, -1);
        deltas.add(dcp_types::counters::TASKS_QUEUED, 1);
        deltas.add(
            Counters::per_type_key(dcp_types::counters::TASKS_UNQUEUED, task.task_type),
            -1,
        );
        deltas.add(
            Counters::per_type_key(dcp_types::counters::TASKS_QUEUED, task.task_type),
            1,
        );
        apply_counter_deltas(&mut tx, job_run_id, &deltas).await?;
        refresh_job_run_status(&mut tx, job_run_id, now()).await?;

        tx.commit().await?;
        queued += 1;
    }

    Ok(queued)
}
