use dcp_types::{JobRunId, TaskId};
use sqlx::PgPool;

use crate::error::StoreError;
use crate::model::LogEntryRow;

pub(crate) async fn count_unprocessed_logs(
    pool: &PgPool,
    job_run_id: &JobRunId,
) -> Result<i64, StoreError> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM log_entries WHERE job_run_id = $1 AND NOT processed",
    )
    .bind(job_run_id.to_string())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub(crate) async fn fetch_unprocessed_logs(
    pool: &PgPool,
    job_run_id: &JobRunId,
    max: usize,
) -> Result<Vec<LogEntryRow>, StoreError> {
    #[derive(sqlx::FromRow)]
    struct Row {
        task_id: String,
        log_entry_id: i64,
        creation_time: chrono::DateTime<chrono::Utc>,
        current_status: String,
        previous_status: String,
        failure_message: Option<String>,
        payload: serde_json::Value,
    }

    let rows: Vec<Row> = sqlx::query_as(
        "SELECT task_id, log_entry_id, creation_time, current_status, previous_status, \
         failure_message, payload FROM log_entries \
         WHERE job_run_id = $1 AND NOT processed ORDER BY log_entry_id LIMIT $2",
    )
    .bind(job_run_id.to_string())
    .bind(max as i64)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let task_id: TaskId = row.task_id.parse()?;
        let payload = match row.payload {
            serde_json::Value::Object(m) => m,
            _ => dcp_types::JsonMap::new(),
        };
        out.push(LogEntryRow {
            current_status: row.current_status.parse().map_err(|_| {
                StoreError::Database(sqlx::Error::Decode(
                    format!("unknown task status '{}'", row.current_status).into(),
                ))
            })?,
            previous_status: row.previous_status.parse().map_err(|_| {
                StoreError::Database(sqlx::Error::Decode(
                    format!("unknown task status '{}'", row.previous_status).into(),
                ))
            })?,
            task_id,
            log_entry_id: row.log_entry_id as u64,
            creation_time: row.creation_time,
            failure_message: row.failure_message,
            payload,
            processed: false,
        });
    }
    Ok(out)
}

pub(crate) async fn list_runs_with_unprocessed_logs(
    pool: &PgPool,
) -> Result<Vec<JobRunId>, StoreError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT job_run_id FROM log_entries WHERE NOT processed",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(|(s,)| s.parse().map_err(StoreError::from)).collect()
}

pub(crate) async fn mark_logs_processed(
    pool: &PgPool,
    job_run_id: &JobRunId,
    log_entry_ids: &[u64],
) -> Result<(), StoreError> {
    let ids: Vec<i64> = log_entry_ids.iter().map(|&id| id as i64).collect();
    sqlx::query(
        "UPDATE log_entries SET processed = TRUE \
         WHERE job_run_id = $1 AND log_entry_id = ANY($2)",
    )
    .bind(job_run_id.to_string())
    .bind(&ids)
    .execute(pool)
    .await?;
    Ok(())
}
