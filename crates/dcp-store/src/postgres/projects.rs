use dcp_types::ProjectId;
use sqlx::PgPool;

use crate::error::StoreError;
use crate::model::ProjectInfo;

#[derive(sqlx::FromRow)]
struct Row {
    project_id: String,
    list_topic: String,
    copy_topic: String,
    list_progress_subscription: String,
    copy_progress_subscription: String,
    retired: bool,
}

impl Row {
    fn into_info(self) -> Result<ProjectInfo, StoreError> {
        Ok(ProjectInfo {
            project_id: self.project_id.parse()?,
            list_topic: self.list_topic,
            copy_topic: self.copy_topic,
            list_progress_subscription: self.list_progress_subscription,
            copy_progress_subscription: self.copy_progress_subscription,
            retired: self.retired,
        })
    }
}

const SELECT_COLUMNS: &str = "project_id, list_topic, copy_topic, \
     list_progress_subscription, copy_progress_subscription, retired";

pub(crate) async fn list_receiver_projects(pool: &PgPool) -> Result<Vec<ProjectInfo>, StoreError> {
    let query = format!(
        "SELECT {SELECT_COLUMNS} FROM projects WHERE NOT retired ORDER BY project_id"
    );
    let rows: Vec<Row> = sqlx::query_as(&query).fetch_all(pool).await?;
    rows.into_iter().map(Row::into_info).collect()
}

pub(crate) async fn list_unused_projects(
    pool: &PgPool,
    page_size: usize,
) -> Result<Vec<ProjectInfo>, StoreError> {
    let query =
        format!("SELECT {SELECT_COLUMNS} FROM projects WHERE retired ORDER BY project_id LIMIT $1");
    let rows: Vec<Row> = sqlx::query_as(&query)
        .bind(page_size as i64)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(Row::into_info).collect()
}

pub(crate) async fn delete_project(pool: &PgPool, project_id: &ProjectId) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM projects WHERE project_id = $1")
        .bind(project_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}
