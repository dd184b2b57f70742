//! Log-export driver (§4.8): batches unprocessed log-entry rows out to
//! per-job-config log files in the destination bucket, then marks them
//! processed. Flushes on a size threshold, on a stalled-progress timeout,
//! or immediately on a forced terminal-transition notification.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dcp_store::{LogEntryRow, TaskStore};
use dcp_types::JobRunId;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::EngineError;
use crate::notify::TerminalNotifications;

/// Renders a single log-entry row per the §4.8 line format:
/// `<RFC3339-nanos> <taskID> <prev>-><curr> FailureMessage:'<sanitized>' WorkerLog:'<payload>'`.
pub fn render_line(row: &LogEntryRow) -> String {
    let failure = row.failure_message.as_deref().unwrap_or("");
    let payload = dcp_types::value::to_spec_string(&row.payload);
    format!(
        "{} {} {}->{} FailureMessage:'{}' WorkerLog:'{}'\n",
        row.creation_time.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        row.task_id,
        sanitize(&row.previous_status.to_string()),
        sanitize(&row.current_status.to_string()),
        sanitize(failure),
        sanitize(&payload),
    )
}

fn sanitize(s: &str) -> String {
    s.replace('\n', "\\n").replace('\'', "`")
}

/// Writes a batch of rendered log lines to one object. Implemented by the
/// real object-store client in production; `MemoryObjectStore` cannot
/// append bytes so tests supply a capturing stub instead.
#[async_trait::async_trait]
pub trait LogWriter: Send + Sync {
    async fn write_log_file(
        &self,
        bucket: &str,
        object: &str,
        contents: String,
    ) -> Result<(), dcp_objectstore::ObjectStoreError>;
}

/// Writes log files straight into the in-memory object store, for running
/// the engine without a cloud object-store backend.
#[async_trait::async_trait]
impl LogWriter for dcp_objectstore::MemoryObjectStore {
    async fn write_log_file(
        &self,
        bucket: &str,
        object: &str,
        contents: String,
    ) -> Result<(), dcp_objectstore::ObjectStoreError> {
        self.put(bucket, object, contents.into_bytes(), 0);
        Ok(())
    }
}

pub struct LogExportDriver {
    store: Arc<dyn TaskStore>,
    writer: Arc<dyn LogWriter>,
    batch_size: usize,
    poll_interval: Duration,
    max_no_progress_ticks: u32,
    working_space_prefix: String,
}

struct RunProgress {
    last_count: i64,
    stalled_ticks: u32,
}

impl LogExportDriver {
    pub fn new(
        store: Arc<dyn TaskStore>,
        writer: Arc<dyn LogWriter>,
        batch_size: usize,
        poll_interval: Duration,
        max_no_progress_ticks: u32,
        working_space_prefix: String,
    ) -> Self {
        Self {
            store,
            writer,
            batch_size,
            poll_interval,
            max_no_progress_ticks,
            working_space_prefix,
        }
    }

    pub async fn run(&self, mut notifications: TerminalNotifications, cancel: CancellationToken) {
        let mut progress: HashMap<JobRunId, RunProgress> = HashMap::new();
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let forced: std::collections::HashSet<_> = notifications.drain().into_iter().collect();
                    let runs = match self.store.list_runs_with_unprocessed_logs().await {
                        Ok(runs) => runs,
                        Err(err) => {
                            warn!(error = %err, "failed to list job runs with unprocessed logs");
                            continue;
                        }
                    };
                    let due: std::collections::HashSet<_> = runs.iter().cloned().collect();
                    for job_run_id in runs.iter().chain(forced.difference(&due)) {
                        self.tick_one(job_run_id, forced.contains(job_run_id), &mut progress).await;
                    }
                }
            }
        }
    }

    async fn tick_one(
        &self,
        job_run_id: &JobRunId,
        forced: bool,
        progress: &mut HashMap<JobRunId, RunProgress>,
    ) {
        let count = match self.store.count_unprocessed_logs(job_run_id).await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, %job_run_id, "failed to count unprocessed logs");
                return;
            }
        };

        if count <= 0 && !forced {
            progress.remove(job_run_id);
            return;
        }

        let entry = progress.entry(job_run_id.clone()).or_insert(RunProgress {
            last_count: -1,
            stalled_ticks: 0,
        });

        let stalled = count > 0 && count == entry.last_count;
        entry.stalled_ticks = if stalled { entry.stalled_ticks + 1 } else { 0 };
        entry.last_count = count;

        let should_flush =
            forced || count >= self.batch_size as i64 || entry.stalled_ticks >= self.max_no_progress_ticks;

        if should_flush {
            if let Err(err) = self.flush(job_run_id).await {
                warn!(error = %err, %job_run_id, "log export flush failed");
            } else {
                progress.remove(job_run_id);
            }
        }
    }

    #[instrument(skip(self))]
    async fn flush(&self, job_run_id: &JobRunId) -> Result<(), EngineError> {
        let rows = self
            .store
            .fetch_unprocessed_logs(job_run_id, self.batch_size)
            .await?;
        if rows.is_empty() {
            return Ok(());
        }

        let job_config_id = format!("projects/{}/jobConfigs/{}", job_run_id.project, job_run_id.config_id);
        let job_spec = self.store.get_job_spec(&job_config_id).await?;
        let bucket = dcp_types::value::require_str(&job_spec, "dst_bucket")
            .map_err(EngineError::from)?
            .to_string();

        let mut groups: HashMap<String, Vec<&LogEntryRow>> = HashMap::new();
        for row in &rows {
            groups.entry(row.task_id.config_id.clone()).or_default().push(row);
        }

        let mut processed_ids = Vec::with_capacity(rows.len());
        for (config_id, group_rows) in groups {
            let first_time = group_rows[0]
                .creation_time
                .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
            let object = format!("{}/logs/{}/{}.log", self.working_space_prefix, config_id, first_time);
            let mut contents = String::new();
            for row in &group_rows {
                contents.push_str(&render_line(row));
            }
            self.writer.write_log_file(&bucket, &object, contents).await?;
            processed_ids.extend(group_rows.iter().map(|r| r.log_entry_id));
        }

        self.store.mark_logs_processed(job_run_id, &processed_ids).await?;
        info!(%job_run_id, rows = rows.len(), "log export flush complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dcp_types::{JsonMap, TaskId, TaskStatus};
    use std::sync::Mutex;

    fn row(task_id: &str, payload: &str) -> LogEntryRow {
        LogEntryRow {
            task_id: task_id.parse::<TaskId>().unwrap(),
            log_entry_id: 1,
            creation_time: Utc::now(),
            current_status: TaskStatus::Succeeded,
            previous_status: TaskStatus::Queued,
            failure_message: Some("bad 'quote'\nline".to_string()),
            payload: JsonMap::new(),
            processed: false,
        }
    }

    #[test]
    fn render_line_sanitizes_newlines_and_quotes() {
        let line = render_line(&row("projects/p/jobConfigs/c/jobRuns/r/tasks/t", "x"));
        assert!(line.contains("FailureMessage:'bad `quote`\\nline'"));
        assert!(!line.contains('\n') || line.ends_with('\n'));
    }

    struct CapturingWriter {
        writes: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait::async_trait]
    impl LogWriter for CapturingWriter {
        async fn write_log_file(
            &self,
            bucket: &str,
            object: &str,
            contents: String,
        ) -> Result<(), dcp_objectstore::ObjectStoreError> {
            self.writes
                .lock()
                .unwrap()
                .push((bucket.to_string(), object.to_string(), contents));
            Ok(())
        }
    }

    #[tokio::test]
    async fn flush_groups_by_config_and_marks_processed() {
        use dcp_store::MemoryTaskStore;
        use serde_json::json;

        let store = Arc::new(MemoryTaskStore::new());
        let mut spec = JsonMap::new();
        spec.insert("dst_bucket".to_string(), json!("dst"));
        store.put_job_spec("projects/p/jobConfigs/c", spec).await;

        let run_id: JobRunId = "projects/p/jobConfigs/c/jobRuns/r".parse().unwrap();
        let task_id: TaskId = "projects/p/jobConfigs/c/jobRuns/r/tasks/t".parse().unwrap();
        store
            .insert_root_task(&run_id, &task_id, dcp_types::TaskType::Copy, JsonMap::new())
            .await
            .unwrap();

        let mut collection = dcp_store::CommitCollection::new();
        let mut log_payload = JsonMap::new();
        log_payload.insert("bytesCopied".to_string(), json!(10));
        collection.push(
            dcp_store::TaskUpdate::new(task_id.clone(), TaskStatus::Succeeded)
                .with_log_payload(log_payload),
        );
        store.commit_updates(collection).await.unwrap();

        let writer = Arc::new(CapturingWriter {
            writes: Mutex::new(Vec::new()),
        });
        let driver = LogExportDriver::new(
            store.clone(),
            writer.clone(),
            100,
            Duration::from_secs(60),
            60,
            "_ws".to_string(),
        );

        driver.flush(&run_id).await.unwrap();

        assert_eq!(writer.writes.lock().unwrap().len(), 1);
        assert_eq!(store.count_unprocessed_logs(&run_id).await.unwrap(), 0);
    }
}
