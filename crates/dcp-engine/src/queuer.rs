//! Queuer (§4.6): periodically claims `Unqueued` tasks and publishes them,
//! independent of the receiver. Races between the two are resolved by the
//! store's monotonic-status rule, not by coordination here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dcp_bus::MessageBus;
use dcp_store::{TaskRouter, TaskStore};
use dcp_types::{JsonMap, Task, TaskType};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::BackoffConfig;
use crate::error::EngineError;

/// Publishes a claimed task to the topic its type routes to, per the
/// `{taskRelativeResourceName, taskParams}` queued-message wire format
/// (§6).
pub struct BusRouter {
    bus: Arc<dyn MessageBus>,
    routing: std::collections::HashMap<TaskType, String>,
}

impl BusRouter {
    pub fn new(bus: Arc<dyn MessageBus>, routing: std::collections::HashMap<TaskType, String>) -> Self {
        Self { bus, routing }
    }
}

#[async_trait]
impl TaskRouter for BusRouter {
    async fn route(&self, task: &Task) -> Result<(), dcp_store::StoreError> {
        let topic = self.routing.get(&task.task_type).ok_or_else(|| {
            dcp_store::StoreError::UnknownTaskTypeForRouting {
                task_id: task.id.clone(),
                task_type: task.task_type.to_string(),
            }
        })?;

        let mut body = JsonMap::new();
        body.insert(
            "taskRelativeResourceName".to_string(),
            serde_json::Value::String(task.id.to_string()),
        );
        body.insert(
            "taskParams".to_string(),
            serde_json::Value::Object(task.spec.clone()),
        );
        let payload = serde_json::to_vec(&serde_json::Value::Object(body))
            .map_err(|e| dcp_store::StoreError::Publish(e.to_string()))?;

        self.bus
            .publish(topic, payload)
            .await
            .map_err(|e| dcp_store::StoreError::Publish(e.to_string()))
    }
}

pub struct Queuer {
    store: Arc<dyn TaskStore>,
    router: Arc<BusRouter>,
    batch_size: usize,
    poll_interval: Duration,
    backoff: BackoffConfig,
}

impl Queuer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        router: Arc<BusRouter>,
        batch_size: usize,
        poll_interval: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            store,
            router,
            batch_size,
            poll_interval,
            backoff,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.cycle() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    #[instrument(skip(self))]
    async fn cycle(&self) {
        let runs = match self.store.list_runs_with_unqueued_tasks().await {
            Ok(runs) => runs,
            Err(err) => {
                warn!(error = %err, "failed to list job runs with unqueued tasks");
                return;
            }
        };

        for job_run_id in runs {
            if let Err(err) = self.queue_run_with_retry(&job_run_id).await {
                warn!(error = %err, %job_run_id, "queuer exhausted retries for job run");
            }
        }
    }

    async fn queue_run_with_retry(
        &self,
        job_run_id: &dcp_types::JobRunId,
    ) -> Result<(), EngineError> {
        let mut attempt = 0u32;
        loop {
            match self
                .store
                .queue_unqueued_tasks(job_run_id, self.batch_size, self.router.as_ref())
                .await
            {
                Ok(count) => {
                    if count > 0 {
                        info!(%job_run_id, count, "queued tasks");
                    }
                    return Ok(());
                }
                Err(err) if attempt < self.backoff.max_attempts => {
                    warn!(attempt, error = %err, "queue_unqueued_tasks failed, retrying");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
