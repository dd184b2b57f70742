//! Batcher (§4.4): the single writer-guarded queue of pending `TaskUpdate`s
//! and the bus messages they came from. Updates are merged per task id
//! under the monotonic "higher post-status wins" rule before the flush
//! ever reaches the store, and every pending message is acknowledged only
//! once that flush commits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dcp_bus::{MessageBus, Receipt};
use dcp_store::{CommitCollection, TaskStore, TaskUpdate};
use dcp_types::TaskId;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::BackoffConfig;
use crate::error::EngineError;
use crate::notify::TerminalNotifier;

struct PendingMessage {
    subscription: String,
    receipt: Receipt,
}

#[derive(Default)]
struct Pending {
    updates: HashMap<TaskId, TaskUpdate>,
    messages: Vec<PendingMessage>,
}

impl Pending {
    /// Tasks updated plus the successors they would insert: the quantity
    /// §4.4 bounds against `max_batch_size`.
    fn weight(&self) -> usize {
        self.updates
            .values()
            .map(|u| 1 + u.new_tasks.len())
            .sum()
    }

    fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    fn take(&mut self) -> (CommitCollection, Vec<PendingMessage>) {
        let mut collection = CommitCollection::new();
        for (_, update) in self.updates.drain() {
            collection.push(update);
        }
        (collection, std::mem::take(&mut self.messages))
    }

    /// Same-task duplicates resolve to the update with the higher proposed
    /// status (§4.4); the loser's successors are discarded, but the
    /// message that produced it is still tracked for acking.
    fn add(&mut self, update: TaskUpdate) {
        match self.updates.get(&update.task_id) {
            Some(existing) if existing.proposed_status >= update.proposed_status => {}
            _ => {
                self.updates.insert(update.task_id.clone(), update);
            }
        }
    }
}

pub struct Batcher {
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn MessageBus>,
    max_batch_size: usize,
    backoff: BackoffConfig,
    pending: Mutex<Pending>,
    terminal_notifier: Option<TerminalNotifier>,
}

impl Batcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        bus: Arc<dyn MessageBus>,
        max_batch_size: usize,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            store,
            bus,
            max_batch_size,
            backoff,
            pending: Mutex::new(Pending::default()),
            terminal_notifier: None,
        }
    }

    /// Attaches the sink `CommitUpdates` posts to on every JobRun terminal
    /// transition, consumed by the log-export driver to force an immediate
    /// flush (§4.8/§9).
    pub fn with_terminal_notifier(mut self, notifier: TerminalNotifier) -> Self {
        self.terminal_notifier = Some(notifier);
        self
    }

    /// Append `update` (sourced from `subscription`/`receipt`), flushing
    /// first if this addition would push the pending weight past
    /// `max_batch_size`.
    pub async fn add(
        &self,
        update: TaskUpdate,
        subscription: &str,
        receipt: Receipt,
    ) -> Result<(), EngineError> {
        {
            let mut pending = self.pending.lock().await;
            let additional = 1 + update.new_tasks.len();
            if pending.weight() + additional > self.max_batch_size && !pending.is_empty() {
                drop(pending);
                self.flush().await?;
                pending = self.pending.lock().await;
            }
            pending.add(update);
            pending.messages.push(PendingMessage {
                subscription: subscription.to_string(),
                receipt,
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<(), EngineError> {
        let (collection, messages) = {
            let mut pending = self.pending.lock().await;
            if pending.is_empty() {
                return Ok(());
            }
            pending.take()
        };

        let pending_count = collection.len();
        let mut attempt = 0u32;
        loop {
            match self.store.commit_updates(collection.clone()).await {
                Ok(report) => {
                    for message in &messages {
                        self.bus.ack(&message.subscription, &message.receipt).await?;
                    }
                    if let Some(notifier) = &self.terminal_notifier {
                        for job_run_id in &report.job_runs_changed_to_terminal {
                            notifier.notify(job_run_id.clone());
                        }
                    }
                    info!(
                        pending_count,
                        outcomes = report.outcomes.len(),
                        "batcher flush committed"
                    );
                    return Ok(());
                }
                Err(err) if attempt < self.backoff.max_attempts => {
                    warn!(attempt, error = %err, "batcher flush failed, retrying");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(EngineError::FlushExhausted(Box::new(EngineError::from(err))));
                }
            }
        }
    }

    /// Runs `flush` on a fixed interval until `cancel` fires, per the
    /// ticker-driven flush loop in §4.4.
    pub async fn run_flush_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.flush().await {
                        warn!(error = %err, "scheduled batcher flush failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcp_bus::MemoryBus;
    use dcp_store::MemoryTaskStore;
    use dcp_types::{JobRunId, TaskStatus, TaskType};

    fn task_id(n: &str) -> TaskId {
        format!("projects/p/jobConfigs/c/jobRuns/r/tasks/{n}").parse().unwrap()
    }

    async fn seeded_store() -> Arc<MemoryTaskStore> {
        let store = MemoryTaskStore::new();
        let run_id: JobRunId = "projects/p/jobConfigs/c/jobRuns/r".parse().unwrap();
        store
            .insert_root_task(&run_id, &task_id("a"), TaskType::Copy, dcp_types::JsonMap::new())
            .await
            .unwrap();
        store
            .insert_root_task(&run_id, &task_id("b"), TaskType::Copy, dcp_types::JsonMap::new())
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn add_merges_duplicate_task_updates_by_higher_status() {
        let store = seeded_store().await;
        let bus = Arc::new(MemoryBus::new());
        let batcher = Batcher::new(store.clone(), bus.clone(), 100, BackoffConfig::default());

        batcher
            .add(
                TaskUpdate::new(task_id("a"), TaskStatus::Queued),
                "sub",
                Receipt("1".to_string()),
            )
            .await
            .unwrap();
        batcher
            .add(
                TaskUpdate::new(task_id("a"), TaskStatus::Succeeded),
                "sub",
                Receipt("2".to_string()),
            )
            .await
            .unwrap();

        let pending = batcher.pending.lock().await;
        assert_eq!(pending.updates.len(), 1);
        assert_eq!(
            pending.updates.get(&task_id("a")).unwrap().proposed_status,
            TaskStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn flush_commits_and_acks_then_clears_pending() {
        let store = seeded_store().await;
        let bus = Arc::new(MemoryBus::new());
        let batcher = Batcher::new(store.clone(), bus.clone(), 100, BackoffConfig::default());

        batcher
            .add(
                TaskUpdate::new(task_id("a"), TaskStatus::Succeeded),
                "sub",
                Receipt("1".to_string()),
            )
            .await
            .unwrap();
        batcher.flush().await.unwrap();

        let pending = batcher.pending.lock().await;
        assert!(pending.is_empty());
        assert!(pending.messages.is_empty());
    }

    #[tokio::test]
    async fn add_triggers_eager_flush_past_max_batch_size() {
        let store = seeded_store().await;
        let bus = Arc::new(MemoryBus::new());
        let batcher = Batcher::new(store.clone(), bus.clone(), 1, BackoffConfig::default());

        batcher
            .add(
                TaskUpdate::new(task_id("a"), TaskStatus::Queued),
                "sub",
                Receipt("1".to_string()),
            )
            .await
            .unwrap();
        // Second add exceeds weight 1, forcing a flush of the first before
        // this one is buffered.
        batcher
            .add(
                TaskUpdate::new(task_id("b"), TaskStatus::Queued),
                "sub",
                Receipt("2".to_string()),
            )
            .await
            .unwrap();

        let pending = batcher.pending.lock().await;
        assert_eq!(pending.updates.len(), 1);
        assert!(pending.updates.contains_key(&task_id("b")));
    }
}
