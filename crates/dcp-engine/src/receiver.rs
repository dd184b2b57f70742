//! Receiver (§4.5): the bridge from completion messages to `TaskUpdate`s.
//!
//! `SingleSubscriptionReceiver` services one fixed subscription directly.
//! `RoundRobinReceiver` periodically re-reads the store's project
//! directory and keeps one single-subscription worker running per active
//! project, restarting any that exit.
//!
//! Both share `poll_once`: resolve the task's current row (for its type
//! and stored spec), resolve its job spec through the cache, dispatch to
//! the matching handler, and hand the result to the batcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dcp_bus::{MessageBus, Receipt};
use dcp_store::TaskStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::batcher::Batcher;
use crate::cache::JobSpecCache;
use crate::error::EngineError;
use crate::handlers::{self, CompletionMessage, ObjectStore};

const EMPTY_POLL_BACKOFF: Duration = Duration::from_millis(250);

/// Shared plumbing a receiver needs regardless of mode.
pub struct ReceiverContext {
    pub store: Arc<dyn TaskStore>,
    pub bus: Arc<dyn MessageBus>,
    pub object_store: Arc<dyn ObjectStore>,
    pub batcher: Arc<Batcher>,
    pub cache: JobSpecCache,
    pub working_space_prefix: String,
    pub max_messages_per_poll: usize,
}

async fn poll_once(ctx: &ReceiverContext, subscription: &str) -> Result<usize, EngineError> {
    let messages = ctx
        .bus
        .receive(subscription, ctx.max_messages_per_poll)
        .await?;
    let count = messages.len();

    for inbound in messages {
        if let Err(err) = handle_one(ctx, subscription, &inbound.payload, inbound.receipt.clone()).await {
            warn!(error = %err, subscription, "dropping undelivered completion message");
        }
    }

    Ok(count)
}

#[instrument(skip(ctx, payload, receipt))]
async fn handle_one(
    ctx: &ReceiverContext,
    subscription: &str,
    payload: &[u8],
    receipt: Receipt,
) -> Result<(), EngineError> {
    let message = CompletionMessage::parse(payload)?;
    let task_id = message.task_id()?;
    debug!(%task_id, "received completion message");

    let task = ctx.store.get_task(&task_id).await?;
    let job_spec = ctx.cache.get(ctx.store.as_ref(), &task_id.project, &task_id.config_id).await?;

    let update = handlers::handle(
        &task,
        &job_spec,
        &message,
        ctx.object_store.as_ref(),
        &ctx.working_space_prefix,
    )
    .await?;

    ctx.batcher.add(update, subscription, receipt).await
}

pub struct SingleSubscriptionReceiver {
    ctx: Arc<ReceiverContext>,
    subscription: String,
}

impl SingleSubscriptionReceiver {
    pub fn new(ctx: Arc<ReceiverContext>, subscription: String) -> Self {
        Self { ctx, subscription }
    }

    /// Polls until `cancel` fires, sleeping briefly between empty polls
    /// rather than busy-looping the bus client.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                result = poll_once(&self.ctx, &self.subscription) => result,
            };
            match received {
                Ok(0) => tokio::time::sleep(EMPTY_POLL_BACKOFF).await,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, subscription = %self.subscription, "receiver poll failed");
                    tokio::time::sleep(EMPTY_POLL_BACKOFF).await;
                }
            }
        }
    }
}

/// Discovers active projects from the store and runs one
/// `SingleSubscriptionReceiver` per project, restarting any whose worker
/// exits. Uses each project's `list_progress_subscription` as the single
/// completions subscription serviced per project.
pub struct RoundRobinReceiver {
    ctx: Arc<ReceiverContext>,
    default_project: String,
    default_subscription: String,
    discovery_interval: Duration,
}

impl RoundRobinReceiver {
    pub fn new(
        ctx: Arc<ReceiverContext>,
        default_project: String,
        default_subscription: String,
        discovery_interval: Duration,
    ) -> Self {
        Self {
            ctx,
            default_project,
            default_subscription,
            discovery_interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut workers: HashMap<String, JoinHandle<()>> = HashMap::new();
        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel::<String>();
        let mut ticker = tokio::time::interval(self.discovery_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    for (_, handle) in workers.drain() {
                        handle.abort();
                    }
                    return;
                }
                Some(failed_project) = failed_rx.recv() => {
                    workers.remove(&failed_project);
                }
                _ = ticker.tick() => {
                    self.reconcile(&mut workers, &failed_tx, &cancel).await;
                }
            }
        }
    }

    async fn reconcile(
        &self,
        workers: &mut HashMap<String, JoinHandle<()>>,
        failed_tx: &mpsc::UnboundedSender<String>,
        cancel: &CancellationToken,
    ) {
        let projects = match self.ctx.store.list_receiver_projects().await {
            Ok(projects) if !projects.is_empty() => projects
                .into_iter()
                .map(|p| (p.project_id.project, p.list_progress_subscription))
                .collect::<Vec<_>>(),
            Ok(_) => vec![(self.default_project.clone(), self.default_subscription.clone())],
            Err(err) => {
                warn!(error = %err, "project discovery failed, falling back to default project");
                vec![(self.default_project.clone(), self.default_subscription.clone())]
            }
        };

        for (project, subscription) in projects {
            if workers.contains_key(&project) {
                continue;
            }
            let ctx = self.ctx.clone();
            let failed_tx = failed_tx.clone();
            let child_cancel = cancel.child_token();
            let project_for_task = project.clone();
            let handle = tokio::spawn(async move {
                let receiver = SingleSubscriptionReceiver::new(ctx, subscription);
                receiver.run(child_cancel).await;
                let _ = failed_tx.send(project_for_task);
            });
            workers.insert(project, handle);
        }
    }
}
