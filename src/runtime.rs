//! Process bootstrap (§4.12): turns a loaded `DcpConfig` into concrete
//! store/bus/object-store implementations and runs each subcommand's loop
//! to completion or cancellation.

use std::sync::Arc;

use dcp_bus::{MemoryBus, MessageBus, PgBus};
use dcp_engine::config::{DcpConfig, ReceiverMode};
use dcp_engine::handlers::ObjectStore;
use dcp_engine::logexport::LogWriter;
use dcp_engine::{
    terminal_notify_channel, Batcher, BusRouter, Cleaner, JobSpecCache, LogExportDriver, Queuer,
    ReceiverContext, RoundRobinReceiver, SingleSubscriptionReceiver, TerminalNotifications,
};
use dcp_objectstore::MemoryObjectStore;
use dcp_store::{PostgresTaskStore, TaskStore};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::DcpError;

/// The engine's wired-up collaborators, built once at process start and
/// shared read-only across whichever subcommand's loop runs.
pub struct Engine {
    pub config: DcpConfig,
    pub store: Arc<dyn TaskStore>,
    pub bus: Arc<dyn MessageBus>,
    object_store: MemoryObjectStore,
}

impl Engine {
    pub async fn bootstrap(config: DcpConfig) -> Result<Self, DcpError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.dsn)
            .await?;

        let store = PostgresTaskStore::new(pool.clone());
        store.run_migrations().await?;
        let store: Arc<dyn TaskStore> = Arc::new(store);

        let bus: Arc<dyn MessageBus> = match config.bus.provider.as_str() {
            "postgres" => Arc::new(PgBus::new(pool)),
            "memory" => Arc::new(MemoryBus::new()),
            other => return Err(DcpError::UnknownBusProvider(other.to_string())),
        };

        Ok(Self {
            config,
            store,
            bus,
            object_store: MemoryObjectStore::new(),
        })
    }

    fn object_store(&self) -> Arc<dyn ObjectStore> {
        Arc::new(self.object_store.clone())
    }

    fn log_writer(&self) -> Arc<dyn LogWriter> {
        Arc::new(self.object_store.clone())
    }

    fn batcher(&self) -> (Arc<Batcher>, TerminalNotifications) {
        let (notifier, notifications) = terminal_notify_channel();
        let batcher = Arc::new(
            Batcher::new(
                self.store.clone(),
                self.bus.clone(),
                self.config.batcher.max_batch_size,
                self.config.batcher.backoff.clone(),
            )
            .with_terminal_notifier(notifier),
        );
        (batcher, notifications)
    }

    fn router(&self) -> Arc<BusRouter> {
        Arc::new(BusRouter::new(self.bus.clone(), self.config.bus.routing_table()))
    }

    fn receiver_context(&self, batcher: Arc<Batcher>) -> Arc<ReceiverContext> {
        Arc::new(ReceiverContext {
            store: self.store.clone(),
            bus: self.bus.clone(),
            object_store: self.object_store(),
            batcher,
            cache: JobSpecCache::new(self.config.receiver.job_spec_cache_capacity),
            working_space_prefix: self.config.log_export.working_space_prefix.clone(),
            max_messages_per_poll: self.config.receiver.max_messages_per_poll,
        })
    }

    async fn run_receiver_loop(
        &self,
        ctx: Arc<ReceiverContext>,
        mode: ReceiverMode,
        cancel: CancellationToken,
    ) {
        match mode {
            ReceiverMode::Single => {
                info!(subscription = %self.config.receiver.subscription, "running single-subscription receiver");
                SingleSubscriptionReceiver::new(ctx, self.config.receiver.subscription.clone())
                    .run(cancel)
                    .await;
            }
            ReceiverMode::RoundRobin => {
                info!("running round-robin receiver");
                RoundRobinReceiver::new(
                    ctx,
                    self.config.project_id.clone(),
                    self.config.receiver.subscription.clone(),
                    self.config.receiver.project_discovery_interval(),
                )
                .run(cancel)
                .await;
            }
        }
    }

    pub async fn run_receiver(&self, mode_override: Option<ReceiverMode>, cancel: CancellationToken) {
        let (batcher, _notifications) = self.batcher();
        let ctx = self.receiver_context(batcher.clone());
        let mode = mode_override.unwrap_or(self.config.receiver.mode);

        tokio::join!(
            batcher.run_flush_loop(self.config.batcher.flush_interval(), cancel.child_token()),
            self.run_receiver_loop(ctx, mode, cancel.child_token()),
        );
    }

    pub async fn run_queuer(&self, cancel: CancellationToken) {
        Queuer::new(
            self.store.clone(),
            self.router(),
            self.config.queuer.batch_size,
            self.config.queuer.poll_interval(),
            self.config.queuer.backoff.clone(),
        )
        .run(cancel)
        .await;
    }

    pub async fn run_cleaner(&self, cancel: CancellationToken) {
        Cleaner::new(
            self.store.clone(),
            self.bus.clone(),
            self.config.cleaner.page_size,
            self.config.cleaner.poll_interval(),
        )
        .run(cancel)
        .await;
    }

    pub async fn run_log_export(&self, notifications: TerminalNotifications, cancel: CancellationToken) {
        LogExportDriver::new(
            self.store.clone(),
            self.log_writer(),
            self.config.log_export.batch_size,
            self.config.log_export.poll_interval(),
            self.config.log_export.max_no_progress_ticks,
            self.config.log_export.working_space_prefix.clone(),
        )
        .run(notifications, cancel)
        .await;
    }

    /// Runs every loop under one runtime, wired to a single shared batcher
    /// so the log exporter's forced-flush channel actually has a producer.
    pub async fn run_all(&self, cancel: CancellationToken) {
        let (batcher, notifications) = self.batcher();
        let ctx = self.receiver_context(batcher.clone());

        tokio::join!(
            batcher.run_flush_loop(self.config.batcher.flush_interval(), cancel.child_token()),
            self.run_receiver_loop(ctx, self.config.receiver.mode, cancel.child_token()),
            self.run_queuer(cancel.child_token()),
            self.run_cleaner(cancel.child_token()),
            self.run_log_export(notifications, cancel.child_token()),
        );
    }
}
