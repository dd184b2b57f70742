//! Resource cleaner (§4.7): periodically tears down bus resources for
//! retired projects, deleting the project's directory row only once every
//! resource is confirmed gone.

use std::sync::Arc;
use std::time::Duration;

use dcp_bus::MessageBus;
use dcp_store::{ProjectInfo, TaskStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub struct Cleaner {
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn MessageBus>,
    page_size: usize,
    poll_interval: Duration,
}

impl Cleaner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        bus: Arc<dyn MessageBus>,
        page_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            page_size,
            poll_interval,
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
        let projects = match self.store.list_unused_projects(self.page_size).await {
            Ok(projects) => projects,
            Err(err) => {
                warn!(error = %err, "failed to list unused projects");
                return;
            }
        };

        for project in projects {
            self.clean_one(&project).await;
        }
    }

    /// Subscriptions are torn down before their parent topic is deleted, so
    /// a subscription's own lookup of its topic still succeeds up to that
    /// point (§4.7).
    async fn clean_one(&self, project: &ProjectInfo) {
        let mut ok = true;
        ok &= self.delete_subscription(&project.list_progress_subscription).await;
        ok &= self.delete_subscription(&project.copy_progress_subscription).await;
        ok &= self.delete_topic(&project.list_topic).await;
        ok &= self.delete_topic(&project.copy_topic).await;

        if ok {
            if let Err(err) = self.store.delete_project(&project.project_id).await {
                warn!(error = %err, project = %project.project_id, "failed to delete project row");
            } else {
                info!(project = %project.project_id, "retired project resources torn down");
            }
        }
    }

    async fn delete_topic(&self, topic: &str) -> bool {
        match self.bus.topic_exists(topic).await {
            Ok(false) => true,
            Ok(true) => self.bus.delete_topic(topic).await.is_ok(),
            Err(err) => {
                warn!(error = %err, topic, "failed to check topic existence");
                false
            }
        }
    }

    async fn delete_subscription(&self, subscription: &str) -> bool {
        match self.bus.subscription_exists(subscription).await {
            Ok(false) => true,
            Ok(true) => self.bus.delete_subscription(subscription).await.is_ok(),
            Err(err) => {
                warn!(error = %err, subscription, "failed to check subscription existence");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcp_bus::MemoryBus;
    use dcp_store::MemoryTaskStore;
    use dcp_types::ProjectId;

    fn project() -> ProjectInfo {
        ProjectInfo {
            project_id: ProjectId::new("acme"),
            list_topic: "acme-list".to_string(),
            copy_topic: "acme-copy".to_string(),
            list_progress_subscription: "acme-list-sub".to_string(),
            copy_progress_subscription: "acme-copy-sub".to_string(),
            retired: true,
        }
    }

    #[tokio::test]
    async fn deletes_project_row_once_every_resource_is_absent() {
        let store = Arc::new(MemoryTaskStore::new());
        store.put_project(project()).await;
        let bus = Arc::new(MemoryBus::new());
        let cleaner = Cleaner::new(store.clone(), bus, 10, Duration::from_secs(60));

        cleaner.cycle().await;

        assert!(store.list_unused_projects(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leaves_project_row_when_a_resource_still_exists() {
        let store = Arc::new(MemoryTaskStore::new());
        store.put_project(project()).await;
        let bus: Arc<dyn MessageBus> = Arc::new(StubbornTopicBus {
            inner: MemoryBus::new(),
            undeletable_topic: "acme-list".to_string(),
        });
        let cleaner = Cleaner::new(store.clone(), bus, 10, Duration::from_secs(60));

        cleaner.cycle().await;

        assert_eq!(store.list_unused_projects(10).await.unwrap().len(), 1);
    }

    /// A bus whose `topic_exists` always reports one named topic as still
    /// present, so `Cleaner` never sees every resource confirmed gone.
    struct StubbornTopicBus {
        inner: MemoryBus,
        undeletable_topic: String,
    }

    #[async_trait::async_trait]
    impl MessageBus for StubbornTopicBus {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), dcp_bus::BusError> {
            self.inner.publish(topic, payload).await
        }
        async fn receive(
            &self,
            subscription: &str,
            max_messages: usize,
        ) -> Result<Vec<dcp_bus::InboundMessage>, dcp_bus::BusError> {
            self.inner.receive(subscription, max_messages).await
        }
        async fn ack(&self, subscription: &str, receipt: &dcp_bus::Receipt) -> Result<(), dcp_bus::BusError> {
            self.inner.ack(subscription, receipt).await
        }
        async fn topic_exists(&self, topic: &str) -> Result<bool, dcp_bus::BusError> {
            if topic == self.undeletable_topic {
                return Ok(true);
            }
            self.inner.topic_exists(topic).await
        }
        async fn delete_topic(&self, topic: &str) -> Result<(), dcp_bus::BusError> {
            if topic == self.undeletable_topic {
                return Err(dcp_bus::BusError::Topology {
                    resource: topic.to_string(),
                    reason: "still in use".to_string(),
                });
            }
            self.inner.delete_topic(topic).await
        }
        async fn subscription_exists(&self, subscription: &str) -> Result<bool, dcp_bus::BusError> {
            self.inner.subscription_exists(subscription).await
        }
        async fn delete_subscription(&self, subscription: &str) -> Result<(), dcp_bus::BusError> {
            self.inner.delete_subscription(subscription).await
        }
    }
}
