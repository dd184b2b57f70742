use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use crate::{BusError, InboundMessage, MessageBus, Receipt};

/// Default visibility timeout (seconds) for `pgmq.read`: a message becomes
/// invisible to other readers for this long after being handed out, giving
/// the receiver loop time to process it before ack or redelivery.
const DEFAULT_VISIBILITY_TIMEOUT_SECS: i32 = 30;

/// Bus implementation backed directly by the `pgmq` Postgres extension's SQL
/// functions (`pgmq.create`, `pgmq.send`, `pgmq.read`, `pgmq.delete`,
/// `pgmq.drop_queue`, `pgmq.list_queues`). Topics and subscriptions are both
/// modeled as pgmq queues of the same name — there is no separate
/// fan-out/subscription layer, matching a single-consumer-group ingest
/// pipeline.
#[derive(Debug, Clone)]
pub struct PgBus {
    pool: PgPool,
    visibility_timeout_secs: i32,
}

impl PgBus {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT_SECS,
        }
    }

    pub fn with_visibility_timeout(mut self, secs: i32) -> Self {
        self.visibility_timeout_secs = secs;
        self
    }

    /// Idempotently ensures the backing pgmq queue exists. Call before the
    /// first publish/receive against a new topic/subscription name.
    pub async fn ensure_queue(&self, queue_name: &str) -> Result<(), BusError> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await
            .map_err(|e| BusError::Topology {
                resource: queue_name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl MessageBus for PgBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let body: Value = serde_json::from_slice(&payload).map_err(|e| BusError::Publish {
            topic: topic.to_string(),
            reason: format!("payload is not valid JSON: {e}"),
        })?;
        sqlx::query("SELECT pgmq.send($1, $2)")
            .bind(topic)
            .bind(body)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn receive(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<InboundMessage>, BusError> {
        let rows = sqlx::query_as::<_, (i64, Value)>(
            "SELECT msg_id, message FROM pgmq.read($1, $2, $3)",
        )
        .bind(subscription)
        .bind(self.visibility_timeout_secs)
        .bind(max_messages as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BusError::Receive {
            subscription: subscription.to_string(),
            reason: e.to_string(),
        })?;

        Ok(rows
            .into_iter()
            .map(|(msg_id, message)| InboundMessage {
                receipt: Receipt(msg_id.to_string()),
                payload: message.to_string().into_bytes(),
            })
            .collect())
    }

    async fn ack(&self, subscription: &str, receipt: &Receipt) -> Result<(), BusError> {
        let msg_id: i64 = receipt.0.parse().map_err(|_| BusError::Ack {
            subscription: subscription.to_string(),
            receipt: receipt.0.clone(),
            reason: "receipt is not a pgmq msg_id".to_string(),
        })?;
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(subscription)
            .bind(msg_id)
            .execute(&self.pool)
            .await
            .map_err(|e| BusError::Ack {
                subscription: subscription.to_string(),
                receipt: receipt.0.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, BusError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM pgmq.list_queues() WHERE queue_name = $1)",
        )
        .bind(topic)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BusError::Topology {
            resource: topic.to_string(),
            reason: e.to_string(),
        })?;
        Ok(exists)
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), BusError> {
        sqlx::query("SELECT pgmq.drop_queue($1)")
            .bind(topic)
            .execute(&self.pool)
            .await
            .map_err(|e| BusError::Topology {
                resource: topic.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, BusError> {
        self.topic_exists(subscription).await
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<(), BusError> {
        self.delete_topic(subscription).await
    }
}
