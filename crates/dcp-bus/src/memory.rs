use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{BusError, InboundMessage, MessageBus, Receipt};

/// An in-process bus for tests: topics/subscriptions are the same name
/// (there is no fan-out modeled), messages are FIFO per subscription, and
/// `receive` never blocks.
#[derive(Debug, Default)]
pub struct MemoryBus {
    queues: Mutex<HashMap<String, Vec<(u64, Vec<u8>)>>>,
    in_flight: Mutex<HashMap<String, HashMap<u64, Vec<u8>>>>,
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, bool>>,
    subscriptions: Mutex<HashMap<String, bool>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_topic(&self, topic: &str) {
        self.topics.lock().unwrap().insert(topic.to_string(), true);
    }

    pub fn declare_subscription(&self, subscription: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.to_string(), true);
        self.queues
            .lock()
            .unwrap()
            .entry(subscription.to_string())
            .or_default();
    }

    pub fn pending_count(&self, subscription: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(subscription)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.queues
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push((id, payload));
        Ok(())
    }

    async fn receive(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<InboundMessage>, BusError> {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(subscription.to_string()).or_default();
        let take = max_messages.min(queue.len());
        let drained: Vec<_> = queue.drain(..take).collect();
        drop(queues);

        let mut in_flight = self.in_flight.lock().unwrap();
        let sub_in_flight = in_flight.entry(subscription.to_string()).or_default();
        let mut out = Vec::with_capacity(drained.len());
        for (id, payload) in drained {
            sub_in_flight.insert(id, payload.clone());
            out.push(InboundMessage {
                receipt: Receipt(id.to_string()),
                payload,
            });
        }
        Ok(out)
    }

    async fn ack(&self, subscription: &str, receipt: &Receipt) -> Result<(), BusError> {
        let id: u64 = receipt.0.parse().map_err(|_| BusError::Ack {
            subscription: subscription.to_string(),
            receipt: receipt.0.clone(),
            reason: "malformed receipt".to_string(),
        })?;
        self.in_flight
            .lock()
            .unwrap()
            .entry(subscription.to_string())
            .or_default()
            .remove(&id);
        Ok(())
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, BusError> {
        Ok(self.topics.lock().unwrap().contains_key(topic))
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), BusError> {
        self.topics.lock().unwrap().remove(topic);
        self.queues.lock().unwrap().remove(topic);
        Ok(())
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, BusError> {
        Ok(self.subscriptions.lock().unwrap().contains_key(subscription))
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<(), BusError> {
        self.subscriptions.lock().unwrap().remove(subscription);
        self.queues.lock().unwrap().remove(subscription);
        self.in_flight.lock().unwrap().remove(subscription);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_receive_then_ack() {
        let bus = MemoryBus::new();
        bus.declare_topic("t");
        bus.declare_subscription("t");
        bus.publish("t", b"hello".to_vec()).await.unwrap();

        let received = bus.receive("t", 10).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, b"hello");

        bus.ack("t", &received[0].receipt).await.unwrap();
        assert_eq!(bus.pending_count("t"), 0);
    }

    #[tokio::test]
    async fn receive_respects_max_messages() {
        let bus = MemoryBus::new();
        bus.declare_topic("t");
        bus.declare_subscription("t");
        for i in 0..5 {
            bus.publish("t", vec![i]).await.unwrap();
        }
        let batch = bus.receive("t", 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(bus.pending_count("t"), 3);
    }

    #[tokio::test]
    async fn delete_topic_removes_topology_and_queue() {
        let bus = MemoryBus::new();
        bus.declare_topic("t");
        assert!(bus.topic_exists("t").await.unwrap());
        bus.delete_topic("t").await.unwrap();
        assert!(!bus.topic_exists("t").await.unwrap());
    }
}
