//! Message-bus facade.
//!
//! The pub/sub client itself is an out-of-scope external collaborator (§1)
//! — only its publish/receive/ack interface matters to the engine. This
//! crate defines that interface as [`MessageBus`] plus two implementations:
//! an in-memory bus for unit tests, and a Postgres-backed bus that talks to
//! the `pgmq` extension's SQL functions directly (the same functions the
//! reference messaging layer's own test helpers invoke, e.g.
//! `SELECT pgmq.drop_queue($1)`), so a whole pipeline can run against nothing
//! but the same Postgres instance the store already uses.

mod memory;
mod pg;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryBus;
pub use pg::PgBus;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to publish to '{topic}': {reason}")]
    Publish { topic: String, reason: String },
    #[error("failed to receive from '{subscription}': {reason}")]
    Receive { subscription: String, reason: String },
    #[error("failed to ack message {receipt} on '{subscription}': {reason}")]
    Ack {
        subscription: String,
        receipt: String,
        reason: String,
    },
    #[error("failed to manage topology for '{resource}': {reason}")]
    Topology { resource: String, reason: String },
}

/// Opaque handle used to acknowledge a received message. Bus-implementation
/// specific (a pgmq `msg_id`, a Pub/Sub ack id, ...); callers only need to
/// round-trip it back into [`MessageBus::ack`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(pub String);

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub receipt: Receipt,
    pub payload: Vec<u8>,
}

/// Publish/receive/ack plus the minimal topology management the resource
/// cleaner (§4.7) needs. Implementations serialize concurrent calls
/// internally; callers do not need external locking.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Polls up to `max_messages` available messages. Does not block
    /// indefinitely; callers loop and sleep between empty polls.
    async fn receive(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<InboundMessage>, BusError>;

    async fn ack(&self, subscription: &str, receipt: &Receipt) -> Result<(), BusError>;

    async fn topic_exists(&self, topic: &str) -> Result<bool, BusError>;

    async fn delete_topic(&self, topic: &str) -> Result<(), BusError>;

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, BusError>;

    async fn delete_subscription(&self, subscription: &str) -> Result<(), BusError>;
}
