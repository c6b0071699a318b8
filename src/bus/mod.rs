//! Messaging bus abstraction.
//!
//! Pattern-subscribe, publish-by-channel-name, and nothing else: the bus
//! gives at-most-once delivery per attempt, no ordering across channels
//! and no persistence across disconnects, and everything above it is built
//! to survive exactly that. The production implementation rides Redis
//! pub/sub; the in-memory one drives the same component code in tests.

mod memory;
mod redis;

pub use self::memory::MemoryBus;
pub use self::redis::RedisBus;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// One delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unreachable: {0}")]
    Unreachable(String),
    #[error("invalid bus endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Stream of messages for one pattern subscription. Yields `None` once the
/// underlying connection is gone; callers resubscribe with backoff.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Subscription { rx }
    }

    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Best-effort publish of one payload to one channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Subscribe to a glob pattern (`ns:data:*`).
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError>;
}
