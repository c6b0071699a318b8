//! In-memory bus double for tests.
//!
//! Same contract as the Redis transport, plus an offline switch for
//! outage scenarios and a log of everything published for assertions.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{BusError, BusMessage, MessageBus, Subscription};

#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<BusMessage>)>>,
    published: Mutex<Vec<BusMessage>>,
    offline: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        MemoryBus::default()
    }

    /// Make every publish fail with `BusError::Unreachable` and close no
    /// existing subscriptions, like a network partition would.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Everything successfully published so far, in order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, channel: &str) -> Vec<BusMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BusError::Unreachable("memory bus offline".to_string()));
        }
        let message = BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        self.published.lock().push(message.clone());
        self.subscribers
            .lock()
            .retain(|(pattern, tx)| {
                if !pattern_matches(pattern, channel) {
                    return true;
                }
                // drop subscribers whose receiver is gone
                tx.send(message.clone()).is_ok()
            });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push((pattern.to_string(), tx));
        Ok(Subscription::new(rx))
    }
}

/// Redis-style glob matching, `*` wildcard only.
fn pattern_matches(pattern: &str, channel: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == channel;
    }
    let mut rest = channel;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            rest = match rest.strip_prefix(part) {
                Some(r) => r,
                None => return false,
            };
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(at) = rest.find(part) {
            rest = &rest[at + part.len()..];
        } else {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("ns:data:*", "ns:data:0:12"));
        assert!(pattern_matches("ns:data:*", "ns:data:LAST:3"));
        assert!(!pattern_matches("ns:data:*", "ns:request:0:12"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("exact", "exactly"));
        assert!(pattern_matches("*", "anything"));
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscriber() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("ns:data:*").await.unwrap();
        bus.publish("ns:data:0:5", "payload").await.unwrap();
        bus.publish("ns:request:0:5", "other").await.unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.channel, "ns:data:0:5");
        assert_eq!(msg.payload, "payload");
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn test_offline_publish_fails() {
        let bus = MemoryBus::new();
        bus.set_offline(true);
        assert!(bus.publish("ns:data:0:5", "payload").await.is_err());
        assert!(bus.published().is_empty());

        bus.set_offline(false);
        assert!(bus.publish("ns:data:0:5", "payload").await.is_ok());
    }
}
