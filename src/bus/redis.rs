//! Redis pub/sub transport.

use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use super::{BusError, BusMessage, MessageBus, Subscription};

pub struct RedisBus {
    client: redis::Client,
    /// Cached publish connection; dropped on error and re-dialed lazily so
    /// an outage costs one failed publish, not a wedged client.
    publish_conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBus {
    pub fn connect(url: &str) -> Result<Self, BusError> {
        let client =
            redis::Client::open(url).map_err(|e| BusError::InvalidEndpoint(e.to_string()))?;
        Ok(RedisBus {
            client,
            publish_conn: Mutex::new(None),
        })
    }
}

#[async_trait::async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut guard = self.publish_conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| BusError::Unreachable(e.to_string()))?,
        };
        let result: Result<(), redis::RedisError> = conn.publish(channel, payload).await;
        match result {
            Ok(()) => {
                *guard = Some(conn);
                Ok(())
            }
            Err(e) => Err(BusError::Unreachable(e.to_string())),
        }
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Unreachable(e.to_string()))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| BusError::Unreachable(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "non-text payload, dropping");
                        continue;
                    }
                };
                if tx.send(BusMessage { channel, payload }).is_err() {
                    // subscriber went away
                    break;
                }
            }
            // stream end means the connection died; the receiver observes
            // the closed channel and resubscribes
        });
        Ok(Subscription::new(rx))
    }
}
