//! Batch producer and replay server.
//!
//! Partitions the dataset into fixed-size batches per hour window and
//! publishes them on the data channels, the final batch of each hour
//! always under the terminal sentinel. A bus outage queues outbound
//! messages instead of dropping them; a drain task retries them in order.
//! Replay requests recompute the identical batch slice from the dataset,
//! so a replay is indistinguishable from the original delivery.

use std::sync::Arc;

use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

use crate::bus::MessageBus;
use crate::channel::{BatchIndex, ChannelKey};
use crate::config::PipelineConfig;
use crate::dataset::Dataset;
use crate::pending::PendingQueue;
use crate::shutdown::Shutdown;

/// An outbound message held back by a bus outage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub channel: String,
    pub payload: String,
}

pub struct Streamer {
    bus: Arc<dyn MessageBus>,
    dataset: Arc<Dataset>,
    config: PipelineConfig,
    pending: PendingQueue<PendingSend>,
    shutdown: Shutdown,
}

impl Streamer {
    pub fn new(bus: Arc<dyn MessageBus>, dataset: Arc<Dataset>, config: PipelineConfig) -> Arc<Self> {
        Arc::new(Streamer {
            bus,
            dataset,
            config,
            pending: PendingQueue::new(),
            shutdown: Shutdown::new(),
        })
    }

    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Run all three loops until shutdown: the publish cycle in this task,
    /// pending drain and replay serving in the background.
    pub async fn run(self: Arc<Self>) {
        let drainer = self.clone();
        tokio::spawn(async move { drainer.drain_loop().await });
        let replayer = self.clone();
        tokio::spawn(async move { replayer.replay_loop().await });
        self.publish_cycle().await;
    }

    /// Publish hour windows 0..24 in a repeating cycle, pausing the
    /// configured interval between hours.
    pub async fn publish_cycle(&self) {
        loop {
            for hour in 0..24u8 {
                if self.shutdown.is_requested() {
                    return;
                }
                self.publish_hour(hour).await;
                tokio::select! {
                    _ = self.shutdown.wait() => return,
                    _ = sleep(self.config.hour_interval()) => {}
                }
            }
        }
    }

    /// Publish every batch of one hour window. The final batch always goes
    /// out under the terminal sentinel, whatever its numeric slot.
    pub async fn publish_hour(&self, hour: u8) {
        let count = self.dataset.batch_count(hour, self.config.batch_size);
        if count == 0 {
            debug!(hour, "no records for hour, nothing to publish");
            return;
        }
        info!(hour, batches = count, "publishing hour window");
        for slot in 0..count as u32 {
            let payload = match self.dataset.batch_payload(hour, slot, self.config.batch_size) {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    error!(hour, slot, error = %e, "failed to serialize batch");
                    continue;
                }
            };
            let index = if slot as usize == count - 1 {
                BatchIndex::Last
            } else {
                BatchIndex::Slot(slot)
            };
            let channel = ChannelKey::Data { index, hour }.render(&self.config.namespace);
            self.publish(channel, payload).await;
        }
    }

    /// Best-effort send: on bus-unreachable the message is queued for the
    /// drain task, never dropped and never retried inline.
    async fn publish(&self, channel: String, payload: String) {
        if let Err(e) = self.bus.publish(&channel, &payload).await {
            error!(channel = %channel, error = %e, "bus unreachable, queuing message");
            self.pending.push(PendingSend { channel, payload });
        }
    }

    /// One drain pass: retry everything queued, in enqueue order. The
    /// first message that fails again goes back to the tail along with the
    /// rest, and the pass stops so an outage doesn't become a hot loop.
    pub async fn drain_pending_once(&self) {
        let queued = self.pending.take_all();
        if queued.is_empty() {
            return;
        }
        info!(count = queued.len(), "retrying queued messages");
        let mut items = queued.into_iter();
        while let Some(item) = items.next() {
            match self.bus.publish(&item.channel, &item.payload).await {
                Ok(()) => debug!(channel = %item.channel, "delivered queued message"),
                Err(e) => {
                    error!(error = %e, "bus still unreachable, requeuing");
                    self.pending.push(item);
                    self.pending.requeue(items);
                    return;
                }
            }
        }
    }

    async fn drain_loop(&self) {
        let mut tick = interval(self.config.pending_drain());
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => {
                    // final attempt so an orderly shutdown flushes the queue
                    self.drain_pending_once().await;
                    return;
                }
                _ = tick.tick() => {}
            }
            self.drain_pending_once().await;
        }
    }

    /// Serve one replay request by recomputing the slice deterministically
    /// and republishing it on the original data channel.
    pub async fn handle_request(&self, slot: u32, hour: u8) {
        match self.dataset.batch_payload(hour, slot, self.config.batch_size) {
            Ok(Some(payload)) => {
                info!(hour, slot, "replaying requested batch");
                let channel = ChannelKey::Data {
                    index: BatchIndex::Slot(slot),
                    hour,
                }
                .render(&self.config.namespace);
                self.publish(channel, payload).await;
            }
            Ok(None) => warn!(hour, slot, "replay request outside the hour's batches"),
            Err(e) => error!(hour, slot, error = %e, "failed to serialize replay batch"),
        }
    }

    async fn replay_loop(&self) {
        let pattern = ChannelKey::request_pattern(&self.config.namespace);
        loop {
            if self.shutdown.is_requested() {
                return;
            }
            match self.bus.subscribe(&pattern).await {
                Ok(mut subscription) => {
                    info!(pattern = %pattern, "listening for replay requests");
                    loop {
                        tokio::select! {
                            _ = self.shutdown.wait() => return,
                            msg = subscription.next() => match msg {
                                Some(msg) => {
                                    match ChannelKey::parse(&self.config.namespace, &msg.channel) {
                                        Ok(ChannelKey::Request { slot, hour }) => {
                                            self.handle_request(slot, hour).await;
                                        }
                                        Ok(_) => {}
                                        Err(e) => {
                                            warn!(channel = %msg.channel, error = %e, "dropping unparseable request");
                                        }
                                    }
                                }
                                None => {
                                    warn!("replay subscription closed");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => error!(error = %e, "failed to subscribe for replay requests"),
            }
            tokio::select! {
                _ = self.shutdown.wait() => return,
                _ = sleep(self.config.resubscribe_backoff()) => {}
            }
        }
    }
}
