//! Window reassembly and safe handoff to storage.
//!
//! Tracks per-hour batch completion across unordered, duplicate and
//! partial delivery, chases gaps via replay requests, flushes complete
//! windows to the time-series store and notifies the processor. Window
//! state is cleared only after the store confirms the write; a periodic
//! reconciliation pass re-drives anything a transient outage stalled.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

use crate::bus::{BusMessage, MessageBus};
use crate::channel::{BatchIndex, ChannelKey};
use crate::config::PipelineConfig;
use crate::pending::PendingQueue;
use crate::schema::{self, WeatherRecord};
use crate::shutdown::Shutdown;
use crate::store::{DataPoint, TimeSeriesStore};

/// Reassembly state for one hour window.
///
/// Invariant: the record buffer is exactly the union of the batches whose
/// slot is in `received`; a redelivered batch can never double-count
/// because registration is insert-if-absent per slot.
#[derive(Debug, Default)]
struct WindowTracker {
    received: BTreeSet<u32>,
    sentinel_seen: bool,
    batches: BTreeMap<u32, Vec<WeatherRecord>>,
    /// Single outstanding slot requested by the previous detection cycle,
    /// for stall suppression.
    last_single_request: Option<u32>,
}

impl WindowTracker {
    /// Register one batch; returns false for an already-present slot.
    fn register(&mut self, slot: u32, records: Vec<WeatherRecord>, sentinel: bool) -> bool {
        if sentinel {
            self.sentinel_seen = true;
        }
        if self.received.contains(&slot) {
            return false;
        }
        self.received.insert(slot);
        self.batches.insert(slot, records);
        true
    }

    fn is_complete(&self, expected: u32) -> bool {
        self.received.len() as u32 >= expected && (0..expected).all(|s| self.received.contains(&s))
    }

    fn missing(&self, expected: u32) -> Vec<u32> {
        (0..expected).filter(|s| !self.received.contains(s)).collect()
    }

    /// Fold another tracker for the same hour into this one (used when
    /// batches arrive while a flush of the window is in flight).
    fn absorb(&mut self, other: WindowTracker) {
        self.sentinel_seen |= other.sentinel_seen;
        for (slot, records) in other.batches {
            if self.received.insert(slot) {
                self.batches.insert(slot, records);
            }
        }
    }
}

/// What a window needs next, decided under the tracker lock and acted on
/// outside it.
enum Step {
    Idle,
    Flush(WindowTracker),
    Request { missing: Vec<u32>, stalled: bool },
}

pub struct Ingester {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn TimeSeriesStore>,
    config: PipelineConfig,
    windows: Mutex<HashMap<u8, WindowTracker>>,
    store_online: AtomicBool,
    pending_notifications: PendingQueue<u8>,
    shutdown: Shutdown,
}

impl Ingester {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn TimeSeriesStore>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Ingester {
            bus,
            store,
            config,
            windows: Mutex::new(HashMap::new()),
            store_online: AtomicBool::new(true),
            pending_notifications: PendingQueue::new(),
            shutdown: Shutdown::new(),
        })
    }

    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }

    /// True while no window state is buffered (all flushed or none seen).
    pub fn is_drained(&self) -> bool {
        self.windows.lock().is_empty() && self.pending_notifications.is_empty()
    }

    /// Run the subscription loop in this task and reconciliation in the
    /// background, until shutdown.
    pub async fn run(self: Arc<Self>) {
        let reconciler = self.clone();
        tokio::spawn(async move { reconciler.reconcile_loop().await });
        self.subscribe_loop().await;
    }

    async fn subscribe_loop(&self) {
        let pattern = ChannelKey::data_pattern(&self.config.namespace);
        loop {
            if self.shutdown.is_requested() {
                return;
            }
            match self.bus.subscribe(&pattern).await {
                Ok(mut subscription) => {
                    info!(pattern = %pattern, "subscribed to data channels");
                    loop {
                        tokio::select! {
                            _ = self.shutdown.wait() => return,
                            msg = subscription.next() => match msg {
                                Some(msg) => self.handle_message(&msg).await,
                                None => {
                                    warn!("data subscription closed, resubscribing");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => error!(error = %e, "failed to subscribe to data channels"),
            }
            tokio::select! {
                _ = self.shutdown.wait() => return,
                _ = sleep(self.config.resubscribe_backoff()) => {}
            }
        }
    }

    /// Process one inbound batch message. Malformed channel names and
    /// undecodable payloads are dropped with a warning; they must never
    /// take the subscription loop down.
    pub async fn handle_message(&self, msg: &BusMessage) {
        let (index, hour) = match ChannelKey::parse(&self.config.namespace, &msg.channel) {
            Ok(ChannelKey::Data { index, hour }) => (index, hour),
            Ok(_) => return,
            Err(e) => {
                warn!(channel = %msg.channel, error = %e, "dropping message with unparseable channel");
                return;
            }
        };
        let records: Vec<WeatherRecord> = match serde_json::from_str(&msg.payload) {
            Ok(records) => records,
            Err(e) => {
                warn!(channel = %msg.channel, error = %e, "dropping undecodable batch payload");
                return;
            }
        };

        self.register_batch(index, hour, records);
        self.drive_window(hour, false).await;
    }

    fn register_batch(&self, index: BatchIndex, hour: u8, records: Vec<WeatherRecord>) {
        let expected = self.config.batches_per_hour;
        // the sentinel's numeric position is not meaningful; it fills the
        // final slot and marks the window as fully announced
        let (slot, sentinel) = match index {
            BatchIndex::Last => (expected.saturating_sub(1), true),
            BatchIndex::Slot(slot) => (slot, false),
        };
        if slot >= expected {
            warn!(hour, slot, expected, "batch slot outside the expected window, ignoring");
            return;
        }

        let mut windows = self.windows.lock();
        let tracker = windows.entry(hour).or_default();
        if tracker.register(slot, records, sentinel) {
            debug!(hour, slot, received = tracker.received.len(), "registered batch");
        } else {
            debug!(hour, slot, "duplicate batch, already registered");
        }
    }

    /// Re-evaluate one window: flush if complete, chase gaps if the
    /// sentinel arrived without the set being full. `probe_store` lets the
    /// reconciliation pass attempt a flush even while the store is marked
    /// offline; that attempt is the recovery probe.
    async fn drive_window(&self, hour: u8, probe_store: bool) {
        let expected = self.config.batches_per_hour;
        let step = {
            let mut windows = self.windows.lock();
            let complete = windows
                .get(&hour)
                .map(|tracker| tracker.is_complete(expected))
                .unwrap_or(false);
            if complete {
                if !self.store_online.load(Ordering::SeqCst) && !probe_store {
                    debug!(hour, "window complete but store offline, deferring flush");
                    Step::Idle
                } else {
                    match windows.remove(&hour) {
                        Some(tracker) => Step::Flush(tracker),
                        None => Step::Idle,
                    }
                }
            } else {
                match windows.get_mut(&hour) {
                    Some(tracker) if tracker.sentinel_seen => {
                        let missing = tracker.missing(expected);
                        let stalled = missing.len() == 1
                            && tracker.last_single_request == Some(missing[0]);
                        tracker.last_single_request = match missing.as_slice() {
                            [slot] => Some(*slot),
                            _ => None,
                        };
                        Step::Request { missing, stalled }
                    }
                    _ => Step::Idle,
                }
            }
        };

        match step {
            Step::Idle => {}
            Step::Flush(tracker) => self.flush_window(hour, tracker).await,
            Step::Request { missing, stalled } => {
                self.request_missing(hour, missing, stalled).await
            }
        }
    }

    /// Flush a complete window to the store as one batched write, then
    /// notify the processor. The tracker was taken out of the map by the
    /// caller; it is dropped only on a confirmed write and re-inserted
    /// (merged with anything that arrived meanwhile) on failure.
    async fn flush_window(&self, hour: u8, tracker: WindowTracker) {
        let mut points: Vec<DataPoint> = Vec::new();
        let mut skipped = 0usize;
        for records in tracker.batches.values() {
            for record in records {
                match schema::shape_point(record) {
                    Some(point) => points.push(point),
                    None => skipped += 1,
                }
            }
        }
        if skipped > 0 {
            warn!(hour, skipped, "skipped records with no usable instant or fields");
        }

        info!(hour, points = points.len(), "flushing completed window");
        match self.store.write_points(&points).await {
            Ok(()) => {
                self.store_online.store(true, Ordering::SeqCst);
                self.notify_completed(hour).await;
                // tracker dropped here: state cleared only after the
                // confirmed write
            }
            Err(e) => {
                error!(hour, error = %e, "store write failed, keeping window buffered");
                self.store_online.store(false, Ordering::SeqCst);
                let mut tracker = tracker;
                let mut windows = self.windows.lock();
                if let Some(newer) = windows.remove(&hour) {
                    tracker.absorb(newer);
                }
                windows.insert(hour, tracker);
            }
        }
    }

    async fn notify_completed(&self, hour: u8) {
        let channel = ChannelKey::Completed { hour }.render(&self.config.namespace);
        match self.bus.publish(&channel, &hour.to_string()).await {
            Ok(()) => info!(hour, "notified processor of completed window"),
            Err(e) => {
                error!(hour, error = %e, "failed to notify processor, queuing notification");
                self.pending_notifications.push(hour);
            }
        }
    }

    /// Request retransmission of every missing slot, throttled. When the
    /// same single slot stays outstanding across cycles, back off first
    /// instead of re-requesting in a tight loop.
    async fn request_missing(&self, hour: u8, missing: Vec<u32>, stalled: bool) {
        if missing.is_empty() {
            return;
        }
        if stalled {
            info!(hour, slot = missing[0], "same batch still outstanding, backing off");
            tokio::select! {
                _ = self.shutdown.wait() => return,
                _ = sleep(self.config.stall_backoff()) => {}
            }
        }
        for slot in missing {
            let channel = ChannelKey::Request { slot, hour }.render(&self.config.namespace);
            if let Err(e) = self.bus.publish(&channel, &hour.to_string()).await {
                error!(hour, slot, error = %e, "failed to request missing batch");
                return;
            }
            info!(hour, slot, "requested missing batch");
            sleep(self.config.request_throttle()).await;
        }
    }

    /// One reconciliation pass: re-evaluate every live window exactly as
    /// the message path would (completion, flush, gap chase, all idempotent),
    /// probing the store if it was marked offline, then retry queued
    /// processor notifications.
    pub async fn reconcile_once(&self) {
        let hours: Vec<u8> = {
            let windows = self.windows.lock();
            windows.keys().copied().collect()
        };
        for hour in hours {
            self.drive_window(hour, true).await;
        }

        let queued = self.pending_notifications.take_all();
        if queued.is_empty() {
            return;
        }
        let mut hours = queued.into_iter();
        while let Some(hour) = hours.next() {
            let channel = ChannelKey::Completed { hour }.render(&self.config.namespace);
            match self.bus.publish(&channel, &hour.to_string()).await {
                Ok(()) => info!(hour, "delivered queued completion notification"),
                Err(e) => {
                    error!(hour, error = %e, "notification still undeliverable, requeuing");
                    self.pending_notifications.push(hour);
                    self.pending_notifications.requeue(hours);
                    return;
                }
            }
        }
    }

    async fn reconcile_loop(&self) {
        let mut tick = interval(self.config.reconcile());
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => return,
                _ = tick.tick() => {}
            }
            self.reconcile_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_completion_requires_every_slot() {
        let mut tracker = WindowTracker::default();
        tracker.register(0, Vec::new(), false);
        tracker.register(2, Vec::new(), true);
        assert!(!tracker.is_complete(3));
        assert_eq!(tracker.missing(3), vec![1]);

        tracker.register(1, Vec::new(), false);
        assert!(tracker.is_complete(3));
        assert!(tracker.missing(3).is_empty());
    }

    #[test]
    fn test_tracker_duplicate_registration_is_noop() {
        let mut tracker = WindowTracker::default();
        let first = vec![record_with_zip("z1")];
        let replay = vec![record_with_zip("z1-replayed")];
        assert!(tracker.register(0, first, false));
        assert!(!tracker.register(0, replay, false));

        let buffered = tracker.batches.get(&0).unwrap();
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].tag("zip_code"), Some("z1"));
    }

    #[test]
    fn test_tracker_absorb_unions_without_overwrite() {
        let mut flushed = WindowTracker::default();
        flushed.register(0, vec![record_with_zip("a")], false);

        let mut newer = WindowTracker::default();
        newer.register(0, vec![record_with_zip("dup")], false);
        newer.register(1, vec![record_with_zip("b")], true);

        flushed.absorb(newer);
        assert_eq!(flushed.received.len(), 2);
        assert!(flushed.sentinel_seen);
        assert_eq!(flushed.batches.get(&0).unwrap()[0].tag("zip_code"), Some("a"));
    }

    fn record_with_zip(zip: &str) -> WeatherRecord {
        serde_json::from_value(serde_json::json!({
            "time": "2023-09-19 05:00",
            "zip_code": zip,
            "state": "NY",
            "temp_c": 20.0,
        }))
        .unwrap()
    }
}
