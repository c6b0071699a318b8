//! Hour-window analytics.
//!
//! Woken by the ingester's completion notifications, computes per-region
//! mean aggregates and per-station extremes over the completed window and
//! writes them back as derived series. One failed query skips that
//! metric/region only; a failed write parks the batch in a retry queue
//! drained by a background task.

use std::sync::Arc;

use tokio::time::{interval, sleep};
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::channel::ChannelKey;
use crate::config::PipelineConfig;
use crate::pending::PendingQueue;
use crate::schema::{AVERAGES_MEASUREMENT, EXTREMES_MEASUREMENT, RAW_MEASUREMENT};
use crate::shutdown::Shutdown;
use crate::store::{Aggregate, DataPoint, FieldValue, TimeRange, TimeSeriesStore};

/// Mean of one metric across one region for one hour window.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRecord {
    pub region: String,
    pub metric: String,
    pub value: f64,
}

/// A per-station minimum or maximum of one metric within one region and
/// hour window.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtremeRecord {
    pub region: String,
    pub station: String,
    pub metric: String,
    pub kind: ExtremeKind,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtremeKind {
    Min,
    Max,
}

impl ExtremeKind {
    fn aggregate(&self) -> Aggregate {
        match self {
            ExtremeKind::Min => Aggregate::Min,
            ExtremeKind::Max => Aggregate::Max,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            ExtremeKind::Min => "min",
            ExtremeKind::Max => "max",
        }
    }
}

pub struct Processor {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn TimeSeriesStore>,
    config: PipelineConfig,
    pending_writes: PendingQueue<Vec<DataPoint>>,
    shutdown: Shutdown,
}

impl Processor {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn TimeSeriesStore>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Processor {
            bus,
            store,
            config,
            pending_writes: PendingQueue::new(),
            shutdown: Shutdown::new(),
        })
    }

    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }

    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.len()
    }

    /// Run the notification loop in this task and the write-retry drain in
    /// the background, until shutdown.
    pub async fn run(self: Arc<Self>) {
        let retrier = self.clone();
        tokio::spawn(async move { retrier.retry_loop().await });
        self.subscribe_loop().await;
    }

    async fn subscribe_loop(&self) {
        let pattern = ChannelKey::completed_pattern(&self.config.namespace);
        loop {
            if self.shutdown.is_requested() {
                return;
            }
            match self.bus.subscribe(&pattern).await {
                Ok(mut subscription) => {
                    info!(pattern = %pattern, "subscribed to completion notifications");
                    loop {
                        tokio::select! {
                            _ = self.shutdown.wait() => return,
                            msg = subscription.next() => match msg {
                                Some(msg) => {
                                    match ChannelKey::parse(&self.config.namespace, &msg.channel) {
                                        Ok(ChannelKey::Completed { hour }) => {
                                            self.process_hour(hour).await;
                                        }
                                        Ok(_) => {}
                                        Err(e) => {
                                            warn!(channel = %msg.channel, error = %e, "dropping unparseable notification");
                                        }
                                    }
                                }
                                None => {
                                    warn!("notification subscription closed, resubscribing");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => error!(error = %e, "failed to subscribe to notifications"),
            }
            tokio::select! {
                _ = self.shutdown.wait() => return,
                _ = sleep(self.config.resubscribe_backoff()) => {}
            }
        }
    }

    /// Run both analytics passes for one completed window and persist the
    /// results. The passes are independent: a failure in one never blocks
    /// the other.
    pub async fn process_hour(&self, hour: u8) {
        let range = TimeRange::hour_window(self.config.dataset_date, hour);
        info!(hour, "computing analytics for completed window");

        let averages = self.region_averages(range).await;
        if averages.is_empty() {
            info!(hour, "no region averages for window");
        } else {
            let points = self.average_points(hour, range, &averages);
            self.persist(points, AVERAGES_MEASUREMENT).await;
        }

        let extremes = self.station_extremes(range).await;
        if extremes.is_empty() {
            info!(hour, "no station extremes for window");
        } else {
            let points = self.extreme_points(hour, range, &extremes);
            self.persist(points, EXTREMES_MEASUREMENT).await;
        }
    }

    /// One grouped mean query per tracked metric; a metric whose query
    /// fails is skipped, the rest still produce results.
    async fn region_averages(&self, range: TimeRange) -> Vec<AggregateRecord> {
        let mut out = Vec::new();
        for metric in &self.config.metrics {
            match self
                .store
                .aggregate(RAW_MEASUREMENT, metric, Aggregate::Mean, range, "state", None)
                .await
            {
                Ok(groups) => {
                    for group in groups {
                        out.push(AggregateRecord {
                            region: group.group,
                            metric: metric.clone(),
                            value: group.value,
                        });
                    }
                }
                Err(e) => warn!(metric = %metric, error = %e, "average query failed, skipping metric"),
            }
        }
        out
    }

    /// Discover the regions the store knows, then run min and max per
    /// (region, metric) grouped by station. Query failures are isolated
    /// per region/metric pair.
    async fn station_extremes(&self, range: TimeRange) -> Vec<ExtremeRecord> {
        let regions = match self.store.tag_values(RAW_MEASUREMENT, "state").await {
            Ok(regions) => regions,
            Err(e) => {
                warn!(error = %e, "region discovery failed, skipping extremes pass");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for region in &regions {
            for metric in &self.config.metrics {
                for kind in [ExtremeKind::Min, ExtremeKind::Max] {
                    match self
                        .store
                        .aggregate(
                            RAW_MEASUREMENT,
                            metric,
                            kind.aggregate(),
                            range,
                            "zip_code",
                            Some(("state", region)),
                        )
                        .await
                    {
                        Ok(groups) => {
                            for group in groups {
                                out.push(ExtremeRecord {
                                    region: region.clone(),
                                    station: group.group,
                                    metric: metric.clone(),
                                    kind,
                                    value: group.value,
                                });
                            }
                        }
                        Err(e) => {
                            warn!(region = %region, metric = %metric, error = %e,
                                "extreme query failed, skipping region/metric");
                        }
                    }
                }
            }
        }
        out
    }

    /// Shape average records as derived points. Metrics for the same
    /// region land as separate points sharing the tag set and timestamp;
    /// the store merges them into one logical row.
    fn average_points(
        &self,
        hour: u8,
        range: TimeRange,
        records: &[AggregateRecord],
    ) -> Vec<DataPoint> {
        records
            .iter()
            .map(|r| {
                DataPoint::new(AVERAGES_MEASUREMENT, range.start)
                    .tag("hour", format!("{:02}", hour))
                    .tag("state", r.region.as_str())
                    .field(format!("avg_{}", r.metric), FieldValue::Float(r.value))
            })
            .collect()
    }

    fn extreme_points(
        &self,
        hour: u8,
        range: TimeRange,
        records: &[ExtremeRecord],
    ) -> Vec<DataPoint> {
        records
            .iter()
            .map(|r| {
                DataPoint::new(EXTREMES_MEASUREMENT, range.start)
                    .tag("hour", format!("{:02}", hour))
                    .tag("state", r.region.as_str())
                    .tag("zip_code", r.station.as_str())
                    .field(
                        format!("{}_{}", r.kind.prefix(), r.metric),
                        FieldValue::Float(r.value),
                    )
            })
            .collect()
    }

    /// Batched write of derived points. A failed batch is retained for the
    /// retry drain; results are never dropped.
    async fn persist(&self, points: Vec<DataPoint>, measurement: &str) {
        match self.store.write_points(&points).await {
            Ok(()) => info!(measurement, count = points.len(), "wrote derived points"),
            Err(e) => {
                error!(measurement, error = %e, "derived write failed, queuing for retry");
                self.pending_writes.push(points);
            }
        }
    }

    /// One retry pass over queued write batches, oldest first; stops early
    /// when the store is still down so the queue keeps its order.
    pub async fn drain_writes_once(&self) {
        let queued = self.pending_writes.take_all();
        if queued.is_empty() {
            return;
        }
        info!(batches = queued.len(), "retrying queued derived writes");
        let mut batches = queued.into_iter();
        while let Some(points) = batches.next() {
            match self.store.write_points(&points).await {
                Ok(()) => info!(count = points.len(), "delivered queued derived write"),
                Err(e) => {
                    error!(error = %e, "store still unreachable, requeuing derived writes");
                    self.pending_writes.push(points);
                    self.pending_writes.requeue(batches);
                    return;
                }
            }
        }
    }

    async fn retry_loop(&self) {
        let mut tick = interval(self.config.write_retry());
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => {
                    self.drain_writes_once().await;
                    return;
                }
                _ = tick.tick() => {}
            }
            self.drain_writes_once().await;
        }
    }
}
