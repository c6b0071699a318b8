//! Time-series store abstraction.
//!
//! The pipeline talks to an append-only measurement store through the
//! [`TimeSeriesStore`] trait so the same component logic runs against the
//! real InfluxDB-compatible backend in production and an in-memory double
//! in tests. Points sharing an identical (measurement, tag-set, timestamp)
//! are merged field-wise by the store; both implementations honor that
//! contract.

mod influx;
mod memory;

pub use influx::InfluxStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use thiserror::Error;

/// A single stored field value. All measured fields are numeric except the
/// wind direction, which stays a string.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }
}

/// One point: measurement name, indexed tags, measured fields, timestamp.
///
/// Tags and fields are `BTreeMap`s so the merge key and the serialized wire
/// form are deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl DataPoint {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        DataPoint {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Aggregate functions the store must support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Mean,
    Min,
    Max,
}

impl Aggregate {
    pub fn function(&self) -> &'static str {
        match self {
            Aggregate::Mean => "MEAN",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
        }
    }
}

/// Half-open query window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// The one-hour window of the given date covering `hour:00..hour+1:00`.
    pub fn hour_window(date: NaiveDate, hour: u8) -> Self {
        let day_start = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
        let start = day_start + Duration::hours(i64::from(hour));
        TimeRange {
            start,
            end: start + Duration::hours(1),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

/// One aggregated value for one group-by tag value.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedValue {
    pub group: String,
    pub value: f64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("store rejected request with status {code}: {body}")]
    Rejected { code: u16, body: String },
    #[error("store returned an undecodable response: {0}")]
    Decode(String),
    #[error("query failed: {0}")]
    Query(String),
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Write a batch of points. Points with an identical
    /// (measurement, tag-set, timestamp) key merge field-wise.
    async fn write_points(&self, points: &[DataPoint]) -> Result<(), StoreError>;

    /// Run one aggregate over `field` of `measurement` within `range`,
    /// grouped by the `group_by` tag, optionally filtered by an exact tag
    /// match. Groups without a usable value are omitted.
    async fn aggregate(
        &self,
        measurement: &str,
        field: &str,
        function: Aggregate,
        range: TimeRange,
        group_by: &str,
        filter: Option<(&str, &str)>,
    ) -> Result<Vec<GroupedValue>, StoreError>;

    /// Distinct values of a tag key across a measurement (schema discovery).
    async fn tag_values(&self, measurement: &str, tag_key: &str) -> Result<Vec<String>, StoreError>;
}
