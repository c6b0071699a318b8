//! Shared record typing rules.
//!
//! One contract for all three daemons: which record attributes are indexed
//! tags, which are measured fields, and how raw values are coerced before
//! a write. The streamer serializes records as-is; coercion happens once,
//! at the ingester's flush and nowhere else.

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::store::{DataPoint, FieldValue};

pub const RAW_MEASUREMENT: &str = "weather_data";
pub const AVERAGES_MEASUREMENT: &str = "weather_averages";
pub const EXTREMES_MEASUREMENT: &str = "zip_code_extremes";

/// Low-cardinality, always-string attributes, indexed for filtering.
pub const TAG_COLUMNS: [&str; 3] = ["zip_code", "state", "name"];

/// Measured attributes. Numeric except where noted in `STRING_FIELDS`.
pub const FIELD_COLUMNS: [&str; 33] = [
    "chance_of_rain",
    "chance_of_snow",
    "cloud",
    "dewpoint_c",
    "dewpoint_f",
    "feelslike_c",
    "feelslike_f",
    "gust_kph",
    "gust_mph",
    "heatindex_c",
    "heatindex_f",
    "humidity",
    "is_day",
    "precip_in",
    "precip_mm",
    "pressure_in",
    "pressure_mb",
    "snow_cm",
    "temp_c",
    "temp_f",
    "uv",
    "vis_km",
    "vis_miles",
    "will_it_rain",
    "will_it_snow",
    "wind_degree",
    "wind_dir",
    "wind_kph",
    "wind_mph",
    "windchill_c",
    "windchill_f",
    "lat",
    "lon",
];

/// Fields exempt from numeric coercion.
pub const STRING_FIELDS: [&str; 1] = ["wind_dir"];

pub fn is_tag_column(key: &str) -> bool {
    TAG_COLUMNS.contains(&key)
}

/// One sensor observation, kept as the raw attribute map it arrived as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeatherRecord(pub Map<String, Value>);

impl WeatherRecord {
    /// The record's own instant. A record without one is invalid and must
    /// be rejected before transport.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.0.get("time")?.as_str()?;
        parse_instant(raw)
    }

    pub fn hour(&self) -> Option<u8> {
        self.timestamp().map(|t| t.hour() as u8)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}

/// Parse the `time` attribute. The feed writes naive local-free timestamps
/// (`2023-09-19 14:00`); RFC 3339 is accepted for replayed or derived data.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Shape one record into a raw-measurement store point: tag columns become
/// tags, field columns are coerced per the contract, the timestamp is the
/// record's own. Returns `None` when the record has no usable instant or
/// no usable field at all.
pub fn shape_point(record: &WeatherRecord) -> Option<DataPoint> {
    let timestamp = record.timestamp()?;
    let mut point = DataPoint::new(RAW_MEASUREMENT, timestamp);

    for key in TAG_COLUMNS {
        match record.0.get(key) {
            Some(Value::String(s)) if !s.is_empty() => {
                point.tags.insert(key.to_string(), s.clone());
            }
            Some(Value::Number(n)) => {
                point.tags.insert(key.to_string(), n.to_string());
            }
            _ => {}
        }
    }

    for key in FIELD_COLUMNS {
        if let Some(value) = coerce_field(key, record.0.get(key)) {
            point.fields.insert(key.to_string(), value);
        }
    }

    if point.fields.is_empty() {
        warn!(time = %timestamp, "record has no usable fields, skipping");
        return None;
    }
    Some(point)
}

/// Coercion rules: empty or absent values are omitted, `STRING_FIELDS`
/// stay strings, everything else must be numeric; a value that fails
/// numeric coercion is dropped with a warning, never fatal.
fn coerce_field(key: &str, value: Option<&Value>) -> Option<FieldValue> {
    let value = value?;
    if STRING_FIELDS.contains(&key) {
        return match value {
            Value::String(s) if !s.is_empty() => Some(FieldValue::Text(s.clone())),
            _ => None,
        };
    }
    match value {
        Value::Number(n) => n.as_f64().map(FieldValue::Float),
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => match s.parse::<f64>() {
            Ok(v) => Some(FieldValue::Float(v)),
            Err(_) => {
                warn!(field = key, value = %s, "dropping value that fails numeric coercion");
                None
            }
        },
        Value::Null => None,
        other => {
            warn!(field = key, value = %other, "dropping non-scalar field value");
            None
        }
    }
}
