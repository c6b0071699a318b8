//! Source dataset loading and deterministic hour/batch windowing.
//!
//! The same windowing function backs both the publish cycle and replay:
//! a batch recomputed for a replay request is byte-identical to its
//! original publication.

use std::collections::HashMap;
use std::path::Path;

use serde_json::{Map, Number, Value};
use thiserror::Error;
use tracing::warn;

use crate::schema::{self, WeatherRecord};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read dataset: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse dataset: {0}")]
    Csv(#[from] csv::Error),
    #[error("dataset has no usable records")]
    Empty,
    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct Dataset {
    records: Vec<WeatherRecord>,
    /// File-order record indices per hour; file order is what makes batch
    /// slicing reproducible.
    hours: HashMap<u8, Vec<usize>>,
}

impl Dataset {
    pub fn from_csv_path(path: &Path) -> Result<Self, DatasetError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let mut map = Map::new();
            for (key, raw) in headers.iter().zip(row.iter()) {
                if raw.is_empty() {
                    // absent values are omitted, not coerced
                    continue;
                }
                map.insert(key.to_string(), csv_value(key, raw));
            }
            records.push(WeatherRecord(map));
        }
        Dataset::from_records(records)
    }

    /// Build from already-decoded records, applying the same validation as
    /// the CSV path. Records without a parseable timestamp are invalid and
    /// rejected here, before they can ever reach the bus.
    pub fn from_records(records: Vec<WeatherRecord>) -> Result<Self, DatasetError> {
        let mut kept = Vec::with_capacity(records.len());
        let mut hours: HashMap<u8, Vec<usize>> = HashMap::new();
        let mut rejected = 0usize;

        for record in records {
            match record.hour() {
                Some(hour) => {
                    hours.entry(hour).or_default().push(kept.len());
                    kept.push(record);
                }
                None => rejected += 1,
            }
        }
        if rejected > 0 {
            warn!(rejected, "rejected records without a parseable timestamp");
        }
        if kept.is_empty() {
            return Err(DatasetError::Empty);
        }
        Ok(Dataset {
            records: kept,
            hours,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records_for_hour(&self, hour: u8) -> Vec<&WeatherRecord> {
        self.hours
            .get(&hour)
            .map(|indices| indices.iter().map(|&i| &self.records[i]).collect())
            .unwrap_or_default()
    }

    /// Number of `batch_size`-bounded batches the hour splits into.
    pub fn batch_count(&self, hour: u8, batch_size: usize) -> usize {
        let len = self.hours.get(&hour).map(Vec::len).unwrap_or(0);
        if batch_size == 0 {
            return 0;
        }
        len.div_ceil(batch_size)
    }

    /// The records of one batch slot, in file order.
    pub fn batch(&self, hour: u8, slot: u32, batch_size: usize) -> Vec<&WeatherRecord> {
        let indices = match self.hours.get(&hour) {
            Some(indices) => indices,
            None => return Vec::new(),
        };
        let start = slot as usize * batch_size;
        indices
            .iter()
            .skip(start)
            .take(batch_size)
            .map(|&i| &self.records[i])
            .collect()
    }

    /// Serialized wire payload for one batch slot; `None` when the slot is
    /// past the end of the hour's data.
    pub fn batch_payload(
        &self,
        hour: u8,
        slot: u32,
        batch_size: usize,
    ) -> Result<Option<String>, DatasetError> {
        let batch = self.batch(hour, slot, batch_size);
        if batch.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_string(&batch)?))
    }
}

/// CSV cells are untyped; numeric-looking field values become numbers so
/// the wire form matches what the store will ingest, while tag columns and
/// the timestamp always stay strings (zip codes keep leading zeros).
fn csv_value(key: &str, raw: &str) -> Value {
    if schema::is_tag_column(key) || key == "time" || schema::STRING_FIELDS.contains(&key) {
        return Value::String(raw.to_string());
    }
    match raw.parse::<f64>().ok().and_then(Number::from_f64) {
        Some(n) => Value::Number(n),
        None => Value::String(raw.to_string()),
    }
}
