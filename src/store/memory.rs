//! In-memory store double for tests, mirroring the production backend's
//! merge-on-write and aggregation contracts. Carries an offline switch so
//! tests can exercise the storage-outage paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{Aggregate, DataPoint, FieldValue, GroupedValue, StoreError, TimeRange, TimeSeriesStore};

type PointKey = (String, BTreeMap<String, String>, i64);

#[derive(Default)]
pub struct MemoryStore {
    points: Mutex<BTreeMap<PointKey, BTreeMap<String, FieldValue>>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Make every store call fail with `StoreError::Unreachable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("memory store offline".to_string()));
        }
        Ok(())
    }

    /// Snapshot of all stored points, one per merged (measurement, tags,
    /// timestamp) key.
    pub fn points(&self) -> Vec<DataPoint> {
        let points = self.points.lock();
        points
            .iter()
            .map(|((measurement, tags, millis), fields)| DataPoint {
                measurement: measurement.clone(),
                tags: tags.clone(),
                fields: fields.clone(),
                timestamp: chrono::DateTime::from_timestamp_millis(*millis)
                    .unwrap_or_default(),
            })
            .collect()
    }

    pub fn count(&self, measurement: &str) -> usize {
        self.points
            .lock()
            .keys()
            .filter(|(m, _, _)| m == measurement)
            .count()
    }
}

#[async_trait::async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn write_points(&self, points: &[DataPoint]) -> Result<(), StoreError> {
        self.check_online()?;
        let mut stored = self.points.lock();
        for point in points {
            let key = (
                point.measurement.clone(),
                point.tags.clone(),
                point.timestamp.timestamp_millis(),
            );
            stored.entry(key).or_default().extend(
                point
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        Ok(())
    }

    async fn aggregate(
        &self,
        measurement: &str,
        field: &str,
        function: Aggregate,
        range: TimeRange,
        group_by: &str,
        filter: Option<(&str, &str)>,
    ) -> Result<Vec<GroupedValue>, StoreError> {
        self.check_online()?;
        let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        {
            let stored = self.points.lock();
            for ((m, tags, millis), fields) in stored.iter() {
                if m != measurement {
                    continue;
                }
                let instant = match chrono::DateTime::from_timestamp_millis(*millis) {
                    Some(t) => t,
                    None => continue,
                };
                if !range.contains(instant) {
                    continue;
                }
                if let Some((key, value)) = filter {
                    if tags.get(key).map(String::as_str) != Some(value) {
                        continue;
                    }
                }
                let group = match tags.get(group_by) {
                    Some(g) => g.clone(),
                    None => continue,
                };
                if let Some(v) = fields.get(field).and_then(FieldValue::as_f64) {
                    groups.entry(group).or_default().push(v);
                }
            }
        }

        Ok(groups
            .into_iter()
            .filter_map(|(group, values)| {
                if values.is_empty() {
                    return None;
                }
                let value = match function {
                    Aggregate::Mean => values.iter().sum::<f64>() / values.len() as f64,
                    Aggregate::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
                    Aggregate::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                };
                Some(GroupedValue { group, value })
            })
            .collect())
    }

    async fn tag_values(&self, measurement: &str, tag_key: &str) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        let stored = self.points.lock();
        let mut values: Vec<String> = stored
            .keys()
            .filter(|(m, _, _)| m == measurement)
            .filter_map(|(_, tags, _)| tags.get(tag_key).cloned())
            .collect();
        values.sort();
        values.dedup();
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn point(state: &str, zip: &str, temp: f64, minute: u32) -> DataPoint {
        let ts = Utc.with_ymd_and_hms(2023, 9, 19, 10, minute, 0).unwrap();
        DataPoint::new("weather_data", ts)
            .tag("state", state)
            .tag("zip_code", zip)
            .field("temp_c", FieldValue::Float(temp))
    }

    fn window() -> TimeRange {
        TimeRange::hour_window(chrono::NaiveDate::from_ymd_opt(2023, 9, 19).unwrap(), 10)
    }

    #[tokio::test]
    async fn test_same_key_points_merge_fields() {
        let store = MemoryStore::new();
        let ts = Utc.with_ymd_and_hms(2023, 9, 19, 10, 0, 0).unwrap();
        let a = DataPoint::new("m", ts)
            .tag("state", "NY")
            .field("x", FieldValue::Float(1.0));
        let b = DataPoint::new("m", ts)
            .tag("state", "NY")
            .field("y", FieldValue::Float(2.0));
        store.write_points(&[a, b]).await.unwrap();

        let merged = store.points();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].fields.len(), 2);
    }

    #[tokio::test]
    async fn test_rewriting_identical_point_is_idempotent() {
        let store = MemoryStore::new();
        let p = point("NY", "10001", 21.0, 5);
        store.write_points(&[p.clone()]).await.unwrap();
        store.write_points(&[p]).await.unwrap();
        assert_eq!(store.count("weather_data"), 1);
    }

    #[tokio::test]
    async fn test_mean_grouped_by_state() {
        let store = MemoryStore::new();
        store
            .write_points(&[
                point("NY", "10001", 10.0, 1),
                point("NY", "10002", 20.0, 2),
                point("CA", "90210", 30.0, 3),
            ])
            .await
            .unwrap();

        let means = store
            .aggregate("weather_data", "temp_c", Aggregate::Mean, window(), "state", None)
            .await
            .unwrap();
        assert_eq!(
            means,
            vec![
                GroupedValue { group: "CA".to_string(), value: 30.0 },
                GroupedValue { group: "NY".to_string(), value: 15.0 },
            ]
        );
    }

    #[tokio::test]
    async fn test_extremes_with_tag_filter() {
        let store = MemoryStore::new();
        store
            .write_points(&[
                point("NY", "z1", 5.0, 1),
                point("NY", "z2", 30.0, 2),
                point("CA", "z3", -40.0, 3),
            ])
            .await
            .unwrap();

        let mins = store
            .aggregate(
                "weather_data",
                "temp_c",
                Aggregate::Min,
                window(),
                "zip_code",
                Some(("state", "NY")),
            )
            .await
            .unwrap();
        assert_eq!(
            mins,
            vec![
                GroupedValue { group: "z1".to_string(), value: 5.0 },
                GroupedValue { group: "z2".to_string(), value: 30.0 },
            ]
        );
    }

    #[tokio::test]
    async fn test_range_is_half_open() {
        let store = MemoryStore::new();
        let boundary = Utc.with_ymd_and_hms(2023, 9, 19, 11, 0, 0).unwrap();
        store
            .write_points(&[DataPoint::new("weather_data", boundary)
                .tag("state", "NY")
                .field("temp_c", FieldValue::Float(50.0))])
            .await
            .unwrap();

        let means = store
            .aggregate("weather_data", "temp_c", Aggregate::Mean, window(), "state", None)
            .await
            .unwrap();
        assert!(means.is_empty());
    }

    #[tokio::test]
    async fn test_offline_rejects_all_calls() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.write_points(&[point("NY", "z", 1.0, 0)]).await,
            Err(StoreError::Unreachable(_))
        ));
        assert!(store.tag_values("weather_data", "state").await.is_err());
    }
}
