//! InfluxDB v1 HTTP backend: line-protocol writes, InfluxQL queries.

use serde_json::Value;
use tracing::debug;

use super::{Aggregate, DataPoint, FieldValue, GroupedValue, StoreError, TimeRange, TimeSeriesStore};
use crate::config::InfluxConfig;

pub struct InfluxStore {
    http: reqwest::Client,
    url: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
}

impl InfluxStore {
    pub fn new(config: &InfluxConfig) -> Self {
        InfluxStore {
            http: reqwest::Client::new(),
            url: config.url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    async fn query(&self, q: &str) -> Result<Value, StoreError> {
        debug!(query = q, "influx query");
        let request = self
            .http
            .get(format!("{}/query", self.url))
            .query(&[("db", self.database.as_str()), ("q", q)]);
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Rejected {
                code: status.as_u16(),
                body,
            });
        }

        let value: Value =
            serde_json::from_str(&body).map_err(|e| StoreError::Decode(e.to_string()))?;
        if let Some(error) = value
            .pointer("/results/0/error")
            .and_then(Value::as_str)
        {
            return Err(StoreError::Query(error.to_string()));
        }
        Ok(value)
    }
}

#[async_trait::async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn write_points(&self, points: &[DataPoint]) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let body = points.iter().map(line).collect::<Vec<_>>().join("\n");
        let request = self
            .http
            .post(format!("{}/write", self.url))
            .query(&[("db", self.database.as_str()), ("precision", "ms")])
            .body(body);
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Rejected {
            code: status.as_u16(),
            body,
        })
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
        let filter_clause = filter
            .map(|(key, value)| format!(" AND \"{}\" = '{}'", key, escape_string_literal(value)))
            .unwrap_or_default();
        let q = format!(
            "SELECT {}(\"{}\") FROM \"{}\" WHERE time >= '{}' AND time < '{}'{} GROUP BY \"{}\"",
            function.function(),
            field,
            measurement,
            range.start.to_rfc3339(),
            range.end.to_rfc3339(),
            filter_clause,
            group_by,
        );
        let value = self.query(&q).await?;

        let mut out = Vec::new();
        let series = value
            .pointer("/results/0/series")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in &series {
            let group = match entry
                .pointer(&format!("/tags/{}", group_by))
                .and_then(Value::as_str)
            {
                Some(g) => g.to_string(),
                None => continue,
            };
            // columns are ["time", "<fn>"]; the aggregate sits in the first
            // row's second column and is null for empty groups
            if let Some(v) = entry.pointer("/values/0/1").and_then(Value::as_f64) {
                out.push(GroupedValue { group, value: v });
            }
        }
        Ok(out)
    }

    async fn tag_values(&self, measurement: &str, tag_key: &str) -> Result<Vec<String>, StoreError> {
        let q = format!(
            "SHOW TAG VALUES FROM \"{}\" WITH KEY = \"{}\"",
            measurement, tag_key
        );
        let value = self.query(&q).await?;

        let rows = value
            .pointer("/results/0/series/0/values")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|row| row.get(1).and_then(Value::as_str).map(str::to_string))
            .collect())
    }
}

/// Render one point in line protocol with millisecond precision.
fn line(point: &DataPoint) -> String {
    let mut out = escape_name(&point.measurement);
    for (key, value) in &point.tags {
        out.push(',');
        out.push_str(&escape_name(key));
        out.push('=');
        out.push_str(&escape_name(value));
    }
    out.push(' ');
    let fields: Vec<String> = point
        .fields
        .iter()
        .map(|(key, value)| match value {
            FieldValue::Float(v) => format!("{}={}", escape_name(key), v),
            FieldValue::Text(s) => {
                format!("{}=\"{}\"", escape_name(key), escape_string_field(s))
            }
        })
        .collect();
    out.push_str(&fields.join(","));
    out.push(' ');
    out.push_str(&point.timestamp.timestamp_millis().to_string());
    out
}

/// Escaping for measurement names, tag keys/values and field keys.
fn escape_name(raw: &str) -> String {
    raw.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}

fn escape_string_field(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

fn escape_string_literal(raw: &str) -> String {
    raw.replace('\'', "\\'")
}
