//! Pipeline configuration shared by the three daemons.

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Time-series store endpoint (InfluxDB v1 HTTP API).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        InfluxConfig {
            url: "http://127.0.0.1:8086".to_string(),
            database: "weather".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Redis endpoint carrying every channel of the protocol.
    pub redis_url: String,
    pub influx: InfluxConfig,
    /// Channel namespace prefix shared by all components.
    pub namespace: String,
    /// Source dataset for the streamer.
    pub dataset_path: String,
    /// Calendar date the dataset's hour windows belong to.
    pub dataset_date: NaiveDate,
    /// Records per published batch.
    pub batch_size: usize,
    /// Batch slots a window must fill to be complete. Shared out-of-band
    /// between streamer and ingester.
    pub batches_per_hour: u32,
    /// Metrics the processor aggregates per window.
    pub metrics: Vec<String>,
    /// Streamer pause between hour windows.
    pub hour_interval_ms: u64,
    /// Streamer/processor pending-queue drain cadence.
    pub pending_drain_ms: u64,
    /// Ingester reconciliation cadence; doubles as the storage-outage
    /// retry backoff.
    pub reconcile_ms: u64,
    /// Pause between consecutive missing-batch requests.
    pub request_throttle_ms: u64,
    /// Extra backoff when the same single batch stays outstanding.
    pub stall_backoff_ms: u64,
    /// Pause before re-subscribing after the bus drops a subscription.
    pub resubscribe_backoff_ms: u64,
    /// Processor failed-write retry cadence.
    pub write_retry_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            influx: InfluxConfig::default(),
            namespace: "weather_channel".to_string(),
            dataset_path: "data/weather_data.csv".to_string(),
            dataset_date: NaiveDate::from_ymd_opt(2023, 9, 19).unwrap_or_default(),
            batch_size: 500,
            batches_per_hour: 88,
            metrics: vec![
                "temp_c".to_string(),
                "pressure_mb".to_string(),
                "humidity".to_string(),
                "precip_mm".to_string(),
            ],
            hour_interval_ms: 600_000,
            pending_drain_ms: 30_000,
            reconcile_ms: 15_000,
            request_throttle_ms: 100,
            stall_backoff_ms: 15_000,
            resubscribe_backoff_ms: 5_000,
            write_retry_ms: 15_000,
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file, or defaults when no path is given, then
    /// apply endpoint overrides from the environment. Unreadable or
    /// unparsable files are fatal to the caller.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
            None => PipelineConfig::default(),
        };
        if let Ok(url) = std::env::var("WEATHER_REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(url) = std::env::var("WEATHER_INFLUX_URL") {
            config.influx.url = url;
        }
        Ok(config)
    }

    pub fn hour_interval(&self) -> Duration {
        Duration::from_millis(self.hour_interval_ms)
    }

    pub fn pending_drain(&self) -> Duration {
        Duration::from_millis(self.pending_drain_ms)
    }

    pub fn reconcile(&self) -> Duration {
        Duration::from_millis(self.reconcile_ms)
    }

    pub fn request_throttle(&self) -> Duration {
        Duration::from_millis(self.request_throttle_ms)
    }

    pub fn stall_backoff(&self) -> Duration {
        Duration::from_millis(self.stall_backoff_ms)
    }

    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }

    pub fn write_retry(&self) -> Duration {
        Duration::from_millis(self.write_retry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = PipelineConfig::default();
        assert_eq!(config.namespace, "weather_channel");
        assert_eq!(config.batches_per_hour, 88);
        assert_eq!(config.reconcile(), Duration::from_millis(15_000));
        assert_eq!(config.metrics.len(), 4);
    }

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            namespace = "weather_test"
            batches_per_hour = 4
            dataset_date = "2024-01-02"

            [influx]
            database = "test_db"
            "#,
        )
        .unwrap();
        assert_eq!(config.namespace, "weather_test");
        assert_eq!(config.batches_per_hour, 4);
        assert_eq!(config.influx.database, "test_db");
        assert_eq!(
            config.dataset_date,
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
        );
        // untouched keys keep their defaults
        assert_eq!(config.batch_size, 500);
    }

    #[test]
    fn test_garbage_toml_is_an_error() {
        let result: Result<PipelineConfig, _> = toml::from_str("batches_per_hour = \"lots\"");
        assert!(result.is_err());
    }
}
