//! End-to-end reassembly semantics: the ingester against the in-memory
//! bus and store, fed batches out of order, duplicated, and through
//! simulated outages.

use std::sync::Arc;

use weather_relay::bus::{BusMessage, MemoryBus};
use weather_relay::store::MemoryStore;
use weather_relay::{Ingester, PipelineConfig};

const NS: &str = "weather_test";

fn test_config() -> PipelineConfig {
    PipelineConfig {
        namespace: NS.to_string(),
        batches_per_hour: 3,
        batch_size: 2,
        request_throttle_ms: 0,
        stall_backoff_ms: 0,
        ..PipelineConfig::default()
    }
}

fn batch_payload(hour: u8, zips: &[&str]) -> String {
    let records: Vec<serde_json::Value> = zips
        .iter()
        .map(|zip| {
            serde_json::json!({
                "time": format!("2023-09-19 {:02}:30", hour),
                "zip_code": zip,
                "state": "NY",
                "temp_c": 20.0,
            })
        })
        .collect();
    serde_json::to_string(&records).unwrap()
}

async fn deliver(ingester: &Ingester, index: &str, hour: u8, payload: String) {
    ingester
        .handle_message(&BusMessage {
            channel: format!("{}:data:{}:{}", NS, index, hour),
            payload,
        })
        .await;
}

#[tokio::test]
async fn test_out_of_order_and_duplicate_delivery_completes_once() {
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    let ingester = Ingester::new(bus.clone(), store.clone(), test_config());

    // slots arrive 1, LAST, 1 (duplicate), 0
    deliver(&ingester, "1", 6, batch_payload(6, &["z2", "z3"])).await;
    deliver(&ingester, "LAST", 6, batch_payload(6, &["z4"])).await;
    assert_eq!(store.count("weather_data"), 0, "no flush before completion");

    deliver(&ingester, "1", 6, batch_payload(6, &["dup-a", "dup-b"])).await;
    assert_eq!(store.count("weather_data"), 0);

    deliver(&ingester, "0", 6, batch_payload(6, &["z0", "z1"])).await;

    // exactly the five distinct records, none double-counted
    assert_eq!(store.count("weather_data"), 5);
    let notifications = bus.published_to(&format!("{}:processor:6", NS));
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].payload, "6");
    assert!(ingester.is_drained(), "tracker dropped after confirmed flush");
}

#[tokio::test]
async fn test_malformed_messages_are_dropped_not_fatal() {
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    let ingester = Ingester::new(bus.clone(), store.clone(), test_config());

    ingester
        .handle_message(&BusMessage {
            channel: format!("{}:data:not-a-slot:6", NS),
            payload: batch_payload(6, &["z0"]),
        })
        .await;
    ingester
        .handle_message(&BusMessage {
            channel: format!("{}:data:0:6", NS),
            payload: "{ not json".to_string(),
        })
        .await;

    // the window is untouched and later good batches still complete it
    deliver(&ingester, "0", 6, batch_payload(6, &["z0", "z1"])).await;
    deliver(&ingester, "1", 6, batch_payload(6, &["z2", "z3"])).await;
    deliver(&ingester, "LAST", 6, batch_payload(6, &["z4"])).await;
    assert_eq!(store.count("weather_data"), 5);
}

#[tokio::test]
async fn test_missing_batches_requested_never_for_present_slots() {
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    let ingester = Ingester::new(bus.clone(), store.clone(), test_config());

    // only the sentinel arrives: slots 0 and 1 are missing
    deliver(&ingester, "LAST", 4, batch_payload(4, &["z4"])).await;
    assert_eq!(bus.published_to(&format!("{}:request:0:4", NS)).len(), 1);
    assert_eq!(bus.published_to(&format!("{}:request:1:4", NS)).len(), 1);
    assert!(bus.published_to(&format!("{}:request:2:4", NS)).is_empty());

    // slot 0 lands; a further detection cycle must not re-request it
    deliver(&ingester, "0", 4, batch_payload(4, &["z0", "z1"])).await;
    assert_eq!(
        bus.published_to(&format!("{}:request:0:4", NS)).len(),
        1,
        "received slot must never be re-requested"
    );
    assert_eq!(bus.published_to(&format!("{}:request:1:4", NS)).len(), 2);

    // replayed slot 1 arrives under its numeric index and completes the set
    deliver(&ingester, "1", 4, batch_payload(4, &["z2", "z3"])).await;
    assert_eq!(store.count("weather_data"), 5);
}

#[tokio::test]
async fn test_storage_outage_preserves_window_until_confirmed_flush() {
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    let ingester = Ingester::new(bus.clone(), store.clone(), test_config());

    store.set_offline(true);
    deliver(&ingester, "0", 9, batch_payload(9, &["z0", "z1"])).await;
    deliver(&ingester, "1", 9, batch_payload(9, &["z2", "z3"])).await;
    deliver(&ingester, "LAST", 9, batch_payload(9, &["z4"])).await;

    // complete, but the write failed: nothing stored, nothing notified,
    // state kept
    assert_eq!(store.count("weather_data"), 0);
    assert!(bus.published_to(&format!("{}:processor:9", NS)).is_empty());
    assert!(!ingester.is_drained());

    // a duplicate during the outage must not trigger another attempt loop
    deliver(&ingester, "0", 9, batch_payload(9, &["dup"])).await;
    assert_eq!(store.count("weather_data"), 0);

    // store recovers; reconciliation re-drives the flush exactly once
    store.set_offline(false);
    ingester.reconcile_once().await;
    assert_eq!(store.count("weather_data"), 5);
    assert_eq!(bus.published_to(&format!("{}:processor:9", NS)).len(), 1);
    assert!(ingester.is_drained());

    // a second pass finds nothing left to apply
    ingester.reconcile_once().await;
    assert_eq!(store.count("weather_data"), 5, "window must not be double-applied");
    assert_eq!(bus.published_to(&format!("{}:processor:9", NS)).len(), 1);
}

#[tokio::test]
async fn test_failed_notification_is_queued_and_redelivered() {
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    let ingester = Ingester::new(bus.clone(), store.clone(), test_config());

    deliver(&ingester, "0", 11, batch_payload(11, &["z0", "z1"])).await;
    deliver(&ingester, "1", 11, batch_payload(11, &["z2", "z3"])).await;

    // the bus dies between the last batch being buffered and the notify
    bus.set_offline(true);
    ingester
        .handle_message(&BusMessage {
            channel: format!("{}:data:LAST:11", NS),
            payload: batch_payload(11, &["z4"]),
        })
        .await;

    // flush reached the store even though the notification could not go out
    assert_eq!(store.count("weather_data"), 5);
    assert!(bus.published_to(&format!("{}:processor:11", NS)).is_empty());

    bus.set_offline(false);
    ingester.reconcile_once().await;
    let notifications = bus.published_to(&format!("{}:processor:11", NS));
    assert_eq!(notifications.len(), 1);
    assert!(ingester.is_drained());
}

#[tokio::test]
async fn test_windows_are_tracked_independently() {
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    let ingester = Ingester::new(bus.clone(), store.clone(), test_config());

    // interleave two hours; only hour 2 completes
    deliver(&ingester, "0", 2, batch_payload(2, &["a0", "a1"])).await;
    deliver(&ingester, "0", 3, batch_payload(3, &["b0", "b1"])).await;
    deliver(&ingester, "1", 2, batch_payload(2, &["a2", "a3"])).await;
    deliver(&ingester, "LAST", 2, batch_payload(2, &["a4"])).await;

    assert_eq!(store.count("weather_data"), 5);
    assert_eq!(bus.published_to(&format!("{}:processor:2", NS)).len(), 1);
    assert!(bus.published_to(&format!("{}:processor:3", NS)).is_empty());
    assert!(!ingester.is_drained(), "hour 3 stays buffered");
}
