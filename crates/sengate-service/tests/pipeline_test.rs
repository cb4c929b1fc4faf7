//! End-to-end pipeline tests over scripted store and bus backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::sleep;

use sengate_core::{
    BusConfig, Error, GatewayConfig, PublishEnvelope, ReadingStatus, Result, StoreConfig,
};
use sengate_link::{
    BusConnection, BusTransport, QosLevel, StoreBackend, StoreConnection, TransportEvent,
};
use sengate_service::Pipeline;

struct MockStore {
    data: std::sync::Mutex<HashMap<String, String>>,
    fail_get: AtomicBool,
}

impl MockStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            data: std::sync::Mutex::new(HashMap::new()),
            fail_get: AtomicBool::new(false),
        })
    }

    fn set(&self, key: &str, value: &str) {
        self.data.lock().unwrap().insert(key.into(), value.into());
    }
}

#[async_trait]
impl StoreBackend for MockStore {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(Error::Store("read failed".into()));
        }
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let data = self.data.lock().unwrap();
        Ok(keys.iter().map(|k| data.get(k).cloned()).collect())
    }

    async fn ping(&self) -> Result<()> {
        if self.fail_get.load(Ordering::SeqCst) {
            Err(Error::Store("ping failed".into()))
        } else {
            Ok(())
        }
    }

    async fn close(&self) {}
}

struct MockBus {
    published: std::sync::Mutex<Vec<(String, Vec<u8>, QosLevel, bool)>>,
    events: std::sync::Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl MockBus {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            published: std::sync::Mutex::new(Vec::new()),
            events: std::sync::Mutex::new(None),
        })
    }

    async fn emit(&self, event: TransportEvent) {
        let sender = self.events.lock().unwrap().clone().expect("not opened");
        sender.send(event).await.unwrap();
    }

    fn envelopes(&self) -> Vec<(String, PublishEnvelope)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(topic, ..)| topic.ends_with("/seninf"))
            .map(|(topic, payload, ..)| {
                (topic.clone(), serde_json::from_slice(payload).unwrap())
            })
            .collect()
    }

    fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, ..)| topic.clone())
            .collect()
    }
}

#[async_trait]
impl BusTransport for MockBus {
    async fn open(&self, _config: &BusConfig, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload, qos, retain));
        Ok(())
    }

    async fn close(&self) {}
}

fn test_config() -> GatewayConfig {
    GatewayConfig::new(
        StoreConfig::new("redis://localhost:6379"),
        BusConfig::new("broker"),
    )
}

/// Yield until spawned state tasks have drained pending events.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

async fn connected_pipeline(
    config: GatewayConfig,
    store: Arc<MockStore>,
    bus: Arc<MockBus>,
) -> Pipeline {
    let store_conn = Arc::new(StoreConnection::new(config.store.clone(), store));
    let bus_conn = Arc::new(BusConnection::new(
        config.bus.clone(),
        config.publisher.clone(),
        bus.clone(),
    ));

    let acker = {
        let bus = bus.clone();
        tokio::spawn(async move {
            loop {
                if bus.events.lock().unwrap().is_some() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            bus.emit(TransportEvent::Up).await;
        })
    };

    let pipeline = Pipeline::new(config, store_conn, bus_conn);
    pipeline.initialize().await.unwrap();
    acker.await.unwrap();
    pipeline
}

const TWO_DEVICE_BATCH: &str = r#"[
    {"serial": "S1", "address": 1, "description": "room",
     "name": "t1", "profile": "p",
     "values": [{"id": "v1", "name": "temp", "code": "A", "min": "-1", "max": "60"}]},
    {"serial": "S1", "address": 1, "description": "room",
     "name": "h1", "profile": "p",
     "values": [{"id": "v2", "name": "hum", "code": "B", "min": "0", "max": "100"}]},
    {"serial": "S2", "address": 2, "description": "hall",
     "name": "t2", "profile": "p",
     "values": [{"id": "v3", "name": "temp", "code": "A", "min": "-1", "max": "60"}]}
]"#;

#[tokio::test]
async fn test_poll_publishes_one_envelope_per_device() {
    let store = MockStore::new();
    store.set("seninf", TWO_DEVICE_BATCH);
    let bus = MockBus::new();
    let pipeline = connected_pipeline(test_config(), store, bus.clone()).await;

    pipeline.poll_once().await;

    let envelopes = bus.envelopes();
    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[0].0, "sengate/S1/seninf");
    assert_eq!(envelopes[0].1.readings.len(), 2);
    assert_eq!(envelopes[1].0, "sengate/S2/seninf");
    assert_eq!(envelopes[1].1.readings.len(), 1);

    let stats = pipeline.get_stats().await;
    assert_eq!(stats.total_published, 2);
    assert_eq!(stats.error_count, 0);
    assert!(stats.last_publish.is_some());
}

#[tokio::test]
async fn test_poll_decodes_and_classifies() {
    let store = MockStore::new();
    // Description carries escaped legacy bytes for 溫度.
    store.set(
        "seninf",
        r#"[{"serial": "S1", "address": 1,
             "description": "\\xb7\\xc5\\xab\\xd7 room",
             "name": "t1", "profile": "p",
             "values": [{"id": "v1", "name": "temp", "code": "A", "min": "-1", "max": "60"}]}]"#,
    );
    let bus = MockBus::new();
    let pipeline = connected_pipeline(test_config(), store, bus.clone()).await;

    pipeline.poll_once().await;

    let envelopes = bus.envelopes();
    assert_eq!(envelopes.len(), 1);
    let reading = &envelopes[0].1.readings[0];
    assert_eq!(reading.description, "溫度 room");
    assert_eq!(reading.status, ReadingStatus::Active);
    let value = &reading.values[0];
    assert_eq!(value.value_type, "溫度");
    assert!(value.range_valid);
    assert_eq!(value.min, Some(-1.0));
    assert_eq!(value.max, Some(60.0));
}

#[tokio::test]
async fn test_poll_skips_when_bus_down() {
    let store = MockStore::new();
    store.set("seninf", TWO_DEVICE_BATCH);
    let bus = MockBus::new();
    let pipeline = connected_pipeline(test_config(), store, bus.clone()).await;

    bus.emit(TransportEvent::Down("broker closed".into())).await;
    settle().await;

    pipeline.poll_once().await;
    assert!(bus.envelopes().is_empty());
    let stats = pipeline.get_stats().await;
    assert_eq!(stats.skipped_cycles, 1);
    assert_eq!(stats.total_published, 0);
    assert_eq!(stats.error_count, 0);

    // Built-in reconnect recovers and the next tick resumes publishing.
    bus.emit(TransportEvent::Up).await;
    settle().await;
    pipeline.poll_once().await;
    assert_eq!(bus.envelopes().len(), 2);
}

#[tokio::test]
async fn test_empty_batch_publishes_nothing() {
    let store = MockStore::new();
    let bus = MockBus::new();
    let pipeline = connected_pipeline(test_config(), store, bus.clone()).await;

    pipeline.poll_once().await;

    assert!(bus.envelopes().is_empty());
    let stats = pipeline.get_stats().await;
    assert_eq!(stats.total_published, 0);
    assert_eq!(stats.error_count, 0);
    assert_eq!(stats.skipped_cycles, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cycle_failure_recovers_on_later_tick() {
    let store = MockStore::new();
    store.set("seninf", TWO_DEVICE_BATCH);
    let bus = MockBus::new();
    let pipeline = connected_pipeline(test_config(), store.clone(), bus.clone()).await;

    store.fail_get.store(true, Ordering::SeqCst);
    pipeline.poll_once().await;
    let stats = pipeline.get_stats().await;
    assert_eq!(stats.error_count, 1);
    assert!(bus.envelopes().is_empty());

    // The store heals; past the liveness probe interval the readiness
    // projection catches up and the cycle runs again.
    store.fail_get.store(false, Ordering::SeqCst);
    sleep(Duration::from_secs(11)).await;
    settle().await;

    pipeline.poll_once().await;
    assert_eq!(bus.envelopes().len(), 2);
    let stats = pipeline.get_stats().await;
    assert_eq!(stats.total_published, 2);
}

#[tokio::test]
async fn test_registration_best_effort() {
    let store = MockStore::new();
    // No identity keys set: registration must fail without blocking.
    store.set("seninf", TWO_DEVICE_BATCH);
    let bus = MockBus::new();
    let pipeline = connected_pipeline(test_config(), store, bus.clone()).await;

    pipeline.register_device().await;
    let stats = pipeline.get_stats().await;
    assert_eq!(stats.error_count, 1);

    // Polling is unaffected.
    pipeline.poll_once().await;
    assert_eq!(bus.envelopes().len(), 2);
}

#[tokio::test]
async fn test_registration_publishes_identity() {
    let store = MockStore::new();
    store.set("device:serial", "GW-7");
    store.set("device:ip", "10.0.0.2");
    let bus = MockBus::new();
    let pipeline = connected_pipeline(test_config(), store, bus.clone()).await;

    pipeline.register_device().await;

    let published = bus.published.lock().unwrap().clone();
    let registration = published
        .iter()
        .find(|(topic, ..)| topic == "device/name")
        .expect("registration published");
    let identity: serde_json::Value = serde_json::from_slice(&registration.1).unwrap();
    assert_eq!(identity["serial_number"], "GW-7");
    assert_eq!(identity["ip_address"], "10.0.0.2");
    assert_eq!(pipeline.get_stats().await.error_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop_lifecycle() {
    let store = MockStore::new();
    store.set("seninf", TWO_DEVICE_BATCH);
    store.set("device:serial", "GW-7");
    store.set("device:ip", "10.0.0.2");
    let bus = MockBus::new();
    let config = test_config().with_poll_interval(30);
    let pipeline = connected_pipeline(config, store, bus.clone()).await;

    pipeline.start().await;
    // The immediate first cycle ran before the scheduler was armed.
    assert_eq!(bus.envelopes().len(), 2);
    assert_eq!(pipeline.health_check().await.status, "running");

    // Re-invoking start is a no-op.
    pipeline.start().await;

    sleep(Duration::from_secs(31)).await;
    settle().await;
    assert_eq!(bus.envelopes().len(), 4);

    pipeline.stop().await;
    let report = pipeline.health_check().await;
    assert_eq!(report.status, "stopped");
    assert!(!report.store_ready);
    assert!(!report.bus_ready);

    // No further ticks after stop.
    sleep(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(bus.envelopes().len(), 4);

    // Lifecycle announcements went out on the service status topic.
    let topics = bus.topics();
    assert!(topics.iter().any(|t| t == "sengate/service/status"));
}

#[tokio::test]
async fn test_health_report_serializes() {
    let store = MockStore::new();
    let bus = MockBus::new();
    let pipeline = connected_pipeline(test_config(), store, bus).await;

    let report = pipeline.health_check().await;
    assert!(report.store_ready);
    assert!(report.bus_ready);
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "stopped");
    assert_eq!(json["stats"]["total_published"], 0);
}
