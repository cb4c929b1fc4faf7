//! Pipeline orchestrator for sengate.
//!
//! Drives the fixed-interval, non-overlapping poll loop: read the
//! reading batch from the store, normalize it, publish one envelope per
//! device on the bus, update statistics. Every failure inside a running
//! cycle is recovered at the cycle boundary; the scheduler survives
//! individual cycle failures indefinitely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use sengate_core::normalize::normalize_and_format;
use sengate_core::{GatewayConfig, NormalizedReading, Result, Stats};
use sengate_link::bus::resolve_device_name;
use sengate_link::{BusConnection, StoreConnection};

/// Point-in-time health projection over the pipeline and both backends.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `running` once started, `stopped` after `stop()` or before
    /// initialization completed.
    pub status: String,

    /// Store backend readiness.
    pub store_ready: bool,

    /// Bus backend readiness.
    pub bus_ready: bool,

    /// Process-lifetime statistics.
    pub stats: Stats,
}

/// State shared between the pipeline handle and its scheduler task.
struct Inner {
    config: GatewayConfig,
    store: Arc<StoreConnection>,
    bus: Arc<BusConnection>,
    stats: RwLock<Stats>,
    running: AtomicBool,
    in_cycle: AtomicBool,
    stop_notify: Notify,
}

/// The acquisition-and-publish orchestrator.
pub struct Pipeline {
    inner: Arc<Inner>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Create a pipeline over pre-built connections.
    pub fn new(config: GatewayConfig, store: Arc<StoreConnection>, bus: Arc<BusConnection>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                bus,
                stats: RwLock::new(Stats::new()),
                running: AtomicBool::new(false),
                in_cycle: AtomicBool::new(false),
                stop_notify: Notify::new(),
            }),
            poll_task: Mutex::new(None),
        }
    }

    /// Create a pipeline over the production Redis and MQTT backends.
    pub fn from_config(config: GatewayConfig) -> Self {
        let store = Arc::new(StoreConnection::with_redis(config.store.clone()));
        let bus = Arc::new(BusConnection::with_mqtt(
            config.bus.clone(),
            config.publisher.clone(),
        ));
        Self::new(config, store, bus)
    }

    /// Connect both backends, sequentially. A failure here is fatal:
    /// the process cannot usefully run without both.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.store.connect().await?;
        self.inner.bus.connect().await?;
        Ok(())
    }

    /// Start the pipeline. Idempotent: re-invoking while running is a
    /// logged no-op.
    ///
    /// Performs the optional device registration, one immediate poll
    /// cycle (so the first data point is not delayed by a full
    /// interval), then arms the periodic scheduler.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            info!("pipeline already running, start ignored");
            return;
        }
        info!(
            interval_secs = self.inner.config.poll_interval_secs,
            "starting pipeline"
        );

        if self.inner.config.auto_register {
            self.inner.register_device().await;
        }
        self.inner.bus.publish_status("running").await;

        self.inner.poll_once().await;

        let inner = self.inner.clone();
        let period = Duration::from_secs(self.inner.config.poll_interval_secs);
        *self.poll_task.lock().await = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The immediate tick; the synchronous first poll covered it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = inner.stop_notify.notified() => break,
                    _ = ticker.tick() => {
                        if !inner.running.load(Ordering::SeqCst) {
                            break;
                        }
                        inner.poll_once().await;
                    }
                }
            }
            debug!("poll scheduler stopped");
        }));
    }

    /// Run one poll cycle now, outside the scheduler.
    pub async fn poll_once(&self) {
        self.inner.poll_once().await;
    }

    /// Read the device identity from the store and republish it on the
    /// bus. Best-effort: failures are counted and logged, never block
    /// or abort startup.
    pub async fn register_device(&self) {
        self.inner.register_device().await;
    }

    /// Stop the pipeline: cancel the scheduler, let an in-flight cycle
    /// finish, announce offline, then drop both connections (bus first,
    /// so the offline announcement precedes losing the data side).
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.stop_notify.notify_one();
        if let Some(task) = self.poll_task.lock().await.take() {
            let _ = task.await;
        }
        self.inner.bus.publish_status("stopped").await;
        self.inner.bus.disconnect().await;
        self.inner.store.disconnect().await;
        info!("pipeline stopped");
    }

    /// Snapshot of the running statistics.
    pub async fn get_stats(&self) -> Stats {
        self.inner.stats.read().await.clone()
    }

    /// Health projection over the pipeline and both backends. Pure
    /// read; no side effects.
    pub async fn health_check(&self) -> HealthReport {
        let running = self.inner.running.load(Ordering::SeqCst);
        HealthReport {
            status: if running { "running" } else { "stopped" }.to_string(),
            store_ready: self.inner.store.is_ready(),
            bus_ready: self.inner.bus.is_ready(),
            stats: self.get_stats().await,
        }
    }
}

impl Inner {
    /// One poll cycle. Overlap-guarded: a slow cycle must not be
    /// overlapped by the next tick.
    async fn poll_once(&self) {
        if self
            .in_cycle
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("previous poll cycle still in flight, skipping this tick");
            return;
        }

        if let Err(e) = self.run_cycle().await {
            self.stats.write().await.error_count += 1;
            error!(error = %e, "poll cycle failed");
        }

        self.in_cycle.store(false, Ordering::SeqCst);
    }

    async fn run_cycle(&self) -> Result<()> {
        let store_ready = self.store.is_ready();
        let bus_ready = self.bus.is_ready();
        if !store_ready || !bus_ready {
            // Coarse-grained backoff: fetch nothing until both backends
            // self-heal; the next tick is the retry point.
            debug!(store_ready, bus_ready, "backend not ready, skipping cycle");
            self.stats.write().await.skipped_cycles += 1;
            return Ok(());
        }

        let payload = self.store.read_batch(&self.config.store.reading_key).await?;
        if payload.as_array().map_or(true, |items| items.is_empty()) {
            debug!(key = %self.config.store.reading_key, "empty reading batch");
            return Ok(());
        }

        let readings = normalize_and_format(&payload);
        if readings.is_empty() {
            debug!("normalization yielded no publishable readings");
            return Ok(());
        }

        let groups = group_by_device(readings);
        let publishes = groups
            .iter()
            .map(|(name, readings)| self.bus.publish_batch(name, readings));
        // Settle all, then aggregate: one device's failure must not
        // hide the other devices' results.
        let results = join_all(publishes).await;

        let mut published = 0u64;
        let mut failed = 0u64;
        for ((name, _), result) in groups.iter().zip(results) {
            match result {
                Ok(()) => published += 1,
                Err(e) => {
                    failed += 1;
                    warn!(device = %name, error = %e, "device publish failed");
                }
            }
        }

        let mut stats = self.stats.write().await;
        stats.total_published += published;
        stats.error_count += failed;
        if published > 0 {
            stats.last_publish = Some(Utc::now());
            debug!(devices = published, "cycle published");
        }
        Ok(())
    }

    async fn register_device(&self) {
        let result = async {
            let identity = self.store.read_device_identity().await?;
            self.bus.publish_device_registration(&identity).await?;
            Ok::<_, sengate_core::Error>(identity)
        }
        .await;

        match result {
            Ok(identity) => {
                info!(serial = %identity.serial_number, "device registration published");
            }
            Err(e) => {
                self.stats.write().await.error_count += 1;
                warn!(error = %e, "device registration failed");
            }
        }
    }
}

/// Group readings by resolved device name, preserving first-seen order.
fn group_by_device(readings: Vec<NormalizedReading>) -> Vec<(String, Vec<NormalizedReading>)> {
    let mut groups: Vec<(String, Vec<NormalizedReading>)> = Vec::new();
    for reading in readings {
        let name = resolve_device_name(None, Some(&reading.serial), Some(reading.address));
        match groups.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, list)) => list.push(reading),
            None => groups.push((name, vec![reading])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use sengate_core::ReadingStatus;

    fn reading(serial: &str, address: i64) -> NormalizedReading {
        NormalizedReading {
            serial: serial.to_string(),
            description: "d".into(),
            address,
            name: "n".into(),
            profile: "p".into(),
            values: Vec::new(),
            status: ReadingStatus::NoValues,
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn test_group_by_device_merges_and_preserves_order() {
        let groups = group_by_device(vec![
            reading("S1", 1),
            reading("S2", 2),
            reading("S1", 1),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "S1");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "S2");
        assert_eq!(groups[1].1.len(), 1);
    }
}
