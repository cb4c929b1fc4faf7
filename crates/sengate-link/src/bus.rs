//! Resilient pub/sub bus connection.
//!
//! `BusConnection` runs two reconnection mechanisms that must not fight
//! each other: the transport driver's built-in retry (re-polling the
//! MQTT event loop after a pause) and an external watchdog that tears
//! the transport down and reconnects from scratch when the built-in
//! path stalls. The watchdog is a single cancellable task, armed on any
//! exit from `Connected` (arming while armed is a no-op) and disarmed
//! the moment a connect acknowledgment arrives, so at most one recovery
//! path is actively retrying at a time.
//!
//! Transport events flow over an mpsc channel into one state task that
//! owns every state transition; nothing else mutates the state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use sengate_core::{
    BusConfig, ConnectionState, DeviceBlock, DeviceIdentity, Error, NormalizedReading,
    PublishEnvelope, Result,
};

/// Presence payloads on the last-will topic.
const PRESENCE_ONLINE: &str = "online";
const PRESENCE_OFFLINE: &str = "offline";

/// How long `disconnect` waits for in-flight publishes to flush.
const FLUSH_WAIT: Duration = Duration::from_millis(200);

/// Delivery quality for bus publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<QosLevel> for rumqttc::QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Connection-lifecycle events surfaced by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The broker acknowledged the connection.
    Up,
    /// The transport dropped, with the reason.
    Down(String),
}

/// Backend contract for the pub/sub bus.
///
/// Production uses [`MqttTransport`]; tests drive the connection with
/// scripted mocks that emit [`TransportEvent`]s on demand.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Open the transport and start reporting lifecycle events on the
    /// given channel. May be called again after `close` for a full
    /// reconnect.
    async fn open(&self, config: &BusConfig, events: mpsc::Sender<TransportEvent>) -> Result<()>;

    /// Publish one message, resolving on broker acknowledgment.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QosLevel, retain: bool)
        -> Result<()>;

    /// Tear the transport down.
    async fn close(&self);
}

/// rumqttc-backed bus transport.
///
/// The driver task re-polls the event loop after a pause when it
/// errors, which is the transport's built-in reconnect. A connect
/// acknowledgment is reported as `Up`, every poll error as `Down`.
pub struct MqttTransport {
    client: Mutex<Option<AsyncClient>>,
    driver_alive: Mutex<Option<Arc<AtomicBool>>>,
}

impl MqttTransport {
    /// Create an unopened transport.
    pub fn new() -> Self {
        Self {
            client: Mutex::new(None),
            driver_alive: Mutex::new(None),
        }
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusTransport for MqttTransport {
    async fn open(&self, config: &BusConfig, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        // Stop a previous driver before replacing the client.
        if let Some(alive) = self.driver_alive.lock().await.take() {
            alive.store(false, Ordering::Release);
        }

        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("sengate-{}", uuid::Uuid::new_v4()));

        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_last_will(LastWill::new(
            config.last_will_topic(),
            PRESENCE_OFFLINE,
            rumqttc::QoS::AtLeastOnce,
            true,
        ));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        *self.client.lock().await = Some(client);

        let alive = Arc::new(AtomicBool::new(true));
        *self.driver_alive.lock().await = Some(alive.clone());

        let reconnect_pause = Duration::from_secs(config.reconnect_pause_secs);
        tokio::spawn(async move {
            while alive.load(Ordering::Acquire) {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if events.send(TransportEvent::Up).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if events.send(TransportEvent::Down(e.to_string())).await.is_err() {
                            break;
                        }
                        // Built-in reconnect: pause, then re-poll.
                        sleep(reconnect_pause).await;
                    }
                }
            }
            debug!("mqtt driver stopped");
        });

        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<()> {
        let client = self
            .client
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::NotConnected("bus transport not opened".into()))?;
        client
            .publish(topic, qos.into(), retain, payload)
            .await
            .map_err(|e| Error::PublishFailure(e.to_string()))
    }

    async fn close(&self) {
        if let Some(alive) = self.driver_alive.lock().await.take() {
            alive.store(false, Ordering::Release);
        }
        if let Some(client) = self.client.lock().await.take() {
            let _ = client.disconnect().await;
        }
    }
}

/// Resolve the device name used as the envelope's topic segment.
///
/// Ordered fallback, evaluated once per reading: explicit device serial,
/// then the reading's own serial field, then a name synthesized from the
/// address, then the sentinel. Hitting the sentinel is warned about but
/// never fatal.
pub fn resolve_device_name(
    explicit: Option<&str>,
    serial: Option<&str>,
    address: Option<i64>,
) -> String {
    if let Some(name) = explicit.filter(|s| !s.is_empty()) {
        return name.to_string();
    }
    if let Some(serial) = serial.filter(|s| !s.is_empty()) {
        return serial.to_string();
    }
    if let Some(address) = address {
        return format!("device_{}", address);
    }
    warn!("reading carries no usable device identity, using sentinel name");
    "unknown_device".to_string()
}

struct BusShared {
    config: BusConfig,
    publisher: String,
    transport: Arc<dyn BusTransport>,
    state: RwLock<ConnectionState>,
    transport_up: AtomicBool,
    ready_tx: watch::Sender<bool>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    events_tx: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl BusShared {
    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state != next {
            info!(from = state.as_str(), to = next.as_str(), "bus connection state");
            *state = next;
        }
    }

    async fn on_up(shared: &Arc<Self>) {
        shared.transport_up.store(true, Ordering::Release);
        shared.set_state(ConnectionState::Connected).await;
        // Disarm before anything else so a racing tick sees Connected.
        shared.disarm_watchdog().await;
        let _ = shared.ready_tx.send(true);
        if let Err(e) = shared
            .transport
            .publish(
                &shared.config.last_will_topic(),
                PRESENCE_ONLINE.into(),
                QosLevel::AtLeastOnce,
                true,
            )
            .await
        {
            warn!(error = %e, "failed to publish online presence");
        }
    }

    async fn on_down(shared: &Arc<Self>, reason: &str) {
        shared.transport_up.store(false, Ordering::Release);
        let _ = shared.ready_tx.send(false);
        let current = *shared.state.read().await;
        if current != ConnectionState::Disconnected {
            warn!(reason, "bus transport dropped");
            shared.set_state(ConnectionState::Reconnecting).await;
            Self::arm_watchdog(shared).await;
        }
    }

    /// Arm the watchdog. A no-op while one is already armed.
    async fn arm_watchdog(shared: &Arc<Self>) {
        let mut guard = shared.watchdog.lock().await;
        if guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let shared = shared.clone();
        let period = Duration::from_secs(shared.config.watchdog_period_secs);
        debug!(period_secs = period.as_secs(), "bus watchdog armed");
        *guard = Some(tokio::spawn(async move {
            loop {
                sleep(period).await;
                if shared.state.read().await.is_connected() {
                    break;
                }
                warn!("bus watchdog firing, tearing transport down for a full reconnect");
                shared.transport.close().await;
                shared.set_state(ConnectionState::Connecting).await;
                let events = shared.events_tx.lock().await.clone();
                let Some(events) = events else { break };
                if let Err(e) = shared.transport.open(&shared.config, events).await {
                    warn!(error = %e, "watchdog reconnect attempt failed");
                    shared.set_state(ConnectionState::Reconnecting).await;
                }
            }
        }));
    }

    async fn disarm_watchdog(&self) {
        if let Some(handle) = self.watchdog.lock().await.take() {
            handle.abort();
            debug!("bus watchdog disarmed");
        }
    }
}

/// Resilient client to the pub/sub bus.
pub struct BusConnection {
    shared: Arc<BusShared>,
    ready_rx: watch::Receiver<bool>,
    state_task: Mutex<Option<JoinHandle<()>>>,
}

impl BusConnection {
    /// Create a connection over the given transport.
    pub fn new(config: BusConfig, publisher: impl Into<String>, transport: Arc<dyn BusTransport>) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            shared: Arc::new(BusShared {
                config,
                publisher: publisher.into(),
                transport,
                state: RwLock::new(ConnectionState::Disconnected),
                transport_up: AtomicBool::new(false),
                ready_tx,
                watchdog: Mutex::new(None),
                events_tx: Mutex::new(None),
            }),
            ready_rx,
            state_task: Mutex::new(None),
        }
    }

    /// Create an MQTT-backed connection.
    pub fn with_mqtt(config: BusConfig, publisher: impl Into<String>) -> Self {
        Self::new(config, publisher, Arc::new(MqttTransport::new()))
    }

    /// Open the transport and wait (bounded) for the broker's
    /// acknowledgment.
    pub async fn connect(&self) -> Result<()> {
        self.shared.set_state(ConnectionState::Connecting).await;

        let (events_tx, mut events_rx) = mpsc::channel::<TransportEvent>(16);
        *self.shared.events_tx.lock().await = Some(events_tx.clone());
        self.shared
            .transport
            .open(&self.shared.config, events_tx)
            .await?;

        // One state task owns every transition.
        let shared = self.shared.clone();
        let mut task_guard = self.state_task.lock().await;
        if let Some(previous) = task_guard.take() {
            previous.abort();
        }
        *task_guard = Some(tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    TransportEvent::Up => BusShared::on_up(&shared).await,
                    TransportEvent::Down(reason) => BusShared::on_down(&shared, &reason).await,
                }
            }
        }));
        drop(task_guard);

        let deadline = Duration::from_secs(self.shared.config.connect_timeout_secs);
        let mut ready_rx = self.ready_rx.clone();
        let acked = timeout(deadline, async move {
            loop {
                if *ready_rx.borrow_and_update() {
                    return true;
                }
                if ready_rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;

        match acked {
            Ok(true) => Ok(()),
            _ => {
                self.teardown().await;
                Err(Error::ConnectTimeout(format!(
                    "bus broker did not acknowledge within {}s",
                    self.shared.config.connect_timeout_secs
                )))
            }
        }
    }

    /// True only when the broker has acknowledged and the transport
    /// still reports itself up.
    pub fn is_ready(&self) -> bool {
        let connected = self
            .shared
            .state
            .try_read()
            .map(|s| s.is_connected())
            .unwrap_or(false);
        connected && self.shared.transport_up.load(Ordering::Acquire)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared
            .state
            .try_read()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::NotConnected("bus".into()))
        }
    }

    /// Build the single envelope published for one device per cycle.
    pub fn build_envelope(
        &self,
        device_name: &str,
        readings: &[NormalizedReading],
    ) -> PublishEnvelope {
        let first = readings.first();
        PublishEnvelope {
            device: DeviceBlock {
                name: device_name.to_string(),
                serial: first.map(|r| r.serial.clone()),
                address: first.map(|r| r.address),
            },
            readings: readings.to_vec(),
            timestamp: Utc::now(),
            publisher: self.shared.publisher.clone(),
        }
    }

    async fn publish_envelope(&self, device_name: &str, envelope: &PublishEnvelope) -> Result<()> {
        let topic = self.shared.config.reading_topic(device_name);
        let payload = serde_json::to_vec(envelope)?;
        self.shared
            .transport
            .publish(&topic, payload, QosLevel::AtLeastOnce, false)
            .await
    }

    /// Publish one reading for one device.
    pub async fn publish_reading(
        &self,
        device_name: &str,
        reading: &NormalizedReading,
    ) -> Result<()> {
        self.ensure_ready()?;
        let envelope = self.build_envelope(device_name, std::slice::from_ref(reading));
        self.publish_envelope(device_name, &envelope).await
    }

    /// Publish all of one device's readings for this cycle, merged into
    /// exactly one envelope. One message per device per cycle keeps
    /// broker churn down.
    pub async fn publish_batch(
        &self,
        device_name: &str,
        readings: &[NormalizedReading],
    ) -> Result<()> {
        self.ensure_ready()?;
        if readings.is_empty() {
            debug!(device = device_name, "no readings for device, nothing to publish");
            return Ok(());
        }
        let envelope = self.build_envelope(device_name, readings);
        self.publish_envelope(device_name, &envelope).await
    }

    /// Announce the registered device identity on the well-known topic.
    pub async fn publish_device_registration(&self, identity: &DeviceIdentity) -> Result<()> {
        if !identity.is_complete() {
            return Err(Error::IncompleteIdentity(
                "device identity requires both serial number and ip address".into(),
            ));
        }
        self.ensure_ready()?;
        let payload = serde_json::to_vec(identity)?;
        self.shared
            .transport
            .publish(
                &self.shared.config.registration_topic,
                payload,
                QosLevel::AtLeastOnce,
                false,
            )
            .await
    }

    /// Retained presence heartbeat. Failures are logged only; presence
    /// reporting must not destabilize the caller.
    pub async fn publish_status(&self, status: &str) {
        let topic = self.shared.config.service_status_topic();
        if let Err(e) = self
            .shared
            .transport
            .publish(&topic, status.into(), QosLevel::AtLeastOnce, true)
            .await
        {
            warn!(error = %e, "failed to publish service status");
        }
    }

    async fn teardown(&self) {
        self.shared.disarm_watchdog().await;
        self.shared.transport.close().await;
        if let Some(task) = self.state_task.lock().await.take() {
            task.abort();
        }
        self.shared.events_tx.lock().await.take();
        self.shared.transport_up.store(false, Ordering::Release);
        let _ = self.shared.ready_tx.send(false);
        self.shared.set_state(ConnectionState::Disconnected).await;
    }

    /// Graceful close: disarm the watchdog, announce offline, give
    /// in-flight publishes a moment to flush, then drop the transport.
    pub async fn disconnect(&self) {
        self.shared.disarm_watchdog().await;
        if self.is_ready() {
            if let Err(e) = self
                .shared
                .transport
                .publish(
                    &self.shared.config.last_will_topic(),
                    PRESENCE_OFFLINE.into(),
                    QosLevel::AtLeastOnce,
                    true,
                )
                .await
            {
                warn!(error = %e, "failed to publish offline presence");
            }
            sleep(FLUSH_WAIT).await;
        }
        self.teardown().await;
        info!("bus disconnected");
    }
}
