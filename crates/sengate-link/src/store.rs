//! Resilient key-value store connection.
//!
//! `StoreConnection` wraps a `StoreBackend` (Redis in production) with a
//! bounded-retry connect policy and a liveness probe that keeps the
//! `is_ready()` projection honest while the backend client heals itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use sengate_core::{ConnectionState, DeviceIdentity, Error, Result, StoreConfig};

/// How often the liveness probe runs once connected.
const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Backend contract for the key-value store.
///
/// Production uses [`RedisBackend`]; tests drive the connection with
/// scripted mocks.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Establish the underlying client connection.
    async fn open(&self) -> Result<()>;

    /// Single-key get. Absent keys map to `None`, not an error.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Multi-key get, one slot per requested key.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Liveness probe against the live connection.
    async fn ping(&self) -> Result<()>;

    /// Best-effort close.
    async fn close(&self);
}

/// Redis-backed store implementation.
///
/// Uses a `ConnectionManager`, which re-establishes the transport on
/// its own after drops; the surrounding `StoreConnection` only tracks
/// whether that self-healing has caught up yet.
pub struct RedisBackend {
    url: String,
    manager: Mutex<Option<redis::aio::ConnectionManager>>,
}

impl RedisBackend {
    /// Create a backend for the given store URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            manager: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<redis::aio::ConnectionManager> {
        self.manager
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::NotConnected("store backend not opened".into()))
    }
}

fn map_redis_err(e: redis::RedisError) -> Error {
    if e.is_connection_refusal() {
        Error::ConnectRefused(e.to_string())
    } else if e.is_timeout() {
        Error::ConnectTimeout(e.to_string())
    } else {
        Error::Store(e.to_string())
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn open(&self) -> Result<()> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| Error::Config(format!("invalid store url: {}", e)))?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(map_redis_err)?;
        *self.manager.lock().await = Some(manager);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut conn = self.connection().await?;
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn close(&self) {
        // Dropping the manager tears down the multiplexed transport.
        self.manager.lock().await.take();
    }
}

/// Resilient client to the key-value store.
pub struct StoreConnection {
    config: StoreConfig,
    backend: Arc<dyn StoreBackend>,
    state: Arc<RwLock<ConnectionState>>,
    healthy: Arc<AtomicBool>,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl StoreConnection {
    /// Create a connection over the given backend.
    pub fn new(config: StoreConfig, backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            config,
            backend,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            healthy: Arc::new(AtomicBool::new(false)),
            probe: Mutex::new(None),
        }
    }

    /// Create a Redis-backed connection.
    pub fn with_redis(config: StoreConfig) -> Self {
        let backend = Arc::new(RedisBackend::new(config.url.clone()));
        Self::new(config, backend)
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state != next {
            info!(from = state.as_str(), to = next.as_str(), "store connection state");
            *state = next;
        }
    }

    /// Establish the connection under the bounded-retry policy.
    ///
    /// Halts escalate in this order: a connection refusal aborts
    /// immediately, then the cumulative-time ceiling, then the attempt
    /// ceiling. Between attempts the delay grows linearly with the
    /// attempt count up to the configured cap.
    pub async fn connect(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting).await;
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
            let outcome = match timeout(connect_timeout, self.backend.open()).await {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectTimeout(format!(
                    "store connect attempt {} exceeded {}s",
                    attempt, self.config.connect_timeout_secs
                ))),
            };

            match outcome {
                Ok(()) => {
                    self.healthy.store(true, Ordering::Release);
                    self.set_state(ConnectionState::Connected).await;
                    self.spawn_probe().await;
                    info!(attempt, "store connected");
                    return Ok(());
                }
                Err(e @ Error::ConnectRefused(_)) => {
                    self.set_state(ConnectionState::Disconnected).await;
                    return Err(e);
                }
                Err(e) => {
                    if started.elapsed().as_secs() >= self.config.max_retry_time_secs {
                        self.set_state(ConnectionState::Disconnected).await;
                        return Err(Error::RetryBudgetExceeded(format!(
                            "store retry time ceiling of {}s reached",
                            self.config.max_retry_time_secs
                        )));
                    }
                    if attempt >= self.config.max_attempts {
                        self.set_state(ConnectionState::Disconnected).await;
                        return Err(Error::RetryBudgetExceeded(format!(
                            "store attempt ceiling of {} reached",
                            self.config.max_attempts
                        )));
                    }
                    let delay = Duration::from_secs(
                        (u64::from(attempt) * self.config.retry_base_delay_secs)
                            .min(self.config.retry_delay_cap_secs),
                    );
                    warn!(attempt, delay_secs = delay.as_secs(), error = %e, "store connect failed, retrying");
                    sleep(delay).await;
                }
            }
        }
    }

    /// Keep the readiness projection current while the backend client
    /// heals itself.
    async fn spawn_probe(&self) {
        let mut guard = self.probe.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        let backend = self.backend.clone();
        let healthy = self.healthy.clone();
        let state = self.state.clone();
        *guard = Some(tokio::spawn(async move {
            loop {
                sleep(PROBE_INTERVAL).await;
                let alive = backend.ping().await.is_ok();
                let was = healthy.swap(alive, Ordering::AcqRel);
                if alive != was {
                    let mut state = state.write().await;
                    let next = if alive {
                        ConnectionState::Connected
                    } else {
                        ConnectionState::Reconnecting
                    };
                    info!(from = state.as_str(), to = next.as_str(), "store connection state");
                    *state = next;
                }
            }
        }));
    }

    /// True only when connected and the transport answered its last probe.
    pub fn is_ready(&self) -> bool {
        let connected = self
            .state
            .try_read()
            .map(|s| s.is_connected())
            .unwrap_or(false);
        connected && self.healthy.load(Ordering::Acquire)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
            .try_read()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::NotConnected("store".into()))
        }
    }

    // An op failure flips readiness immediately; the probe flips it
    // back once the backend answers again.
    fn note_op(&self, failed: bool) {
        if failed {
            self.healthy.store(false, Ordering::Release);
        }
    }

    /// Read the reading batch under a single key.
    ///
    /// An absent key yields an empty array, not an error.
    pub async fn read_batch(&self, key: &str) -> Result<Value> {
        self.ensure_ready()?;
        let fetched = self.backend.get(key).await;
        self.note_op(fetched.is_err());
        match fetched? {
            None => {
                debug!(key, "store key absent, empty batch");
                Ok(Value::Array(Vec::new()))
            }
            Some(text) => {
                let payload: Value = serde_json::from_str(&text)?;
                Ok(payload)
            }
        }
    }

    /// Read the registered device identity from its two configured keys.
    pub async fn read_device_identity(&self) -> Result<DeviceIdentity> {
        self.ensure_ready()?;
        let keys = vec![self.config.serial_key.clone(), self.config.ip_key.clone()];
        let fetched = self.backend.get_many(&keys).await;
        self.note_op(fetched.is_err());
        let mut values = fetched?.into_iter();

        let serial_number = values
            .next()
            .flatten()
            .ok_or_else(|| Error::MissingField(self.config.serial_key.clone()))?;
        let ip_address = values
            .next()
            .flatten()
            .ok_or_else(|| Error::MissingField(self.config.ip_key.clone()))?;

        Ok(DeviceIdentity {
            serial_number,
            ip_address,
        })
    }

    /// Batch read with a partial-success policy: absent keys and
    /// unparseable payloads are logged and excluded, never fatal.
    pub async fn read_many(&self, keys: &[String]) -> Result<HashMap<String, Value>> {
        self.ensure_ready()?;
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let fetched = self.backend.get_many(keys).await;
        self.note_op(fetched.is_err());

        let mut out = HashMap::with_capacity(keys.len());
        for (key, slot) in keys.iter().zip(fetched?) {
            match slot {
                None => debug!(key = %key, "store key absent, excluded"),
                Some(text) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => {
                        out.insert(key.clone(), value);
                    }
                    Err(e) => warn!(key = %key, error = %e, "unparseable store payload, excluded"),
                },
            }
        }
        Ok(out)
    }

    /// Liveness probe. Any error maps to `false`, never an `Err`.
    pub async fn ping(&self) -> bool {
        self.backend.ping().await.is_ok()
    }

    /// Best-effort graceful close. Never propagates its own failure;
    /// shutdown must not be blocked by a cleanup error.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.probe.lock().await.take() {
            handle.abort();
        }
        self.backend.close().await;
        self.healthy.store(false, Ordering::Release);
        self.set_state(ConnectionState::Disconnected).await;
        info!("store disconnected");
    }
}
