//! Configuration value objects.
//!
//! Resolved once at process start (by the CLI) and passed by reference
//! into each component's constructor. Components never reach into the
//! environment themselves.

use serde::{Deserialize, Serialize};

/// Key-value store (Redis) connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store URL, e.g. `redis://localhost:6379`.
    pub url: String,

    /// Key holding the sensor reading batch.
    #[serde(default = "default_reading_key")]
    pub reading_key: String,

    /// Key holding the device serial number.
    #[serde(default = "default_serial_key")]
    pub serial_key: String,

    /// Key holding the device IP address.
    #[serde(default = "default_ip_key")]
    pub ip_key: String,

    /// Per-attempt connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Base delay between connect retries, in seconds. The actual delay
    /// grows linearly with the attempt count up to `retry_delay_cap_secs`.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,

    /// Cap on the per-attempt retry delay, in seconds.
    #[serde(default = "default_retry_delay_cap")]
    pub retry_delay_cap_secs: u64,

    /// Maximum number of connect attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Ceiling on cumulative retry time, in seconds.
    #[serde(default = "default_max_retry_time")]
    pub max_retry_time_secs: u64,
}

fn default_reading_key() -> String {
    "seninf".to_string()
}

fn default_serial_key() -> String {
    "device:serial".to_string()
}

fn default_ip_key() -> String {
    "device:ip".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_retry_base_delay() -> u64 {
    5
}

fn default_retry_delay_cap() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    10
}

fn default_max_retry_time() -> u64 {
    3600
}

impl StoreConfig {
    /// Create a new store configuration for the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reading_key: default_reading_key(),
            serial_key: default_serial_key(),
            ip_key: default_ip_key(),
            connect_timeout_secs: default_connect_timeout(),
            retry_base_delay_secs: default_retry_base_delay(),
            retry_delay_cap_secs: default_retry_delay_cap(),
            max_attempts: default_max_attempts(),
            max_retry_time_secs: default_max_retry_time(),
        }
    }

    /// Set the reading key.
    pub fn with_reading_key(mut self, key: impl Into<String>) -> Self {
        self.reading_key = key.into();
        self
    }

    /// Set the device identity keys.
    pub fn with_identity_keys(
        mut self,
        serial_key: impl Into<String>,
        ip_key: impl Into<String>,
    ) -> Self {
        self.serial_key = serial_key.into();
        self.ip_key = ip_key.into();
        self
    }

    /// Set the retry budget (attempt and time ceilings).
    pub fn with_retry_budget(mut self, max_attempts: u32, max_retry_time_secs: u64) -> Self {
        self.max_attempts = max_attempts;
        self.max_retry_time_secs = max_retry_time_secs;
        self
    }
}

/// MQTT bus connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Broker host.
    pub host: String,

    /// Broker port.
    #[serde(default = "default_bus_port")]
    pub port: u16,

    /// Client ID. A random suffix is appended when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Topic prefix for reading and presence topics.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Fixed topic for device registration announcements.
    #[serde(default = "default_registration_topic")]
    pub registration_topic: String,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Bounded connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Pause before the built-in reconnect re-polls, in seconds.
    #[serde(default = "default_reconnect_pause")]
    pub reconnect_pause_secs: u64,

    /// External watchdog period in seconds. The watchdog tears the
    /// transport down and reconnects from scratch whenever the built-in
    /// reconnect stalls.
    #[serde(default = "default_watchdog_period")]
    pub watchdog_period_secs: u64,
}

fn default_bus_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "sengate".to_string()
}

fn default_registration_topic() -> String {
    "device/name".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_reconnect_pause() -> u64 {
    5
}

fn default_watchdog_period() -> u64 {
    20
}

impl BusConfig {
    /// Create a new bus configuration for the given broker host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_bus_port(),
            client_id: None,
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            registration_topic: default_registration_topic(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect_pause_secs: default_reconnect_pause(),
            watchdog_period_secs: default_watchdog_period(),
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set authentication.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the topic prefix.
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Set the client ID.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Topic carrying reading envelopes for one device.
    pub fn reading_topic(&self, device_name: &str) -> String {
        format!("{}/{}/seninf", self.topic_prefix, device_name)
    }

    /// Retained presence heartbeat topic.
    pub fn service_status_topic(&self) -> String {
        format!("{}/service/status", self.topic_prefix)
    }

    /// Last-will presence topic.
    pub fn last_will_topic(&self) -> String {
        format!("{}/status", self.topic_prefix)
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Store backend configuration.
    pub store: StoreConfig,

    /// Bus backend configuration.
    pub bus: BusConfig,

    /// Poll interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Publish a device-registration announcement on start.
    #[serde(default = "default_auto_register")]
    pub auto_register: bool,

    /// Publisher identity tag stamped into every envelope.
    #[serde(default = "default_publisher")]
    pub publisher: String,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_auto_register() -> bool {
    true
}

fn default_publisher() -> String {
    "sengate".to_string()
}

impl GatewayConfig {
    /// Create a gateway configuration from backend configurations.
    pub fn new(store: StoreConfig, bus: BusConfig) -> Self {
        Self {
            store,
            bus,
            poll_interval_secs: default_poll_interval(),
            auto_register: default_auto_register(),
            publisher: default_publisher(),
        }
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Enable or disable registration on start.
    pub fn with_auto_register(mut self, enabled: bool) -> Self {
        self.auto_register = enabled;
        self
    }
}
