//! Resilient backend connections for sengate.
//!
//! Two independently-failing connections live here: `StoreConnection`
//! over the key-value store and `BusConnection` over the MQTT bus. Each
//! owns its reconnect policy exclusively; the pipeline only ever sees
//! the boolean `is_ready()` projection.
//!
//! Both connections talk to their backend through an object-safe trait
//! (`StoreBackend`, `BusTransport`) so tests can drive them with mock
//! backends while production wires in `RedisBackend` and `MqttTransport`.

pub mod bus;
pub mod store;

pub use bus::{
    resolve_device_name, BusConnection, BusTransport, MqttTransport, QosLevel, TransportEvent,
};
pub use store::{RedisBackend, StoreBackend, StoreConnection};
