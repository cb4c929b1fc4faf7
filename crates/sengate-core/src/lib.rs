//! Core types for the sengate sensor gateway.
//!
//! This crate holds everything the connection and pipeline layers share:
//! the unified error type, configuration value objects, the reading data
//! model, the sensor-type catalog, legacy text decoding and the
//! normalization stage that turns raw store payloads into publish-ready
//! readings.

pub mod config;
pub mod decode;
pub mod error;
pub mod model;
pub mod normalize;
pub mod units;

pub use config::{BusConfig, GatewayConfig, StoreConfig};
pub use error::{Error, Result};
pub use model::{
    ConnectionState, DeviceBlock, DeviceIdentity, NormalizedReading, NormalizedValue,
    PublishEnvelope, RawReading, RawValueSpec, ReadingStatus, Stats,
};
