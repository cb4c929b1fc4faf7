//! Data model for readings, envelopes and connection state.
//!
//! Raw shapes mirror the store's wire encoding and deserialize leniently:
//! a missing or malformed field is a normalization concern, never a
//! deserialization crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One sensor reading as read from the key-value store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawReading {
    /// Device serial. Required for normalization, but absence is a
    /// filtered reading, not an error.
    #[serde(default, deserialize_with = "lenient_string")]
    pub serial: Option<String>,

    /// Device address. Accepted as a JSON number or a numeric string.
    #[serde(default, deserialize_with = "lenient_i64")]
    pub address: Option<i64>,

    /// Possibly legacy-escaped description text.
    #[serde(default, rename = "description")]
    pub description_raw: String,

    /// Possibly legacy-escaped display name.
    #[serde(default, rename = "name")]
    pub name_raw: String,

    /// Device profile identifier.
    #[serde(default)]
    pub profile: String,

    /// Ordered value specifications.
    #[serde(default, rename = "values")]
    pub value_specs: Vec<RawValueSpec>,
}

/// One raw value specification inside a reading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawValueSpec {
    /// Opaque value identifier.
    #[serde(default)]
    pub id: String,

    /// Possibly legacy-escaped value name.
    #[serde(default, rename = "name")]
    pub name_raw: String,

    /// Single-character sensor-type code.
    #[serde(default)]
    pub code: String,

    /// Range minimum; number, numeric string, or absent.
    #[serde(default)]
    pub min: Option<Value>,

    /// Range maximum; number, numeric string, or absent.
    #[serde(default)]
    pub max: Option<Value>,

    /// Optional calculation expression, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calc: Option<String>,
}

/// Readiness classification of a normalized reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingStatus {
    /// The reading carries no values at all.
    NoValues,
    /// Values exist but none has a valid range.
    InvalidRange,
    /// Name or description is empty after decoding.
    IncompleteInfo,
    /// At least one range-valid value and complete identity text.
    Active,
    /// Reserved for processing faults surfaced by callers.
    Error,
}

impl ReadingStatus {
    /// Short identifier for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::NoValues => "no_values",
            ReadingStatus::InvalidRange => "invalid_range",
            ReadingStatus::IncompleteInfo => "incomplete_info",
            ReadingStatus::Active => "active",
            ReadingStatus::Error => "error",
        }
    }
}

/// One normalized, publish-ready value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedValue {
    /// Opaque value identifier.
    pub id: String,

    /// Decoded value name.
    pub name: String,

    /// Parsed range minimum.
    pub min: Option<f64>,

    /// Parsed range maximum.
    pub max: Option<f64>,

    /// Single-character sensor-type code.
    pub code: String,

    /// Optional calculation expression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calc: Option<String>,

    /// Human-readable type from the unit catalog, or "unknown".
    #[serde(rename = "type")]
    pub value_type: String,

    /// Whether min and max are both present with min < max.
    pub range_valid: bool,
}

/// One normalized sensor reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedReading {
    /// Device serial.
    pub serial: String,

    /// Decoded description text.
    pub description: String,

    /// Device address.
    pub address: i64,

    /// Decoded display name.
    pub name: String,

    /// Device profile identifier.
    pub profile: String,

    /// Ordered normalized values.
    pub values: Vec<NormalizedValue>,

    /// Readiness classification.
    pub status: ReadingStatus,

    /// When normalization ran.
    pub processed_at: DateTime<Utc>,
}

/// Device metadata block inside a publish envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceBlock {
    /// Resolved device name (topic segment).
    pub name: String,

    /// Device serial, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    /// Device address, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<i64>,
}

/// The wire shape published to the bus: one device, one or many
/// readings, a timestamp and the publisher identity tag. Immutable
/// once constructed and never retried after being handed off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEnvelope {
    /// Device metadata.
    pub device: DeviceBlock,

    /// Ordered readings for this device.
    pub readings: Vec<NormalizedReading>,

    /// Envelope construction time.
    pub timestamp: DateTime<Utc>,

    /// Publisher identity tag.
    pub publisher: String,
}

/// Registered device identity, read from the store and relayed to the
/// bus as a registration announcement. Ephemeral; never persisted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Device serial number.
    pub serial_number: String,

    /// Device IP address.
    pub ip_address: String,
}

impl DeviceIdentity {
    /// Whether both fields carry non-empty values.
    pub fn is_complete(&self) -> bool {
        !self.serial_number.is_empty() && !self.ip_address.is_empty()
    }
}

/// Connection lifecycle state, owned exclusively by its connection.
///
/// `Disconnected -> Connecting -> Connected` on a successful connect;
/// `Connected -> Reconnecting` when the transport drops; back to
/// `Connected` when either reconnect path succeeds. Terminal
/// `Disconnected` is only reached via an explicit disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Short identifier for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    /// True only in the `Connected` state.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Process-lifetime publishing statistics, owned by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    /// When the pipeline started.
    pub start_time: DateTime<Utc>,

    /// Total envelopes acknowledged by the bus.
    pub total_published: u64,

    /// Time of the most recent successful publish.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_publish: Option<DateTime<Utc>>,

    /// Errors recovered at the cycle boundary.
    pub error_count: u64,

    /// Cycles skipped because a backend was not ready.
    pub skipped_cycles: u64,
}

impl Stats {
    /// Fresh statistics starting now.
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            total_published: 0,
            last_publish: None,
            error_count: 0,
            skipped_cycles: 0,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept a string field that may arrive as a JSON string or number.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Accept an integer field that may arrive as a JSON number or a
/// numeric string.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_reading_lenient_fields() {
        let reading: RawReading = serde_json::from_value(json!({
            "serial": "S1",
            "address": "7",
            "description": "boiler",
            "name": "b1",
            "profile": "p2",
            "values": [{"id": "v1", "name": "temp", "code": "A", "min": 0, "max": 60}]
        }))
        .unwrap();
        assert_eq!(reading.serial.as_deref(), Some("S1"));
        assert_eq!(reading.address, Some(7));
        assert_eq!(reading.value_specs.len(), 1);
    }

    #[test]
    fn test_raw_reading_missing_required_fields() {
        let reading: RawReading = serde_json::from_value(json!({
            "description": "no identity",
            "values": []
        }))
        .unwrap();
        assert!(reading.serial.is_none());
        assert!(reading.address.is_none());
    }

    #[test]
    fn test_connection_state_projection() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
        assert_eq!(ConnectionState::Reconnecting.as_str(), "reconnecting");
    }

    #[test]
    fn test_device_identity_completeness() {
        let full = DeviceIdentity {
            serial_number: "S1".into(),
            ip_address: "10.0.0.2".into(),
        };
        assert!(full.is_complete());

        let partial = DeviceIdentity {
            serial_number: String::new(),
            ip_address: "10.0.0.2".into(),
        };
        assert!(!partial.is_complete());
    }
}
