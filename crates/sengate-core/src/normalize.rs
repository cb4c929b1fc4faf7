//! Sensor reading normalization.
//!
//! Turns raw store payloads into publish-ready readings: decodes legacy
//! text, parses and validates numeric ranges, classifies readiness.
//! Per-item malformed data is dropped with a log line; only the shape
//! of the whole payload (not an array) is reported, and even that as an
//! empty result rather than an error.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::decode::decode_legacy_text;
use crate::model::{NormalizedReading, NormalizedValue, RawReading, RawValueSpec, ReadingStatus};
use crate::units;

/// Parse a range bound that may arrive as a number or numeric string.
fn parse_numeric(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Normalize one value specification.
pub fn normalize_value(spec: &RawValueSpec) -> NormalizedValue {
    let min = parse_numeric(spec.min.as_ref());
    let max = parse_numeric(spec.max.as_ref());
    let range_valid = matches!((min, max), (Some(lo), Some(hi)) if lo < hi);

    NormalizedValue {
        id: spec.id.clone(),
        name: decode_legacy_text(&spec.name_raw),
        min,
        max,
        code: spec.code.clone(),
        calc: spec.calc.clone(),
        value_type: units::lookup(&spec.code).to_string(),
        range_valid,
    }
}

/// Classify reading readiness.
///
/// `Active` requires at least one range-valid value and non-empty name
/// and description; otherwise the first unmet condition wins, in the
/// order NoValues, InvalidRange, IncompleteInfo.
fn classify(values: &[NormalizedValue], name: &str, description: &str) -> ReadingStatus {
    if values.is_empty() {
        ReadingStatus::NoValues
    } else if !values.iter().any(|v| v.range_valid) {
        ReadingStatus::InvalidRange
    } else if name.is_empty() || description.is_empty() {
        ReadingStatus::IncompleteInfo
    } else {
        ReadingStatus::Active
    }
}

/// Normalize one raw reading.
///
/// Returns `None` when the serial or address is missing; such readings
/// are filtered upstream rather than failing the batch.
pub fn normalize_reading(raw: &RawReading) -> Option<NormalizedReading> {
    let serial = raw.serial.clone()?;
    let address = raw.address?;

    let description = decode_legacy_text(&raw.description_raw);
    let name = decode_legacy_text(&raw.name_raw);
    let values: Vec<NormalizedValue> = raw.value_specs.iter().map(normalize_value).collect();
    let status = classify(&values, &name, &description);

    Some(NormalizedReading {
        serial,
        description,
        address,
        name,
        profile: raw.profile.clone(),
        values,
        status,
        processed_at: Utc::now(),
    })
}

/// Normalize a whole store payload.
///
/// The single entry point the pipeline calls. A non-array payload maps
/// to an empty result with a warning; items that fail to parse or lack
/// required identity fields are dropped individually.
pub fn normalize_and_format(payload: &Value) -> Vec<NormalizedReading> {
    let Some(items) = payload.as_array() else {
        warn!("store payload is not an array, nothing to normalize");
        return Vec::new();
    };

    let mut readings = Vec::with_capacity(items.len());
    for item in items {
        let raw: RawReading = match serde_json::from_value(item.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "skipping unparseable reading");
                continue;
            }
        };
        match normalize_reading(&raw) {
            Some(reading) => readings.push(reading),
            None => {
                debug!("skipping reading without serial or address");
            }
        }
    }
    readings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(code: &str, min: Option<Value>, max: Option<Value>) -> RawValueSpec {
        RawValueSpec {
            id: "v1".into(),
            name_raw: "value".into(),
            code: code.into(),
            min,
            max,
            calc: None,
        }
    }

    #[test]
    fn test_range_valid_biconditional() {
        let cases = [
            (Some(json!(0)), Some(json!(60)), true),
            (Some(json!(60)), Some(json!(0)), false),
            (Some(json!(5)), Some(json!(5)), false),
            (None, Some(json!(60)), false),
            (Some(json!(0)), None, false),
            (Some(json!("-1")), Some(json!("60")), true),
            (Some(json!("n/a")), Some(json!(60)), false),
        ];
        for (min, max, expected) in cases {
            let value = normalize_value(&spec("A", min.clone(), max.clone()));
            assert_eq!(
                value.range_valid, expected,
                "min={:?} max={:?}",
                min, max
            );
            // range_valid must match the biconditional exactly.
            let both = value.min.is_some() && value.max.is_some();
            let ordered = both && value.min.unwrap() < value.max.unwrap();
            assert_eq!(value.range_valid, ordered);
        }
    }

    #[test]
    fn test_type_lookup_with_unknown_default() {
        let known = normalize_value(&spec("A", Some(json!(0)), Some(json!(1))));
        assert_eq!(known.value_type, "溫度");
        let unknown = normalize_value(&spec("Q", Some(json!(0)), Some(json!(1))));
        assert_eq!(unknown.value_type, "unknown");
    }

    fn raw_reading(serial: Option<&str>, address: Option<i64>) -> RawReading {
        RawReading {
            serial: serial.map(str::to_string),
            address,
            description_raw: "room".into(),
            name_raw: "sensor".into(),
            profile: "p1".into(),
            value_specs: vec![spec("A", Some(json!(0)), Some(json!(60)))],
        }
    }

    #[test]
    fn test_normalize_reading_requires_identity() {
        assert!(normalize_reading(&raw_reading(Some("S1"), Some(1))).is_some());
        assert!(normalize_reading(&raw_reading(None, Some(1))).is_none());
        assert!(normalize_reading(&raw_reading(Some("S1"), None)).is_none());
    }

    #[test]
    fn test_status_priority_order() {
        // No values at all.
        let mut raw = raw_reading(Some("S1"), Some(1));
        raw.value_specs.clear();
        assert_eq!(
            normalize_reading(&raw).unwrap().status,
            ReadingStatus::NoValues
        );

        // Values but no valid range.
        let mut raw = raw_reading(Some("S1"), Some(1));
        raw.value_specs = vec![spec("A", Some(json!(60)), Some(json!(0)))];
        assert_eq!(
            normalize_reading(&raw).unwrap().status,
            ReadingStatus::InvalidRange
        );

        // Valid range but empty name.
        let mut raw = raw_reading(Some("S1"), Some(1));
        raw.name_raw = String::new();
        assert_eq!(
            normalize_reading(&raw).unwrap().status,
            ReadingStatus::IncompleteInfo
        );

        // Everything present.
        let raw = raw_reading(Some("S1"), Some(1));
        assert_eq!(
            normalize_reading(&raw).unwrap().status,
            ReadingStatus::Active
        );
    }

    #[test]
    fn test_normalize_decodes_legacy_description() {
        let mut raw = raw_reading(Some("S1"), Some(1));
        raw.description_raw = "\\xb7\\xc5\\xab\\xd7".into();
        let reading = normalize_reading(&raw).unwrap();
        assert_eq!(reading.description, "溫度");
        assert_eq!(reading.status, ReadingStatus::Active);
    }

    #[test]
    fn test_normalize_and_format_filters_bad_items() {
        let payload = json!([
            {"serial": "S1", "address": 1, "description": "d", "name": "n",
             "values": [{"id": "v", "name": "t", "code": "A", "min": 0, "max": 60}]},
            {"description": "missing identity"},
            42
        ]);
        let readings = normalize_and_format(&payload);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].serial, "S1");
    }

    #[test]
    fn test_normalize_and_format_non_array() {
        assert!(normalize_and_format(&json!({"not": "an array"})).is_empty());
        assert!(normalize_and_format(&json!(null)).is_empty());
    }
}
