//! Sensor-type catalog.
//!
//! Static lookup from the one-character type code carried by each value
//! specification to its human-readable type name. The vocabulary comes
//! from the fleet's legacy labeling and is intentionally fixed.

/// Fallback type name for unrecognized codes.
pub const UNKNOWN_TYPE: &str = "unknown";

/// Look up the human-readable type name for a sensor-type code.
pub fn lookup(code: &str) -> &'static str {
    match code {
        "A" => "溫度",
        "B" => "濕度",
        "C" => "電壓",
        "D" => "電流",
        "E" => "照度",
        "F" => "CO2",
        "G" => "PM2.5",
        "H" => "壓力",
        _ => UNKNOWN_TYPE,
    }
}

/// Whether the catalog knows this code.
pub fn is_known(code: &str) -> bool {
    lookup(code) != UNKNOWN_TYPE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes() {
        assert_eq!(lookup("A"), "溫度");
        assert_eq!(lookup("B"), "濕度");
        assert_eq!(lookup("F"), "CO2");
        assert!(is_known("H"));
    }

    #[test]
    fn test_unknown_codes() {
        assert_eq!(lookup("Z"), UNKNOWN_TYPE);
        assert_eq!(lookup(""), UNKNOWN_TYPE);
        assert_eq!(lookup("AB"), UNKNOWN_TYPE);
        assert!(!is_known("?"));
    }
}
