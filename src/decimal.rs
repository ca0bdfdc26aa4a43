//! Lenient decimal decoding for exchange JSON payloads.
//!
//! Exchanges are inconsistent about whether prices and quantities travel as
//! JSON strings, integers, or floats. This module centralizes the one place
//! that forgiveness is allowed; everywhere else in the crate a `Decimal` is
//! just a `Decimal`.

use rust_decimal::Decimal;
use serde::de::{self, Deserialize, Deserializer};
use serde_json::Value;
use std::str::FromStr;

/// Deserialize a field that may arrive as a JSON string, integer, or float
/// into a `Decimal`. Use via `#[serde(deserialize_with = "decimal::lenient")]`.
pub fn lenient<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    from_value(&value).map_err(de::Error::custom)
}

/// Same as [`lenient`] but for an `Option<Decimal>` field, treating JSON
/// `null` or a missing value as `None`.
pub fn lenient_opt<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => from_value(&v).map(Some).map_err(de::Error::custom),
    }
}

/// Parse a `serde_json::Value` into a `Decimal`, accepting string, integer,
/// or float representations. Returns an error for anything else (objects,
/// arrays, bools, null).
pub fn from_value(value: &Value) -> Result<Decimal, String> {
    match value {
        Value::String(s) => {
            Decimal::from_str(s.trim()).map_err(|e| format!("invalid decimal string {s:?}: {e}"))
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Decimal::from(i))
            } else if let Some(u) = n.as_u64() {
                Ok(Decimal::from(u))
            } else if let Some(f) = n.as_f64() {
                Decimal::try_from(f).map_err(|e| format!("invalid decimal from float {f}: {e}"))
            } else {
                Err(format!("unrepresentable JSON number: {n}"))
            }
        }
        other => Err(format!("expected decimal-like value, got {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_string() {
        assert_eq!(from_value(&Value::String("12.3400".into())).unwrap(), dec!(12.34));
    }

    #[test]
    fn parses_integer() {
        assert_eq!(from_value(&serde_json::json!(42)).unwrap(), dec!(42));
    }

    #[test]
    fn parses_float() {
        assert_eq!(from_value(&serde_json::json!(0.5)).unwrap(), dec!(0.5));
    }

    #[test]
    fn rejects_object() {
        assert!(from_value(&serde_json::json!({"a": 1})).is_err());
    }
}
