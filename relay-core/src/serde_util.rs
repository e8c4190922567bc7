//! Serde helpers for exchange payloads
//!
//! Delta sends numeric fields either as JSON strings (`"64012.5"`) or as
//! bare numbers depending on the channel, so decimals are read from both.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer};
use serde_json::Value;

fn value_to_decimal<E: de::Error>(value: Value) -> Result<Option<Decimal>, E> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => parse_decimal(s.trim()).map(Some),
        Value::Number(n) => parse_decimal(&n.to_string()).map(Some),
        other => Err(E::custom(format!("expected decimal, got {}", other))),
    }
}

fn parse_decimal<E: de::Error>(raw: &str) -> Result<Decimal, E> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|e| E::custom(format!("invalid decimal '{}': {}", raw, e)))
}

/// Optional decimal from a string, number or null
pub fn decimal_opt<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        Some(value) => value_to_decimal(value),
        None => Ok(None),
    }
}

/// Required decimal from a string or number
pub fn decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_to_decimal(value)?.ok_or_else(|| de::Error::custom("decimal cannot be null"))
}
