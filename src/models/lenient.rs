//! Deserializers for vendor fields that arrive as either strings or numbers.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// `"42.5"`, `42.5` and `null` all become `Option<f64>`.
pub fn f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(value_as_f64(&Option::<Value>::deserialize(deserializer)?.unwrap_or(Value::Null)))
}

/// Numbers are rendered without quotes, `null` becomes `None`.
pub fn string_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(value_as_string(&Option::<Value>::deserialize(deserializer)?.unwrap_or(Value::Null)))
}

/// Epoch milliseconds as number or numeric string; anything else is `0`.
pub fn epoch_ms<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?.unwrap_or(Value::Null);
    Ok(value_as_f64(&value).map(|v| v as i64).unwrap_or(0))
}

pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "on" | "open" | "locked" => Some(true),
            "0" | "false" | "off" | "closed" | "unlocked" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
