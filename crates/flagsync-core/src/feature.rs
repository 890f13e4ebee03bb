//! Feature records as replicated from the feature service.
//!
//! A record carries its value untyped (a raw JSON payload plus a declared
//! [`FeatureType`]). Conversion to a concrete Rust type happens explicitly at
//! read time through the `coerce_*` helpers, never implicitly.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::strategy::RolloutStrategy;

/// Declared type of a feature's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureType {
    Boolean,
    String,
    Number,
    Json,
}

impl FeatureType {
    /// Wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::Boolean => "BOOLEAN",
            FeatureType::String => "STRING",
            FeatureType::Number => "NUMBER",
            FeatureType::Json => "JSON",
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single feature definition.
///
/// Records are replaced wholesale on every accepted update; readers only
/// ever see complete records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    /// Unique feature key.
    pub key: String,
    /// Declared value type.
    #[serde(rename = "type")]
    pub feature_type: FeatureType,
    /// Server-computed default value. `null` means no value is set.
    #[serde(default)]
    pub value: Value,
    /// Monotonically increasing version for this key.
    #[serde(default)]
    pub version: u64,
    /// Rollout strategies in evaluation order.
    #[serde(default)]
    pub strategies: Vec<RolloutStrategy>,
}

impl FeatureRecord {
    /// Create a record without strategies.
    pub fn new(
        key: impl Into<String>,
        feature_type: FeatureType,
        value: impl Into<Value>,
        version: u64,
    ) -> Self {
        Self {
            key: key.into(),
            feature_type,
            value: value.into(),
            version,
            strategies: Vec::new(),
        }
    }

    /// Append a rollout strategy.
    pub fn with_strategy(mut self, strategy: RolloutStrategy) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Whether any rollout strategies are attached.
    pub fn has_strategies(&self) -> bool {
        !self.strategies.is_empty()
    }

    /// Whether the record carries a value at all.
    pub fn is_set(&self) -> bool {
        !self.value.is_null()
    }

    /// Whether `other` defines the feature differently from `self`.
    ///
    /// Only the effective definition counts: type, value and strategy set.
    /// The version is ignored.
    pub fn differs_from(&self, other: &FeatureRecord) -> bool {
        self.feature_type != other.feature_type
            || self.value != other.value
            || self.strategies != other.strategies
    }
}

/// Coerce a raw value to a boolean.
///
/// Accepts JSON booleans and the strings `"true"` / `"false"`.
pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Coerce a raw value to a number.
///
/// Accepts JSON numbers and strings holding a finite decimal number.
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Coerce a raw value to a string. Only JSON strings qualify.
pub fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Coerce a raw value to its JSON text.
///
/// The service usually ships JSON features as pre-serialized strings, which
/// are returned verbatim. Structured payloads are serialized. `null` yields
/// nothing.
pub fn coerce_raw_json(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Short name of a raw value's JSON kind, for error reporting.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_record_with_unknown_fields() {
        let record: FeatureRecord = serde_json::from_value(json!({
            "key": "banner",
            "type": "STRING",
            "value": "hello",
            "version": 3,
            "l": true,
            "extra": {"ignored": 1}
        }))
        .unwrap();

        assert_eq!(record.key, "banner");
        assert_eq!(record.feature_type, FeatureType::String);
        assert_eq!(record.value, json!("hello"));
        assert_eq!(record.version, 3);
        assert!(record.strategies.is_empty());
    }

    #[test]
    fn test_parse_record_without_value() {
        let record: FeatureRecord =
            serde_json::from_value(json!({"key": "f", "type": "BOOLEAN", "version": 1})).unwrap();
        assert!(!record.is_set());
    }

    #[test]
    fn test_differs_from_ignores_version() {
        let a = FeatureRecord::new("f", FeatureType::Boolean, true, 1);
        let mut b = a.clone();
        b.version = 2;
        assert!(!a.differs_from(&b));

        b.value = json!(false);
        assert!(a.differs_from(&b));
    }

    #[test]
    fn test_differs_from_strategies() {
        let a = FeatureRecord::new("f", FeatureType::Boolean, true, 1);
        let b = a.clone().with_strategy(RolloutStrategy::new(json!(false)));
        assert!(a.differs_from(&b));
    }

    #[test]
    fn test_coerce_bool() {
        assert_eq!(coerce_bool(&json!(true)), Some(true));
        assert_eq!(coerce_bool(&json!("false")), Some(false));
        assert_eq!(coerce_bool(&json!("yes")), None);
        assert_eq!(coerce_bool(&json!(1)), None);
        assert_eq!(coerce_bool(&Value::Null), None);
    }

    #[test]
    fn test_coerce_number() {
        assert_eq!(coerce_number(&json!(2.5)), Some(2.5));
        assert_eq!(coerce_number(&json!("42")), Some(42.0));
        assert_eq!(coerce_number(&json!("NaN")), None);
        assert_eq!(coerce_number(&json!(true)), None);
    }

    #[test]
    fn test_coerce_string_is_strict() {
        assert_eq!(coerce_string(&json!("x")), Some("x".to_string()));
        assert_eq!(coerce_string(&json!(1)), None);
    }

    #[test]
    fn test_coerce_raw_json() {
        assert_eq!(
            coerce_raw_json(&json!("{\"a\":1}")),
            Some("{\"a\":1}".to_string())
        );
        assert_eq!(coerce_raw_json(&json!({"a": 1})), Some("{\"a\":1}".to_string()));
        assert_eq!(coerce_raw_json(&Value::Null), None);
    }
}
