//! Strict typed reads of feature values.
//!
//! A read succeeds only when the record's declared type matches the
//! requested one and the value converts cleanly.

use flagsync_core::feature::{coerce_bool, coerce_number, coerce_raw_json, coerce_string, value_kind};
use flagsync_core::{FeatureRecord, FeatureType};
use serde_json::Value;

use crate::FlagsError;

fn mismatch(record: &FeatureRecord, expected: FeatureType, value: &Value) -> FlagsError {
    let actual = if record.feature_type == expected {
        value_kind(value).to_string()
    } else {
        record.feature_type.to_string()
    };
    FlagsError::TypeMismatch {
        key: record.key.clone(),
        expected,
        actual,
    }
}

fn read<T>(
    record: &FeatureRecord,
    value: &Value,
    expected: FeatureType,
    coerce: impl FnOnce(&Value) -> Option<T>,
) -> Result<T, FlagsError> {
    if record.feature_type != expected {
        return Err(mismatch(record, expected, value));
    }
    coerce(value).ok_or_else(|| mismatch(record, expected, value))
}

pub(crate) fn read_boolean(record: &FeatureRecord, value: &Value) -> Result<bool, FlagsError> {
    read(record, value, FeatureType::Boolean, coerce_bool)
}

pub(crate) fn read_number(record: &FeatureRecord, value: &Value) -> Result<f64, FlagsError> {
    read(record, value, FeatureType::Number, coerce_number)
}

pub(crate) fn read_string(record: &FeatureRecord, value: &Value) -> Result<String, FlagsError> {
    read(record, value, FeatureType::String, coerce_string)
}

pub(crate) fn read_raw_json(record: &FeatureRecord, value: &Value) -> Result<String, FlagsError> {
    read(record, value, FeatureType::Json, coerce_raw_json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wrong_declared_type() {
        let record = FeatureRecord::new("f", FeatureType::String, "true", 1);
        let err = read_boolean(&record, &record.value).unwrap_err();
        match err {
            FlagsError::TypeMismatch { key, expected, actual } => {
                assert_eq!(key, "f");
                assert_eq!(expected, FeatureType::Boolean);
                assert_eq!(actual, "STRING");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_null_value() {
        let record = FeatureRecord::new("f", FeatureType::Number, Value::Null, 1);
        let err = read_number(&record, &record.value).unwrap_err();
        assert!(matches!(err, FlagsError::TypeMismatch { ref actual, .. } if actual == "null"));
    }

    #[test]
    fn test_reads() {
        let b = FeatureRecord::new("b", FeatureType::Boolean, "false", 1);
        assert!(!read_boolean(&b, &b.value).unwrap());

        let n = FeatureRecord::new("n", FeatureType::Number, "12.5", 1);
        assert_eq!(read_number(&n, &n.value).unwrap(), 12.5);

        let s = FeatureRecord::new("s", FeatureType::String, "hi", 1);
        assert_eq!(read_string(&s, &s.value).unwrap(), "hi");

        let j = FeatureRecord::new("j", FeatureType::Json, json!({"a": [1, 2]}), 1);
        assert_eq!(read_raw_json(&j, &j.value).unwrap(), r#"{"a":[1,2]}"#);
    }
}
