//! Decoded feature service messages.
//!
//! Every message names its kind and carries a JSON payload. SSE delivers the
//! kind as the event name; WebSocket frames wrap both in an envelope:
//!
//! ```json
//! {"type": "feature", "data": {"key": "f1", "type": "BOOLEAN", "value": true, "version": 2}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::feature::FeatureRecord;

/// Kind name of a full synchronization.
pub const KIND_FEATURES: &str = "features";
/// Kind name of a single feature upsert.
pub const KIND_FEATURE: &str = "feature";
/// Kind name of a single feature delete.
pub const KIND_DELETE_FEATURE: &str = "delete_feature";
/// Kind name of a heartbeat.
pub const KIND_HEARTBEAT: &str = "heartbeat";
/// Kind name of a heartbeat acknowledgement.
pub const KIND_ACK: &str = "ack";
/// Kind name of a graceful server close.
pub const KIND_BYE: &str = "bye";
/// Kind name of a terminal failure.
pub const KIND_FAILURE: &str = "failure";

/// A single decoded message from the feature service.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Replace every known record.
    FullSync(Vec<FeatureRecord>),
    /// Insert or replace one record.
    Upsert(FeatureRecord),
    /// Remove one record.
    Delete { key: String },
    /// Keep-alive; no repository effect.
    Heartbeat,
    /// The server is closing the stream gracefully.
    Bye,
    /// The server refuses to serve this client. Never retried.
    Failure { reason: String },
}

#[derive(Debug, Deserialize)]
struct DeletePayload {
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FailurePayload {
    Reason(String),
    Object {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// WebSocket frame shape.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl StreamMessage {
    /// Kind name this message travels under.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::FullSync(_) => KIND_FEATURES,
            StreamMessage::Upsert(_) => KIND_FEATURE,
            StreamMessage::Delete { .. } => KIND_DELETE_FEATURE,
            StreamMessage::Heartbeat => KIND_HEARTBEAT,
            StreamMessage::Bye => KIND_BYE,
            StreamMessage::Failure { .. } => KIND_FAILURE,
        }
    }

    /// Decode a message from its kind name and raw payload text.
    ///
    /// Control kinds accept an empty payload.
    pub fn decode(kind: &str, data: &str) -> Result<Self, ProtocolError> {
        let data = data.trim();
        let value = if data.is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(data) {
                Ok(value) => value,
                // Failure reasons are sometimes sent as bare text
                Err(_) if is_failure_kind(kind) => Value::String(data.to_string()),
                Err(e) => return Err(ProtocolError::Json(e)),
            }
        };
        Self::decode_value(kind, value)
    }

    /// Decode a message from its kind name and an already-parsed payload.
    pub fn decode_value(kind: &str, data: Value) -> Result<Self, ProtocolError> {
        match kind {
            KIND_FEATURES => {
                let records = require(kind, data)?;
                Ok(StreamMessage::FullSync(records))
            }
            KIND_FEATURE => {
                let record = require(kind, data)?;
                Ok(StreamMessage::Upsert(record))
            }
            KIND_DELETE_FEATURE => {
                // Either a bare {key} or the full deleted record
                let payload: DeletePayload = require(kind, data)?;
                Ok(StreamMessage::Delete { key: payload.key })
            }
            KIND_HEARTBEAT | KIND_ACK => Ok(StreamMessage::Heartbeat),
            KIND_BYE => Ok(StreamMessage::Bye),
            k if is_failure_kind(k) => {
                let reason = match data {
                    Value::Null => None,
                    other => match serde_json::from_value::<FailurePayload>(other) {
                        Ok(FailurePayload::Reason(reason)) => Some(reason),
                        Ok(FailurePayload::Object { reason }) => reason,
                        Err(_) => None,
                    },
                };
                Ok(StreamMessage::Failure {
                    reason: reason
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "unspecified".to_string()),
                })
            }
            other => Err(ProtocolError::UnknownKind(other.to_string())),
        }
    }

    /// Decode a WebSocket envelope frame.
    pub fn decode_envelope(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Self::decode_value(&envelope.kind, envelope.data)
    }

    /// Encode this message as a WebSocket envelope frame.
    pub fn to_envelope(&self) -> Result<String, ProtocolError> {
        let data = match self {
            StreamMessage::FullSync(records) => serde_json::to_value(records)?,
            StreamMessage::Upsert(record) => serde_json::to_value(record)?,
            StreamMessage::Delete { key } => serde_json::json!({ "key": key }),
            StreamMessage::Heartbeat | StreamMessage::Bye => Value::Null,
            StreamMessage::Failure { reason } => serde_json::json!({ "reason": reason }),
        };
        let envelope = Envelope {
            kind: self.kind().to_string(),
            data,
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

fn is_failure_kind(kind: &str) -> bool {
    matches!(kind, KIND_FAILURE | "failed")
}

fn require<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> Result<T, ProtocolError> {
    if data.is_null() {
        return Err(ProtocolError::MissingPayload(kind.to_string()));
    }
    serde_json::from_value(data).map_err(|source| ProtocolError::Malformed {
        kind: kind.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::FeatureType;
    use crate::strategy::Operator;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_full_sync() {
        let data = r#"[
            {"key": "f1", "type": "BOOLEAN", "value": true, "version": 1},
            {"key": "f2", "type": "STRING", "value": "base", "version": 4,
             "strategies": [{"value": "variant", "percentage": 100,
                             "rules": [{"attribute": "country", "operator": "EQUALS", "values": ["nz"]}]}]}
        ]"#;

        let msg = StreamMessage::decode("features", data).unwrap();
        let StreamMessage::FullSync(records) = msg else {
            panic!("expected full sync, got {:?}", msg);
        };
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], FeatureRecord::new("f1", FeatureType::Boolean, true, 1));
        assert_eq!(records[1].strategies[0].rules[0].operator, Operator::Equals);
    }

    #[test]
    fn test_decode_upsert_ignores_unknown_fields() {
        let data = r#"{"key": "f1", "type": "NUMBER", "value": 3.5, "version": 7, "l": false, "fp": "abc"}"#;
        let msg = StreamMessage::decode("feature", data).unwrap();
        assert_eq!(
            msg,
            StreamMessage::Upsert(FeatureRecord::new("f1", FeatureType::Number, 3.5, 7))
        );
    }

    #[test]
    fn test_decode_delete_from_key_or_record() {
        let by_key = StreamMessage::decode("delete_feature", r#"{"key": "f1"}"#).unwrap();
        let by_record = StreamMessage::decode(
            "delete_feature",
            r#"{"key": "f1", "type": "BOOLEAN", "value": true, "version": 3}"#,
        )
        .unwrap();
        assert_eq!(by_key, StreamMessage::Delete { key: "f1".into() });
        assert_eq!(by_record, by_key);
    }

    #[test]
    fn test_decode_control_messages() {
        assert_eq!(StreamMessage::decode("heartbeat", "").unwrap(), StreamMessage::Heartbeat);
        assert_eq!(StreamMessage::decode("ack", "{}").unwrap(), StreamMessage::Heartbeat);
        assert_eq!(StreamMessage::decode("bye", "").unwrap(), StreamMessage::Bye);
    }

    #[test]
    fn test_decode_failure_variants() {
        let from_object = StreamMessage::decode("failure", r#"{"reason": "api key revoked"}"#).unwrap();
        assert_eq!(from_object, StreamMessage::Failure { reason: "api key revoked".into() });

        let from_string = StreamMessage::decode("failed", r#""bad key""#).unwrap();
        assert_eq!(from_string, StreamMessage::Failure { reason: "bad key".into() });

        let from_text = StreamMessage::decode("failure", "bad key").unwrap();
        assert_eq!(from_text, StreamMessage::Failure { reason: "bad key".into() });

        let empty = StreamMessage::decode("failure", "").unwrap();
        assert_eq!(empty, StreamMessage::Failure { reason: "unspecified".into() });
    }

    #[test]
    fn test_unknown_kind() {
        let err = StreamMessage::decode("config", "{}").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(k) if k == "config"));
    }

    #[test]
    fn test_missing_payload() {
        let err = StreamMessage::decode("feature", "").unwrap_err();
        assert!(matches!(err, ProtocolError::MissingPayload(k) if k == "feature"));
    }

    #[test]
    fn test_malformed_payload() {
        let err = StreamMessage::decode("feature", r#"{"key": "f1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { ref kind, .. } if kind == "feature"));

        let err = StreamMessage::decode("features", "{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn test_envelope() {
        let text = r#"{"type": "feature", "data": {"key": "f1", "type": "JSON", "value": "{\"a\":1}", "version": 2}}"#;
        let msg = StreamMessage::decode_envelope(text).unwrap();
        assert_eq!(
            msg,
            StreamMessage::Upsert(FeatureRecord::new("f1", FeatureType::Json, "{\"a\":1}", 2))
        );

        let heartbeat = StreamMessage::decode_envelope(r#"{"type": "heartbeat"}"#).unwrap();
        assert_eq!(heartbeat, StreamMessage::Heartbeat);
    }

    #[test]
    fn test_envelope_encoding_is_decodable() {
        let msg = StreamMessage::Delete { key: "gone".into() };
        let text = msg.to_envelope().unwrap();
        assert_eq!(StreamMessage::decode_envelope(&text).unwrap(), msg);
    }
}
