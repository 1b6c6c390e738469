use serde::{Deserialize, Serialize};

use super::event::EventEnvelope;

// ============================================================================
// Envelope Codec - Queue message body <-> EventEnvelope
// ============================================================================
//
// Message bodies are double-encoded:
//
//   {"Message": "<aggregate_id>|<version>|<type_code>|<payload>", ...}
//
// The outer JSON object is the queue transport wrapper (other fields are
// ignored). The inner string is the store's wire format. The payload is the
// last field and may itself contain the separator.
//
// Decoding never panics and has no side effects.
//
// ============================================================================

const FIELD_SEPARATOR: char = '|';
const FIELD_COUNT: usize = 4;

/// Transport wrapper put around the inner envelope by the queue
#[derive(Serialize, Deserialize, Debug)]
struct TransportMessage {
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed transport wrapper: {0}")]
    MalformedTransport(#[source] serde_json::Error),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] EnvelopeError),
}

impl DecodeError {
    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::MalformedTransport(_) => "malformed_transport",
            DecodeError::MalformedEnvelope(_) => "malformed_envelope",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("expected 4 fields, found {found}")]
    FieldCount { found: usize },

    #[error("field `{0}` is empty")]
    EmptyField(&'static str),

    #[error("version is not a non-negative integer: {0:?}")]
    InvalidVersion(String),
}

pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Decode a raw queue message body into an event envelope
    pub fn decode(body: &str) -> Result<EventEnvelope, DecodeError> {
        let transport: TransportMessage =
            serde_json::from_str(body).map_err(DecodeError::MalformedTransport)?;

        Ok(Self::decode_inner(&transport.message)?)
    }

    /// Parse the store wire format carried inside the transport wrapper
    pub fn decode_inner(inner: &str) -> Result<EventEnvelope, EnvelopeError> {
        let fields: Vec<&str> = inner.splitn(FIELD_COUNT, FIELD_SEPARATOR).collect();
        let &[aggregate_id, version, type_code, payload] = fields.as_slice() else {
            return Err(EnvelopeError::FieldCount { found: fields.len() });
        };

        if aggregate_id.is_empty() {
            return Err(EnvelopeError::EmptyField("aggregate_id"));
        }
        if type_code.is_empty() {
            return Err(EnvelopeError::EmptyField("type_code"));
        }

        let version = version
            .parse::<i64>()
            .ok()
            .filter(|v| *v >= 0)
            .ok_or_else(|| EnvelopeError::InvalidVersion(version.to_string()))?;

        Ok(EventEnvelope::new(aggregate_id, version, type_code, payload))
    }

    /// Encode an envelope into a transport body accepted by `decode`
    #[cfg(test)]
    pub fn encode(envelope: &EventEnvelope) -> String {
        serde_json::json!({ "Message": Self::encode_inner(envelope) }).to_string()
    }

    #[cfg(test)]
    pub fn encode_inner(envelope: &EventEnvelope) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            envelope.aggregate_id,
            envelope.version,
            envelope.type_code,
            envelope.payload,
            sep = FIELD_SEPARATOR,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_deposit_scenario() {
        let body = r#"{"Message":"acct-1|3|Deposited|{amt:50}"}"#;

        let envelope = EnvelopeCodec::decode(body).unwrap();

        assert_eq!(envelope.aggregate_id, "acct-1");
        assert_eq!(envelope.version, 3);
        assert_eq!(envelope.type_code, "Deposited");
        assert_eq!(envelope.payload, "{amt:50}");
    }

    #[test]
    fn test_decode_ignores_other_transport_fields() {
        let body = r#"{"Type":"Notification","MessageId":"abc","Message":"acct-9|0|Opened|","Timestamp":"2024-01-01T00:00:00Z"}"#;

        let envelope = EnvelopeCodec::decode(body).unwrap();

        assert_eq!(envelope, EventEnvelope::new("acct-9", 0, "Opened", ""));
    }

    #[test]
    fn test_payload_may_contain_separator() {
        let body = r#"{"Message":"order-7|12|Noted|a|b|c"}"#;

        let envelope = EnvelopeCodec::decode(body).unwrap();

        assert_eq!(envelope.payload, "a|b|c");
    }

    #[test]
    fn test_round_trip() {
        let envelopes = vec![
            EventEnvelope::new("acct-1", 3, "Deposited", "{amt:50}"),
            EventEnvelope::new("a", 0, "T", ""),
            EventEnvelope::new("stream with spaces", i64::MAX, "Type.V2", "quoted \"json\" | pipes\nnewline"),
            EventEnvelope::new("ünïcödé", 42, "Événement", "😀"),
        ];

        for envelope in envelopes {
            let body = EnvelopeCodec::encode(&envelope);
            assert_eq!(EnvelopeCodec::decode(&body).unwrap(), envelope);
        }
    }

    #[test]
    fn test_wrong_field_count_is_malformed_envelope() {
        let err = EnvelopeCodec::decode(r#"{"Message":"garbage"}"#).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedEnvelope(EnvelopeError::FieldCount { found: 1 })
        ));
        assert_eq!(err.kind(), "malformed_envelope");

        let err = EnvelopeCodec::decode(r#"{"Message":"acct-1|3|Deposited"}"#).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedEnvelope(EnvelopeError::FieldCount { found: 3 })
        ));
    }

    #[test]
    fn test_non_numeric_version_is_malformed_envelope() {
        for inner in ["acct-1|three|Deposited|x", "acct-1|-1|Deposited|x", "acct-1||Deposited|x", "acct-1|1.5|Deposited|x"] {
            let body = format!(r#"{{"Message":"{inner}"}}"#);
            let err = EnvelopeCodec::decode(&body).unwrap_err();
            assert!(
                matches!(err, DecodeError::MalformedEnvelope(EnvelopeError::InvalidVersion(_))),
                "unexpected result for {inner}: {err:?}"
            );
        }
    }

    #[test]
    fn test_empty_identifiers_are_rejected() {
        assert_eq!(
            EnvelopeCodec::decode_inner("|3|Deposited|x").unwrap_err(),
            EnvelopeError::EmptyField("aggregate_id")
        );
        assert_eq!(
            EnvelopeCodec::decode_inner("acct-1|3||x").unwrap_err(),
            EnvelopeError::EmptyField("type_code")
        );
    }

    #[test]
    fn test_malformed_transport() {
        let bodies = [
            "",
            "not json",
            "{\"Message\":",
            "[]",
            "\"acct-1|3|Deposited|x\"",
            r#"{"message":"acct-1|3|Deposited|x"}"#,
            r#"{"Message":42}"#,
            r#"{"Message":null}"#,
        ];

        for body in bodies {
            let err = EnvelopeCodec::decode(body).unwrap_err();
            assert!(
                matches!(err, DecodeError::MalformedTransport(_)),
                "unexpected result for {body:?}: {err:?}"
            );
            assert_eq!(err.kind(), "malformed_transport");
        }
    }

    #[test]
    fn test_decode_is_deterministic() {
        let body = r#"{"Message":"acct-1|x|Deposited|{}"}"#;
        let first = EnvelopeCodec::decode(body).unwrap_err().to_string();
        let second = EnvelopeCodec::decode(body).unwrap_err().to_string();
        assert_eq!(first, second);
    }
}
