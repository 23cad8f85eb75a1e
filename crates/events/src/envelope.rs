//! Change-data-capture envelope (Debezium wire shape) and its decoder.
//!
//! A change event arrives as a JSON object:
//!
//! ```text
//! { "before": {..} | null, "after": {..} | null, "op": "c" | "r" | "u" | "d", "source": { "table": .., "connector": .. } }
//! ```
//!
//! Decoding is deliberately lenient about *extra* data: unknown fields at any
//! level are ignored so upstream schema evolution never turns into poison
//! messages. It is strict about *shape*: a payload that is not a JSON object
//! with an `op` is a [`DecodeError`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use newsrelay_core::RowImage;

/// Row-level operation carried by a change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// `c`: row inserted.
    Create,
    /// `r`: row emitted by an initial/incremental snapshot.
    SnapshotRead,
    /// `u`: row updated.
    Update,
    /// `d`: row deleted.
    Delete,
    /// Any op code this decoder does not know (e.g. `t` truncate, `m` message).
    Other(String),
}

impl Operation {
    pub fn from_code(code: &str) -> Self {
        match code {
            "c" => Operation::Create,
            "r" => Operation::SnapshotRead,
            "u" => Operation::Update,
            "d" => Operation::Delete,
            other => Operation::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Operation::Create => "c",
            Operation::SnapshotRead => "r",
            Operation::Update => "u",
            Operation::Delete => "d",
            Operation::Other(code) => code,
        }
    }

    /// Creation-class operations are the only ones the relays act upon.
    pub fn is_creation(&self) -> bool {
        matches!(self, Operation::Create | Operation::SnapshotRead)
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let code = String::deserialize(deserializer)?;
        Ok(Operation::from_code(&code))
    }
}

impl Serialize for Operation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.code())
    }
}

impl core::fmt::Display for Operation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

/// Origin metadata of a change event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub connector: Option<String>,
}

/// Decoded change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    pub op: Operation,
    #[serde(default)]
    pub before: Option<RowImage>,
    #[serde(default)]
    pub after: Option<RowImage>,
    #[serde(default)]
    pub source: Option<SourceInfo>,
}

/// Payload could not be read as a change envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("malformed change envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("change envelope must be a JSON object")]
    NotAnObject,
}

/// What a consumer should do with a decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A creation-class event with a row image to act upon.
    Apply(RowImage),
    /// Update/delete/unknown op: intentionally ignored.
    SkipNonCreation(Operation),
    /// Creation-class op without an `after` image: nothing to act upon.
    SkipMissingAfter(Operation),
}

impl ChangeEnvelope {
    /// Decode raw message bytes.
    ///
    /// Also accepts the `{ "schema": .., "payload": { .. } }` wrapping produced by
    /// converters with embedded schemas, as long as the outer object has no `op`.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::Empty);
        }

        let value: JsonValue = serde_json::from_slice(raw)?;
        let JsonValue::Object(mut object) = value else {
            return Err(DecodeError::NotAnObject);
        };

        if !object.contains_key("op") {
            if let Some(JsonValue::Object(inner)) = object.remove("payload") {
                object = inner;
            }
        }

        Ok(serde_json::from_value(JsonValue::Object(object))?)
    }

    pub fn table(&self) -> Option<&str> {
        self.source.as_ref().and_then(|s| s.table.as_deref())
    }

    /// Filter to creation-class operations.
    ///
    /// Skips are logged here (debug for expected skips, warn for a creation
    /// without a row image) so every consumer reports them the same way.
    pub fn classify(self) -> Decoded {
        if !self.op.is_creation() {
            debug!(op = %self.op, table = ?self.table(), "skipping non-creation change event");
            return Decoded::SkipNonCreation(self.op);
        }

        match self.after {
            Some(after) => Decoded::Apply(after),
            None => {
                warn!(
                    op = %self.op,
                    table = ?self.source.as_ref().and_then(|s| s.table.as_deref()),
                    "creation event without 'after' image; skipping"
                );
                Decoded::SkipMissingAfter(self.op)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn decode_json(value: JsonValue) -> ChangeEnvelope {
        ChangeEnvelope::decode(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn decodes_a_create_event() {
        let env = decode_json(json!({
            "before": null,
            "after": { "id": 1, "title": "t" },
            "op": "c",
            "source": { "table": "articles", "connector": "news-connector", "db": "news" },
        }));

        assert_eq!(env.op, Operation::Create);
        assert!(env.before.is_none());
        assert_eq!(env.table(), Some("articles"));
        assert_eq!(
            env.source.as_ref().and_then(|s| s.connector.as_deref()),
            Some("news-connector")
        );
        assert!(matches!(env.classify(), Decoded::Apply(_)));
    }

    #[test]
    fn snapshot_reads_are_creation_class() {
        let env = decode_json(json!({ "op": "r", "after": { "id": 1 } }));
        assert!(matches!(env.classify(), Decoded::Apply(_)));
    }

    #[test]
    fn updates_and_deletes_are_skipped() {
        let update = decode_json(json!({ "op": "u", "before": {"id": 1}, "after": {"id": 1} }));
        let delete = decode_json(json!({ "op": "d", "before": {"id": 1}, "after": null }));

        assert_eq!(update.classify(), Decoded::SkipNonCreation(Operation::Update));
        assert_eq!(delete.classify(), Decoded::SkipNonCreation(Operation::Delete));
    }

    #[test]
    fn unknown_op_codes_are_skipped_not_rejected() {
        let env = decode_json(json!({ "op": "t" }));
        assert_eq!(
            env.classify(),
            Decoded::SkipNonCreation(Operation::Other("t".to_string()))
        );
    }

    #[test]
    fn creation_without_after_is_skipped() {
        let env = decode_json(json!({ "op": "c", "after": null }));
        assert_eq!(env.classify(), Decoded::SkipMissingAfter(Operation::Create));
    }

    #[test]
    fn unwraps_schema_payload_wrapping() {
        let env = decode_json(json!({
            "schema": { "type": "struct" },
            "payload": { "op": "c", "after": { "id": 9 } },
        }));
        assert_eq!(env.op, Operation::Create);
    }

    #[test]
    fn malformed_payloads_are_decode_errors() {
        assert!(matches!(ChangeEnvelope::decode(b""), Err(DecodeError::Empty)));
        assert!(matches!(ChangeEnvelope::decode(b"{not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(ChangeEnvelope::decode(b"[1,2]"), Err(DecodeError::NotAnObject)));
        assert!(matches!(
            ChangeEnvelope::decode(br#"{"after": {"id": 1}}"#),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            ChangeEnvelope::decode(br#"{"op": "c", "after": "oops"}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    proptest! {
        #[test]
        fn unknown_fields_never_change_the_envelope(
            field in "[a-z_]{1,12}",
            nested in "[a-z_]{1,12}",
            value in any::<i64>(),
        ) {
            prop_assume!(!["op", "before", "after", "source", "payload"].contains(&field.as_str()));
            prop_assume!(!["table", "connector"].contains(&nested.as_str()));

            let base = json!({
                "before": null,
                "after": { "id": 1 },
                "op": "c",
                "source": { "table": "articles", "connector": "conn" },
            });
            let mut extended = base.clone();
            extended[field.as_str()] = json!(value);
            extended["source"][nested.as_str()] = json!(value);

            prop_assert_eq!(decode_json(base), decode_json(extended));
        }
    }
}
