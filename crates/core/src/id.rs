//! Strongly-typed identifiers used across the pipelines.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Natural key of a row in a downstream store (e.g. an article id).
///
/// Every write is an upsert keyed by this value, so it doubles as the
/// correlation key for dead-letter routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(String);

/// Identifier a message channel assigns to a delivered message (offset, stream id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Build the identifier, rejecting empty or whitespace-only input.
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::invalid_key(format!("{}: empty", $name)));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_newtype!(RowKey, "RowKey");
impl_string_newtype!(MessageId, "MessageId");

impl MessageId {
    /// Sequential id such as `mem-3`; never blank.
    pub fn sequence(prefix: &str, n: u64) -> Self {
        Self(format!("{prefix}-{n}"))
    }
}

impl RowKey {
    /// Derive a key from a scalar JSON value (string or number).
    ///
    /// CDC row images carry integer primary keys as JSON numbers, while the
    /// paginated source usually hands out string ids; both map to the same key space.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, DomainError> {
        match value {
            serde_json::Value::String(s) => Self::new(s.clone()),
            serde_json::Value::Number(n) => Self::new(n.to_string()),
            other => Err(DomainError::invalid_key(format!(
                "RowKey: expected string or number, got {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_blank_keys() {
        assert!(RowKey::new("").is_err());
        assert!(RowKey::new("   ").is_err());
        assert!(MessageId::new("").is_err());
    }

    #[test]
    fn numeric_and_string_json_keys_share_a_key_space() {
        let from_number = RowKey::from_json(&json!(42)).unwrap();
        let from_string = RowKey::from_json(&json!("42")).unwrap();
        assert_eq!(from_number, from_string);
    }

    #[test]
    fn non_scalar_json_keys_are_rejected() {
        assert!(RowKey::from_json(&json!({"id": 1})).is_err());
        assert!(RowKey::from_json(&json!(null)).is_err());
    }
}
