//! Row images and the rows persisted to downstream stores.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{DomainError, DomainResult};
use crate::id::RowKey;

/// How a row image encodes its change timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// ISO-8601 / RFC 3339 string. A string without offset is read as UTC.
    #[default]
    Rfc3339,
    /// Integer milliseconds since the Unix epoch.
    EpochMillis,
    /// Integer microseconds since the Unix epoch (Debezium `MicroTimestamp`).
    EpochMicros,
}

impl TimestampFormat {
    /// Interpret `value` (found under `field`) as a UTC instant.
    pub fn parse(self, field: &str, value: &JsonValue) -> DomainResult<DateTime<Utc>> {
        match self {
            TimestampFormat::Rfc3339 => {
                let s = value
                    .as_str()
                    .ok_or_else(|| DomainError::invalid_timestamp(field, "expected a string"))?;
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    return Ok(dt.with_timezone(&Utc));
                }
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                    .map(|naive| naive.and_utc())
                    .map_err(|e| DomainError::invalid_timestamp(field, e.to_string()))
            }
            TimestampFormat::EpochMillis => {
                let ms = epoch_integer(field, value)?;
                Utc.timestamp_millis_opt(ms)
                    .single()
                    .ok_or_else(|| DomainError::invalid_timestamp(field, "out of range"))
            }
            TimestampFormat::EpochMicros => {
                let us = epoch_integer(field, value)?;
                Utc.timestamp_micros(us)
                    .single()
                    .ok_or_else(|| DomainError::invalid_timestamp(field, "out of range"))
            }
        }
    }
}

fn epoch_integer(field: &str, value: &JsonValue) -> DomainResult<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .ok_or_else(|| DomainError::invalid_timestamp(field, "expected an integer")),
        JsonValue::String(s) => s
            .parse::<i64>()
            .map_err(|e| DomainError::invalid_timestamp(field, e.to_string())),
        _ => Err(DomainError::invalid_timestamp(field, "expected an integer")),
    }
}

/// A row image as carried by a change event (`before` / `after`) or a source item.
///
/// Unknown fields are kept; nothing is validated until a caller asks for a
/// specific field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowImage(Map<String, JsonValue>);

impl RowImage {
    pub fn new(fields: Map<String, JsonValue>) -> Self {
        Self(fields)
    }

    /// Wrap a JSON value, which must be an object.
    pub fn from_value(value: JsonValue) -> DomainResult<Self> {
        match value {
            JsonValue::Object(map) => Ok(Self(map)),
            other => Err(DomainError::validation(format!(
                "row image must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    /// Extract the natural key stored under `field`.
    pub fn key(&self, field: &str) -> DomainResult<RowKey> {
        let value = self
            .get(field)
            .ok_or_else(|| DomainError::missing_field(field))?;
        RowKey::from_json(value)
    }

    /// Extract the change timestamp stored under `field`.
    pub fn timestamp(&self, field: &str, format: TimestampFormat) -> DomainResult<DateTime<Utc>> {
        let value = self
            .get(field)
            .ok_or_else(|| DomainError::missing_field(field))?;
        format.parse(field, value)
    }

    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }
}

/// A row persisted in a downstream store.
///
/// `updated_at` is the timestamp the staleness guard compares against; the body
/// is opaque to the pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: RowKey,
    pub updated_at: DateTime<Utc>,
    pub body: JsonValue,
}

impl Row {
    pub fn new(key: RowKey, updated_at: DateTime<Utc>, body: JsonValue) -> Self {
        Self {
            key,
            updated_at,
            body,
        }
    }

    /// Build a row from an image, reading key and timestamp from the named fields.
    pub fn from_image(
        image: RowImage,
        key_field: &str,
        timestamp_field: &str,
        format: TimestampFormat,
    ) -> DomainResult<Self> {
        let key = image.key(key_field)?;
        let updated_at = image.timestamp(timestamp_field, format)?;
        Ok(Self::new(key, updated_at, image.into_value()))
    }
}

/// Where a pipeline finds the key and change timestamp in its row images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIdentity {
    pub key_field: String,
    pub timestamp_field: String,
    #[serde(default)]
    pub timestamp_format: TimestampFormat,
}

impl RowIdentity {
    pub fn new(key_field: impl Into<String>, timestamp_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            timestamp_field: timestamp_field.into(),
            timestamp_format: TimestampFormat::default(),
        }
    }

    pub fn with_timestamp_format(mut self, format: TimestampFormat) -> Self {
        self.timestamp_format = format;
        self
    }

    pub fn row(&self, image: RowImage) -> DomainResult<Row> {
        Row::from_image(
            image,
            &self.key_field,
            &self.timestamp_field,
            self.timestamp_format,
        )
    }
}
