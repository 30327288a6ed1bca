//! Common types used throughout offsync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Identifier of the client installation that produced a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Create a ClientId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "ClientId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random client id.
    pub fn generate() -> Self {
        Self(format!("client-{}", uuid::Uuid::new_v4()))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HTTP-like method of a captured mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "Unsupported HTTP method: {}",
                other
            ))),
        }
    }
}

/// The optimistic-concurrency field every backend record must expose.
///
/// Exactly one token is configured per deployment; records are never probed
/// for whichever field happens to be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "field", rename_all = "snake_case")]
pub enum ConcurrencyToken {
    /// Server-assigned monotonic integer (default field `version`).
    Version(String),
    /// Server-maintained modification timestamp (default field `updated_at`).
    UpdatedAt(String),
}

impl ConcurrencyToken {
    /// Integer `version` field.
    pub fn version() -> Self {
        Self::Version("version".to_string())
    }

    /// Timestamp `updated_at` field.
    pub fn updated_at() -> Self {
        Self::UpdatedAt("updated_at".to_string())
    }

    /// Name of the record field carrying the token.
    pub fn field(&self) -> &str {
        match self {
            Self::Version(field) | Self::UpdatedAt(field) => field,
        }
    }

    /// Read the token from a record, if present and non-null.
    pub fn read(&self, record: &Value) -> Option<Value> {
        record
            .get(self.field())
            .filter(|value| !value.is_null())
            .cloned()
    }

    /// Whether the server token shows a change the client has not seen.
    pub fn server_is_newer(&self, server: &Value, last_known: &Value) -> bool {
        match self {
            Self::Version(_) => match (server.as_i64(), last_known.as_i64()) {
                (Some(server), Some(known)) => server != known,
                _ => server != last_known,
            },
            Self::UpdatedAt(_) => match (parse_timestamp(server), parse_timestamp(last_known)) {
                (Some(server), Some(known)) => server > known,
                _ => server != last_known,
            },
        }
    }
}

impl Default for ConcurrencyToken {
    fn default() -> Self {
        Self::version()
    }
}

/// Parse a timestamp stored either as RFC 3339 text or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(number) => number.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Checksum of a JSON payload (CRC32 of its canonical serialization).
pub fn checksum(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("{:08x}", crc32fast::hash(&bytes))
}
