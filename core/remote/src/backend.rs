//! Remote backend trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use offsync_common::{Error, HttpMethod, Result};

use crate::query::Query;

/// Generic HTTP-shaped request, used to replay captured transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Absolute URL, or a path resolved against the backend's base URL.
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Response to an `HttpRequest`. Non-2xx statuses are returned, not raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body; `Null` when the body was empty or not JSON.
    pub body: Value,
}

impl HttpResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the backend reported a write conflict (HTTP 409).
    pub fn is_conflict(&self) -> bool {
        self.status == 409
    }

    /// Convert a non-2xx response into `Error::Remote`.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let message = match &self.body {
            Value::Null => String::new(),
            Value::String(text) => text.clone(),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        };
        Err(Error::Remote {
            status: self.status,
            message,
        })
    }
}

/// Read the `id` field of a row as a string.
pub fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Backend the offline core talks to when online.
///
/// Implementations must be thread-safe. Transport failures surface as
/// `Network` or `Timeout`; application-level failures as `Remote`.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Issue a raw HTTP-shaped request.
    ///
    /// # Errors
    /// - `Network`/`Timeout` when no response was received
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Run a query against a table.
    async fn select(&self, query: &Query) -> Result<Vec<Value>>;

    /// Fetch one row by id.
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Value>>;

    /// Insert rows and return them as stored by the server.
    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>>;

    /// Patch one row and return it as stored by the server.
    ///
    /// # Errors
    /// - `NotFound` if no row has this id
    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value>;

    /// Delete one row.
    ///
    /// # Errors
    /// - `NotFound` if no row has this id
    async fn delete(&self, table: &str, id: &str) -> Result<()>;
}
