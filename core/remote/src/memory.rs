//! In-memory backend for testing.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use offsync_common::{Error, HttpMethod, Result};

use crate::backend::{row_id, HttpRequest, HttpResponse, RemoteBackend};
use crate::query::Query;

/// Injected failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Transport failure (`Error::Network`).
    Network,
    /// Call timed out (`Error::Timeout`).
    Timeout,
    /// Server answered with this status (`Error::Remote`).
    Status(u16),
}

impl Failure {
    fn to_error(self) -> Error {
        match self {
            Self::Network => Error::Network("injected network failure".to_string()),
            Self::Timeout => Error::Timeout(Duration::from_secs(30)),
            Self::Status(status) => Error::Remote {
                status,
                message: "injected failure".to_string(),
            },
        }
    }
}

/// A call issued against the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// `select`, `fetch`, `insert`, `update`, `delete` or the HTTP method.
    pub operation: String,
    /// Table name, or the URL for raw requests.
    pub target: String,
    pub id: Option<String>,
    pub body: Option<Value>,
}

impl RecordedCall {
    /// Whether the call mutates server state.
    pub fn is_write(&self) -> bool {
        matches!(
            self.operation.as_str(),
            "insert" | "update" | "delete" | "POST" | "PUT" | "PATCH" | "DELETE"
        )
    }
}

#[derive(Default)]
struct State {
    tables: BTreeMap<String, Vec<Value>>,
    next_id: u64,
    calls: Vec<RecordedCall>,
    responses: VecDeque<HttpResponse>,
    failure: Option<Failure>,
}

/// In-process backend.
///
/// Assigns `id`, a monotonic `version` and `updated_at` on every write, the
/// way a database trigger would. Latency and failures can be injected and
/// every call is recorded for assertions.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    latency_ms: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail every call with `failure` until cleared with `None`.
    pub fn set_failure(&self, failure: Option<Failure>) {
        if let Ok(mut state) = self.state.lock() {
            state.failure = failure;
        }
    }

    /// Queue a scripted response for the next raw request.
    pub fn push_response(&self, response: HttpResponse) {
        if let Ok(mut state) = self.state.lock() {
            state.responses.push_back(response);
        }
    }

    /// Insert rows directly, without recording a call.
    pub fn seed(&self, table: &str, rows: Vec<Value>) -> Vec<Value> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };
        rows.into_iter()
            .filter_map(|row| state.insert_row(table, row).ok())
            .collect()
    }

    /// Change a row server-side (as another client would), bumping its version.
    pub fn touch(&self, table: &str, id: &str, patch: Value) -> Option<Value> {
        self.state.lock().ok()?.update_row(table, id, patch).ok()
    }

    /// Current rows of a table.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.state
            .lock()
            .map(|state| state.tables.get(table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Current row by id.
    pub fn row(&self, table: &str, id: &str) -> Option<Value> {
        self.state.lock().ok()?.find(table, id).cloned()
    }

    /// Every call issued so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    /// Number of mutating calls issued so far.
    pub fn write_count(&self) -> usize {
        self.calls().iter().filter(|c| c.is_write()).count()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Network("memory backend lock poisoned".to_string()))
    }

    /// Apply latency, record the call, then fail if a failure is injected.
    async fn begin(&self, call: RecordedCall) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let mut state = self.lock()?;
        state.calls.push(call);
        match state.failure {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl State {
    fn find(&self, table: &str, id: &str) -> Option<&Value> {
        self.tables
            .get(table)?
            .iter()
            .find(|row| row_id(row).as_deref() == Some(id))
    }

    fn insert_row(&mut self, table: &str, row: Value) -> Result<Value> {
        let Value::Object(mut fields) = row else {
            return Err(Error::Remote {
                status: 400,
                message: "row must be a JSON object".to_string(),
            });
        };

        let id = match fields.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                self.next_id += 1;
                fields.insert("id".to_string(), json!(self.next_id));
                self.next_id.to_string()
            }
        };
        if self.find(table, &id).is_some() {
            return Err(Error::Remote {
                status: 409,
                message: format!("duplicate key {}", id),
            });
        }

        fields.insert("version".to_string(), json!(1));
        fields.insert("updated_at".to_string(), json!(now_text()));
        let row = Value::Object(fields);
        self.tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    fn update_row(&mut self, table: &str, id: &str, patch: Value) -> Result<Value> {
        let row = self
            .tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|row| row_id(row).as_deref() == Some(id)))
            .ok_or_else(|| Error::NotFound(format!("{}/{}", table, id)))?;

        let version = row.get("version").and_then(Value::as_i64).unwrap_or(0);
        if let (Value::Object(fields), Value::Object(patch)) = (&mut *row, patch) {
            for (key, value) in patch {
                if key != "id" {
                    fields.insert(key, value);
                }
            }
            fields.insert("version".to_string(), json!(version + 1));
            fields.insert("updated_at".to_string(), json!(now_text()));
        }
        Ok(row.clone())
    }

    fn delete_row(&mut self, table: &str, id: &str) -> Result<()> {
        let rows = self
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", table, id)))?;
        let before = rows.len();
        rows.retain(|row| row_id(row).as_deref() != Some(id));
        if rows.len() == before {
            return Err(Error::NotFound(format!("{}/{}", table, id)));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.begin(RecordedCall {
            operation: request.method.as_str().to_string(),
            target: request.url.clone(),
            id: None,
            body: request.body.clone(),
        })
        .await?;

        let mut state = self.lock()?;
        if let Some(response) = state.responses.pop_front() {
            return Ok(response);
        }
        let status = if request.method == HttpMethod::Post { 201 } else { 200 };
        Ok(HttpResponse::new(status, request.body.unwrap_or(Value::Null)))
    }

    async fn select(&self, query: &Query) -> Result<Vec<Value>> {
        self.begin(RecordedCall {
            operation: "select".to_string(),
            target: query.table.clone(),
            id: None,
            body: None,
        })
        .await?;
        let state = self.lock()?;
        let rows = state.tables.get(&query.table).cloned().unwrap_or_default();
        Ok(query.apply(rows))
    }

    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Value>> {
        self.begin(RecordedCall {
            operation: "fetch".to_string(),
            target: table.to_string(),
            id: Some(id.to_string()),
            body: None,
        })
        .await?;
        Ok(self.lock()?.find(table, id).cloned())
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>> {
        self.begin(RecordedCall {
            operation: "insert".to_string(),
            target: table.to_string(),
            id: None,
            body: Some(Value::Array(rows.clone())),
        })
        .await?;
        let mut state = self.lock()?;
        rows.into_iter()
            .map(|row| state.insert_row(table, row))
            .collect()
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value> {
        self.begin(RecordedCall {
            operation: "update".to_string(),
            target: table.to_string(),
            id: Some(id.to_string()),
            body: Some(patch.clone()),
        })
        .await?;
        self.lock()?.update_row(table, id, patch)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.begin(RecordedCall {
            operation: "delete".to_string(),
            target: table.to_string(),
            id: Some(id.to_string()),
            body: None,
        })
        .await?;
        self.lock()?.delete_row(table, id)
    }
}
