//! PostgREST remote backend implementation.

use async_trait::async_trait;
use reqwest::{header, Method};
use serde_json::Value;
use tracing::debug;

use offsync_common::{Error, Result};

use super::client::{RestClient, RestConfig};
use crate::backend::{HttpRequest, HttpResponse, RemoteBackend};
use crate::query::Query;

const RETURN_REPRESENTATION: &str = "return=representation";

/// Backend speaking PostgREST (Supabase `rest/v1`).
pub struct RestBackend {
    client: RestClient,
}

impl RestBackend {
    /// Create a backend.
    ///
    /// # Errors
    /// - Invalid configuration
    pub fn new(config: RestConfig) -> Result<Self> {
        Ok(Self {
            client: RestClient::new(&config)?,
        })
    }

    fn id_filter(id: &str) -> [(&'static str, String); 1] {
        [("id", format!("eq.{}", id))]
    }

    fn rows(value: Value) -> Vec<Value> {
        match value {
            Value::Array(rows) => rows,
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }
}

#[async_trait]
impl RemoteBackend for RestBackend {
    fn name(&self) -> &str {
        "postgrest"
    }

    async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.client.raw(request).await
    }

    async fn select(&self, query: &Query) -> Result<Vec<Value>> {
        let url = self.client.table_url(&query.table)?;
        debug!(table = %query.table, "Selecting rows");
        let request = self
            .client
            .builder(Method::GET, url)
            .query(&query.postgrest_params());
        let response = self.client.send(request).await?;
        Ok(Self::rows(self.client.handle_response(response).await?))
    }

    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let url = self.client.table_url(table)?;
        let request = self
            .client
            .builder(Method::GET, url)
            .query(&Self::id_filter(id))
            .query(&[("limit", "1")]);
        let response = self.client.send(request).await?;
        match self.client.handle_response(response).await {
            Ok(value) => Ok(Self::rows(value).into_iter().next()),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>> {
        let url = self.client.table_url(table)?;
        debug!(table, count = rows.len(), "Inserting rows");
        let request = self
            .client
            .builder(Method::POST, url)
            .header("Prefer", RETURN_REPRESENTATION)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&rows);
        let response = self.client.send(request).await?;
        Ok(Self::rows(self.client.handle_response(response).await?))
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value> {
        let url = self.client.table_url(table)?;
        debug!(table, id, "Updating row");
        let request = self
            .client
            .builder(Method::PATCH, url)
            .query(&Self::id_filter(id))
            .header("Prefer", RETURN_REPRESENTATION)
            .json(&patch);
        let response = self.client.send(request).await?;
        Self::rows(self.client.handle_response(response).await?)
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("{}/{}", table, id)))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let url = self.client.table_url(table)?;
        debug!(table, id, "Deleting row");
        let request = self
            .client
            .builder(Method::DELETE, url)
            .query(&Self::id_filter(id))
            .header("Prefer", RETURN_REPRESENTATION);
        let response = self.client.send(request).await?;
        if Self::rows(self.client.handle_response(response).await?).is_empty() {
            return Err(Error::NotFound(format!("{}/{}", table, id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rows_normalization() {
        assert_eq!(RestBackend::rows(json!([{"id": 1}])).len(), 1);
        assert_eq!(RestBackend::rows(json!({"id": 1})).len(), 1);
        assert!(RestBackend::rows(Value::Null).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_retryable() {
        let backend = RestBackend::new(
            RestConfig::new("http://127.0.0.1:9", "anon")
                .with_timeout(std::time::Duration::from_secs(2)),
        )
        .unwrap();
        let err = backend.fetch("products", "1").await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }
}
