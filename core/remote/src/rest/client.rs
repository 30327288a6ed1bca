//! PostgREST HTTP client.

use reqwest::{header, Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use offsync_common::{Error, HttpMethod, Result};

use crate::backend::{HttpRequest, HttpResponse};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Connection settings for a PostgREST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`.
    pub base_url: String,
    /// Anonymous/service key sent as `apikey`.
    pub api_key: String,
    /// User access token; falls back to `api_key` as the bearer.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Path of the REST API under `base_url`.
    #[serde(default = "default_rest_path")]
    pub rest_path: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_rest_path() -> String {
    "rest/v1/".to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_user_agent() -> String {
    format!("offsync/{}", env!("CARGO_PKG_VERSION"))
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            access_token: None,
            rest_path: default_rest_path(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            user_agent: default_user_agent(),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Low-level PostgREST client.
pub struct RestClient {
    http: Client,
    base: Url,
    rest: Url,
    api_key: String,
    bearer: String,
    timeout: Duration,
}

impl RestClient {
    /// Create a client.
    ///
    /// # Errors
    /// - `InvalidInput` if `base_url` is not a valid URL
    /// - `Network` if the HTTP client cannot be built
    pub fn new(config: &RestConfig) -> Result<Self> {
        let mut base = Url::parse(&config.base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL: {}", e)))?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let rest = base
            .join(&config.rest_path)
            .map_err(|e| Error::InvalidInput(format!("Invalid REST path: {}", e)))?;

        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            rest,
            api_key: config.api_key.clone(),
            bearer: config
                .access_token
                .clone()
                .unwrap_or_else(|| config.api_key.clone()),
            timeout: config.timeout(),
        })
    }

    /// URL of a table endpoint.
    pub fn table_url(&self, table: &str) -> Result<Url> {
        self.rest
            .join(table)
            .map_err(|e| Error::InvalidInput(format!("Invalid table name {}: {}", table, e)))
    }

    /// Resolve a possibly relative URL against the base URL.
    pub fn resolve(&self, url: &str) -> Result<Url> {
        Url::parse(url)
            .or_else(|_| self.base.join(url.trim_start_matches('/')))
            .map_err(|e| Error::InvalidInput(format!("Invalid URL {}: {}", url, e)))
    }

    /// Request builder with auth headers applied.
    pub fn builder(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.bearer))
    }

    /// Send a request, mapping transport failures.
    pub async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request.send().await.map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::Network(e.to_string())
        }
    }

    /// Replay a raw request. Non-2xx responses are returned as-is.
    pub async fn raw(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = self.resolve(&request.url)?;
        debug!(method = %request.method, %url, "Replaying request");

        let mut builder = self.builder(to_method(request.method), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = self.send(builder).await?;
        let status = response.status().as_u16();
        let headers: BTreeMap<_, _> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    /// Handle API response with error checking.
    pub async fn handle_response(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();

        if status.is_success() {
            let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound("Resource not found".to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Remote {
                status: status.as_u16(),
                message: body,
            })
        }
    }
}

fn to_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = RestClient::new(&RestConfig::new("https://xyz.supabase.co", "anon")).unwrap();
        assert_eq!(
            client.table_url("products").unwrap().as_str(),
            "https://xyz.supabase.co/rest/v1/products"
        );
        assert_eq!(
            client.resolve("/rest/v1/orders?id=eq.1").unwrap().as_str(),
            "https://xyz.supabase.co/rest/v1/orders?id=eq.1"
        );
        assert_eq!(
            client.resolve("https://other.example/x").unwrap().as_str(),
            "https://other.example/x"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            RestClient::new(&RestConfig::new("not a url", "anon")),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_config_defaults() {
        let config: RestConfig =
            serde_json::from_str(r#"{"base_url": "https://h", "api_key": "k"}"#).unwrap();
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.rest_path, "rest/v1/");
        assert!(config.user_agent.starts_with("offsync/"));
    }
}
