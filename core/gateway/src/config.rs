//! Gateway configuration and per-call options.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use offsync_common::ConcurrencyToken;

/// Default lifetime of cached query results.
pub const DEFAULT_TTL_MINUTES: i64 = 60;

/// Gateway-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub default_ttl_minutes: i64,
    /// Master switch for caching reads and serving them offline.
    pub cache_enabled: bool,
    /// Retry budget of queued writes.
    pub max_retries: u32,
    /// Bound on every online backend call.
    pub request_timeout: Duration,
    pub concurrency_token: ConcurrencyToken,
}

impl GatewayConfig {
    pub fn with_default_ttl(mut self, minutes: i64) -> Self {
        self.default_ttl_minutes = minutes;
        self
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_concurrency_token(mut self, token: ConcurrencyToken) -> Self {
        self.concurrency_token = token;
        self
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_ttl_minutes: DEFAULT_TTL_MINUTES,
            cache_enabled: true,
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
            concurrency_token: ConcurrencyToken::default(),
        }
    }
}

/// Options of a single read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Read and write the cache for this call.
    pub use_cache: bool,
    /// Serve a fresh cached copy without touching the network.
    pub cache_first: bool,
    /// Override of the gateway's default TTL.
    pub ttl_minutes: Option<i64>,
}

impl ReadOptions {
    /// Bypass the cache entirely.
    pub fn no_cache() -> Self {
        Self {
            use_cache: false,
            ..Self::default()
        }
    }

    pub fn cache_first() -> Self {
        Self {
            cache_first: true,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, minutes: i64) -> Self {
        self.ttl_minutes = Some(minutes);
        self
    }
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            cache_first: false,
            ttl_minutes: None,
        }
    }
}

/// Result of a gateway call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayResponse {
    pub data: Value,
    /// `true` for cached reads and for optimistic offline writes.
    pub from_cache: bool,
    /// Sync queue items created by an offline write.
    pub queued: Vec<i64>,
    /// Transaction recorded by an offline raw request.
    pub transaction_id: Option<i64>,
}

impl GatewayResponse {
    pub(crate) fn remote(data: Value) -> Self {
        Self {
            data,
            from_cache: false,
            queued: Vec::new(),
            transaction_id: None,
        }
    }

    pub(crate) fn cached(data: Value) -> Self {
        Self {
            data,
            from_cache: true,
            queued: Vec::new(),
            transaction_id: None,
        }
    }

    pub(crate) fn queued(data: Value, queued: Vec<i64>) -> Self {
        Self {
            data,
            from_cache: true,
            queued,
            transaction_id: None,
        }
    }

    /// Whether the write still has to reach the server.
    pub fn is_pending(&self) -> bool {
        !self.queued.is_empty() || self.transaction_id.is_some()
    }
}
