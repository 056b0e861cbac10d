//! The upstream content source the core calls through.

use async_trait::async_trait;
use bulwark_core::{SourceError, TtlClass};
use bulwark_storage::fingerprint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Liveness answer from [`ContentSource::ping`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub version: Option<String>,
    pub message: Option<String>,
}

/// An upstream content API.
///
/// Implementations report failures as [`SourceError`]: a raw status and
/// message when the transport exposes them, or an already typed error.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Perform one call.
    async fn fetch(&self, request: &SourceRequest) -> Result<Value, SourceError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<PingResponse, SourceError>;
}

/// Logical request descriptor.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    /// Endpoint or operation name.
    pub endpoint: String,
    pub params: Value,
    /// Fires when the caller gives up on the request.
    pub cancel: Option<CancellationToken>,
    /// Rate-limit key; `None` shares the default window.
    pub caller: Option<String>,
    /// Explicit cache key, overriding the request fingerprint.
    pub cache_key: Option<String>,
    pub ttl_class: TtlClass,
    /// Skip the cache lookup and do not store the response.
    pub bypass_cache: bool,
}

impl SourceRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: Value::Null,
            cancel: None,
            caller: None,
            cache_key: None,
            ttl_class: TtlClass::default(),
            bypass_cache: false,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_ttl_class(mut self, class: TtlClass) -> Self {
        self.ttl_class = class;
        self
    }

    pub fn bypassing_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// The explicit cache key, or the fingerprint of endpoint and params.
    pub fn resolved_cache_key(&self) -> String {
        self.cache_key
            .clone()
            .unwrap_or_else(|| fingerprint(&self.endpoint, &self.params))
    }
}
