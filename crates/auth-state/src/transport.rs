//! Outbound HTTP to the measurement API
//!
//! `Transport` is the seam between session logic and the network. It owns
//! the ambient default bearer token that every request carries unless the
//! request names its own, so tests can substitute a stub without touching a
//! shared client's configuration.

use std::future::Future;
use std::pin::Pin;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use common::Secret;
use reqwest::{Method, StatusCode};
use tracing::{Instrument, debug, debug_span};

use crate::error::{Error, Result};

/// Boxed future returned by `Transport::send`.
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>>;

/// A request relative to the API base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    /// Bearer for this request only. `None` falls back to the default bearer.
    pub bearer: Option<Secret<String>>,
    pub json: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            bearer: None,
            json: None,
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            ..Self::get(path)
        }
    }

    pub fn bearer(mut self, token: Secret<String>) -> Self {
        self.bearer = Some(token);
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }
}

/// Status and raw body of a completed request.
///
/// Any status counts as completed; only failures to get a response at all
/// are `Error::Transport`.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Request execution plus the ambient default bearer.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Execute a request. Network errors and timeouts are `Error::Transport`.
    fn send(&self, request: ApiRequest) -> TransportFuture<'_>;

    /// Attach `token` to every later request that names no bearer of its own.
    fn set_default_bearer(&self, token: &Secret<String>);

    /// Stop attaching a default bearer.
    fn clear_default_bearer(&self);

    fn default_bearer(&self) -> Option<Secret<String>>;
}

/// reqwest-backed transport rooted at the API base URL.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    default_bearer: RwLock<Option<Secret<String>>>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
            default_bearer: RwLock::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Join a relative endpoint path onto the base URL.
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: ApiRequest) -> TransportFuture<'_> {
        let span = debug_span!("api_request", method = %request.method, path = %request.path);
        let url = self.url_for(&request.path);
        let bearer = request.bearer.or_else(|| self.default_bearer());

        let mut builder = self
            .client
            .request(request.method, &url)
            .timeout(self.timeout);
        if let Some(token) = bearer.as_ref().filter(|t| !t.is_empty()) {
            builder = builder.bearer_auth(token.expose());
        }
        if let Some(body) = request.json.as_ref() {
            builder = builder.json(body);
        }

        Box::pin(async move {
            let response = builder
                .send()
                .await
                .map_err(|e| Error::Transport(format!("request to {url} failed: {e}")))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| Error::Transport(format!("reading response from {url}: {e}")))?;
            debug!(%status, bytes = body.len(), "api response");
            Ok(ApiResponse { status, body })
        }
        .instrument(span))
    }

    fn set_default_bearer(&self, token: &Secret<String>) {
        *self
            .default_bearer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
    }

    fn clear_default_bearer(&self) {
        *self
            .default_bearer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn default_bearer(&self) -> Option<Secret<String>> {
        self.default_bearer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
