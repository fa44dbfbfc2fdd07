use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Post,
    Patch,
    Delete,
}

/// One REST call, relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

/// Status and decoded body. An empty body decodes to `Value::Null`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Value,
}

impl RemoteResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

/// The only I/O boundary of the sync engine. Any HTTP status is a response;
/// `Err` means the request never completed (connect failure, timeout).
pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: RemoteRequest) -> impl Future<Output = Result<RemoteResponse>> + Send;
}

/// Source of the bearer token. Storage of the token lives elsewhere.
pub trait AuthProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;

    /// Called once per pass when the server answers 401/403.
    fn on_unauthorized(&self) {}
}

/// A fixed token, e.g. from `FINTRAX_TOKEN`.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.trim().is_empty()))
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("FINTRAX_TOKEN").ok())
    }
}

impl AuthProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }

    fn on_unauthorized(&self) {
        log::warn!("Server rejected the API token; log in again to resume syncing");
    }
}

/// `reqwest`-backed transport with a per-request timeout.
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
    auth: Arc<dyn AuthProvider>,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("not a base URL: {base_url}")));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self { client, base, auth })
    }

    /// Append `path` to the base URL, keeping any path prefix the base has.
    fn url_for(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            self.base.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let url = self.url_for(&request.path);
        let mut builder = match request.method {
            Method::Post => self.client.post(url),
            Method::Patch => self.client.patch(url),
            Method::Delete => self.client.delete(url),
        };
        if let Some(token) = self.auth.bearer_token() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Config(format!("invalid token: {e}")))?;
            builder = builder.header(AUTHORIZATION, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        // Non-JSON bodies (HTML error pages) are kept as a string
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        log::trace!("{:?} {} -> {status}", request.method, request.path);
        Ok(RemoteResponse { status, body })
    }
}
