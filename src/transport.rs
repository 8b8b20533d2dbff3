use log::{debug, warn};
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

/// Production API gateway used by the vendor's mobile app.
pub const DEFAULT_BASE_URL: &str = "https://exo9f857n8.execute-api.us-east-2.amazonaws.com/prod";

/// User agent of the mobile app the cloud expects to talk to.
pub const DEFAULT_USER_AGENT: &str = "Smartwater-iOS-prod-3.39.0";

/// Whether a request may be re-sent after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Sent exactly once. Default for POST: a command that timed out may
    /// still have reached the faucet, so the caller has to decide.
    Never,
    /// Read-only request, retried with backoff. Default for GET.
    Idempotent,
    /// Retried with backoff even though it is a write. Reserved for the
    /// stop command.
    SafetyCritical,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Budget for a single HTTP exchange.
    pub timeout: Duration,
    /// Total attempts for [`RetryPolicy::Idempotent`] requests.
    pub max_attempts: u32,
    /// Total attempts for [`RetryPolicy::SafetyCritical`] requests.
    pub safety_critical_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            safety_critical_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl TransportConfig {
    pub fn attempts_for(&self, policy: RetryPolicy) -> u32 {
        match policy {
            RetryPolicy::Never => 1,
            RetryPolicy::Idempotent => self.max_attempts.max(1),
            RetryPolicy::SafetyCritical => self.safety_critical_attempts.max(1),
        }
    }
}

/// A single request against the vendor API, relative to the base URL.
#[derive(Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
    bearer: Option<String>,
    retry: RetryPolicy,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
            bearer: None,
            retry: RetryPolicy::Idempotent,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
            bearer: None,
            retry: RetryPolicy::Never,
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.bearer = Some(token.to_string());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

/// Body of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Json(Value),
    /// Anything that did not parse as JSON, kept for diagnostics.
    Raw(String),
}

impl Body {
    fn parse(text: String) -> Self {
        if text.trim().is_empty() {
            return Body::Empty;
        }
        match serde_json::from_str(&text) {
            Ok(value) => Body::Json(value),
            Err(_) => Body::Raw(text),
        }
    }

    /// The body as text, for logging and error payloads.
    pub fn raw(&self) -> String {
        match self {
            Body::Empty => String::new(),
            Body::Json(value) => value.to_string(),
            Body::Raw(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Body,
}

impl Response {
    /// Deserialize the body into `T`. An empty body decodes as `{}`.
    ///
    /// A body that does not match `T` becomes [`Error::Api`] with the raw
    /// payload attached, so unknown vendor shapes can be captured and
    /// studied later.
    pub fn decode<T: DeserializeOwned>(&self, what: &str) -> Result<T> {
        let value = match &self.body {
            Body::Empty => Value::Object(serde_json::Map::new()),
            Body::Json(value) => value.clone(),
            Body::Raw(text) => {
                warn!("Unrecognized {} response (not JSON): {}", what, text);
                return Err(Error::Api {
                    status: Some(self.status),
                    message: format!("unrecognized {} response", what),
                    payload: text.clone(),
                });
            }
        };

        serde_json::from_value(value).map_err(|e| {
            let payload = self.body.raw();
            warn!("Unrecognized {} response ({}): {}", what, e, payload);
            Error::Api {
                status: Some(self.status),
                message: format!("unrecognized {} response: {}", what, e),
                payload,
            }
        })
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub fn classify(status: StatusCode, path: &str, body: String) -> Error {
    match status.as_u16() {
        401 | 403 => Error::Auth(format!(
            "{} rejected the access token (HTTP {})",
            path,
            status.as_u16()
        )),
        404 => Error::NotFound(path.to_string()),
        429 => Error::Transient(format!("rate limited on {}", path)),
        code if code >= 500 => Error::Transient(format!("server error (HTTP {}) on {}", code, path)),
        code => Error::Api {
            status: Some(code),
            message: format!("{} returned HTTP {}", path, code),
            payload: body,
        },
    }
}

/// Double `current`, capped at `max`.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current * 2, max)
}

/// Thin HTTP layer over `reqwest` with timeouts, retries and error
/// translation.
pub struct Transport {
    client: reqwest::Client,
    base_url: String,
    config: TransportConfig,
    clock: Arc<dyn Clock>,
}

impl Transport {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_config(base_url, TransportConfig::default(), Arc::new(SystemClock))
    }

    pub fn with_config(
        base_url: impl Into<String>,
        config: TransportConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            config,
            clock,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Send `request`, retrying transient failures as its policy allows.
    pub async fn send(&self, request: &Request) -> Result<Response> {
        let attempts = self.config.attempts_for(request.retry);
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 1;

        loop {
            match self.send_once(request).await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "{} {} failed (attempt {}/{}): {}; retrying in {:?}",
                        request.method, request.path, attempt, attempts, e, backoff
                    );
                    self.clock.sleep(backoff).await;
                    backoff = next_backoff(backoff, self.config.max_backoff);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn send_once(&self, request: &Request) -> Result<Response> {
        let url = format!("{}{}", self.base_url, request.path);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header(ACCEPT, HeaderValue::from_static("application/json"));

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!("{} {}", request.method, request.path);

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            Ok(Response {
                status: status.as_u16(),
                body: Body::parse(text),
            })
        } else {
            debug!(
                "{} {} failed with status {}: {}",
                request.method, request.path, status, text
            );
            Err(classify(status, &request.path, text))
        }
    }
}
