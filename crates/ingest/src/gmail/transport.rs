//! HTTP transport seam for the Gmail client
//!
//! The production transport drives a blocking `ureq` agent from a tokio
//! blocking thread so the client itself stays async.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

/// A GET request against the provider API
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    /// Query parameters; keys may repeat (e.g. `labelIds`)
    pub query: Vec<(String, String)>,
    /// OAuth bearer token
    pub bearer: String,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, bearer: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            bearer: bearer.into(),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// First value of a query parameter
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Status and body of a completed HTTP exchange
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

/// A request that failed below the HTTP status level
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// Timeouts, connect failures and protocol resets are worth retrying
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Other(_))
    }
}

/// Async GET transport
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// `ureq`-backed transport with a per-call timeout
#[derive(Clone)]
pub struct UreqTransport {
    agent: Arc<ureq::Agent>,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            // Status codes are classified by the retry loop, not raised here
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent: Arc::new(agent),
        }
    }

    fn call(agent: &ureq::Agent, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = agent
            .get(&request.url)
            .header("Authorization", &format!("Bearer {}", request.bearer))
            .header("Accept", "application/json");
        for (key, value) in &request.query {
            builder = builder.query(key, value);
        }

        let mut response = builder.call().map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.body_mut().read_to_string().map_err(classify)?;
        Ok(HttpResponse { status, body })
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl HttpTransport for UreqTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let agent = Arc::clone(&self.agent);
        tokio::task::spawn_blocking(move || Self::call(&agent, &request))
            .await
            .map_err(|e| TransportError::Other(format!("HTTP worker failed: {}", e)))?
    }
}

/// Map a ureq error onto the retry taxonomy
fn classify(err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::Timeout(kind) => TransportError::Timeout(format!("{:?}", kind)),
        ureq::Error::ConnectionFailed | ureq::Error::HostNotFound => {
            TransportError::Connect(err.to_string())
        }
        ureq::Error::Protocol(_) => TransportError::Protocol(err.to_string()),
        ureq::Error::Io(io) => match io.kind() {
            ErrorKind::TimedOut => TransportError::Timeout(io.to_string()),
            ErrorKind::ConnectionRefused | ErrorKind::NotConnected => {
                TransportError::Connect(io.to_string())
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => TransportError::Protocol(io.to_string()),
            _ => TransportError::Other(io.to_string()),
        },
        other => TransportError::Other(other.to_string()),
    }
}
