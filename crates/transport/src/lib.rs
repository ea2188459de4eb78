//! Transport abstraction for the authenticated request pipeline
//!
//! Defines the `Transport` trait that decouples the pipeline's auth and retry
//! policy from the HTTP stack. `ReqwestTransport` is the production
//! implementation; tests substitute scripted transports.
//!
//! A transport performs exactly one exchange. It does not interpret status
//! codes: any response that arrives, 2xx or not, is `Ok(RawResponse)`. Only a
//! failure to obtain a response at all is a `TransportFailure`.

pub mod reqwest_transport;

pub use reqwest::Method;
pub use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
pub use reqwest_transport::ReqwestTransport;

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// A fully prepared request, after the outgoing hook has run.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub method: Method,
    /// Path (or absolute URL) of the target; resolved against the transport's base URL
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Upper bound the transport may apply on its own; the pipeline races its
    /// own timer as well
    pub timeout: Duration,
}

/// A response as received, whatever its status.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// No response was obtained.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    #[error("timeout of {}ms exceeded", .0.as_millis())]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Other(String),
}

impl TransportFailure {
    /// Short machine-readable code, in the style of HTTP client error codes.
    pub fn code(&self) -> &'static str {
        match self {
            TransportFailure::Timeout(_) => "ECONNABORTED",
            TransportFailure::Connect(_) => "ERR_NETWORK",
            TransportFailure::Other(_) => "ERR_BAD_REQUEST",
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportFailure>;

/// One HTTP exchange.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Identifier for logging (e.g. "reqwest", "scripted")
    fn id(&self) -> &str;

    /// Send `request` and return whatever response arrives.
    fn send<'a>(
        &'a self,
        request: OutgoingRequest,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse>> + Send + 'a>>;
}
