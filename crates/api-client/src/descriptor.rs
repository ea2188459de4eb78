//! Request descriptors
//!
//! A descriptor is everything the pipeline needs to perform one logical
//! request. Builders consume and return `self`; once handed to the pipeline a
//! descriptor is only read. Each retry attempt gets a derived descriptor that
//! keeps the same `id` so log lines and `x-request-id` correlate across
//! attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use transport::{HeaderMap, HeaderName, HeaderValue, Method};
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// How a request relates to the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Attach the credential; refresh and retry once on 401
    #[default]
    Default,
    /// Never attach the credential, never refresh
    Public,
    /// Attach the credential if held; a 401 is returned as-is
    Optional,
}

#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    id: Uuid,
    method: Method,
    url: String,
    body: Option<serde_json::Value>,
    headers: HeaderMap,
    auth_mode: AuthMode,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
    cancel: Option<CancellationToken>,
    attempt: u32,
    auth_retried: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            url: url.into(),
            body: None,
            headers: HeaderMap::new(),
            auth_mode: AuthMode::Default,
            timeout: None,
            retry: None,
            cancel: None,
            attempt: 0,
            auth_retried: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// JSON request body.
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = mode;
        self
    }

    /// Overrides the pipeline's default timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the executor's retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Cancelling `token` aborts the request wherever it is.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Value of the `x-request-id` header.
    pub fn request_id(&self) -> String {
        format!("req_{}", self.id.simple())
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn body(&self) -> Option<&serde_json::Value> {
        self.body.as_ref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn mode(&self) -> AuthMode {
        self.auth_mode
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// Executor attempt number, 0 for the first.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether this is the re-dispatch after a token refresh.
    pub fn is_auth_retried(&self) -> bool {
        self.auth_retried
    }

    /// Derived descriptor for executor attempt `attempt`, with its own
    /// cancellation handle.
    pub(crate) fn next_attempt(&self, attempt: u32, cancel: CancellationToken) -> Self {
        let mut next = self.clone();
        next.attempt = attempt;
        next.cancel = Some(cancel);
        next.auth_retried = false;
        next
    }

    /// Derived descriptor for the single re-dispatch after a refresh.
    pub(crate) fn for_auth_retry(&self) -> Self {
        let mut next = self.clone();
        next.auth_retried = true;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_method() {
        assert_eq!(RequestDescriptor::get("/a").method(), Method::GET);
        assert_eq!(RequestDescriptor::post("/a").method(), Method::POST);
        assert_eq!(RequestDescriptor::put("/a").method(), Method::PUT);
        assert_eq!(RequestDescriptor::patch("/a").method(), Method::PATCH);
        assert_eq!(RequestDescriptor::delete("/a").method(), Method::DELETE);
    }

    #[test]
    fn defaults() {
        let descriptor = RequestDescriptor::get("/users/me");
        assert_eq!(descriptor.url(), "/users/me");
        assert_eq!(descriptor.mode(), AuthMode::Default);
        assert_eq!(descriptor.body(), None);
        assert_eq!(descriptor.timeout_override(), None);
        assert_eq!(descriptor.attempt(), 0);
        assert!(!descriptor.is_auth_retried());
        assert!(descriptor.cancel_token().is_none());
    }

    #[test]
    fn request_id_is_prefixed_hex() {
        let descriptor = RequestDescriptor::get("/a");
        let id = descriptor.request_id();
        assert!(id.starts_with("req_"));
        assert_eq!(id.len(), 4 + 32);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn derived_descriptors_keep_identity() {
        let original = RequestDescriptor::post("/orders")
            .json(serde_json::json!({"sku": "A1"}))
            .auth_mode(AuthMode::Optional);

        let retried = original.for_auth_retry();
        assert_eq!(retried.id(), original.id());
        assert!(retried.is_auth_retried());
        assert!(!original.is_auth_retried());

        let token = CancellationToken::new();
        let second = retried.next_attempt(1, token.clone());
        assert_eq!(second.id(), original.id());
        assert_eq!(second.attempt(), 1);
        assert!(!second.is_auth_retried(), "each attempt may refresh again");
        assert_eq!(second.body(), original.body());
        assert_eq!(second.mode(), AuthMode::Optional);

        token.cancel();
        assert!(second.cancel_token().unwrap().is_cancelled());
    }

    #[test]
    fn auth_mode_parses_lowercase() {
        let mode: AuthMode = serde_json::from_str(r#""public""#).unwrap();
        assert_eq!(mode, AuthMode::Public);
    }
}
