//! Interceptor pipeline
//!
//! Every request passes an outgoing hook (credential, correlation id, content
//! type) and its result passes an incoming hook that classifies failures and
//! recovers from 401s through the singleflight refresh in `refresh.rs`.
//!
//! Incoming decisions, in order:
//!
//! 1. 2xx passes through.
//! 2. Non-401, or a request already re-dispatched after a refresh, fails with
//!    the classified error.
//! 3. A 401 from the refresh endpoint itself ends the session.
//! 4. A 401 on a `public` or `optional` request fails without refreshing.
//! 5. A 401 on a `default` request waits for (or starts) the refresh, then is
//!    re-dispatched exactly once with the new token.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::Secret;
use session::{REFRESH_TOKEN_PATH, TOKEN_TYPE, TokenManager};
use tracing::{debug, instrument, warn};
use transport::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use transport::{HeaderMap, HeaderName, HeaderValue, OutgoingRequest, RawResponse, Transport, TransportFailure};

use crate::classify::{classify_response, classify_transport};
use crate::descriptor::{AuthMode, RequestDescriptor};
use crate::error::ApiError;
use crate::executor::{Executor, ExecutorOptions};
use crate::metrics;
use crate::refresh::{self, RefreshState};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

static REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Host notification for a terminal refresh failure.
pub type RefreshFailedHook = Arc<dyn Fn() + Send + Sync>;

/// Snapshot of the refresh protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshStatus {
    pub refreshing: bool,
    pub queue_len: usize,
}

pub(crate) struct Inner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) tokens: Arc<TokenManager>,
    pub(crate) refresh_path: String,
    pub(crate) timeout: Duration,
    pub(crate) refresh: Mutex<RefreshState>,
    pub(crate) on_refresh_failed: Option<RefreshFailedHook>,
}

impl Inner {
    pub(crate) fn refresh_state(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_refresh_failed(&self) {
        if let Some(hook) = &self.on_refresh_failed {
            hook();
        }
    }
}

/// Shared handle to one pipeline; clones share the credential and the
/// refresh state.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

pub struct PipelineBuilder {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenManager>,
    refresh_path: String,
    timeout: Duration,
    on_refresh_failed: Option<RefreshFailedHook>,
}

impl PipelineBuilder {
    pub fn new(transport: Arc<dyn Transport>, tokens: Arc<TokenManager>) -> Self {
        Self {
            transport,
            tokens,
            refresh_path: REFRESH_TOKEN_PATH.to_string(),
            timeout: DEFAULT_TIMEOUT,
            on_refresh_failed: None,
        }
    }

    pub fn refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Called once per terminal refresh failure, after the credential is
    /// cleared.
    pub fn on_token_refresh_failed(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_refresh_failed = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            inner: Arc::new(Inner {
                transport: self.transport,
                tokens: self.tokens,
                refresh_path: self.refresh_path,
                timeout: self.timeout,
                refresh: Mutex::new(RefreshState::default()),
                on_refresh_failed: self.on_refresh_failed,
            }),
        }
    }
}

impl Pipeline {
    pub fn builder(transport: Arc<dyn Transport>, tokens: Arc<TokenManager>) -> PipelineBuilder {
        PipelineBuilder::new(transport, tokens)
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.inner.tokens
    }

    pub fn refresh_path(&self) -> &str {
        &self.inner.refresh_path
    }

    pub fn refresh_status(&self) -> RefreshStatus {
        self.inner.refresh_state().status()
    }

    /// New executor bound to this pipeline.
    pub fn executor<T>(&self, options: ExecutorOptions<T>) -> Executor<T>
    where
        T: serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
    {
        Executor::new(self.clone(), options)
    }

    /// Run one request through both hooks.
    ///
    /// Returns the 2xx response or the classified error. If the descriptor
    /// carries a cancellation token, cancelling it resolves this call with a
    /// `Cancelled` error wherever it is, including while queued behind a
    /// refresh.
    #[instrument(skip_all, fields(request_id = %descriptor.request_id(), method = %descriptor.method(), url = %descriptor.url()))]
    pub async fn send(&self, descriptor: &RequestDescriptor) -> Result<RawResponse, ApiError> {
        match descriptor.cancel_token() {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!("request cancelled");
                        Err(ApiError::cancelled("request cancelled"))
                    }
                    result = self.run(descriptor) => result,
                }
            }
            None => self.run(descriptor).await,
        }
    }

    async fn run(&self, descriptor: &RequestDescriptor) -> Result<RawResponse, ApiError> {
        let request = self.outgoing(descriptor, None)?;
        let result = dispatch(&self.inner, request).await;
        self.incoming(descriptor, result).await
    }

    /// Outgoing hook. `token` overrides the stored credential for the
    /// re-dispatch after a refresh.
    fn outgoing(
        &self,
        descriptor: &RequestDescriptor,
        token: Option<&Secret<String>>,
    ) -> Result<OutgoingRequest, ApiError> {
        let mut headers = descriptor.headers().clone();
        if let Ok(value) = HeaderValue::from_str(&descriptor.request_id()) {
            headers.insert(REQUEST_ID.clone(), value);
        }
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }

        match descriptor.mode() {
            AuthMode::Public => {
                headers.remove(AUTHORIZATION);
            }
            AuthMode::Default | AuthMode::Optional => {
                let header = match token {
                    Some(token) => Some(format!("{TOKEN_TYPE} {}", token.expose_str())),
                    None => self.inner.tokens.auth_header(),
                };
                if let Some(header) = header {
                    attach_authorization(&mut headers, &header);
                }
            }
        }

        let body = match descriptor.body() {
            Some(body) => {
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                let bytes = serde_json::to_vec(body).map_err(|e| {
                    ApiError::decode(0, format!("request body is not serializable: {e}"))
                })?;
                Some(Bytes::from(bytes))
            }
            None => None,
        };

        Ok(OutgoingRequest {
            method: descriptor.method().clone(),
            url: descriptor.url().to_string(),
            headers,
            body,
            timeout: descriptor.timeout_override().unwrap_or(self.inner.timeout),
        })
    }

    /// Incoming hook.
    async fn incoming(
        &self,
        descriptor: &RequestDescriptor,
        result: transport::Result<RawResponse>,
    ) -> Result<RawResponse, ApiError> {
        let response = match result {
            Ok(response) if response.is_success() => return Ok(response),
            Ok(response) => response,
            Err(failure) => {
                let error = classify_transport(&failure);
                warn!(error = %error, "no response received");
                return Err(error);
            }
        };

        let error = classify_response(&response);
        if response.status != 401 || descriptor.is_auth_retried() {
            debug!(status = response.status, "request failed");
            return Err(error);
        }

        if self.is_refresh_endpoint(descriptor.url()) {
            warn!("refresh endpoint rejected the session");
            let error = error.into_session_terminated();
            refresh::terminate(&self.inner, &error).await;
            return Err(error);
        }

        match descriptor.mode() {
            AuthMode::Default => {}
            AuthMode::Public | AuthMode::Optional => {
                debug!(mode = ?descriptor.mode(), "401 without refresh");
                return Err(error);
            }
        }

        let token = refresh::acquire(&self.inner).await?;
        let retried = descriptor.for_auth_retry();
        debug!("re-dispatching with refreshed credential");
        let request = self.outgoing(&retried, Some(&token))?;
        settle(dispatch(&self.inner, request).await)
    }

    /// Whether `url` targets the refresh endpoint, by path.
    fn is_refresh_endpoint(&self, url: &str) -> bool {
        request_path(url).trim_end_matches('/')
            == request_path(&self.inner.refresh_path).trim_end_matches('/')
    }
}

/// One exchange raced against the request timeout; a timeout is a status-0
/// failure like any other.
pub(crate) async fn dispatch(
    inner: &Inner,
    request: OutgoingRequest,
) -> transport::Result<RawResponse> {
    let timeout = request.timeout;
    let method = request.method.clone();
    let started = Instant::now();

    let result = match tokio::time::timeout(timeout, inner.transport.send(request)).await {
        Ok(result) => result,
        Err(_) => Err(TransportFailure::Timeout(timeout)),
    };

    let status = result.as_ref().map(|r| r.status).unwrap_or(0);
    metrics::record_request(method.as_str(), status, started.elapsed().as_secs_f64());
    result
}

/// Map a final exchange result to the caller's result, without any recovery.
pub(crate) fn settle(result: transport::Result<RawResponse>) -> Result<RawResponse, ApiError> {
    match result {
        Ok(response) if response.is_success() => Ok(response),
        Ok(response) => Err(classify_response(&response)),
        Err(failure) => Err(classify_transport(&failure)),
    }
}

fn attach_authorization(headers: &mut HeaderMap, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(mut value) => {
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Err(_) => warn!("stored access token is not a valid header value, sending without it"),
    }
}

/// Path component of a path or absolute URL, without query or fragment.
fn request_path(url: &str) -> &str {
    let without_scheme = match url.find("://") {
        Some(i) => {
            let rest = &url[i + 3..];
            rest.find('/').map_or("", |j| &rest[j..])
        }
        None => url,
    };
    let end = without_scheme
        .find(['?', '#'])
        .unwrap_or(without_scheme.len());
    &without_scheme[..end]
}
