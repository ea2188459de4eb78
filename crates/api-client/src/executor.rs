//! Request executor
//!
//! One executor owns one `RequestState` and at most one in-flight call. A new
//! `execute` cancels the previous call (last call wins); a cancelled call
//! resolves to `Ok(None)` and leaves the state alone. Optional debounce delays
//! dispatch until calls stop arriving; optional retry re-runs transient
//! failures with exponential backoff, each attempt on a fresh descriptor with
//! its own cancellation handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use transport::RawResponse;

use crate::descriptor::RequestDescriptor;
use crate::error::ApiError;
use crate::metrics;
use crate::pipeline::Pipeline;
use crate::retry::RetryPolicy;
use crate::state::{ApiResponse, RequestState};

pub type SuccessHook<T> = Arc<dyn Fn(&ApiResponse<T>) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&ApiError) + Send + Sync>;
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Per-executor behaviour.
pub struct ExecutorOptions<T> {
    pub initial_data: Option<T>,
    /// Zero disables debouncing
    pub debounce: Duration,
    /// Used when the descriptor carries no policy of its own
    pub retry: Option<RetryPolicy>,
    /// Abort the in-flight call when the executor is dropped
    pub auto_cleanup: bool,
    on_before: Option<Hook>,
    on_success: Option<SuccessHook<T>>,
    on_error: Option<ErrorHook>,
    on_finish: Option<Hook>,
}

impl<T> Default for ExecutorOptions<T> {
    fn default() -> Self {
        Self {
            initial_data: None,
            debounce: Duration::ZERO,
            retry: None,
            auto_cleanup: true,
            on_before: None,
            on_success: None,
            on_error: None,
            on_finish: None,
        }
    }
}

impl<T> ExecutorOptions<T> {
    pub fn initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn auto_cleanup(mut self, enabled: bool) -> Self {
        self.auto_cleanup = enabled;
        self
    }

    /// Runs once per dispatched call, after debounce.
    pub fn on_before(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_before = Some(Arc::new(hook));
        self
    }

    pub fn on_success(mut self, hook: impl Fn(&ApiResponse<T>) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Runs once per failed call, after retries are exhausted.
    pub fn on_error(mut self, hook: impl Fn(&ApiError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Runs after `on_success` or `on_error`; not for cancelled calls.
    pub fn on_finish(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Arc::new(hook));
        self
    }
}

/// Cancellation handle of the call currently in flight.
#[derive(Clone)]
struct InFlight {
    call: u64,
    token: CancellationToken,
}

pub struct Executor<T> {
    pipeline: Pipeline,
    options: ExecutorOptions<T>,
    state: watch::Sender<RequestState<T>>,
    current: Mutex<Option<InFlight>>,
    calls: AtomicU64,
}

impl<T> Executor<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(pipeline: Pipeline, options: ExecutorOptions<T>) -> Self {
        let (state, _) = watch::channel(RequestState::initial(options.initial_data.clone()));
        Self {
            pipeline,
            options,
            state,
            current: Mutex::new(None),
            calls: AtomicU64::new(0),
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> RequestState<T> {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<RequestState<T>> {
        self.state.subscribe()
    }

    /// Run `descriptor` to completion.
    ///
    /// `Ok(Some(data))` on success, `Err` with the classified error once
    /// retries are exhausted, `Ok(None)` if the call was aborted or superseded
    /// before it settled.
    pub async fn execute(&self, descriptor: RequestDescriptor) -> Result<Option<T>, ApiError> {
        let call = self.begin();
        let token = call.token.clone();

        if !self.options.debounce.is_zero() {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(url = %descriptor.url(), "superseded during debounce");
                    return Ok(None);
                }
                _ = tokio::time::sleep(self.options.debounce) => {}
            }
        }

        if let Some(hook) = &self.options.on_before {
            hook();
        }
        self.state.send_modify(|state| {
            state.loading = true;
            state.error = None;
        });

        let outcome = match descriptor.cancel_token().cloned() {
            Some(external) => {
                tokio::select! {
                    _ = external.cancelled() => {
                        self.cancel_if_current(&call, "caller cancelled");
                        None
                    }
                    outcome = self.attempts(&descriptor, &token) => outcome,
                }
            }
            None => self.attempts(&descriptor, &token).await,
        };
        let Some(outcome) = outcome else {
            return Ok(None);
        };

        // Settle only if nobody aborted us since; the check runs under the
        // state lock so an abort cannot interleave with the update
        let settled = self.state.send_if_modified(|state| {
            if token.is_cancelled() {
                return false;
            }
            state.loading = false;
            match &outcome {
                Ok(response) => {
                    state.data = Some(response.data.clone());
                    state.error = None;
                    state.status_code = Some(response.status);
                    state.response = Some(response.clone());
                }
                Err(error) => {
                    state.error = Some(error.clone());
                    state.status_code = Some(error.status);
                }
            }
            true
        });
        if !settled {
            return Ok(None);
        }
        self.release(&call);

        match outcome {
            Ok(response) => {
                if let Some(hook) = &self.options.on_success {
                    hook(&response);
                }
                self.finish();
                Ok(Some(response.data))
            }
            Err(error) => {
                if let Some(hook) = &self.options.on_error {
                    hook(&error);
                }
                self.finish();
                Err(error)
            }
        }
    }

    /// Cancel the in-flight call, if any. Its `execute` resolves to `Ok(None)`.
    pub fn abort(&self, reason: Option<&str>) {
        let call = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(call) = call {
            call.token.cancel();
            debug!(reason = reason.unwrap_or("aborted"), "request aborted");
        }
        self.state.send_if_modified(|state| {
            let was_loading = state.loading;
            state.loading = false;
            was_loading
        });
    }

    /// Abort and restore the initial state.
    pub fn reset(&self) {
        self.abort(Some("reset"));
        self.state
            .send_replace(RequestState::initial(self.options.initial_data.clone()));
    }

    /// Bounded retry loop. `None` means cancelled.
    async fn attempts(
        &self,
        descriptor: &RequestDescriptor,
        token: &CancellationToken,
    ) -> Option<Result<ApiResponse<T>, ApiError>> {
        let policy = descriptor
            .retry_policy()
            .or(self.options.retry.as_ref())
            .cloned();
        let mut attempt = 0;

        loop {
            let request = descriptor.next_attempt(attempt, token.child_token());
            let result = self
                .pipeline
                .send(&request)
                .await
                .and_then(decode::<T>);

            let error = match result {
                Ok(response) => return Some(Ok(response)),
                Err(_) if token.is_cancelled() => return None,
                Err(error) if error.is_cancelled() => return None,
                Err(error) => error,
            };

            let Some(delay) = policy.as_ref().and_then(|p| p.next_delay(attempt, &error)) else {
                return Some(Err(error));
            };
            attempt += 1;
            warn!(
                request_id = %request.request_id(),
                attempt,
                status = error.status,
                delay_ms = delay.as_millis() as u64,
                "request failed, retrying"
            );
            metrics::record_retry();

            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Install a new cancellation handle, cancelling the previous call.
    fn begin(&self) -> InFlight {
        let call = InFlight {
            call: self.calls.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(call.clone());
        if let Some(previous) = previous {
            debug!(superseded = previous.call, "cancelling previous call");
            previous.token.cancel();
        }
        call
    }

    fn is_current(&self, call: &InFlight) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|current| current.call == call.call)
    }

    /// Forget `call` if it is still the in-flight one.
    fn release(&self, call: &InFlight) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|c| c.call == call.call) {
            *current = None;
        }
    }

    fn cancel_if_current(&self, call: &InFlight, reason: &str) {
        if self.is_current(call) {
            self.abort(Some(reason));
        } else {
            call.token.cancel();
        }
    }

    fn finish(&self) {
        if let Some(hook) = &self.options.on_finish {
            hook();
        }
    }
}

impl<T> Drop for Executor<T> {
    fn drop(&mut self) {
        if !self.options.auto_cleanup {
            return;
        }
        let current = self
            .current
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(call) = current {
            call.token.cancel();
            debug!("executor dropped, in-flight request aborted");
        }
    }
}

/// Decode a 2xx body; an empty body reads as JSON `null`.
fn decode<T: DeserializeOwned>(raw: RawResponse) -> Result<ApiResponse<T>, ApiError> {
    let body: &[u8] = if raw.body.is_empty() { b"null" } else { &raw.body };
    let data = serde_json::from_slice(body).map_err(|e| {
        ApiError::decode(raw.status, format!("unexpected response body: {e}"))
    })?;
    Ok(ApiResponse {
        data,
        status: raw.status,
        headers: raw.headers,
    })
}
