//! Singleflight token refresh
//!
//! The first request to need a new token becomes the leader: it flips the
//! state to refreshing and spawns the refresh on its own task. Requests that
//! arrive while the refresh is in flight queue a oneshot and wait. The
//! refresh task drains the queue exactly once: all waiters get the new token
//! or all get the same error. Flipping back to idle and taking the queue
//! happen under one lock, so no request can observe "refreshing" after the
//! drain and wait forever.
//!
//! The refreshing flag belongs to the refresh task. Nothing else resets it,
//! so at most one refresh call is in flight however sessions end around it.
//!
//! Running the refresh on a spawned task means cancelling the leader's request
//! does not abandon the waiters. If the task panics, its drain guard rejects
//! the queue on unwind and the supervising task ends the session.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use common::Secret;
use session::RefreshGrant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use transport::header::CONTENT_TYPE;
use transport::{HeaderMap, HeaderValue, Method, OutgoingRequest};

use crate::error::ApiError;
use crate::metrics::{self, RefreshOutcome};
use crate::pipeline::{Inner, RefreshStatus, dispatch, settle};

type TokenResult = Result<Secret<String>, ApiError>;

const ABORTED: &str = "token refresh aborted";

struct Waiter {
    id: u64,
    tx: oneshot::Sender<TokenResult>,
}

/// Refresh flag plus the requests stalled on it.
#[derive(Default)]
pub(crate) struct RefreshState {
    refreshing: bool,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
}

impl RefreshState {
    pub(crate) fn status(&self) -> RefreshStatus {
        RefreshStatus {
            refreshing: self.refreshing,
            queue_len: self.queue.len(),
        }
    }

    /// Back to idle and hand over every waiter, in one critical section.
    fn drain(&mut self) -> VecDeque<Waiter> {
        self.refreshing = false;
        self.take_queue()
    }

    /// Hand over every waiter, leaving the flag to its owner.
    fn take_queue(&mut self) -> VecDeque<Waiter> {
        std::mem::take(&mut self.queue)
    }
}

enum Role {
    Leader,
    Waiter {
        id: u64,
        rx: oneshot::Receiver<TokenResult>,
    },
}

/// Wait for a fresh token, starting the refresh if none is in flight.
pub(crate) async fn acquire(inner: &Arc<Inner>) -> TokenResult {
    let role = {
        let mut state = inner.refresh_state();
        if state.refreshing {
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter { id, tx });
            debug!(waiter = id, queue_len = state.queue.len(), "refresh in flight, queued");
            Role::Waiter { id, rx }
        } else {
            state.refreshing = true;
            Role::Leader
        }
    };

    match role {
        Role::Leader => match tokio::spawn(supervise(inner.clone())).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "refresh supervisor failed");
                Err(ApiError::session_terminated(ABORTED))
            }
        },
        Role::Waiter { id, rx } => {
            let _slot = QueueSlot {
                inner: inner.clone(),
                id,
            };
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(ApiError::session_terminated("token refresh abandoned")),
            }
        }
    }
}

/// End the session after the refresh endpoint itself answered 401.
///
/// Queued waiters are rejected now. A refresh still in flight keeps the
/// flag; its result is discarded because the credential was cleared.
pub(crate) async fn terminate(inner: &Inner, cause: &ApiError) {
    inner.tokens.clear().await;
    let waiters = inner.refresh_state().take_queue();
    let rejected = reject_all(waiters, cause);
    warn!(rejected, "session terminated");
    metrics::record_refresh(RefreshOutcome::Failure);
    inner.notify_refresh_failed();
}

/// Run the refresh and treat a crash of it as a terminal failure.
async fn supervise(inner: Arc<Inner>) -> TokenResult {
    match tokio::spawn(run(inner.clone())).await {
        Ok(result) => result,
        Err(e) => {
            let error = ApiError::session_terminated(ABORTED);
            inner.tokens.clear().await;
            let rejected = reject_all(inner.refresh_state().drain(), &error);
            error!(error = %e, rejected, "token refresh crashed, session terminated");
            metrics::record_refresh(RefreshOutcome::Failure);
            inner.notify_refresh_failed();
            Err(error)
        }
    }
}

async fn run(inner: Arc<Inner>) -> TokenResult {
    let mut drain = DrainGuard {
        inner: inner.clone(),
        settled: false,
    };
    let ticket = inner.tokens.begin_refresh();
    info!("refreshing access token");

    let grant = match request_grant(&inner).await {
        Ok(grant) => grant,
        Err(cause) => {
            let error = cause.into_session_terminated();
            inner.tokens.clear().await;
            let rejected = drain.reject(&error);
            warn!(error = %error, rejected, "token refresh failed, session terminated");
            metrics::record_refresh(RefreshOutcome::Failure);
            inner.notify_refresh_failed();
            return Err(error);
        }
    };

    if !inner
        .tokens
        .complete_refresh(ticket, &grant.access_token, grant.expires_in)
        .await
    {
        let error = ApiError::session_terminated("session ended during token refresh");
        let rejected = drain.reject(&error);
        info!(rejected, "refreshed token discarded after logout");
        metrics::record_refresh(RefreshOutcome::Discarded);
        return Err(error);
    }

    let token = Secret::new(grant.access_token);
    let released = drain.resolve(&token);
    info!(released, expires_in = grant.expires_in, "access token refreshed");
    metrics::record_refresh(RefreshOutcome::Success);
    Ok(token)
}

/// POST the refresh endpoint with an empty JSON object and no bearer token;
/// the transport's cookie store authenticates the call.
async fn request_grant(inner: &Inner) -> Result<RefreshGrant, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let request = OutgoingRequest {
        method: Method::POST,
        url: inner.refresh_path.clone(),
        headers,
        body: Some(Bytes::from_static(b"{}")),
        timeout: inner.timeout,
    };

    let response = settle(dispatch(inner, request).await)?;
    RefreshGrant::from_slice(&response.body).map_err(|e| ApiError::decode(response.status, e.to_string()))
}

fn reject_all(waiters: VecDeque<Waiter>, error: &ApiError) -> usize {
    let count = waiters.len();
    for waiter in waiters {
        // Receiver gone means the request was cancelled; nothing to do
        let _ = waiter.tx.send(Err(error.clone()));
    }
    count
}

/// Settles the queue exactly once.
///
/// Dropped unsettled (the refresh panicked), it rejects the waiters queued so
/// far and leaves the flag set; `supervise` ends the session and resets it.
struct DrainGuard {
    inner: Arc<Inner>,
    settled: bool,
}

impl DrainGuard {
    fn take(&mut self) -> VecDeque<Waiter> {
        self.settled = true;
        self.inner.refresh_state().drain()
    }

    fn resolve(&mut self, token: &Secret<String>) -> usize {
        let waiters = self.take();
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.tx.send(Ok(token.clone()));
        }
        count
    }

    fn reject(&mut self, error: &ApiError) -> usize {
        let waiters = self.take();
        reject_all(waiters, error)
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if !self.settled {
            let waiters = self.inner.refresh_state().take_queue();
            let rejected = reject_all(waiters, &ApiError::session_terminated(ABORTED));
            warn!(rejected, "refresh ended without settling its waiters");
        }
    }
}

/// A waiter's place in the queue; removing it on drop keeps a cancelled
/// request from lingering until the drain.
struct QueueSlot {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        let mut state = self.inner.refresh_state();
        let before = state.queue.len();
        state.queue.retain(|waiter| waiter.id != self.id);
        if state.queue.len() < before {
            debug!(waiter = self.id, queue_len = state.queue.len(), "cancelled request left refresh queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter(id: u64) -> (Waiter, oneshot::Receiver<TokenResult>) {
        let (tx, rx) = oneshot::channel();
        (Waiter { id, tx }, rx)
    }

    #[test]
    fn drain_resets_flag_and_empties_queue() {
        let mut state = RefreshState::default();
        state.refreshing = true;
        state.queue.push_back(waiter(0).0);
        state.queue.push_back(waiter(1).0);

        let taken = state.drain();
        assert_eq!(taken.len(), 2);
        assert_eq!(state.status(), RefreshStatus { refreshing: false, queue_len: 0 });
    }

    #[test]
    fn take_queue_leaves_flag_to_its_owner() {
        let mut state = RefreshState::default();
        state.refreshing = true;
        state.queue.push_back(waiter(0).0);

        assert_eq!(state.take_queue().len(), 1);
        assert_eq!(state.status(), RefreshStatus { refreshing: true, queue_len: 0 });
    }

    #[test]
    fn reject_all_reaches_every_waiter_and_skips_dropped_ones() {
        let (a, mut rx_a) = waiter(0);
        let (b, rx_b) = waiter(1);
        drop(rx_b);

        let error = ApiError::session_terminated("refresh token revoked");
        let count = reject_all(VecDeque::from([a, b]), &error);

        assert_eq!(count, 2);
        assert_eq!(rx_a.try_recv().unwrap(), Err(error));
    }
}
