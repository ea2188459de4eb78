//! Client metrics
//!
//! Recorded through the `metrics` facade; the host decides whether a recorder
//! is installed. Without one these calls are no-ops.
//!
//! - `api_requests_total` (counter): labels `method`, `status` (0 = no response)
//! - `api_request_duration_seconds` (histogram): label `status`
//! - `api_token_refresh_total` (counter): label `outcome`
//! - `api_retries_total` (counter)

/// Histogram buckets for `api_request_duration_seconds`, 5ms to 60s.
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Outcome label values for `api_token_refresh_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Success,
    Failure,
    /// The session was cleared while the refresh was in flight
    Discarded,
}

impl RefreshOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Success => "success",
            RefreshOutcome::Failure => "failure",
            RefreshOutcome::Discarded => "discarded",
        }
    }
}

/// Record one transport exchange.
pub fn record_request(method: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    metrics::counter!("api_requests_total", "method" => method.to_string(), "status" => status.clone())
        .increment(1);
    metrics::histogram!("api_request_duration_seconds", "status" => status).record(duration_secs);
}

pub fn record_refresh(outcome: RefreshOutcome) {
    metrics::counter!("api_token_refresh_total", "outcome" => outcome.as_str()).increment(1);
}

pub fn record_retry() {
    metrics::counter!("api_retries_total").increment(1);
}
