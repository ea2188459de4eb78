//! Normalized API error
//!
//! Every failure that leaves the pipeline is an `ApiError`, whatever produced
//! it: a transport failure, a non-2xx response, a body that did not decode, or
//! a cancelled call. `status` is the HTTP status, or 0 when no response was
//! received.

use std::collections::BTreeMap;

use serde::Serialize;

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No response reached us (status 0)
    Network,
    /// 4xx other than 401/422; not retried by default
    Client,
    /// 5xx; retryable
    Server,
    /// 401; absorbed by the refresh protocol where possible
    AuthExpired,
    /// 422 with field-level detail
    Validation,
    /// The refresh itself failed; the credential has been cleared
    SessionTerminated,
    /// The call was aborted or superseded; swallowed by the executor
    Cancelled,
    /// A 2xx body did not match the expected type
    Decode,
    /// A response outside 2xx/4xx/5xx, such as an unfollowed redirect
    Unexpected,
}

/// Normalized error surfaced to callers.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{message} (status {status})")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Per-field validation messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<BTreeMap<String, Vec<String>>>,
    /// Raw response body, when there was one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, status: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status,
            code: None,
            field_errors: None,
            details: None,
        }
    }

    /// Transport-level failure (status 0).
    pub fn network(message: impl Into<String>, code: Option<&str>) -> Self {
        let mut error = Self::new(ErrorKind::Network, 0, message);
        error.code = code.map(str::to_owned);
        error
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        let mut error = Self::new(ErrorKind::Cancelled, 0, reason);
        error.code = Some("ERR_CANCELED".into());
        error
    }

    pub fn decode(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Decode, status, message)
    }

    pub fn session_terminated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionTerminated, 401, message)
    }

    /// Re-label this error as the cause of a terminated session, keeping
    /// status, message and body for diagnostics.
    pub fn into_session_terminated(mut self) -> Self {
        self.kind = ErrorKind::SessionTerminated;
        self
    }

    pub fn is_auth_error(&self) -> bool {
        self.status == 401
    }

    pub fn is_validation_error(&self) -> bool {
        self.status == 422 && self.field_errors.is_some()
    }

    pub fn is_network_error(&self) -> bool {
        self.kind == ErrorKind::Network
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Server errors and transport failures; the default retry predicate.
    /// A terminated session is final whatever status the refresh ended with.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            ErrorKind::Network | ErrorKind::Server => true,
            ErrorKind::Cancelled | ErrorKind::SessionTerminated => false,
            _ => self.status >= 500,
        }
    }

    /// Whether no retry can change the outcome.
    pub fn is_final(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled | ErrorKind::SessionTerminated)
    }

    /// Flatten field errors into `"field: message"` lines, fields in order.
    pub fn validation_messages(&self) -> Vec<String> {
        let Some(fields) = &self.field_errors else {
            return Vec::new();
        };
        fields
            .iter()
            .flat_map(|(field, messages)| {
                messages.iter().map(move |message| format!("{field}: {message}"))
            })
            .collect()
    }
}
