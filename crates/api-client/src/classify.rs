//! Failure classification
//!
//! Turns whatever the transport produced (a non-2xx response or no response
//! at all) into an `ApiError`. Pure: no I/O, no logging.

use std::collections::BTreeMap;

use serde_json::Value;
use transport::{RawResponse, TransportFailure};

use crate::error::{ApiError, ErrorKind};

const FALLBACK_MESSAGE: &str = "Something went wrong";
const NETWORK_MESSAGE: &str = "Network error";

/// Something that did not succeed.
#[derive(Debug, Clone, Copy)]
pub enum RawFailure<'a> {
    /// No response was obtained
    Transport(&'a TransportFailure),
    /// A response arrived with a non-2xx status
    Response(&'a RawResponse),
}

pub fn classify(failure: RawFailure<'_>) -> ApiError {
    match failure {
        RawFailure::Transport(failure) => classify_transport(failure),
        RawFailure::Response(response) => classify_response(response),
    }
}

/// Status 0, message from the failure itself.
pub fn classify_transport(failure: &TransportFailure) -> ApiError {
    let message = failure.to_string();
    let message = if message.trim().is_empty() {
        NETWORK_MESSAGE.to_string()
    } else {
        message
    };
    ApiError::network(message, Some(failure.code()))
}

/// Status from the response; message from body `message`, then body `error`,
/// then the default table.
pub fn classify_response(response: &RawResponse) -> ApiError {
    let status = response.status;
    let body = parse_body(&response.body);
    let object = body.as_ref().and_then(Value::as_object);

    let message = object
        .and_then(|o| non_empty_str(o.get("message")).or_else(|| non_empty_str(o.get("error"))))
        .map(str::to_owned)
        .unwrap_or_else(|| default_message(status).to_string());

    let mut error = ApiError::new(kind_for_status(status), status, message);
    error.code = object.and_then(|o| o.get("code")).and_then(code_string);
    error.field_errors = object.and_then(|o| o.get("errors")).and_then(field_errors);
    error.details = body;
    error
}

/// Default message per status.
pub fn default_message(status: u16) -> &'static str {
    match status {
        400 => "Bad request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not found",
        409 => "Conflict",
        422 => "Validation error",
        429 => "Too many requests",
        500 => "Internal server error",
        502 => "Bad gateway",
        503 => "Service unavailable",
        _ => FALLBACK_MESSAGE,
    }
}

pub fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        0 => ErrorKind::Network,
        401 => ErrorKind::AuthExpired,
        422 => ErrorKind::Validation,
        400..=499 => ErrorKind::Client,
        500..=599 => ErrorKind::Server,
        _ => ErrorKind::Unexpected,
    }
}

/// JSON if it parses, the text otherwise, nothing for an empty body.
fn parse_body(body: &[u8]) -> Option<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match serde_json::from_slice(body) {
        Ok(value) => Some(value),
        Err(_) => Some(Value::String(String::from_utf8_lossy(body).into_owned())),
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn code_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `{"field": ["msg", ...]}`; a bare string stands for a one-element list.
fn field_errors(value: &Value) -> Option<BTreeMap<String, Vec<String>>> {
    let map = value.as_object()?;
    let fields: BTreeMap<String, Vec<String>> = map
        .iter()
        .filter_map(|(field, messages)| {
            let messages: Vec<String> = match messages {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect(),
                _ => return None,
            };
            (!messages.is_empty()).then(|| (field.clone(), messages))
        })
        .collect();
    (!fields.is_empty()).then_some(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn response(status: u16, body: &str) -> RawResponse {
        RawResponse::new(status, body.to_string())
    }

    #[test]
    fn message_comes_from_body_message_first() {
        let error = classify_response(&response(
            400,
            r#"{"message":"email required","error":"bad_request"}"#,
        ));
        assert_eq!(error.status, 400);
        assert_eq!(error.kind, ErrorKind::Client);
        assert_eq!(error.message, "email required");
    }

    #[test]
    fn falls_back_to_body_error() {
        let error = classify_response(&response(403, r#"{"error":"insufficient scope"}"#));
        assert_eq!(error.message, "insufficient scope");
        assert_eq!(error.kind, ErrorKind::Client);
    }

    #[test]
    fn kinds_follow_status_class() {
        assert_eq!(kind_for_status(404), ErrorKind::Client);
        assert_eq!(kind_for_status(429), ErrorKind::Client);
        assert_eq!(kind_for_status(503), ErrorKind::Server);
        assert_eq!(kind_for_status(101), ErrorKind::Unexpected);
        assert_eq!(kind_for_status(304), ErrorKind::Unexpected);
        assert_eq!(kind_for_status(302), ErrorKind::Unexpected);

        let error = classify_response(&response(301, ""));
        assert_eq!(error.kind, ErrorKind::Unexpected);
        assert_eq!(error.message, "Something went wrong");
        assert!(!error.is_transient());
    }

    #[test]
    fn falls_back_to_default_table() {
        let cases = [
            (400, "Bad request"),
            (401, "Unauthorized"),
            (403, "Forbidden"),
            (404, "Not found"),
            (409, "Conflict"),
            (422, "Validation error"),
            (429, "Too many requests"),
            (500, "Internal server error"),
            (502, "Bad gateway"),
            (503, "Service unavailable"),
            (418, "Something went wrong"),
            (504, "Something went wrong"),
        ];
        for (status, expected) in cases {
            let error = classify_response(&response(status, ""));
            assert_eq!(error.message, expected, "status {status}");
            assert_eq!(error.details, None);
        }
    }

    #[test]
    fn blank_message_is_ignored() {
        let error = classify_response(&response(500, r#"{"message":"  "}"#));
        assert_eq!(error.message, "Internal server error");
    }

    #[test]
    fn non_json_body_kept_as_details() {
        let error = classify_response(&response(502, "<html>upstream down</html>"));
        assert_eq!(error.message, "Bad gateway");
        assert_eq!(error.kind, ErrorKind::Server);
        assert_eq!(
            error.details,
            Some(Value::String("<html>upstream down</html>".into()))
        );
    }

    #[test]
    fn validation_body_populates_field_errors() {
        let error = classify_response(&response(
            422,
            r#"{"message":"Invalid input","code":"VALIDATION","errors":{"email":["is taken"],"name":"is blank","age":42}}"#,
        ));
        assert_eq!(error.kind, ErrorKind::Validation);
        assert_eq!(error.code.as_deref(), Some("VALIDATION"));
        let fields = error.field_errors.clone().unwrap();
        assert_eq!(fields.len(), 2, "non-string entries are dropped");
        assert_eq!(fields["email"], vec!["is taken"]);
        assert_eq!(fields["name"], vec!["is blank"]);
        assert!(error.is_validation_error());
    }

    #[test]
    fn numeric_code_is_stringified() {
        let error = classify_response(&response(409, r#"{"code":1042}"#));
        assert_eq!(error.code.as_deref(), Some("1042"));
    }

    #[test]
    fn unauthorized_is_auth_expired() {
        let error = classify_response(&response(401, r#"{"message":"jwt expired"}"#));
        assert_eq!(error.kind, ErrorKind::AuthExpired);
        assert!(error.is_auth_error());
    }

    #[test]
    fn transport_failures_have_status_zero() {
        let error = classify_transport(&TransportFailure::Timeout(Duration::from_secs(30)));
        assert_eq!(error.status, 0);
        assert_eq!(error.kind, ErrorKind::Network);
        assert_eq!(error.message, "timeout of 30000ms exceeded");
        assert_eq!(error.code.as_deref(), Some("ECONNABORTED"));

        let error = classify(RawFailure::Transport(&TransportFailure::Connect(
            "connection refused".into(),
        )));
        assert!(error.is_network_error());
        assert!(error.message.contains("connection refused"));
    }

    #[test]
    fn classify_dispatches_on_failure_kind() {
        let raw = response(404, "");
        let error = classify(RawFailure::Response(&raw));
        assert_eq!(error.status, 404);
        assert_eq!(error.message, "Not found");
    }
}
