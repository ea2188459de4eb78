//! reqwest-backed transport
//!
//! Resolves request paths against a base URL and performs the exchange with a
//! shared `reqwest::Client`. The client keeps a cookie store so the refresh
//! endpoint can authenticate with the session cookie set at login.

use crate::{OutgoingRequest, RawResponse, Result, Transport, TransportFailure};
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Production transport over `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    /// Build a transport with its own cookie-enabled client.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| TransportFailure::Other(format!("building HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Use an existing client (shared connection pool, custom TLS, ...).
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URLs pass through; paths are joined onto the base URL.
    pub fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if url.starts_with('/') {
            format!("{base}{url}")
        } else {
            format!("{base}/{url}")
        }
    }
}

impl Transport for ReqwestTransport {
    fn id(&self) -> &str {
        "reqwest"
    }

    fn send<'a>(
        &'a self,
        request: OutgoingRequest,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.resolve(&request.url);
            let timeout = request.timeout;

            let mut builder = self
                .client
                .request(request.method, &url)
                .headers(request.headers)
                .timeout(timeout);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    TransportFailure::Timeout(timeout)
                } else if e.is_connect() {
                    TransportFailure::Connect(e.to_string())
                } else {
                    TransportFailure::Other(e.to_string())
                }
            })?;

            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(|e| {
                if e.is_timeout() {
                    TransportFailure::Timeout(timeout)
                } else {
                    TransportFailure::Other(format!("reading response body: {e}"))
                }
            })?;

            debug!(url = %url, status, bytes = body.len(), "exchange complete");
            Ok(RawResponse {
                status,
                headers,
                body,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HeaderMap, HeaderValue, Method};
    use axum::body::Body;
    use axum::http::StatusCode;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Start a mock upstream that echoes method, path, headers and body as JSON,
    /// except `/missing` (404) and `/slow` (sleeps 2s).
    async fn start_echo_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let handle = tokio::spawn(async move {
            let app =
                axum::Router::new().fallback(|request: axum::http::Request<Body>| async move {
                    let path = request.uri().path().to_string();
                    if path == "/missing" {
                        return (
                            StatusCode::NOT_FOUND,
                            [("x-upstream-echo", "true")],
                            axum::Json(serde_json::json!({"message": "no such thing"})),
                        );
                    }
                    if path == "/slow" {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    let mut headers_map = serde_json::Map::new();
                    for (name, value) in request.headers() {
                        headers_map.insert(
                            name.to_string(),
                            serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                        );
                    }
                    let method = request.method().to_string();
                    let body_bytes = axum::body::to_bytes(request.into_body(), 1024 * 1024)
                        .await
                        .unwrap();
                    let body = serde_json::json!({
                        "echoed_headers": headers_map,
                        "method": method,
                        "path": path,
                        "body": String::from_utf8_lossy(&body_bytes),
                    });
                    (StatusCode::OK, [("x-upstream-echo", "true")], axum::Json(body))
                });
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    fn request(method: Method, url: &str) -> OutgoingRequest {
        OutgoingRequest {
            method,
            url: url.to_string(),
            headers: HeaderMap::new(),
            body: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn resolve_joins_paths_onto_base() {
        let transport = ReqwestTransport::new("https://api.example.com/v1/").unwrap();
        assert_eq!(transport.resolve("/me"), "https://api.example.com/v1/me");
        assert_eq!(transport.resolve("me"), "https://api.example.com/v1/me");
        assert_eq!(
            transport.resolve("https://other.example.com/x"),
            "https://other.example.com/x"
        );
    }

    #[tokio::test]
    async fn forwards_method_headers_and_body() {
        let (url, _server) = start_echo_server().await;
        let transport = ReqwestTransport::new(url).unwrap();

        let mut req = request(Method::POST, "/users");
        req.headers
            .insert("authorization", HeaderValue::from_static("Bearer at_1"));
        req.body = Some(bytes::Bytes::from_static(br#"{"name":"ada"}"#));

        let response = transport.send(req).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("x-upstream-echo").unwrap(), "true");

        let echoed: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["path"], "/users");
        assert_eq!(echoed["echoed_headers"]["authorization"], "Bearer at_1");
        assert_eq!(echoed["body"], r#"{"name":"ada"}"#);
    }

    #[tokio::test]
    async fn non_success_status_is_still_a_response() {
        let (url, _server) = start_echo_server().await;
        let transport = ReqwestTransport::new(url).unwrap();

        let response = transport.send(request(Method::GET, "/missing")).await.unwrap();
        assert_eq!(response.status, 404);
        assert!(!response.is_success());
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["message"], "no such thing");
    }

    #[tokio::test]
    async fn connection_refused_is_a_connect_failure() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = ReqwestTransport::new(format!("http://{addr}")).unwrap();
        let err = transport.send(request(Method::GET, "/")).await.unwrap_err();
        assert!(matches!(err, TransportFailure::Connect(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let (url, _server) = start_echo_server().await;
        let transport = ReqwestTransport::new(url).unwrap();

        let mut req = request(Method::GET, "/slow");
        req.timeout = Duration::from_millis(100);
        let err = transport.send(req).await.unwrap_err();
        assert_eq!(err, TransportFailure::Timeout(Duration::from_millis(100)));
    }
}
