//! Scripted transport for pipeline and executor tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use session::{ACCESS_TOKEN_KEY, MemoryTokenStore, TokenManager};
use transport::header::{AUTHORIZATION, CONTENT_TYPE};
use transport::{HeaderMap, HeaderValue, OutgoingRequest, RawResponse, Transport, TransportFailure};

/// What the scripted backend does with one request.
pub(crate) struct Reply {
    outcome: Result<RawResponse, TransportFailure>,
    delay: Duration,
    crash: Option<&'static str>,
}

impl Reply {
    pub(crate) fn json(status: u16, body: serde_json::Value) -> Self {
        let mut response = RawResponse::new(status, body.to_string());
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            outcome: Ok(response),
            delay: Duration::ZERO,
            crash: None,
        }
    }

    pub(crate) fn empty(status: u16) -> Self {
        Self {
            outcome: Ok(RawResponse::new(status, "")),
            delay: Duration::ZERO,
            crash: None,
        }
    }

    pub(crate) fn fail(failure: TransportFailure) -> Self {
        Self {
            outcome: Err(failure),
            delay: Duration::ZERO,
            crash: None,
        }
    }

    /// Panic inside the transport instead of answering.
    pub(crate) fn crash(message: &'static str) -> Self {
        let mut reply = Self::empty(500);
        reply.crash = Some(message);
        reply
    }

    pub(crate) fn header(mut self, name: &'static str, value: &'static str) -> Self {
        if let Ok(response) = &mut self.outcome {
            response.headers.insert(name, HeaderValue::from_static(value));
        }
        self
    }

    /// Answer only after `delay` of (tokio) time.
    pub(crate) fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A request as the transport saw it.
#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub(crate) url: String,
    pub(crate) authorization: Option<String>,
    pub(crate) request_id: Option<String>,
    pub(crate) content_type: Option<String>,
    pub(crate) body: Option<String>,
    pub(crate) at: tokio::time::Instant,
}

type Handler = Box<dyn Fn(&OutgoingRequest) -> Reply + Send + Sync>;

pub(crate) struct ScriptedTransport {
    handler: Handler,
    log: Mutex<Vec<Recorded>>,
}

impl ScriptedTransport {
    pub(crate) fn new(handler: impl Fn(&OutgoingRequest) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn requests_to(&self, url: &str) -> Vec<Recorded> {
        self.requests().into_iter().filter(|r| r.url == url).collect()
    }

    pub(crate) fn count(&self, url: &str) -> usize {
        self.requests_to(url).len()
    }
}

impl Transport for ScriptedTransport {
    fn id(&self) -> &str {
        "scripted"
    }

    fn send<'a>(
        &'a self,
        request: OutgoingRequest,
    ) -> Pin<Box<dyn Future<Output = transport::Result<RawResponse>> + Send + 'a>> {
        self.log.lock().unwrap().push(Recorded {
            url: request.url.clone(),
            authorization: header(&request.headers, AUTHORIZATION.as_str()),
            request_id: header(&request.headers, "x-request-id"),
            content_type: header(&request.headers, CONTENT_TYPE.as_str()),
            body: request
                .body
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned()),
            at: tokio::time::Instant::now(),
        });
        let reply = (self.handler)(&request);

        Box::pin(async move {
            if !reply.delay.is_zero() {
                tokio::time::sleep(reply.delay).await;
            }
            if let Some(message) = reply.crash {
                panic!("{message}");
            }
            reply.outcome
        })
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// `Authorization` header of a request, if any.
pub(crate) fn bearer(request: &OutgoingRequest) -> Option<String> {
    request
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// In-memory session already holding `token`.
pub(crate) fn fresh_session(token: &str) -> Arc<TokenManager> {
    let store = MemoryTokenStore::with_fields([(ACCESS_TOKEN_KEY, token)]);
    Arc::new(TokenManager::new(Arc::new(store)))
}
