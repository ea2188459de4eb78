//! Executor state

use transport::HeaderMap;

use crate::error::ApiError;

/// A decoded 2xx response.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub data: T,
    pub status: u16,
    pub headers: HeaderMap,
}

impl<T> ApiResponse<T> {
    /// Header value as text, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Observable state of one executor.
#[derive(Debug, Clone)]
pub struct RequestState<T> {
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<ApiError>,
    pub status_code: Option<u16>,
    pub response: Option<ApiResponse<T>>,
}

impl<T> RequestState<T> {
    pub fn initial(data: Option<T>) -> Self {
        Self {
            data,
            loading: false,
            error: None,
            status_code: None,
            response: None,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.loading && self.error.is_none() && self.response.is_some()
    }
}

impl<T> Default for RequestState<T> {
    fn default() -> Self {
        Self::initial(None)
    }
}
