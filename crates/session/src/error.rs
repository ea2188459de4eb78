//! Error types for token storage operations

/// Errors from token store backends.
///
/// These stay inside the session crate boundary: `TokenManager` logs them and
/// treats the credential as absent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("token store parse error: {0}")]
    Parse(String),

    #[error("token store unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
