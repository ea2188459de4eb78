//! Session constants
//!
//! Storage keys are combined with a caller-chosen namespace prefix (see
//! `StorageKeys`). The refresh path is relative to the API base URL.

/// Authorization scheme used in the `Authorization` header
pub const TOKEN_TYPE: &str = "Bearer";

/// Storage key for the raw access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Storage key for the expiry, as unix epoch milliseconds
pub const TOKEN_EXPIRES_KEY: &str = "tokenExpiresAt";

/// Default refresh endpoint path
pub const REFRESH_TOKEN_PATH: &str = "/auth/refresh";

/// A credential counts as expired this long before its real expiry, so a
/// request is never sent with a token that lapses mid-flight.
pub const EXPIRY_SKEW_MILLIS: u64 = 5_000;
