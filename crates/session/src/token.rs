//! Refresh endpoint response
//!
//! The refresh call authenticates itself with the session cookie and answers
//! with a new access token. Backends disagree on casing, so both camelCase
//! and snake_case field names are accepted.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Body returned by the refresh endpoint.
///
/// `expires_in` is a delta in seconds from the response time; the
/// `TokenManager` converts it to an absolute expiry when storing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", try_from = "GrantFields")]
pub struct RefreshGrant {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

/// Both spellings of every field; a body may carry either or both, and the
/// snake_case value wins when both are non-empty.
#[derive(Deserialize)]
struct GrantFields {
    access_token: Option<String>,
    #[serde(rename = "accessToken")]
    access_token_camel: Option<String>,
    refresh_token: Option<String>,
    #[serde(rename = "refreshToken")]
    refresh_token_camel: Option<String>,
    expires_in: Option<u64>,
    #[serde(rename = "expiresIn")]
    expires_in_camel: Option<u64>,
}

fn either(snake: Option<String>, camel: Option<String>) -> Option<String> {
    snake.filter(|v| !v.is_empty()).or(camel.filter(|v| !v.is_empty()))
}

impl TryFrom<GrantFields> for RefreshGrant {
    type Error = String;

    fn try_from(fields: GrantFields) -> std::result::Result<Self, Self::Error> {
        let access_token = either(fields.access_token, fields.access_token_camel)
            .ok_or_else(|| "refresh response has no access token".to_string())?;
        Ok(Self {
            access_token,
            refresh_token: either(fields.refresh_token, fields.refresh_token_camel),
            expires_in: fields.expires_in.or(fields.expires_in_camel),
        })
    }
}

impl RefreshGrant {
    /// Parse a refresh response body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| Error::Parse(format!("invalid refresh response: {e}")))
    }
}
