//! Token manager: credential semantics on top of a raw `TokenStore`
//!
//! The manager is the only owner of the credential. The store holds two raw
//! fields (access token, expiry in epoch milliseconds); the manager turns them
//! into header values and expiry checks, and replaces them as one store batch
//! so no reader ever pairs a token with another token's expiry.
//!
//! A refresh epoch guards against a refresh resurrecting a session that was
//! cleared while the refresh was in flight: `clear()` bumps the epoch, and
//! `complete_refresh()` refuses tickets taken under an older epoch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::Secret;
use tracing::{debug, info, warn};

use crate::constants::{ACCESS_TOKEN_KEY, EXPIRY_SKEW_MILLIS, TOKEN_EXPIRES_KEY, TOKEN_TYPE};
use crate::store::{FieldChange, TokenStore};

/// The live access credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: Secret<String>,
    /// Expiry as unix epoch milliseconds, if the issuer reported one
    pub expires_at: Option<u64>,
}

impl Credential {
    /// Expired, or within the skew window of expiring, at `now` (epoch ms).
    pub fn is_expired_at(&self, now: u64) -> bool {
        expired_at(self.expires_at, now)
    }
}

/// Fully qualified storage keys for one session namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub access_token: String,
    pub expires_at: String,
}

impl StorageKeys {
    /// Prefix the default field names with `namespace` (may be empty).
    pub fn namespaced(namespace: &str) -> Self {
        Self {
            access_token: format!("{namespace}{ACCESS_TOKEN_KEY}"),
            expires_at: format!("{namespace}{TOKEN_EXPIRES_KEY}"),
        }
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::namespaced("")
    }
}

/// Marker taken when a refresh starts; see `TokenManager::complete_refresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTicket(u64);

/// Owner of the single live credential.
pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    keys: StorageKeys,
    epoch: AtomicU64,
    /// Serializes credential writes and the epoch check that guards them.
    write_lock: tokio::sync::Mutex<()>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self::with_keys(store, StorageKeys::default())
    }

    pub fn with_keys(store: Arc<dyn TokenStore>, keys: StorageKeys) -> Self {
        Self {
            store,
            keys,
            epoch: AtomicU64::new(0),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn keys(&self) -> &StorageKeys {
        &self.keys
    }

    /// Current access token, or `None` if absent or the store is unreadable.
    pub fn access_token(&self) -> Option<Secret<String>> {
        match self.store.get(&self.keys.access_token) {
            Ok(token) => token.filter(|t| !t.is_empty()).map(Secret::new),
            Err(e) => {
                warn!(error = %e, "token store read failed, treating as no credential");
                None
            }
        }
    }

    /// Expiry in epoch milliseconds, if one was stored and parses.
    pub fn expires_at(&self) -> Option<u64> {
        match self.store.get(&self.keys.expires_at) {
            Ok(raw) => parse_expiry(raw),
            Err(e) => {
                warn!(error = %e, "token store read failed, treating expiry as unset");
                None
            }
        }
    }

    /// The full credential, read as one snapshot.
    pub fn credential(&self) -> Option<Credential> {
        let fields = match self
            .store
            .get_many(&[self.keys.access_token.as_str(), self.keys.expires_at.as_str()])
        {
            Ok(fields) => fields,
            Err(e) => {
                warn!(error = %e, "token store read failed, treating as no credential");
                return None;
            }
        };
        let mut fields = fields.into_iter();
        let access_token = fields.next().flatten().filter(|t| !t.is_empty())?;
        Some(Credential {
            access_token: Secret::new(access_token),
            expires_at: parse_expiry(fields.next().flatten()),
        })
    }

    pub fn has_credential(&self) -> bool {
        self.access_token().is_some()
    }

    /// `Authorization` header value for the current credential.
    pub fn auth_header(&self) -> Option<String> {
        self.access_token()
            .map(|token| format!("{TOKEN_TYPE} {}", token.expose_str()))
    }

    /// Whether the credential is expired (or within the skew window of it).
    /// Always false when no expiry was recorded.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// `is_expired` evaluated at an explicit `now` (epoch milliseconds).
    pub fn is_expired_at(&self, now: u64) -> bool {
        expired_at(self.expires_at(), now)
    }

    /// Replace the held credential.
    ///
    /// With `expires_in_secs` the expiry becomes `now + expires_in_secs`;
    /// without it any previous expiry is dropped so it cannot be paired with
    /// the new token.
    pub async fn set_credential(&self, access_token: &str, expires_in_secs: Option<u64>) {
        let _guard = self.write_lock.lock().await;
        self.write_credential(access_token, expires_in_secs).await;
    }

    /// Remove the credential and invalidate any refresh in progress.
    pub async fn clear(&self) {
        let _guard = self.write_lock.lock().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let changes = [
            FieldChange::Remove(self.keys.access_token.as_str()),
            FieldChange::Remove(self.keys.expires_at.as_str()),
        ];
        if let Err(e) = self.store.apply(&changes).await {
            warn!(error = %e, "failed to remove credential");
        }
        info!("credential cleared");
    }

    /// Start bracketing a refresh call.
    pub fn begin_refresh(&self) -> RefreshTicket {
        RefreshTicket(self.epoch.load(Ordering::SeqCst))
    }

    /// Store a refreshed credential unless the session was cleared since
    /// `ticket` was taken. Returns whether the credential was stored.
    pub async fn complete_refresh(
        &self,
        ticket: RefreshTicket,
        access_token: &str,
        expires_in_secs: Option<u64>,
    ) -> bool {
        let _guard = self.write_lock.lock().await;
        if self.epoch.load(Ordering::SeqCst) != ticket.0 {
            debug!("session cleared during refresh, discarding refreshed credential");
            return false;
        }
        self.write_credential(access_token, expires_in_secs).await;
        true
    }

    async fn write_credential(&self, access_token: &str, expires_in_secs: Option<u64>) {
        let expires_at = expires_in_secs
            .map(|secs| now_millis().saturating_add(secs.saturating_mul(1000)).to_string());
        let expiry = match &expires_at {
            Some(millis) => FieldChange::Set(self.keys.expires_at.as_str(), millis.as_str()),
            None => FieldChange::Remove(self.keys.expires_at.as_str()),
        };
        let changes = [FieldChange::Set(self.keys.access_token.as_str(), access_token), expiry];
        if let Err(e) = self.store.apply(&changes).await {
            warn!(error = %e, "failed to persist credential");
        }
        debug!(expires_in_secs, "credential replaced");
    }
}

fn expired_at(expires_at: Option<u64>, now: u64) -> bool {
    expires_at.is_some_and(|expires_at| now >= expires_at.saturating_sub(EXPIRY_SKEW_MILLIS))
}

fn parse_expiry(raw: Option<String>) -> Option<u64> {
    let raw = raw?;
    match raw.parse::<u64>() {
        Ok(millis) => Some(millis),
        Err(e) => {
            warn!(error = %e, "stored expiry is not a millisecond timestamp, ignoring");
            None
        }
    }
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
