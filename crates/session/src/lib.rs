//! Access credential storage and lifecycle
//!
//! Holds the single live access credential for an API session. The storage
//! medium is abstracted behind `TokenStore` (raw key/value fields only); the
//! `TokenManager` owns the credential semantics on top of it:
//!
//! 1. Login or refresh stores a credential via `TokenManager::set_credential()`
//! 2. Every outgoing request reads `TokenManager::auth_header()`
//! 3. A refresh brackets its call with `begin_refresh()` / `complete_refresh()`
//! 4. Logout or a terminal refresh failure calls `TokenManager::clear()`
//!
//! Storage failures never propagate out of the manager: an unreadable store
//! behaves as "no credential" so callers degrade to unauthenticated requests.

pub mod constants;
pub mod error;
pub mod manager;
pub mod store;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use manager::{Credential, RefreshTicket, StorageKeys, TokenManager};
pub use store::{FieldChange, FileTokenStore, MemoryTokenStore, StoreFuture, TokenStore};
pub use token::RefreshGrant;
