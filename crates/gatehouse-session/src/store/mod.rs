//! Session persistence backends.
//!
//! Two backends exist: [`CookieSessionStore`] keeps the encrypted session
//! entirely in cookies (the stateless default), and [`ExternalStoreAdapter`]
//! keeps it in an operator-supplied key/value store behind the
//! [`SessionStore`] contract, with only a reference cookie in the browser.

mod cookie;
mod external;
mod memory;

pub use cookie::{CookieSessionStore, MAX_COOKIE_SIZE, assemble_chunks, split_into_chunks};
pub use external::{ExternalStoreAdapter, IdGenerator};
pub use memory::MemorySessionStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::SessionResult;
use crate::codec::SessionHeader;

/// A session as persisted in an external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    /// Session metadata.
    pub header: SessionHeader,
    /// Session payload.
    pub data: Map<String, Value>,
}

/// Contract an operator-supplied session store must satisfy.
///
/// All methods are async; implementations wrapping synchronous stores can
/// answer immediately. The engine performs no read-modify-write transactions
/// against the store: a session is owned by whichever request holds its
/// cookie, and concurrent writes for the same id are last-write-wins.
///
/// The `ttl` hint on [`set`](SessionStore::set) mirrors the session's
/// computed expiry; stores with native TTL support should honor it so that
/// abandoned sessions age out without a sweeper.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetches a session by id. `None` when absent or already expired.
    async fn get(&self, id: &str) -> SessionResult<Option<StoredSession>>;

    /// Writes a session under the given id.
    async fn set(
        &self,
        id: &str,
        value: StoredSession,
        ttl: Option<std::time::Duration>,
    ) -> SessionResult<()>;

    /// Deletes a session by id. Deleting an absent id is not an error.
    async fn destroy(&self, id: &str) -> SessionResult<()>;
}
