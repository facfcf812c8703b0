//! External-store session backend.
//!
//! The session body lives in an operator-supplied [`SessionStore`]; the
//! browser carries only a reference cookie with the store key. The key comes
//! from a custom generator when the operator supplies one (typically to reuse
//! the identity provider's own session id, which lets back-channel logout
//! address sessions directly), otherwise from a random UUID.
//!
//! A custom id may be predictable, so it must not be trusted as entropy: with
//! `sign_store_cookie` enabled the reference cookie is HMAC-signed and
//! verified against the full key ring on read.

use std::sync::Arc;

use axum_extra::extract::CookieJar;
use cookie::{Cookie, Expiration};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::{SessionStore, StoredSession};
use crate::SessionResult;
use crate::codec::SessionHeader;
use crate::config::SessionConfig;
use crate::keyring::KeyRing;
use crate::transient::{sign_value, verify_value};

/// Custom session-id generator.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Adapter wrapping an operator-supplied store behind the engine's contract.
#[derive(Clone)]
pub struct ExternalStoreAdapter {
    store: Arc<dyn SessionStore>,
    keyring: Arc<KeyRing>,
    config: SessionConfig,
    genid: Option<IdGenerator>,
}

impl ExternalStoreAdapter {
    /// Creates an adapter over the given store.
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        keyring: Arc<KeyRing>,
        config: SessionConfig,
        genid: Option<IdGenerator>,
    ) -> Self {
        Self {
            store,
            keyring,
            config,
            genid,
        }
    }

    /// Generates a fresh session id.
    #[must_use]
    pub fn generate_id(&self) -> String {
        match &self.genid {
            Some(genid) => genid(),
            None => Uuid::new_v4().to_string(),
        }
    }

    fn signs_cookie(&self) -> bool {
        // A random UUID is its own integrity check; signing only matters
        // when the operator's generator controls the id.
        self.config.sign_store_cookie && self.genid.is_some()
    }

    fn cookie_value(&self, id: &str) -> String {
        if self.signs_cookie() {
            sign_value(self.keyring.current(), id)
        } else {
            id.to_string()
        }
    }

    fn id_from_cookie(&self, value: &str) -> Option<String> {
        if self.signs_cookie() {
            let verified = verify_value(&self.keyring, value);
            if verified.is_none() {
                debug!("store reference cookie failed signature verification");
            }
            verified
        } else {
            Some(value.to_string())
        }
    }

    fn reference_cookie(&self, id: &str, exp: i64) -> Cookie<'static> {
        let cookie_config = &self.config.cookie;
        let mut builder = Cookie::build((self.config.name.clone(), self.cookie_value(id)))
            .http_only(true)
            .secure(cookie_config.secure)
            .same_site(cookie_config.same_site.to_same_site())
            .path(cookie_config.path.clone());
        if let Some(domain) = &cookie_config.domain {
            builder = builder.domain(domain.clone());
        }
        if !self.config.transient
            && let Ok(expires) = OffsetDateTime::from_unix_timestamp(exp)
        {
            builder = builder.expires(Expiration::DateTime(expires));
        }
        builder.build()
    }

    fn removal_cookie(&self) -> Cookie<'static> {
        let mut builder =
            Cookie::build((self.config.name.clone(), "")).path(self.config.cookie.path.clone());
        if let Some(domain) = &self.config.cookie.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }

    /// Loads the session referenced by the cookie.
    ///
    /// Absent cookie, unverifiable cookie, missing store entry, or an expired
    /// header all yield `Ok(None)` (fail open to anonymous). A failing store
    /// is a real error and propagates.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the underlying store fails.
    pub async fn read(
        &self,
        jar: &CookieJar,
    ) -> SessionResult<Option<(String, SessionHeader, Map<String, Value>)>> {
        let Some(cookie) = jar.get(&self.config.name) else {
            return Ok(None);
        };
        let Some(id) = self.id_from_cookie(cookie.value()) else {
            return Ok(None);
        };
        let Some(stored) = self.store.get(&id).await? else {
            return Ok(None);
        };
        if self
            .config
            .is_expired(&stored.header, OffsetDateTime::now_utc())
        {
            debug!(session_id = %id, "stored session is expired, discarding");
            return Ok(None);
        }
        Ok(Some((id, stored.header, stored.data)))
    }

    /// Persists the session and sets the reference cookie.
    ///
    /// `previous_id` is destroyed when it differs from `id` — that is the
    /// fixation defense: after an identity change the old key can no longer
    /// reach the new session.
    ///
    /// # Errors
    ///
    /// Returns a storage error when a store write fails; the caller must not
    /// swallow it, or cookie and store state would diverge.
    pub async fn write(
        &self,
        jar: CookieJar,
        id: &str,
        previous_id: Option<&str>,
        header: SessionHeader,
        data: Map<String, Value>,
    ) -> SessionResult<CookieJar> {
        if let Some(previous) = previous_id
            && previous != id
        {
            self.store.destroy(previous).await?;
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let ttl = u64::try_from(header.exp - now)
            .ok()
            .map(std::time::Duration::from_secs);
        self.store
            .set(id, StoredSession { header, data }, ttl)
            .await?;
        Ok(jar.add(self.reference_cookie(id, header.exp)))
    }

    /// Destroys the store entry and clears the reference cookie.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the destroy fails.
    pub async fn destroy(&self, jar: CookieJar, id: &str) -> SessionResult<CookieJar> {
        self.store.destroy(id).await?;
        Ok(jar.remove(self.removal_cookie()))
    }
}
