//! OIDC back-channel logout (per the Back-Channel Logout 1.0 spec).
//!
//! The provider POSTs a logout token to a dedicated endpoint; the engine
//! records a logout marker keyed by `issuer|sid` (and `issuer|sub`) in a
//! pluggable store. Stateless cookie sessions cannot be revoked server-side
//! directly, so the marker is consulted on each request: a session whose ID
//! token was issued at or before the marker is treated as logged out.
//!
//! Logging in again writes a newer ID token whose `iat` postdates the
//! marker; the callback route additionally calls [`BackchannelLogout::on_login`]
//! to drop the now-stale markers from the store.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use gatehouse_session::{Session, SessionConfig, decode_claims};

use crate::error::AuthResult;

/// The `events` member a logout token must carry.
const LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

/// The claims the engine needs from a validated logout token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutClaims {
    /// Token issuer; markers are scoped to it.
    pub issuer: String,
    /// Provider session id the logout targets, when present.
    pub sid: Option<String>,
    /// Subject the logout targets, when present.
    pub sub: Option<String>,
    /// When the logout token was issued, unix seconds.
    pub iat: i64,
}

impl LogoutClaims {
    /// Extracts logout claims from a logout token's payload.
    ///
    /// Signature verification is the protocol client's job and must happen
    /// before this is called. Returns `None` when the token is structurally
    /// invalid: missing `iss` or `iat`, neither `sid` nor `sub`, a `nonce`
    /// claim (prohibited, to distinguish logout tokens from ID tokens), or
    /// no back-channel-logout event.
    #[must_use]
    pub fn from_token(raw: &str) -> Option<Self> {
        let claims = decode_claims(raw)?;
        Self::from_claims(&claims)
    }

    /// Extracts logout claims from an already-decoded payload.
    #[must_use]
    pub fn from_claims(claims: &Value) -> Option<Self> {
        if claims.get("nonce").is_some() {
            return None;
        }
        claims
            .get("events")?
            .as_object()?
            .contains_key(LOGOUT_EVENT)
            .then_some(())?;

        let issuer = claims.get("iss")?.as_str()?.to_string();
        let iat = claims.get("iat")?.as_i64()?;
        let sid = claims
            .get("sid")
            .and_then(Value::as_str)
            .map(str::to_string);
        let sub = claims
            .get("sub")
            .and_then(Value::as_str)
            .map(str::to_string);
        if sid.is_none() && sub.is_none() {
            return None;
        }
        Some(Self {
            issuer,
            sid,
            sub,
            iat,
        })
    }

    fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if let Some(sid) = &self.sid {
            keys.push(format!("{}|{sid}", self.issuer));
        }
        if let Some(sub) = &self.sub {
            keys.push(format!("{}|{sub}", self.issuer));
        }
        keys
    }
}

/// Storage for back-channel logout markers.
///
/// The value is the logout token's `iat`. Implementations should honor the
/// TTL hint; a marker older than the longest possible session is dead
/// weight.
#[async_trait]
pub trait LogoutMarkerStore: Send + Sync {
    /// Records a marker.
    async fn set(&self, key: &str, iat: i64, ttl: Option<Duration>) -> AuthResult<()>;

    /// Fetches a marker's `iat`.
    async fn get(&self, key: &str) -> AuthResult<Option<i64>>;

    /// Deletes a marker.
    async fn delete(&self, key: &str) -> AuthResult<()>;
}

/// In-memory marker store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    entries: RwLock<HashMap<String, (i64, Option<Instant>)>>,
}

impl MemoryMarkerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogoutMarkerStore for MemoryMarkerStore {
    async fn set(&self, key: &str, iat: i64, ttl: Option<Duration>) -> AuthResult<()> {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .write()
            .await
            .insert(key.to_string(), (iat, expires));
        Ok(())
    }

    async fn get(&self, key: &str) -> AuthResult<Option<i64>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires)| expires.is_none_or(|at| at > Instant::now()))
            .map(|(iat, _)| *iat))
    }

    async fn delete(&self, key: &str) -> AuthResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Accepts logout tokens and answers per-request revocation checks.
pub struct BackchannelLogout {
    store: Box<dyn LogoutMarkerStore>,
    marker_ttl: Option<Duration>,
}

impl BackchannelLogout {
    /// Creates a registry over the given marker store.
    ///
    /// Markers only need to outlive the session they target, so the TTL
    /// hint is the smaller of the enabled rolling and absolute durations
    /// when both apply. A disabled rolling window does not participate.
    #[must_use]
    pub fn new(store: Box<dyn LogoutMarkerStore>, session_config: &SessionConfig) -> Self {
        let marker_ttl = match (
            session_config.effective_rolling(),
            session_config.absolute_duration,
        ) {
            (Some(r), Some(a)) => Some(r.min(a)),
            (Some(d), None) | (None, Some(d)) => Some(d),
            (None, None) => None,
        };
        Self { store, marker_ttl }
    }

    /// Records a logout token's markers.
    ///
    /// An existing marker with a newer `iat` wins; tokens can arrive out of
    /// order and a replayed old token must not shadow a newer one.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the marker store fails.
    pub async fn on_logout_token(&self, claims: &LogoutClaims) -> AuthResult<()> {
        for key in claims.keys() {
            if let Some(existing) = self.store.get(&key).await?
                && existing >= claims.iat
            {
                debug!(key, "newer logout marker already recorded");
                continue;
            }
            self.store.set(&key, claims.iat, self.marker_ttl).await?;
        }
        info!(issuer = %claims.issuer, "back-channel logout recorded");
        Ok(())
    }

    /// Returns `true` when the session has been logged out behind its back.
    ///
    /// Checks the `issuer|sid` marker first, then `issuer|sub`. A marker
    /// applies only when it was issued at or after the session's ID token;
    /// a fresh login outruns older markers.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the marker store fails.
    pub async fn is_logged_out(&self, session: &mut Session, issuer: &str) -> AuthResult<bool> {
        let login_iat = session.id_token_issued_at();
        for key in session_keys(session, issuer) {
            if let Some(marker_iat) = self.store.get(&key).await?
                && login_iat.is_none_or(|login| marker_iat >= login)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drops any recorded markers for a freshly authenticated session.
    ///
    /// The new ID token already outruns older markers by `iat`; deleting
    /// them keeps the store from serving stale notifications against the
    /// new login.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the marker store fails.
    pub async fn on_login(&self, session: &mut Session, issuer: &str) -> AuthResult<()> {
        for key in session_keys(session, issuer) {
            self.store.delete(&key).await?;
        }
        Ok(())
    }
}

fn session_keys(session: &mut Session, issuer: &str) -> Vec<String> {
    let mut keys = Vec::with_capacity(2);
    if let Some(sid) = session.session_id_claim() {
        keys.push(format!("{issuer}|{sid}"));
    }
    if let Some(sub) = session.subject() {
        keys.push(format!("{issuer}|{sub}"));
    }
    keys
}
