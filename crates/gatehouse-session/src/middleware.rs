//! Per-request session orchestration.
//!
//! [`SessionManager`] drives the `NoSession → Loaded → (Mutated)? →
//! Finalized` lifecycle: it loads the session from the configured backend on
//! the way in, exposes it through a [`SessionHandle`] in the request
//! extensions, and writes it back exactly once on the way out.
//!
//! Load failures of the "bad cookie" kind fail open to an anonymous session.
//! Store I/O failures do not: swallowing one would leave the browser's
//! cookie and the store entry describing different worlds, so they surface
//! as 500s even though the inner handler already ran.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use time::OffsetDateTime;
use tracing::{debug, error};

use crate::SessionResult;
use crate::codec::SessionHeader;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::handle::SessionHandle;
use crate::keyring::KeyRing;
use crate::session::Session;
use crate::store::{CookieSessionStore, ExternalStoreAdapter, IdGenerator, SessionStore};

enum Backend {
    Cookie(CookieSessionStore),
    External(ExternalStoreAdapter),
}

/// Loads and persists the session for each request.
pub struct SessionManager {
    backend: Backend,
    config: SessionConfig,
}

impl SessionManager {
    /// Creates a manager over the stateless cookie backend.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the session config is invalid.
    pub fn cookie(keyring: Arc<KeyRing>, config: SessionConfig) -> SessionResult<Self> {
        config
            .validate()
            .map_err(|e| SessionError::configuration(e.to_string()))?;
        Ok(Self {
            backend: Backend::Cookie(CookieSessionStore::new(keyring, config.clone())),
            config,
        })
    }

    /// Creates a manager over an external store.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the session config is invalid.
    pub fn external(
        keyring: Arc<KeyRing>,
        config: SessionConfig,
        store: Arc<dyn SessionStore>,
        genid: Option<IdGenerator>,
    ) -> SessionResult<Self> {
        config
            .validate()
            .map_err(|e| SessionError::configuration(e.to_string()))?;
        Ok(Self {
            backend: Backend::External(ExternalStoreAdapter::new(
                store,
                keyring,
                config.clone(),
                genid,
            )),
            config,
        })
    }

    /// The session configuration this manager was built with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Loads the session from the request's cookies.
    ///
    /// Undecryptable, malformed, or expired sessions yield an anonymous
    /// handle.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the external store fails.
    pub async fn load(&self, jar: &CookieJar) -> SessionResult<SessionHandle> {
        match &self.backend {
            Backend::Cookie(store) => Ok(match store.read(jar) {
                Some((header, values)) => {
                    SessionHandle::loaded(Session::from_values(values), header, None)
                }
                None => SessionHandle::anonymous(),
            }),
            Backend::External(adapter) => Ok(match adapter.read(jar).await? {
                Some((id, header, values)) => {
                    SessionHandle::loaded(Session::from_values(values), header, Some(id))
                }
                None => SessionHandle::anonymous(),
            }),
        }
    }

    /// Writes the session back and returns the jar with cookie changes.
    ///
    /// An empty or cleared session removes the cookies (and the store
    /// entry). Otherwise the header is refreshed — `uat` becomes now, `iat`
    /// is kept unless the backing id is being regenerated — and the payload
    /// is re-encrypted or re-stored.
    ///
    /// # Errors
    ///
    /// Returns a finalize error on double finalization and a storage or
    /// crypto error when the write fails.
    pub async fn finalize(&self, handle: &SessionHandle, jar: CookieJar) -> SessionResult<CookieJar> {
        let state = handle.take_for_finalize()?;
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let session = state.session.filter(|s| !s.is_empty());
        let Some(session) = session else {
            return match &self.backend {
                Backend::Cookie(store) => Ok(store.clear(jar)),
                Backend::External(adapter) => match state.store_id {
                    Some(id) => adapter.destroy(jar, &id).await,
                    None => Ok(jar),
                },
            };
        };

        let iat = if state.regenerate {
            now
        } else {
            state.loaded_header.map_or(now, |h| h.iat)
        };
        let header = SessionHeader {
            iat,
            uat: now,
            exp: self.config.expires_at(iat, now),
        };

        match &self.backend {
            Backend::Cookie(store) => store.write(jar, &header, session.values()),
            Backend::External(adapter) => {
                let previous = state.store_id;
                let id = if state.regenerate || previous.is_none() {
                    adapter.generate_id()
                } else {
                    // Checked above; previous is Some here.
                    previous.clone().unwrap_or_else(|| adapter.generate_id())
                };
                adapter
                    .write(jar, &id, previous.as_deref(), header, session.into_values())
                    .await
            }
        }
    }
}

/// Axum middleware wiring the manager into the request lifecycle.
///
/// Apply with `axum::middleware::from_fn_with_state`. Handlers reach the
/// session via the [`SessionHandle`] request extension.
pub async fn session_middleware(
    State(manager): State<Arc<SessionManager>>,
    mut req: Request,
    next: Next,
) -> Response {
    if req.extensions().get::<SessionHandle>().is_some() {
        // Two session layers on one route is a wiring mistake, not a
        // recoverable condition.
        error!("session middleware invoked re-entrantly on the same request");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "session middleware configured twice",
        )
            .into_response();
    }

    let jar = CookieJar::from_headers(req.headers());
    let handle = match manager.load(&jar).await {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "session load failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "session load failed").into_response();
        }
    };

    req.extensions_mut().insert(handle.clone());
    let response = next.run(req).await;

    match manager.finalize(&handle, jar).await {
        Ok(jar) => (jar, response).into_response(),
        Err(err) => {
            // Headers for the inner response may already be queued; the
            // pipeline still has to see the failure.
            error!(error = %err, "session finalize failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "session write failed").into_response()
        }
    }
}

/// Fetches the session handle installed by [`session_middleware`].
///
/// # Errors
///
/// Returns a configuration error when the middleware is not installed on
/// this route.
pub fn session_from_extensions(
    extensions: &axum::http::Extensions,
) -> SessionResult<SessionHandle> {
    extensions.get::<SessionHandle>().cloned().ok_or_else(|| {
        SessionError::configuration("session middleware is not installed on this route")
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::MemorySessionStore;

    fn keyring() -> Arc<KeyRing> {
        Arc::new(KeyRing::from_secret("test secret").unwrap())
    }

    fn authenticated_session() -> Session {
        let mut session = Session::new();
        session.insert("id_token", json!("a.b.c"));
        session
    }

    #[tokio::test]
    async fn test_cookie_backend_roundtrip() {
        let manager = SessionManager::cookie(keyring(), SessionConfig::default()).unwrap();

        let handle = manager.load(&CookieJar::new()).await.unwrap();
        assert!(!handle.is_authenticated());
        handle.replace(Some(authenticated_session()));

        let jar = manager.finalize(&handle, CookieJar::new()).await.unwrap();
        assert!(jar.get("appSession").is_some());

        // Next request: the session comes back.
        let handle = manager.load(&jar).await.unwrap();
        assert!(handle.is_authenticated());
    }

    #[tokio::test]
    async fn test_cleared_session_clears_cookies() {
        let manager = SessionManager::cookie(keyring(), SessionConfig::default()).unwrap();
        let handle = SessionHandle::anonymous();
        handle.replace(Some(authenticated_session()));
        let jar = manager.finalize(&handle, CookieJar::new()).await.unwrap();

        let handle = manager.load(&jar).await.unwrap();
        handle.clear();
        let jar = manager.finalize(&handle, jar).await.unwrap();
        assert!(jar.get("appSession").is_none());
    }

    #[tokio::test]
    async fn test_external_backend_regenerates_id() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::external(
            keyring(),
            SessionConfig::default(),
            store.clone(),
            None,
        )
        .unwrap();

        let handle = SessionHandle::anonymous();
        handle.replace(Some(authenticated_session()));
        let jar = manager.finalize(&handle, CookieJar::new()).await.unwrap();
        let first_id = jar.get("appSession").unwrap().value().to_string();

        // Re-login as a different identity: the id must change and the old
        // entry must be gone.
        let handle = manager.load(&jar).await.unwrap();
        handle.replace(Some(authenticated_session()));
        handle.mark_regenerate();
        let jar = manager.finalize(&handle, jar).await.unwrap();
        let second_id = jar.get("appSession").unwrap().value().to_string();

        assert_ne!(first_id, second_id);
        assert!(store.get(&first_id).await.unwrap().is_none());
        assert!(store.get(&second_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stable_id_without_regenerate() {
        let store = Arc::new(MemorySessionStore::new());
        let manager =
            SessionManager::external(keyring(), SessionConfig::default(), store, None).unwrap();

        let handle = SessionHandle::anonymous();
        handle.replace(Some(authenticated_session()));
        let jar = manager.finalize(&handle, CookieJar::new()).await.unwrap();
        let first_id = jar.get("appSession").unwrap().value().to_string();

        let handle = manager.load(&jar).await.unwrap();
        let mut session = handle.get().unwrap();
        session.insert("basket", json!("b-1"));
        handle.replace(Some(session));
        let jar = manager.finalize(&handle, jar).await.unwrap();

        assert_eq!(jar.get("appSession").unwrap().value(), first_id);
    }

    #[tokio::test]
    async fn test_double_finalize_is_an_error() {
        let manager = SessionManager::cookie(keyring(), SessionConfig::default()).unwrap();
        let handle = SessionHandle::anonymous();
        manager.finalize(&handle, CookieJar::new()).await.unwrap();
        let err = manager
            .finalize(&handle, CookieJar::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Finalize { .. }));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_setup() {
        let config = SessionConfig {
            rolling: false,
            absolute_duration: None,
            ..SessionConfig::default()
        };
        assert!(SessionManager::cookie(keyring(), config).is_err());
    }
}
