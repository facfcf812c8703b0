//! Request-scoped session handle.
//!
//! The handle is the only way request handlers see the session. It enforces
//! two lifecycle rules: the session can only be replaced wholesale (no
//! incremental re-initialization), and it can be taken for finalization
//! exactly once. A second finalize is a checked error, not a silent no-op.

use std::sync::{Arc, Mutex};

use crate::SessionResult;
use crate::codec::SessionHeader;
use crate::error::SessionError;
use crate::session::Session;

#[derive(Debug)]
struct Inner {
    session: Option<Session>,
    loaded_header: Option<SessionHeader>,
    store_id: Option<String>,
    regenerate: bool,
    finalized: bool,
}

/// Everything finalize needs, extracted from the handle in one step.
#[derive(Debug)]
pub struct FinalizeState {
    /// The (possibly mutated) session, `None` when cleared.
    pub session: Option<Session>,
    /// The header the session was loaded with, `None` for a fresh session.
    pub loaded_header: Option<SessionHeader>,
    /// The external-store id the session was loaded under.
    pub store_id: Option<String>,
    /// Whether the backing id must be regenerated before writing.
    pub regenerate: bool,
}

/// Shared, mutable view of the current request's session.
///
/// Cheap to clone; all clones point at the same state.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    inner: Arc<Mutex<Inner>>,
}

impl SessionHandle {
    /// Creates a handle with no session (anonymous request).
    #[must_use]
    pub fn anonymous() -> Self {
        Self::build(None, None, None)
    }

    /// Creates a handle for a session loaded from a backend.
    #[must_use]
    pub fn loaded(
        session: Session,
        header: SessionHeader,
        store_id: Option<String>,
    ) -> Self {
        Self::build(Some(session), Some(header), store_id)
    }

    fn build(
        session: Option<Session>,
        loaded_header: Option<SessionHeader>,
        store_id: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                session,
                loaded_header,
                store_id,
                regenerate: false,
                finalized: false,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock still holds coherent session data; recover it.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// A snapshot of the current session.
    #[must_use]
    pub fn get(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    /// Returns `true` when the current session carries an ID token.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.lock()
            .session
            .as_ref()
            .is_some_and(Session::is_authenticated)
    }

    /// Replaces the session wholesale. `None` clears it.
    pub fn replace(&self, session: Option<Session>) {
        self.lock().session = session;
    }

    /// Clears the session; the backend entry and cookies go at finalize.
    pub fn clear(&self) {
        self.replace(None);
    }

    /// Requests a new backing session id at finalize time.
    ///
    /// Called on privilege changes (login, identity switch) so a previously
    /// issued id can never address the new session.
    pub fn mark_regenerate(&self) {
        self.lock().regenerate = true;
    }

    /// The external-store id the session was loaded under, if any.
    #[must_use]
    pub fn store_id(&self) -> Option<String> {
        self.lock().store_id.clone()
    }

    /// Extracts the finalize state, marking the handle finalized.
    ///
    /// # Errors
    ///
    /// Returns a finalize error when called a second time — double
    /// finalization means the middleware is wired incorrectly.
    pub fn take_for_finalize(&self) -> SessionResult<FinalizeState> {
        let mut inner = self.lock();
        if inner.finalized {
            return Err(SessionError::finalize(
                "session already finalized for this request",
            ));
        }
        inner.finalized = true;
        Ok(FinalizeState {
            session: inner.session.take(),
            loaded_header: inner.loaded_header,
            store_id: inner.store_id.take(),
            regenerate: inner.regenerate,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_anonymous_handle() {
        let handle = SessionHandle::anonymous();
        assert!(handle.get().is_none());
        assert!(!handle.is_authenticated());
    }

    #[test]
    fn test_replace_is_wholesale() {
        let handle = SessionHandle::anonymous();
        let mut session = Session::new();
        session.insert("basket", json!("b-1"));
        handle.replace(Some(session));

        let mut other = Session::new();
        other.insert("id_token", json!("a.b.c"));
        handle.replace(Some(other));

        // The first session's keys do not bleed into the replacement.
        let current = handle.get().unwrap();
        assert!(current.get("basket").is_none());
        assert!(handle.is_authenticated());
    }

    #[test]
    fn test_clones_share_state() {
        let handle = SessionHandle::anonymous();
        let clone = handle.clone();
        clone.replace(Some(Session::new()));
        assert!(handle.get().is_some());
    }

    #[test]
    fn test_finalize_is_single_fire() {
        let handle = SessionHandle::anonymous();
        handle.take_for_finalize().unwrap();
        let err = handle.take_for_finalize().unwrap_err();
        assert!(matches!(err, SessionError::Finalize { .. }));
    }

    #[test]
    fn test_finalize_state_carries_regenerate() {
        let handle = SessionHandle::loaded(
            Session::new(),
            SessionHeader {
                iat: 1,
                uat: 2,
                exp: 3,
            },
            Some("store-1".to_string()),
        );
        handle.mark_regenerate();
        let state = handle.take_for_finalize().unwrap();
        assert!(state.regenerate);
        assert_eq!(state.store_id.as_deref(), Some("store-1"));
        assert_eq!(state.loaded_header.unwrap().iat, 1);
    }
}
